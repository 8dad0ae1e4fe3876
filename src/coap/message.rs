//! CoAP message model and wire codec (RFC 7252 subset)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Ver| T |  TKL  |      Code     |          Message ID           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Token (if any, TKL bytes) ...
//! |   Options (if any) ...
//! |1 1 1 1 1 1 1 1|    Payload (if any) ...
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

const VERSION: u8 = 1;
const HEADER_LEN: usize = 4;
const PAYLOAD_MARKER: u8 = 0xFF;
pub const MAX_TOKEN_LEN: usize = 8;

/// Option numbers understood by the agent
pub mod option {
    pub const OBSERVE: u16 = 6;
    pub const URI_PATH: u16 = 11;
    pub const CONTENT_FORMAT: u16 = 12;
    pub const MAX_AGE: u16 = 14;
    pub const URI_QUERY: u16 = 15;
}

/// Content-Format registry values
pub mod content_format {
    pub const TEXT_PLAIN: u16 = 0;
    pub const LINK_FORMAT: u16 = 40;
    pub const JSON: u16 = 50;
}

/// Observe option value registering an observer
pub const OBSERVE_REGISTER: u32 = 0;
/// Observe option value deregistering an observer
pub const OBSERVE_DEREGISTER: u32 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("Datagram shorter than the {HEADER_LEN}-byte header ({0} bytes)")]
    TooShort(usize),
    #[error("Unsupported CoAP version {0}")]
    UnsupportedVersion(u8),
    #[error("Invalid token length {0}")]
    InvalidTokenLength(usize),
    #[error("Truncated token or option")]
    Truncated,
    #[error("Reserved option nibble 15 outside the payload marker")]
    ReservedNibble,
    #[error("Payload marker followed by an empty payload")]
    EmptyPayload,
    #[error("Option {number} value too long ({len} bytes)")]
    OptionTooLong { number: u16, len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    fn bits(self) -> u8 {
        match self {
            MessageType::Confirmable => 0,
            MessageType::NonConfirmable => 1,
            MessageType::Acknowledgement => 2,
            MessageType::Reset => 3,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }
}

/// Request method or response code, `class.detail` packed into one byte
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Code(pub u8);

impl Code {
    pub const EMPTY: Code = Code(0x00);

    pub const GET: Code = Code(0x01);
    pub const POST: Code = Code(0x02);
    pub const PUT: Code = Code(0x03);
    pub const DELETE: Code = Code(0x04);

    pub const CREATED: Code = Code(0x41);
    pub const DELETED: Code = Code(0x42);
    pub const VALID: Code = Code(0x43);
    pub const CHANGED: Code = Code(0x44);
    pub const CONTENT: Code = Code(0x45);

    pub const BAD_REQUEST: Code = Code(0x80);
    pub const NOT_FOUND: Code = Code(0x84);
    pub const METHOD_NOT_ALLOWED: Code = Code(0x85);
    pub const PRECONDITION_FAILED: Code = Code(0x8C);
    pub const INTERNAL_SERVER_ERROR: Code = Code(0xA0);

    pub fn class(self) -> u8 {
        self.0 >> 5
    }

    pub fn detail(self) -> u8 {
        self.0 & 0x1F
    }

    pub fn is_request(self) -> bool {
        self.class() == 0 && self.0 != 0
    }

    pub fn is_success(self) -> bool {
        self.class() == 2
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Code({self})")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_type: MessageType,
    pub code: Code,
    pub message_id: u16,
    pub token: Vec<u8>,
    /// Sorted by option number; repeated options keep insertion order
    options: Vec<(u16, Vec<u8>)>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(message_type: MessageType, code: Code, message_id: u16, token: Vec<u8>) -> Self {
        Self {
            message_type,
            code,
            message_id,
            token,
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Request for `path`, confirmable or not
    pub fn request(code: Code, confirmable: bool, message_id: u16, token: Vec<u8>, path: &str) -> Self {
        let message_type = if confirmable {
            MessageType::Confirmable
        } else {
            MessageType::NonConfirmable
        };
        let mut message = Self::new(message_type, code, message_id, token);
        message.set_path(path);
        message
    }

    /// Response to `request`: piggybacked on an ACK for confirmable
    /// requests, otherwise a NON carrying `message_id`
    pub fn response_to(request: &Message, code: Code, message_id: u16) -> Self {
        match request.message_type {
            MessageType::Confirmable => Self::new(
                MessageType::Acknowledgement,
                code,
                request.message_id,
                request.token.clone(),
            ),
            _ => Self::new(MessageType::NonConfirmable, code, message_id, request.token.clone()),
        }
    }

    pub fn empty_ack(message_id: u16) -> Self {
        Self::new(MessageType::Acknowledgement, Code::EMPTY, message_id, Vec::new())
    }

    pub fn reset(message_id: u16) -> Self {
        Self::new(MessageType::Reset, Code::EMPTY, message_id, Vec::new())
    }

    pub fn is_confirmable(&self) -> bool {
        self.message_type == MessageType::Confirmable
    }

    pub fn options(&self) -> impl Iterator<Item = (u16, &[u8])> {
        self.options.iter().map(|(number, value)| (*number, value.as_slice()))
    }

    pub fn option_values(&self, number: u16) -> impl Iterator<Item = &[u8]> {
        self.options
            .iter()
            .filter(move |(n, _)| *n == number)
            .map(|(_, value)| value.as_slice())
    }

    pub fn add_option(&mut self, number: u16, value: Vec<u8>) {
        let index = self.options.partition_point(|(n, _)| *n <= number);
        self.options.insert(index, (number, value));
    }

    pub fn remove_option(&mut self, number: u16) {
        self.options.retain(|(n, _)| *n != number);
    }

    /// Replace an option with a minimally encoded unsigned integer
    pub fn set_uint_option(&mut self, number: u16, value: u32) {
        self.remove_option(number);
        self.add_option(number, encode_uint(value));
    }

    pub fn uint_option(&self, number: u16) -> Option<u32> {
        self.option_values(number).next().map(decode_uint)
    }

    /// Replace Uri-Path options with the non-empty segments of `path`
    pub fn set_path(&mut self, path: &str) {
        self.remove_option(option::URI_PATH);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.add_option(option::URI_PATH, segment.as_bytes().to_vec());
        }
    }

    /// Uri-Path segments joined with `/`, without a leading separator
    pub fn path(&self) -> String {
        self.option_values(option::URI_PATH)
            .map(String::from_utf8_lossy)
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn observe(&self) -> Option<u32> {
        self.uint_option(option::OBSERVE)
    }

    pub fn set_observe(&mut self, value: u32) {
        // Observe sequence numbers are 24 bits
        self.set_uint_option(option::OBSERVE, value & 0x00FF_FFFF);
    }

    pub fn content_format(&self) -> Option<u16> {
        self.uint_option(option::CONTENT_FORMAT)
            .and_then(|v| u16::try_from(v).ok())
    }

    pub fn set_content_format(&mut self, format: u16) {
        self.set_uint_option(option::CONTENT_FORMAT, u32::from(format));
    }

    pub fn max_age(&self) -> Option<u32> {
        self.uint_option(option::MAX_AGE)
    }

    pub fn set_max_age(&mut self, seconds: u32) {
        self.set_uint_option(option::MAX_AGE, seconds);
    }

    pub fn set_payload(&mut self, payload: impl Into<Vec<u8>>) {
        self.payload = payload.into();
    }

    /// Payload as text; `None` when empty or not UTF-8
    pub fn payload_str(&self) -> Option<&str> {
        if self.payload.is_empty() {
            return None;
        }
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn encode(&self) -> Result<Bytes, MessageError> {
        if self.token.len() > MAX_TOKEN_LEN {
            return Err(MessageError::InvalidTokenLength(self.token.len()));
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.token.len() + self.payload.len() + 32);
        buf.put_u8((VERSION << 6) | (self.message_type.bits() << 4) | self.token.len() as u8);
        buf.put_u8(self.code.0);
        buf.put_u16(self.message_id);
        buf.put_slice(&self.token);

        let mut previous = 0u16;
        for (number, value) in &self.options {
            if value.len() > usize::from(u16::MAX) + 269 {
                return Err(MessageError::OptionTooLong {
                    number: *number,
                    len: value.len(),
                });
            }
            let (delta_nibble, delta_ext) = split_extended(usize::from(number - previous));
            let (len_nibble, len_ext) = split_extended(value.len());
            buf.put_u8((delta_nibble << 4) | len_nibble);
            put_extended(&mut buf, delta_ext);
            put_extended(&mut buf, len_ext);
            buf.put_slice(value);
            previous = *number;
        }

        if !self.payload.is_empty() {
            buf.put_u8(PAYLOAD_MARKER);
            buf.put_slice(&self.payload);
        }

        Ok(buf.freeze())
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, MessageError> {
        if datagram.len() < HEADER_LEN {
            return Err(MessageError::TooShort(datagram.len()));
        }

        let mut buf = datagram;
        let first = buf.get_u8();
        let version = first >> 6;
        if version != VERSION {
            return Err(MessageError::UnsupportedVersion(version));
        }
        let message_type = MessageType::from_bits(first >> 4);
        let token_len = usize::from(first & 0x0F);
        if token_len > MAX_TOKEN_LEN {
            return Err(MessageError::InvalidTokenLength(token_len));
        }
        let code = Code(buf.get_u8());
        let message_id = buf.get_u16();

        if buf.remaining() < token_len {
            return Err(MessageError::Truncated);
        }
        let token = buf[..token_len].to_vec();
        buf.advance(token_len);

        let mut message = Self::new(message_type, code, message_id, token);
        let mut number = 0u16;

        while buf.has_remaining() {
            let byte = buf.get_u8();
            if byte == PAYLOAD_MARKER {
                if !buf.has_remaining() {
                    return Err(MessageError::EmptyPayload);
                }
                message.payload = buf.to_vec();
                break;
            }

            let delta = read_extended(&mut buf, byte >> 4)?;
            let len = read_extended(&mut buf, byte & 0x0F)?;
            if buf.remaining() < len {
                return Err(MessageError::Truncated);
            }

            number = u16::try_from(usize::from(number) + delta).map_err(|_| MessageError::Truncated)?;
            message.options.push((number, buf[..len].to_vec()));
            buf.advance(len);
        }

        Ok(message)
    }
}

fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

fn decode_uint(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .take(4)
        .fold(0u32, |acc, b| (acc << 8) | u32::from(*b))
}

enum Extended {
    None,
    One(u8),
    Two(u16),
}

fn split_extended(value: usize) -> (u8, Extended) {
    if value < 13 {
        (value as u8, Extended::None)
    } else if value < 269 {
        (13, Extended::One((value - 13) as u8))
    } else {
        (14, Extended::Two((value - 269) as u16))
    }
}

fn put_extended(buf: &mut BytesMut, ext: Extended) {
    match ext {
        Extended::None => {}
        Extended::One(v) => buf.put_u8(v),
        Extended::Two(v) => buf.put_u16(v),
    }
}

fn read_extended(buf: &mut &[u8], nibble: u8) -> Result<usize, MessageError> {
    match nibble {
        0..=12 => Ok(usize::from(nibble)),
        13 => {
            if buf.remaining() < 1 {
                return Err(MessageError::Truncated);
            }
            Ok(usize::from(buf.get_u8()) + 13)
        }
        14 => {
            if buf.remaining() < 2 {
                return Err(MessageError::Truncated);
            }
            Ok(usize::from(buf.get_u16()) + 269)
        }
        _ => Err(MessageError::ReservedNibble),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_request_wire_layout() {
        let request = Message::request(Code::GET, true, 0x1234, vec![0xAA, 0xBB], "a/b");
        let bytes = request.encode().unwrap();

        assert_eq!(
            bytes.as_ref(),
            &[
                0x42, 0x01, 0x12, 0x34, // ver 1, CON, tkl 2, GET, mid
                0xAA, 0xBB, // token
                0xB1, b'a', // Uri-Path delta 11 len 1
                0x01, b'b', // Uri-Path delta 0 len 1
            ]
        );
    }

    #[test]
    fn test_decode_round_trip_with_payload() {
        let mut message = Message::request(Code::PUT, false, 7, vec![1, 2, 3, 4], "PIOT/ConstrainedDevice/ActuatorCmd");
        message.set_content_format(content_format::JSON);
        message.set_payload(r#"{"command":1}"#);

        let decoded = Message::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.path(), "PIOT/ConstrainedDevice/ActuatorCmd");
        assert_eq!(decoded.content_format(), Some(content_format::JSON));
        assert_eq!(decoded.payload_str(), Some(r#"{"command":1}"#));
    }

    #[test]
    fn test_extended_delta_and_length() {
        let mut message = Message::new(MessageType::NonConfirmable, Code::GET, 1, Vec::new());
        let long_segment = "x".repeat(300);
        message.add_option(option::URI_PATH, long_segment.clone().into_bytes());
        message.add_option(300, vec![9]);

        let bytes = message.encode().unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded.path(), long_segment);
        assert_eq!(decoded.option_values(300).next(), Some(&[9u8][..]));
    }

    #[test]
    fn test_options_kept_sorted() {
        let mut message = Message::new(MessageType::Confirmable, Code::GET, 1, Vec::new());
        message.set_path("a/b");
        message.set_observe(OBSERVE_REGISTER);

        let numbers: Vec<u16> = message.options().map(|(n, _)| n).collect();
        assert_eq!(numbers, vec![option::OBSERVE, option::URI_PATH, option::URI_PATH]);
        assert_eq!(message.observe(), Some(0));
    }

    #[test]
    fn test_uint_options_minimal_encoding() {
        assert_eq!(encode_uint(0), Vec::<u8>::new());
        assert_eq!(encode_uint(5), vec![5]);
        assert_eq!(encode_uint(0x0102), vec![1, 2]);
        assert_eq!(decode_uint(&[]), 0);
        assert_eq!(decode_uint(&[1, 2]), 0x0102);

        let mut message = Message::new(MessageType::Acknowledgement, Code::CONTENT, 1, Vec::new());
        message.set_max_age(60);
        message.set_max_age(120);
        assert_eq!(message.max_age(), Some(120));
        assert_eq!(message.option_values(option::MAX_AGE).count(), 1);
    }

    #[test]
    fn test_response_to_confirmable_is_piggybacked() {
        let request = Message::request(Code::GET, true, 42, vec![7], "x");
        let response = Message::response_to(&request, Code::CONTENT, 99);
        assert_eq!(response.message_type, MessageType::Acknowledgement);
        assert_eq!(response.message_id, 42);
        assert_eq!(response.token, vec![7]);

        let request = Message::request(Code::GET, false, 42, vec![7], "x");
        let response = Message::response_to(&request, Code::CONTENT, 99);
        assert_eq!(response.message_type, MessageType::NonConfirmable);
        assert_eq!(response.message_id, 99);
    }

    #[test]
    fn test_code_display() {
        assert_eq!(Code::CONTENT.to_string(), "2.05");
        assert_eq!(Code::PRECONDITION_FAILED.to_string(), "4.12");
        assert_eq!(Code::INTERNAL_SERVER_ERROR.to_string(), "5.00");
        assert!(Code::PUT.is_request());
        assert!(!Code::EMPTY.is_request());
        assert!(Code::CHANGED.is_success());
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(Message::decode(&[0x40, 0x01]), Err(MessageError::TooShort(2)));
        assert_eq!(
            Message::decode(&[0x80, 0x01, 0, 1]),
            Err(MessageError::UnsupportedVersion(2))
        );
        assert_eq!(
            Message::decode(&[0x49, 0x01, 0, 1]),
            Err(MessageError::InvalidTokenLength(9))
        );
        assert_eq!(
            Message::decode(&[0x42, 0x01, 0, 1, 0xAA]),
            Err(MessageError::Truncated)
        );
        assert_eq!(
            Message::decode(&[0x40, 0x01, 0, 1, 0xF1, 0x00]),
            Err(MessageError::ReservedNibble)
        );
        assert_eq!(
            Message::decode(&[0x40, 0x01, 0, 1, 0xFF]),
            Err(MessageError::EmptyPayload)
        );
        assert_eq!(
            Message::decode(&[0x40, 0x01, 0, 1, 0xB5, b'a']),
            Err(MessageError::Truncated)
        );
    }

    #[test]
    fn test_empty_ack_and_reset() {
        let ack = Message::decode(&Message::empty_ack(5).encode().unwrap()).unwrap();
        assert_eq!(ack.message_type, MessageType::Acknowledgement);
        assert_eq!(ack.code, Code::EMPTY);
        assert_eq!(ack.message_id, 5);

        let rst = Message::reset(6).encode().unwrap();
        assert_eq!(rst.as_ref(), &[0x70, 0x00, 0x00, 0x06]);
    }
}
