//! CoAP request/response adapters
//!
//! - [`message`]: wire codec shared by client and server
//! - [`client`]: [`RequestResponseClient`] with blocking and background-loop
//!   runtimes
//! - [`server`]: resource tree, default handlers and the serving adapter

pub mod client;
pub mod message;
pub mod server;

pub use client::{create_client, ClientRuntime, RequestResponseClient};
pub use message::{Code, Message, MessageError, MessageType};
pub use server::CoapServerAdapter;

use std::net::SocketAddr;
use tracing::warn;

/// Well-known resource discovery path
pub const DISCOVERY_PATH: &str = ".well-known/core";

/// Receive buffer size on both sides: the largest UDP payload
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// False when a read filled the whole receive buffer, so the datagram may
/// have been cut short. Such datagrams are logged and dropped rather than
/// decoded.
pub fn datagram_fits(len: usize, from: SocketAddr) -> bool {
    if len < MAX_DATAGRAM_SIZE {
        return true;
    }
    warn!(peer = %from, len = len, "Datagram fills the receive buffer and may be truncated, dropping it");
    false
}

/// Fresh 4-byte correlation token
pub fn new_token() -> Vec<u8> {
    uuid::Uuid::new_v4().as_bytes()[..4].to_vec()
}

/// Random starting point for a message-id sequence
pub fn initial_message_id() -> u16 {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    u16::from_be_bytes([bytes[0], bytes[1]])
}

/// One CoRE link-format entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub path: String,
    pub observable: bool,
}

/// Render links as `</path>;obs,</other>`
pub fn format_link_format(links: &[Link]) -> String {
    links
        .iter()
        .map(|link| {
            if link.observable {
                format!("</{}>;obs", link.path)
            } else {
                format!("</{}>", link.path)
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a link-format body, skipping entries without a `<...>` target
pub fn parse_link_format(body: &str) -> Vec<Link> {
    body.split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            let start = entry.find('<')?;
            let end = entry[start..].find('>')? + start;
            let path = entry[start + 1..end].trim_start_matches('/').to_string();
            let observable = entry[end + 1..]
                .split(';')
                .any(|attr| attr.trim() == "obs");
            Some(Link { path, observable })
        })
        .collect()
}
