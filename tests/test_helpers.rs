//! Test helpers and utilities for integration tests

use cda_agent::coap::{Code, Message, MessageType};
use cda_agent::config::{CdaConfig, CoapGatewaySection, ConstrainedDeviceSection};
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

/// Configuration binding the CoAP server to an ephemeral loopback port
#[allow(dead_code)]
pub fn loopback_config() -> CdaConfig {
    CdaConfig {
        coap_gateway: CoapGatewaySection {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        },
        constrained_device: ConstrainedDeviceSection {
            poll_cycles: 5,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Client-side gateway section pointing at a running server
#[allow(dead_code)]
pub fn gateway_for(addr: SocketAddr) -> CoapGatewaySection {
    CoapGatewaySection {
        host: addr.ip().to_string(),
        port: addr.port(),
        ..Default::default()
    }
}

/// Raw UDP peer for driving the server with hand-built messages
#[allow(dead_code)]
pub struct RawPeer {
    socket: UdpSocket,
    server: SocketAddr,
}

#[allow(dead_code)]
impl RawPeer {
    pub fn new(server: SocketAddr) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        Self { socket, server }
    }

    pub fn send(&self, message: &Message) {
        let bytes = message.encode().unwrap();
        self.socket.send_to(&bytes, self.server).unwrap();
    }

    pub fn recv(&self) -> Option<Message> {
        let mut buf = vec![0u8; cda_agent::coap::MAX_DATAGRAM_SIZE];
        let (len, _) = self.socket.recv_from(&mut buf).ok()?;
        Message::decode(&buf[..len]).ok()
    }

    /// Send a confirmable request and wait for the piggybacked response
    pub fn request(&self, code: Code, path: &str, payload: Option<&str>) -> Message {
        let mut request = Message::request(code, true, 0x1234, vec![0xA1, 0xB2], path);
        if let Some(payload) = payload {
            request.set_payload(payload);
        }
        self.send(&request);

        let response = self.recv().expect("no response from server");
        assert_eq!(response.message_type, MessageType::Acknowledgement);
        assert_eq!(response.message_id, 0x1234);
        assert_eq!(response.token, vec![0xA1, 0xB2]);
        response
    }
}

/// Poll `condition` until it holds or `timeout` elapses
#[allow(dead_code)]
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
