//! Blocking runtime: std UDP socket plus a receiver thread
//!
//! Every send blocks the calling thread until the receiver thread delivers
//! the correlated response or the timeout elapses.

use super::exchange::{Correlator, Exchange, ExchangeError, NotifyCallback};
use crate::coap::message::{Message, MessageType};
use crate::coap::{datagram_fits, MAX_DATAGRAM_SIZE};
use crate::common::net::local_bind_addr;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

const RECV_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct BlockingExchange {
    socket: UdpSocket,
    peer: SocketAddr,
    correlator: Arc<Correlator>,
    running: Arc<AtomicBool>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl BlockingExchange {
    pub fn connect(peer: SocketAddr) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(local_bind_addr(&peer))?;
        let recv_socket = socket.try_clone()?;
        recv_socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;

        let correlator = Arc::new(Correlator::new());
        let running = Arc::new(AtomicBool::new(true));

        let receiver = {
            let correlator = correlator.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("coap-client-recv".to_string())
                .spawn(move || receive_loop(recv_socket, correlator, running))?
        };

        debug!(peer = %peer, local = ?socket.local_addr().ok(), "Blocking CoAP exchange ready");

        Ok(Self {
            socket,
            peer,
            correlator,
            running,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    fn send(&self, message: &Message) -> Result<(), ExchangeError> {
        let bytes = message.encode()?;
        self.socket.send_to(&bytes, self.peer)?;
        Ok(())
    }
}

fn receive_loop(socket: UdpSocket, correlator: Arc<Correlator>, running: Arc<AtomicBool>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    while running.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                if !datagram_fits(len, from) {
                    continue;
                }
                let Some(reply) = correlator.route(&buf[..len]) else {
                    continue;
                };
                match reply.encode() {
                    Ok(bytes) => {
                        if let Err(e) = socket.send_to(&bytes, from) {
                            warn!(error = %e, peer = %from, "Failed to send {:?}", reply.message_type);
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to encode reply"),
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) => {
                warn!(error = %e, "CoAP client receive failed");
                thread::sleep(RECV_POLL_INTERVAL);
            }
        }
    }

    debug!("CoAP client receiver stopped");
}

impl Exchange for BlockingExchange {
    fn exchange(&self, request: Message, timeout: Duration) -> Result<Option<Message>, ExchangeError> {
        let token = request.token.clone();
        let (tx, rx) = mpsc::channel();
        self.correlator.expect(token.clone(), move |response| {
            let _ = tx.send(response);
        });

        if let Err(e) = self.send(&request) {
            self.correlator.forget(&token);
            return Err(e);
        }

        match rx.recv_timeout(timeout) {
            Ok(response) => Ok(Some(response)),
            Err(_) => {
                self.correlator.forget(&token);
                Ok(None)
            }
        }
    }

    fn observe(&self, request: Message, on_notify: NotifyCallback) -> Result<(), ExchangeError> {
        let token = request.token.clone();
        self.correlator.add_observer(token.clone(), on_notify);

        if let Err(e) = self.send(&request) {
            self.correlator.remove_observer(&token);
            return Err(e);
        }
        Ok(())
    }

    fn cancel_observe(&self, token: &[u8], cancel: Message, timeout: Duration) -> Result<bool, ExchangeError> {
        self.correlator.remove_observer(token);

        if cancel.message_type == MessageType::Reset {
            self.send(&cancel)?;
            return Ok(true);
        }

        Ok(self.exchange(cancel, timeout)?.is_some())
    }
}

impl Drop for BlockingExchange {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(receiver) = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = receiver.join();
        }
    }
}
