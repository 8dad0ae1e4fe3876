//! Background-loop runtime: tokio UDP socket owned by a [`BackgroundLoop`]
//!
//! Socket I/O only ever runs on the loop thread. Calls submit a future to
//! the loop and block on its result, which gives the same call-site
//! contract as the blocking runtime.

use super::exchange::{Correlator, Exchange, ExchangeError, NotifyCallback};
use crate::coap::message::{Message, MessageType};
use crate::coap::{datagram_fits, MAX_DATAGRAM_SIZE};
use crate::common::net::local_bind_addr;
use crate::error::CdaResult;
use crate::runtime::BackgroundLoop;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::{debug, warn};

const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(50);

pub struct EventLoopExchange {
    background: BackgroundLoop,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    correlator: Arc<Correlator>,
}

impl EventLoopExchange {
    pub fn connect(peer: SocketAddr) -> CdaResult<Self> {
        let background = BackgroundLoop::start("coap-client-loop")?;

        let bind_addr = local_bind_addr(&peer);
        let socket = Arc::new(background.submit(async move { UdpSocket::bind(bind_addr).await })??);
        let correlator = Arc::new(Correlator::new());

        background.spawn(receive_loop(socket.clone(), correlator.clone()))?;

        debug!(peer = %peer, local = ?socket.local_addr().ok(), "Event-loop CoAP exchange ready");

        Ok(Self {
            background,
            socket,
            peer,
            correlator,
        })
    }

    fn send(&self, message: &Message) -> Result<(), ExchangeError> {
        let bytes = message.encode()?;
        let socket = self.socket.clone();
        let peer = self.peer;
        self.background
            .submit(async move { socket.send_to(&bytes, peer).await })??;
        Ok(())
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, correlator: Arc<Correlator>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                if !datagram_fits(len, from) {
                    continue;
                }
                let Some(reply) = correlator.route(&buf[..len]) else {
                    continue;
                };
                match reply.encode() {
                    Ok(bytes) => {
                        if let Err(e) = socket.send_to(&bytes, from).await {
                            warn!(error = %e, peer = %from, "Failed to send {:?}", reply.message_type);
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to encode reply"),
                }
            }
            Err(e) => {
                warn!(error = %e, "CoAP client receive failed");
                tokio::time::sleep(RECV_ERROR_BACKOFF).await;
            }
        }
    }
}

impl Exchange for EventLoopExchange {
    fn exchange(&self, request: Message, timeout: Duration) -> Result<Option<Message>, ExchangeError> {
        let bytes = request.encode()?;
        let token = request.token.clone();
        let (tx, rx) = oneshot::channel();
        self.correlator.expect(token.clone(), move |response| {
            let _ = tx.send(response);
        });

        let socket = self.socket.clone();
        let correlator = self.correlator.clone();
        let peer = self.peer;

        self.background.submit(async move {
            if let Err(e) = socket.send_to(&bytes, peer).await {
                correlator.forget(&token);
                return Err(ExchangeError::Io(e));
            }

            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(response)) => Ok(Some(response)),
                _ => {
                    correlator.forget(&token);
                    Ok(None)
                }
            }
        })?
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

impl Drop for EventLoopExchange {
    fn drop(&mut self) {
        self.background.stop(Duration::from_secs(1));
    }
}
