//! Transport seam beneath the request/response client
//!
//! An [`Exchange`] moves encoded requests to the peer and hands responses
//! back, correlated by token. Both runtimes share the [`Correlator`], which
//! routes every inbound datagram either to a waiting request or to an
//! observation callback.

use crate::coap::message::{Code, Message, MessageError, MessageType};
use crate::runtime::LoopError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Callback invoked with every notification of one observation
pub type NotifyCallback = Arc<dyn Fn(Message) + Send + Sync>;

type Responder = Box<dyn FnOnce(Message) + Send>;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to encode request: {0}")]
    Encode(#[from] MessageError),
    #[error("Background loop error: {0}")]
    Loop(#[from] LoopError),
}

/// Sends requests to one peer and correlates what comes back
pub trait Exchange: Send + Sync + 'static {
    /// Send `request` and wait up to `timeout` for the response carrying its
    /// token. `Ok(None)` means nothing arrived in time.
    fn exchange(&self, request: Message, timeout: Duration) -> Result<Option<Message>, ExchangeError>;

    /// Send an observe registration; the first response and every later
    /// notification for its token go to `on_notify`.
    fn observe(&self, request: Message, on_notify: NotifyCallback) -> Result<(), ExchangeError>;

    /// Drop the route for `token` and send `cancel`. A Reset is sent without
    /// waiting; a deregistration request waits up to `timeout` for its
    /// response. Returns whether the cancellation was acknowledged.
    fn cancel_observe(&self, token: &[u8], cancel: Message, timeout: Duration) -> Result<bool, ExchangeError>;
}

/// Token-keyed routing table for inbound datagrams
#[derive(Default)]
pub struct Correlator {
    pending: Mutex<HashMap<Vec<u8>, Responder>>,
    observers: Mutex<HashMap<Vec<u8>, NotifyCallback>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Await a single response for `token`
    pub fn expect(&self, token: Vec<u8>, responder: impl FnOnce(Message) + Send + 'static) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token, Box::new(responder));
    }

    /// Stop waiting for `token`, e.g. after a timeout
    pub fn forget(&self, token: &[u8]) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token);
    }

    pub fn add_observer(&self, token: Vec<u8>, on_notify: NotifyCallback) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token, on_notify);
    }

    pub fn remove_observer(&self, token: &[u8]) -> bool {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token)
            .is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Route one inbound datagram.
    ///
    /// Returns the message to send back: an empty ACK for a confirmable
    /// message we consumed, a Reset for a confirmable message nobody wants.
    pub fn route(&self, datagram: &[u8]) -> Option<Message> {
        let message = match Message::decode(datagram) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, len = datagram.len(), "Dropping malformed CoAP datagram");
                return None;
            }
        };

        // Token-less empty messages are bare ACK/RST; a no-content reply keeps its token
        if message.message_type == MessageType::Reset
            || (message.code == Code::EMPTY && message.token.is_empty())
        {
            debug!(message_id = message.message_id, "Ignoring empty message");
            return None;
        }

        let confirmable = message.is_confirmable();
        let message_id = message.message_id;

        let observer = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&message.token)
            .cloned();

        if let Some(on_notify) = observer {
            // Registration response may also have a waiter
            self.forget(&message.token);
            on_notify(message);
            return confirmable.then(|| Message::empty_ack(message_id));
        }

        let responder = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&message.token);

        match responder {
            Some(responder) => {
                responder(message);
                confirmable.then(|| Message::empty_ack(message_id))
            }
            None => {
                debug!(
                    message_id = message_id,
                    code = %message.code,
                    "Unmatched response, no request waiting for its token"
                );
                confirmable.then(|| Message::reset(message_id))
            }
        }
    }
}
