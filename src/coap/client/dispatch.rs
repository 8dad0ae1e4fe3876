//! Hand-off of observed actuator commands to the bound listener
//!
//! Notifications arrive on the transport thread: the background loop or the
//! blocking receiver. Listener code may call back into the client, which
//! needs that thread free to deliver the response, so commands are queued
//! here and delivered from a dedicated dispatcher thread instead.

use super::forward_actuator_payload;
use crate::common::ListenerSlot;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

const DISPATCH_THREAD_NAME: &str = "coap-client-dispatch";

/// Work item queued by a notification callback
pub(crate) enum Dispatch {
    Command { path: String, payload: String },
    Stop,
}

struct Running {
    tx: Sender<Dispatch>,
    thread: JoinHandle<()>,
}

/// Owns the dispatcher thread; started on first use
pub(crate) struct CommandDispatcher {
    listener: Arc<ListenerSlot>,
    running: Mutex<Option<Running>>,
}

impl CommandDispatcher {
    pub(crate) fn new(listener: Arc<ListenerSlot>) -> Self {
        Self {
            listener,
            running: Mutex::new(None),
        }
    }

    /// Queue handle for notification callbacks, starting the thread if needed
    pub(crate) fn sender(&self) -> std::io::Result<Sender<Dispatch>> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(running) = running.as_ref() {
            return Ok(running.tx.clone());
        }

        let (tx, rx) = mpsc::channel();
        let listener = self.listener.clone();
        let thread = thread::Builder::new()
            .name(DISPATCH_THREAD_NAME.to_string())
            .spawn(move || run_dispatcher(rx, listener))?;

        debug!("Observation dispatcher started");
        *running = Some(Running { tx: tx.clone(), thread });
        Ok(tx)
    }
}

impl Drop for CommandDispatcher {
    fn drop(&mut self) {
        let Some(running) = self
            .running
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        let _ = running.tx.send(Dispatch::Stop);
        // A listener dropping the last client handle runs on the dispatcher itself
        if running.thread.thread().id() == thread::current().id() {
            return;
        }
        if running.thread.join().is_err() {
            warn!("Observation dispatcher panicked");
        }
    }
}

fn run_dispatcher(rx: Receiver<Dispatch>, listener: Arc<ListenerSlot>) {
    while let Ok(Dispatch::Command { path, payload }) = rx.recv() {
        forward_actuator_payload(&listener, &path, &payload);
    }
    debug!("Observation dispatcher stopped");
}
