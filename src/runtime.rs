//! Background scheduling loop
//!
//! A single current-thread tokio runtime driven by a dedicated OS thread.
//! Synchronous callers submit futures onto it and block until they resolve,
//! so socket internals only ever run on the loop thread. Submitting from the
//! loop thread itself is refused, since blocking there would stall the loop
//! the caller waits on.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, warn};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Error)]
pub enum LoopError {
    #[error("Failed to build loop runtime: {0}")]
    Build(#[source] std::io::Error),
    #[error("Failed to spawn loop thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("Background loop is stopped")]
    Stopped,
    #[error("Submitted operation was cancelled before completing")]
    Cancelled,
    #[error("Cannot block on background loop '{0}' from its own thread")]
    Reentrant(String),
}

/// Dedicated thread running a tokio scheduler for the lifetime of its owner
pub struct BackgroundLoop {
    name: String,
    handle: Handle,
    thread_id: ThreadId,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundLoop {
    /// Build the runtime and start the loop thread
    pub fn start(name: &str) -> Result<Self, LoopError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(LoopError::Build)?;
        let handle = runtime.handle().clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread_name = name.to_string();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                debug!(loop_name = %thread_name, "Background loop exited");
                // Dropping the runtime cancels every task still parked on it
            })
            .map_err(LoopError::Spawn)?;
        let thread_id = thread.thread().id();

        debug!(loop_name = %name, "Background loop started");

        Ok(Self {
            name: name.to_string(),
            handle,
            thread_id,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    /// Spawn a task onto the loop without waiting for it
    pub fn spawn<F>(&self, fut: F) -> Result<tokio::task::JoinHandle<F::Output>, LoopError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if !self.is_running() {
            return Err(LoopError::Stopped);
        }
        Ok(self.handle.spawn(fut))
    }

    /// True when called from the loop thread
    pub fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Run a future on the loop and block the calling thread until it
    /// completes.
    ///
    /// Fails with [`LoopError::Reentrant`] when called from the loop thread,
    /// e.g. by a callback the loop is running.
    pub fn submit<F>(&self, fut: F) -> Result<F::Output, LoopError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.is_loop_thread() {
            warn!(loop_name = %self.name, "Refusing to block the background loop on itself");
            return Err(LoopError::Reentrant(self.name.clone()));
        }

        // std channel so the caller may block even from inside another runtime
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        self.spawn(async move {
            let _ = tx.send(fut.await);
        })?;
        rx.recv().map_err(|_| LoopError::Cancelled)
    }

    /// Signal the loop to exit and wait up to `wait` for its thread.
    ///
    /// Returns true when the thread finished within the bound. Safe to call
    /// repeatedly.
    pub fn stop(&self, wait: Duration) -> bool {
        if let Some(tx) = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = tx.send(());
        }

        // The loop exits once this call returns; waiting here would only stall it
        if self.is_loop_thread() {
            return false;
        }

        let Some(thread) = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return true;
        };

        let deadline = Instant::now() + wait;
        while !thread.is_finished() {
            if Instant::now() >= deadline {
                warn!(loop_name = %self.name, "Background loop did not stop within {:?}", wait);
                return false;
            }
            thread::sleep(STOP_POLL_INTERVAL);
        }

        if thread.join().is_err() {
            warn!(loop_name = %self.name, "Background loop thread panicked");
        }
        true
    }
}

impl Drop for BackgroundLoop {
    fn drop(&mut self) {
        self.stop(Duration::from_secs(1));
    }
}

impl std::fmt::Debug for BackgroundLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundLoop")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}
