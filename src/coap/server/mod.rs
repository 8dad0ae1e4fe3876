//! CoAP server adapter
//!
//! Hosts the device's resource tree and serves remote requests against it
//! from a dedicated background loop. The tree is frozen while serving:
//! registration only succeeds between `stop_server` and `start_server`.

pub mod handlers;
pub mod tree;

pub use handlers::{
    ChangeNotifier, GetSystemPerformanceResourceHandler, GetTelemetryResourceHandler,
    ObservableResource, Reply, ResourceHandler, UpdateActuatorResourceHandler,
};
pub use tree::{RegistrationError, ResourceTree};

use crate::coap::message::{content_format, Code, Message, MessageType, OBSERVE_DEREGISTER, OBSERVE_REGISTER};
use crate::coap::{datagram_fits, format_link_format, initial_message_id, DISCOVERY_PATH, MAX_DATAGRAM_SIZE};
use crate::common::resource::{HUMIDIFIER_ACTUATOR_NAME, HVAC_ACTUATOR_NAME};
use crate::common::{resolve_host, resolve_path, DataMessageListener, ListenerSlot, ResourceName};
use crate::config::CdaConfig;
use crate::error::CdaResult;
use crate::runtime::BackgroundLoop;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Bound on waiting for the serving thread to exit
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

struct ServerRun {
    background: BackgroundLoop,
    shutdown: watch::Sender<bool>,
    local_addr: SocketAddr,
}

/// Request/response server hosting the device resources
pub struct CoapServerAdapter {
    bind_addr: SocketAddr,
    tree: Mutex<Arc<ResourceTree>>,
    listener: Arc<ListenerSlot>,
    telemetry: Arc<GetTelemetryResourceHandler>,
    sys_perf: Arc<GetSystemPerformanceResourceHandler>,
    run: Mutex<Option<ServerRun>>,
}

impl CoapServerAdapter {
    /// Resolve the bind host, seed the resource tree and register the
    /// default handlers.
    pub fn new(config: &CdaConfig, listener: Option<Arc<dyn DataMessageListener>>) -> CdaResult<Self> {
        let bind_addr = resolve_host(&config.coap_gateway.host, config.coap_gateway.port)?;
        let poll_cycles = config.constrained_device.poll_cycles;

        let listener_slot = Arc::new(ListenerSlot::new(None));
        let telemetry = Arc::new(GetTelemetryResourceHandler::new(
            ResourceName::CdaSensorMsg.data_type(),
            poll_cycles,
        ));
        let sys_perf = Arc::new(GetSystemPerformanceResourceHandler::new(
            ResourceName::CdaSystemPerfMsg.data_type(),
            poll_cycles,
        ));

        let mut tree = ResourceTree::new();
        for resource in ResourceName::ALL {
            tree.add_container(resource.segment());
        }
        for actuator in [HUMIDIFIER_ACTUATOR_NAME, HVAC_ACTUATOR_NAME] {
            tree.register(
                &resolve_path(Some(ResourceName::CdaActuatorCmd), Some(actuator)),
                Arc::new(UpdateActuatorResourceHandler::new(actuator, listener_slot.clone())),
            )?;
        }
        tree.register(ResourceName::CdaSensorMsg.segment(), telemetry.clone())?;
        tree.register(ResourceName::CdaSystemPerfMsg.segment(), sys_perf.clone())?;

        let adapter = Self {
            bind_addr,
            tree: Mutex::new(Arc::new(tree)),
            listener: listener_slot,
            telemetry,
            sys_perf,
            run: Mutex::new(None),
        };

        if let Some(listener) = listener {
            adapter.set_data_message_listener(listener);
        }

        info!(bind_addr = %bind_addr, "CoAP server adapter created");
        Ok(adapter)
    }

    fn lock_run(&self) -> MutexGuard<'_, Option<ServerRun>> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `handler` at the path resolved from `resource` and `name`.
    ///
    /// Refused when the target or handler is missing, when any ancestor of
    /// the path does not exist, or while the server is running.
    pub fn add_resource(
        &self,
        resource: Option<ResourceName>,
        name: Option<&str>,
        handler: Option<Arc<dyn ResourceHandler>>,
    ) -> bool {
        let path = resolve_path(resource, name);
        let Some(handler) = handler else {
            warn!(path = %path, "No handler given, resource not added");
            return false;
        };
        if path.is_empty() {
            warn!("No resource or name given, resource not added");
            return false;
        }

        let mut tree = self.tree.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tree) = Arc::get_mut(&mut tree) else {
            warn!(path = %path, error = %RegistrationError::ServerRunning, "Resource not added");
            return false;
        };

        match tree.register(&path, handler) {
            Ok(previous) => {
                if previous.is_some() {
                    debug!(path = %path, "Replaced existing resource handler");
                }
                info!(path = %path, "Resource added");
                true
            }
            Err(e) => {
                warn!(path = %path, error = %e, "Resource not added");
                false
            }
        }
    }

    /// True when a node exists at the path, with or without a handler
    pub fn has_resource(&self, resource: Option<ResourceName>, name: Option<&str>) -> bool {
        let path = resolve_path(resource, name);
        self.tree
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&path)
    }

    /// Replace the listener and bind the observable handlers to it
    pub fn set_data_message_listener(&self, listener: Arc<dyn DataMessageListener>) -> bool {
        listener.set_telemetry_data_listener(self.telemetry.clone());
        listener.set_system_performance_data_listener(self.sys_perf.clone());
        if self.listener.set(listener).is_some() {
            debug!("Replaced data message listener");
        }
        true
    }

    pub fn telemetry_handler(&self) -> Arc<GetTelemetryResourceHandler> {
        self.telemetry.clone()
    }

    pub fn system_performance_handler(&self) -> Arc<GetSystemPerformanceResourceHandler> {
        self.sys_perf.clone()
    }

    pub fn is_running(&self) -> bool {
        self.lock_run()
            .as_ref()
            .is_some_and(|run| run.background.is_running())
    }

    /// Address the server is listening on, while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_run().as_ref().map(|run| run.local_addr)
    }

    /// Start serving on a dedicated background loop. A running server is
    /// stopped first.
    pub fn start_server(&self) -> bool {
        let _span = crate::lifecycle_span!(event = "coap_server_start").entered();

        if self.lock_run().is_some() {
            info!("CoAP server already running, restarting");
            self.stop_server();
        }

        let background = match BackgroundLoop::start("coap-server-loop") {
            Ok(background) => background,
            Err(e) => {
                warn!(error = %e, "Failed to start CoAP server loop");
                return false;
            }
        };

        let bind_addr = self.bind_addr;
        let socket = match background.submit(async move { UdpSocket::bind(bind_addr).await }) {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                warn!(bind_addr = %bind_addr, error = %e, "Failed to bind CoAP server socket");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "CoAP server loop unavailable");
                return false;
            }
        };

        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(error = %e, "CoAP server socket has no local address");
                return false;
            }
        };

        let tree = self.tree.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        for (path, handler) in tree.observable_handlers() {
            handler.attach_notifier(ChangeNotifier::new(path, changes_tx.clone()));
        }
        drop(changes_tx);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = ServingTask {
            socket,
            tree,
            changes: changes_rx,
            shutdown: shutdown_rx,
            observers: HashMap::new(),
            message_id: initial_message_id(),
            observe_sequence: 2,
        };

        if let Err(e) = background.spawn(server.run()) {
            warn!(error = %e, "Failed to spawn CoAP serving task");
            return false;
        }

        info!(local_addr = %local_addr, "CoAP server listening");
        *self.lock_run() = Some(ServerRun {
            background,
            shutdown: shutdown_tx,
            local_addr,
        });
        true
    }

    /// Stop serving and wait (bounded) for the serving thread.
    ///
    /// Safe to call when the server never started.
    pub fn stop_server(&self) -> bool {
        let Some(run) = self.lock_run().take() else {
            warn!("CoAP server is not running, nothing to stop");
            return false;
        };

        let _ = run.shutdown.send(true);
        let stopped = run.background.stop(STOP_TIMEOUT);
        if stopped {
            info!(local_addr = %run.local_addr, "CoAP server stopped");
        } else {
            warn!(local_addr = %run.local_addr, "CoAP server did not stop within {:?}", STOP_TIMEOUT);
        }
        stopped
    }
}

impl Drop for CoapServerAdapter {
    fn drop(&mut self) {
        if let Some(run) = self.lock_run().take() {
            let _ = run.shutdown.send(true);
            run.background.stop(Duration::from_secs(1));
        }
    }
}

struct Observer {
    addr: SocketAddr,
    token: Vec<u8>,
    /// Message id of the last message sent to this observer, matched by RST
    last_message_id: u16,
}

/// State owned by the serving task on the background loop
struct ServingTask {
    socket: UdpSocket,
    tree: Arc<ResourceTree>,
    changes: mpsc::UnboundedReceiver<String>,
    shutdown: watch::Receiver<bool>,
    observers: HashMap<String, Vec<Observer>>,
    message_id: u16,
    observe_sequence: u32,
}

impl ServingTask {
    async fn run(mut self) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                Some(path) = self.changes.recv() => self.notify_observers(&path).await,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        if datagram_fits(len, from) {
                            self.handle_datagram(&buf[..len], from).await;
                        }
                    }
                    Err(e) => warn!(error = %e, "CoAP server receive failed"),
                },
            }
        }

        debug!("CoAP serving task exited");
    }

    fn next_message_id(&mut self) -> u16 {
        self.message_id = self.message_id.wrapping_add(1);
        self.message_id
    }

    fn next_observe_sequence(&mut self) -> u32 {
        self.observe_sequence = (self.observe_sequence + 1) & 0x00FF_FFFF;
        self.observe_sequence
    }

    async fn send(&self, message: &Message, to: SocketAddr) {
        match message.encode() {
            Ok(bytes) => {
                if let Err(e) = self.socket.send_to(&bytes, to).await {
                    warn!(peer = %to, error = %e, "Failed to send CoAP message");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode CoAP message"),
        }
    }

    async fn handle_datagram(&mut self, datagram: &[u8], from: SocketAddr) {
        let request = match Message::decode(datagram) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %from, error = %e, "Dropping malformed CoAP datagram");
                return;
            }
        };

        if request.message_type == MessageType::Reset {
            self.remove_observer_by_reset(from, request.message_id);
            return;
        }

        if !request.code.is_request() {
            // ACKs for confirmable notifications and pings
            if request.is_confirmable() {
                self.send(&Message::reset(request.message_id), from).await;
            }
            return;
        }

        let path = request.path();
        let span = crate::coap_span!(method = %request.code, path = %path, peer = %from);
        let _enter = span.enter();

        let response_id = self.next_message_id();

        if path == DISCOVERY_PATH {
            let mut response = Message::response_to(&request, Code::CONTENT, response_id);
            if request.code == Code::GET {
                response.set_content_format(content_format::LINK_FORMAT);
                response.set_payload(format_link_format(&self.tree.links()));
            } else {
                response.code = Code::METHOD_NOT_ALLOWED;
            }
            self.send(&response, from).await;
            return;
        }

        let Some(handler) = self.tree.lookup(&path) else {
            debug!("No resource at path");
            let response = Message::response_to(&request, Code::NOT_FOUND, response_id);
            self.send(&response, from).await;
            return;
        };

        let reply = match request.code {
            Code::GET => handler.render_get(),
            Code::PUT => handler.render_put(&request.payload),
            Code::POST => handler.render_post(&request.payload),
            Code::DELETE => handler.render_delete(),
            _ => Reply::code(Code::METHOD_NOT_ALLOWED),
        };

        let mut response = Message::response_to(&request, reply.code, response_id);
        apply_reply(&mut response, &reply);

        if request.code == Code::GET && handler.is_observable() {
            match request.observe() {
                Some(OBSERVE_REGISTER) if reply.code != Code::METHOD_NOT_ALLOWED => {
                    let sequence = self.next_observe_sequence();
                    response.set_observe(sequence);
                    self.register_observer(&path, from, &request.token, response.message_id);
                }
                Some(OBSERVE_DEREGISTER) => self.remove_observer(&path, from, &request.token),
                _ => {}
            }
        }

        debug!(code = %response.code, "Answering request");
        self.send(&response, from).await;
    }

    fn register_observer(&mut self, path: &str, addr: SocketAddr, token: &[u8], message_id: u16) {
        let observers = self.observers.entry(path.to_string()).or_default();
        observers.retain(|o| !(o.addr == addr && o.token == token));
        observers.push(Observer {
            addr,
            token: token.to_vec(),
            last_message_id: message_id,
        });
        info!(path = %path, peer = %addr, count = observers.len(), "Observer registered");
    }

    fn remove_observer(&mut self, path: &str, addr: SocketAddr, token: &[u8]) {
        if let Some(observers) = self.observers.get_mut(path) {
            let before = observers.len();
            observers.retain(|o| !(o.addr == addr && o.token == token));
            if observers.len() < before {
                info!(path = %path, peer = %addr, "Observer deregistered");
            }
        }
    }

    fn remove_observer_by_reset(&mut self, addr: SocketAddr, message_id: u16) {
        for (path, observers) in self.observers.iter_mut() {
            let before = observers.len();
            observers.retain(|o| !(o.addr == addr && o.last_message_id == message_id));
            if observers.len() < before {
                info!(path = %path, peer = %addr, "Observer removed by reset");
            }
        }
    }

    async fn notify_observers(&mut self, path: &str) {
        let Some(handler) = self.tree.lookup(path) else {
            return;
        };
        let count = self.observers.get(path).map_or(0, Vec::len);
        if count == 0 {
            return;
        }

        let reply = handler.render_get();
        let sequence = self.next_observe_sequence();

        for index in 0..count {
            let message_id = self.next_message_id();
            let Some(observer) = self.observers.get_mut(path).and_then(|o| o.get_mut(index)) else {
                break;
            };
            observer.last_message_id = message_id;

            let mut notification = Message::new(
                MessageType::NonConfirmable,
                reply.code,
                message_id,
                observer.token.clone(),
            );
            notification.set_observe(sequence);
            apply_reply(&mut notification, &reply);

            let addr = observer.addr;
            self.send(&notification, addr).await;
        }

        debug!(path = %path, observers = count, sequence = sequence, "Observers notified");
    }
}

fn apply_reply(message: &mut Message, reply: &Reply) {
    if let Some(format) = reply.content_format {
        message.set_content_format(format);
    }
    if let Some(max_age) = reply.max_age {
        message.set_max_age(max_age);
    }
    if let Some(payload) = &reply.payload {
        message.set_payload(payload.as_bytes());
    }
}
