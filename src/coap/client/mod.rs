//! CoAP request/response client
//!
//! One capability interface, [`RequestResponseClient`], with two runtimes
//! chosen at construction:
//!
//! - [`BlockingCoapClient`]: sends on the caller's thread and waits for a
//!   receiver thread to deliver the response
//! - [`EventLoopCoapClient`]: submits every operation to a dedicated
//!   background loop and blocks on the result
//!
//! Both share [`CoapClient`], which owns path resolution, response handling,
//! the observation table and the listener binding. Observed actuator commands
//! reach the listener through a dispatcher thread, never on the transport
//! thread, so listeners are free to call back into the client.

pub mod blocking;
mod dispatch;
pub mod event_loop;
pub mod exchange;

use crate::coap::message::{content_format, Code, Message, OBSERVE_DEREGISTER, OBSERVE_REGISTER};
use crate::coap::{initial_message_id, new_token, parse_link_format, Link, DISCOVERY_PATH};
use crate::common::{is_actuator_command_path, resolve_host, resolve_path, DataMessageListener, ListenerSlot, ResourceName};
use crate::config::CoapGatewaySection;
use crate::data::codec::json_to_actuator_data;
use crate::error::CdaResult;
use dispatch::{CommandDispatcher, Dispatch};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

pub use crate::config::ClientRuntime;
pub use blocking::BlockingExchange;
pub use event_loop::EventLoopExchange;
pub use exchange::{Exchange, ExchangeError};

/// Timeout used when callers have no better value
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Observation lifetime used when callers have no better value
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Request/response operations shared by both runtimes.
///
/// Every operation reports failure through its return value; none of them
/// panic or return errors.
pub trait RequestResponseClient: Send + Sync {
    /// GET the well-known discovery path; returns whether a response arrived
    fn send_discovery_request(&self, timeout: Duration) -> bool {
        self.discover(timeout).is_some()
    }

    /// GET the well-known discovery path and parse the advertised links
    fn discover(&self, timeout: Duration) -> Option<Vec<Link>>;

    fn send_delete_request(
        &self,
        resource: Option<ResourceName>,
        name: Option<&str>,
        enable_con: bool,
        timeout: Duration,
    ) -> bool;

    fn send_get_request(
        &self,
        resource: Option<ResourceName>,
        name: Option<&str>,
        enable_con: bool,
        timeout: Duration,
    ) -> bool;

    fn send_post_request(
        &self,
        resource: Option<ResourceName>,
        name: Option<&str>,
        enable_con: bool,
        payload: Option<&str>,
        timeout: Duration,
    ) -> bool;

    fn send_put_request(
        &self,
        resource: Option<ResourceName>,
        name: Option<&str>,
        enable_con: bool,
        payload: Option<&str>,
        timeout: Duration,
    ) -> bool;

    /// Replace the bound listener
    fn set_data_message_listener(&self, listener: Arc<dyn DataMessageListener>) -> bool;

    /// Begin observing `resource` and/or `name`; a second start for the same
    /// resource without a stop is refused. Name-only targets share the `None`
    /// slot of the observation table.
    fn start_observer(&self, resource: Option<ResourceName>, name: Option<&str>, ttl: Duration) -> bool;

    /// Cancel observation of `resource`; stopping an unobserved resource is
    /// refused
    fn stop_observer(&self, resource: Option<ResourceName>, name: Option<&str>, timeout: Duration) -> bool;

    fn is_observing(&self, resource: Option<ResourceName>) -> bool;

    fn observed_resources(&self) -> Vec<Option<ResourceName>>;
}

/// One live observation
#[derive(Debug, Clone)]
pub struct ObservationEntry {
    pub token: Vec<u8>,
    pub path: String,
    /// Most recent notification; `None` until the first one arrives
    pub last_response: Option<Message>,
    pub ttl: Duration,
}

/// Observations keyed by resource; `None` holds the name-only target
type ObservationKey = Option<ResourceName>;
type ObservationTable = Arc<Mutex<HashMap<ObservationKey, ObservationEntry>>>;

fn lock_table(table: &ObservationTable) -> MutexGuard<'_, HashMap<ObservationKey, ObservationEntry>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client logic shared by both runtimes, generic over the transport seam
pub struct CoapClient<E: Exchange> {
    exchange: E,
    peer: SocketAddr,
    confirmable_observe: bool,
    listener: Arc<ListenerSlot>,
    observations: ObservationTable,
    dispatcher: CommandDispatcher,
    message_id: AtomicU16,
}

pub type BlockingCoapClient = CoapClient<BlockingExchange>;
pub type EventLoopCoapClient = CoapClient<EventLoopExchange>;

impl BlockingCoapClient {
    /// Resolve the gateway host and open the blocking runtime
    pub fn blocking(
        config: &CoapGatewaySection,
        listener: Option<Arc<dyn DataMessageListener>>,
    ) -> CdaResult<Self> {
        let peer = resolve_host(&config.host, config.port)?;
        let exchange = BlockingExchange::connect(peer)?;
        Ok(Self::with_exchange(exchange, peer, config, listener))
    }
}

impl EventLoopCoapClient {
    /// Resolve the gateway host and start the background loop
    pub fn event_loop(
        config: &CoapGatewaySection,
        listener: Option<Arc<dyn DataMessageListener>>,
    ) -> CdaResult<Self> {
        let peer = resolve_host(&config.host, config.port)?;
        let exchange = EventLoopExchange::connect(peer)?;
        Ok(Self::with_exchange(exchange, peer, config, listener))
    }
}

/// Construct the client for `runtime`
pub fn create_client(
    runtime: ClientRuntime,
    config: &CoapGatewaySection,
    listener: Option<Arc<dyn DataMessageListener>>,
) -> CdaResult<Box<dyn RequestResponseClient>> {
    let client: Box<dyn RequestResponseClient> = match runtime {
        ClientRuntime::Blocking => Box::new(CoapClient::blocking(config, listener)?),
        ClientRuntime::EventLoop => Box::new(CoapClient::event_loop(config, listener)?),
    };
    info!(runtime = ?runtime, host = %config.host, port = config.port, "CoAP client created");
    Ok(client)
}

impl<E: Exchange> CoapClient<E> {
    pub fn with_exchange(
        exchange: E,
        peer: SocketAddr,
        config: &CoapGatewaySection,
        listener: Option<Arc<dyn DataMessageListener>>,
    ) -> Self {
        let listener = Arc::new(ListenerSlot::new(listener));
        Self {
            exchange,
            peer,
            confirmable_observe: config.enable_confirmed_msgs,
            dispatcher: CommandDispatcher::new(listener.clone()),
            listener,
            observations: Arc::new(Mutex::new(HashMap::new())),
            message_id: AtomicU16::new(initial_message_id()),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Snapshot of one observation entry
    pub fn observation(&self, resource: Option<ResourceName>) -> Option<ObservationEntry> {
        lock_table(&self.observations).get(&resource).cloned()
    }

    fn next_message_id(&self) -> u16 {
        self.message_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send_request(
        &self,
        code: Code,
        resource: Option<ResourceName>,
        name: Option<&str>,
        enable_con: bool,
        payload: Option<&str>,
        timeout: Duration,
    ) -> bool {
        let path = resolve_path(resource, name);
        if path.is_empty() {
            warn!(method = %code, "No resource or name given, request not sent");
            return false;
        }

        let span = crate::coap_span!(method = %code, path = %path);
        let _enter = span.enter();

        let mut request = Message::request(code, enable_con, self.next_message_id(), new_token(), &path);
        if let Some(payload) = payload {
            request.set_content_format(content_format::JSON);
            request.set_payload(payload);
        }

        debug!(peer = %self.peer, confirmable = enable_con, "Sending request");

        let response = match self.exchange.exchange(request, timeout) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Request failed");
                return false;
            }
        };

        match code {
            Code::GET => self.on_get_response(&path, response.as_ref()),
            Code::PUT => self.on_put_response(&path, response.as_ref()),
            Code::POST => self.on_post_response(&path, response.as_ref()),
            _ => self.on_delete_response(&path, response.as_ref()),
        }
    }

    fn on_get_response(&self, path: &str, response: Option<&Message>) -> bool {
        let Some(response) = response else {
            warn!(path = %path, "No response to GET");
            return false;
        };

        if response.code == Code::EMPTY {
            info!(path = %path, "GET response carried no content");
            return false;
        }

        let payload = response.payload_str().unwrap_or_default();
        info!(path = %path, code = %response.code, payload = %payload, "GET response");

        if is_actuator_command_path(path) && !payload.is_empty() {
            self.forward_actuator_command(path, payload);
        }

        response.code.is_success()
    }

    fn on_put_response(&self, path: &str, response: Option<&Message>) -> bool {
        log_response("PUT", path, response)
    }

    fn on_post_response(&self, path: &str, response: Option<&Message>) -> bool {
        log_response("POST", path, response)
    }

    fn on_delete_response(&self, path: &str, response: Option<&Message>) -> bool {
        log_response("DELETE", path, response)
    }

    fn forward_actuator_command(&self, path: &str, payload: &str) {
        forward_actuator_payload(&self.listener, path, payload);
    }
}

fn log_response(method: &str, path: &str, response: Option<&Message>) -> bool {
    match response {
        Some(response) => {
            info!(
                path = %path,
                code = %response.code,
                payload = %response.payload_str().unwrap_or_default(),
                "{} response",
                method
            );
            response.code.is_success()
        }
        None => {
            warn!(path = %path, "No response to {}", method);
            false
        }
    }
}

/// Decode an actuator payload and hand it to the bound listener.
///
/// Decode failures are logged and dropped.
pub(crate) fn forward_actuator_payload(listener: &ListenerSlot, path: &str, payload: &str) {
    let data = match json_to_actuator_data(payload) {
        Ok(data) => data,
        Err(e) => {
            warn!(path = %path, payload = %payload, error = %e, "Failed to decode actuator command");
            return;
        }
    };

    match listener.get() {
        Some(listener) => {
            listener.handle_actuator_command_message(&data);
        }
        None => debug!(path = %path, "No data message listener bound, dropping actuator command"),
    }
}

impl<E: Exchange> RequestResponseClient for CoapClient<E> {
    fn discover(&self, timeout: Duration) -> Option<Vec<Link>> {
        let request = Message::request(Code::GET, false, self.next_message_id(), new_token(), DISCOVERY_PATH);

        match self.exchange.exchange(request, timeout) {
            Ok(Some(response)) if response.code.is_success() => {
                let links = parse_link_format(response.payload_str().unwrap_or_default());
                for link in &links {
                    info!(path = %link.path, observable = link.observable, "Discovered resource");
                }
                Some(links)
            }
            Ok(Some(response)) => {
                warn!(code = %response.code, "Discovery request rejected");
                None
            }
            Ok(None) => {
                warn!(peer = %self.peer, "No response to discovery request");
                None
            }
            Err(e) => {
                warn!(error = %e, "Discovery request failed");
                None
            }
        }
    }

    fn send_delete_request(
        &self,
        resource: Option<ResourceName>,
        name: Option<&str>,
        enable_con: bool,
        timeout: Duration,
    ) -> bool {
        self.send_request(Code::DELETE, resource, name, enable_con, None, timeout)
    }

    fn send_get_request(
        &self,
        resource: Option<ResourceName>,
        name: Option<&str>,
        enable_con: bool,
        timeout: Duration,
    ) -> bool {
        self.send_request(Code::GET, resource, name, enable_con, None, timeout)
    }

    fn send_post_request(
        &self,
        resource: Option<ResourceName>,
        name: Option<&str>,
        enable_con: bool,
        payload: Option<&str>,
        timeout: Duration,
    ) -> bool {
        self.send_request(Code::POST, resource, name, enable_con, payload, timeout)
    }

    fn send_put_request(
        &self,
        resource: Option<ResourceName>,
        name: Option<&str>,
        enable_con: bool,
        payload: Option<&str>,
        timeout: Duration,
    ) -> bool {
        self.send_request(Code::PUT, resource, name, enable_con, payload, timeout)
    }

    fn set_data_message_listener(&self, listener: Arc<dyn DataMessageListener>) -> bool {
        if self.listener.set(listener).is_some() {
            debug!("Replaced data message listener");
        }
        true
    }

    fn start_observer(&self, resource: Option<ResourceName>, name: Option<&str>, ttl: Duration) -> bool {
        let path = resolve_path(resource, name);
        if path.is_empty() {
            warn!("No resource or name given, not starting observer");
            return false;
        }

        let dispatch = match self.dispatcher.sender() {
            Ok(dispatch) => dispatch,
            Err(e) => {
                warn!(path = %path, error = %e, "Failed to start observation dispatcher");
                return false;
            }
        };
        let token = new_token();

        {
            let mut table = lock_table(&self.observations);
            if let Some(existing) = table.get(&resource) {
                warn!(
                    resource = ?resource,
                    path = %existing.path,
                    "Already observing resource, ignoring start request"
                );
                return false;
            }
            table.insert(
                resource,
                ObservationEntry {
                    token: token.clone(),
                    path: path.clone(),
                    last_response: None,
                    ttl,
                },
            );
        }

        let mut request = Message::request(
            Code::GET,
            self.confirmable_observe,
            self.next_message_id(),
            token,
            &path,
        );
        request.set_observe(OBSERVE_REGISTER);

        let on_notify = notification_handler(resource, self.observations.clone(), dispatch);

        match self.exchange.observe(request, on_notify) {
            Ok(()) => {
                info!(resource = ?resource, path = %path, ttl_secs = ttl.as_secs(), "Started observing");
                true
            }
            Err(e) => {
                lock_table(&self.observations).remove(&resource);
                warn!(resource = ?resource, path = %path, error = %e, "Failed to start observing");
                false
            }
        }
    }

    fn stop_observer(&self, resource: Option<ResourceName>, name: Option<&str>, timeout: Duration) -> bool {
        let Some(entry) = lock_table(&self.observations).remove(&resource) else {
            warn!(resource = ?resource, name = ?name, "Resource is not being observed, ignoring stop request");
            return false;
        };

        let cancel = match &entry.last_response {
            Some(last) => Message::reset(last.message_id),
            None => {
                warn!(
                    resource = ?resource,
                    "No notification received yet, sending deregistration instead of reset"
                );
                let mut request = Message::request(
                    Code::GET,
                    self.confirmable_observe,
                    self.next_message_id(),
                    entry.token.clone(),
                    &entry.path,
                );
                request.set_observe(OBSERVE_DEREGISTER);
                request
            }
        };

        match self.exchange.cancel_observe(&entry.token, cancel, timeout) {
            Ok(acknowledged) => {
                info!(resource = ?resource, path = %entry.path, acknowledged = acknowledged, "Stopped observing");
                true
            }
            Err(e) => {
                warn!(resource = ?resource, error = %e, "Failed to send observation cancellation");
                false
            }
        }
    }

    fn is_observing(&self, resource: Option<ResourceName>) -> bool {
        lock_table(&self.observations).contains_key(&resource)
    }

    fn observed_resources(&self) -> Vec<Option<ResourceName>> {
        let mut resources: Vec<ObservationKey> = lock_table(&self.observations).keys().copied().collect();
        resources.sort();
        resources
    }
}

/// Per-resource notification callback.
///
/// Records the notification in the table, then queues the payload for the
/// dispatcher to forward as an actuator command. Runs on the transport
/// thread, so it never calls the listener itself. Notifications for a
/// cancelled observation are dropped.
fn notification_handler(
    resource: ObservationKey,
    observations: ObservationTable,
    dispatch: Sender<Dispatch>,
) -> exchange::NotifyCallback {
    Arc::new(move |notification: Message| {
        let path = {
            let mut table = lock_table(&observations);
            let Some(entry) = table.get_mut(&resource) else {
                debug!(resource = ?resource, "Notification for cancelled observation dropped");
                return;
            };
            entry.last_response = Some(notification.clone());
            entry.path.clone()
        };

        if notification.code == Code::EMPTY {
            debug!(resource = ?resource, "Observed resource has no data yet");
            return;
        }
        if !notification.code.is_success() {
            warn!(resource = ?resource, code = %notification.code, "Observation rejected by server");
            return;
        }

        debug!(
            resource = ?resource,
            sequence = ?notification.observe(),
            "Observation notification"
        );

        let Some(payload) = notification.payload_str() else {
            debug!(resource = ?resource, "Empty notification");
            return;
        };
        let command = Dispatch::Command {
            path,
            payload: payload.to_string(),
        };
        if dispatch.send(command).is_err() {
            debug!(resource = ?resource, "Client dropped, notification discarded");
        }
    })
}
