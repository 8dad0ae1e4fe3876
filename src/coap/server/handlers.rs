//! Resource handlers served by the CoAP server adapter
//!
//! - [`ObservableResource`]: holds the latest pushed record and serves it
//!   on GET ([`GetTelemetryResourceHandler`],
//!   [`GetSystemPerformanceResourceHandler`])
//! - [`UpdateActuatorResourceHandler`]: decodes PUT payloads as actuator
//!   commands and relays them to the data-message listener

use crate::coap::message::{content_format, Code};
use crate::common::{ListenerSlot, SystemPerformanceDataListener, TelemetryDataListener};
use crate::data::codec::{actuator_data_to_json, from_json_bytes, to_json};
use crate::data::{ActuatorData, IotData, SensorData, SystemPerformanceData};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// Outcome of one handler invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: Code,
    pub payload: Option<String>,
    pub content_format: Option<u16>,
    pub max_age: Option<u32>,
}

impl Reply {
    /// Reply carrying only a code
    pub fn code(code: Code) -> Self {
        Self {
            code,
            payload: None,
            content_format: None,
            max_age: None,
        }
    }

    pub fn json(code: Code, body: String) -> Self {
        Self {
            code,
            payload: Some(body),
            content_format: Some(content_format::JSON),
            max_age: None,
        }
    }

    pub fn text(code: Code, body: &str) -> Self {
        Self {
            code,
            payload: Some(body.to_string()),
            content_format: Some(content_format::TEXT_PLAIN),
            max_age: None,
        }
    }

    pub fn with_max_age(mut self, seconds: u32) -> Self {
        self.max_age = Some(seconds);
        self
    }
}

/// Signals the serving task that the resource at `path` changed
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    path: String,
    tx: UnboundedSender<String>,
}

impl ChangeNotifier {
    pub fn new(path: String, tx: UnboundedSender<String>) -> Self {
        Self { path, tx }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn notify(&self) -> bool {
        self.tx.send(self.path.clone()).is_ok()
    }
}

/// Per-resource request logic. Unimplemented methods answer 4.05.
pub trait ResourceHandler: Send + Sync {
    fn name(&self) -> &str;

    fn is_observable(&self) -> bool {
        false
    }

    fn render_get(&self) -> Reply {
        Reply::code(Code::METHOD_NOT_ALLOWED)
    }

    fn render_put(&self, _payload: &[u8]) -> Reply {
        Reply::code(Code::METHOD_NOT_ALLOWED)
    }

    fn render_post(&self, _payload: &[u8]) -> Reply {
        Reply::code(Code::METHOD_NOT_ALLOWED)
    }

    fn render_delete(&self) -> Reply {
        Reply::code(Code::METHOD_NOT_ALLOWED)
    }

    /// Bind the change notifier of a running server; observable handlers only
    fn attach_notifier(&self, _notifier: ChangeNotifier) {}
}

/// Observable resource serving the most recently pushed record
pub struct ObservableResource<T> {
    name: String,
    max_age: u32,
    current: Mutex<Option<T>>,
    changed: AtomicBool,
    notifier: Mutex<Option<ChangeNotifier>>,
}

pub type GetTelemetryResourceHandler = ObservableResource<SensorData>;
pub type GetSystemPerformanceResourceHandler = ObservableResource<SystemPerformanceData>;

impl<T: IotData + Clone> ObservableResource<T> {
    /// `poll_cycles` becomes the response max-age in seconds
    pub fn new(name: &str, poll_cycles: u32) -> Self {
        Self {
            name: name.to_string(),
            max_age: poll_cycles,
            current: Mutex::new(None),
            changed: AtomicBool::new(false),
            notifier: Mutex::new(None),
        }
    }

    pub fn current(&self) -> Option<T> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// True when an update arrived that has not been served yet
    pub fn has_changed(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }

    /// Replace the stored record and wake observers
    pub fn update(&self, data: &T) -> bool {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(data.clone());
        self.changed.store(true, Ordering::Release);

        debug!(resource = %self.name, kind = T::KIND, "Resource updated");

        if let Ok(notifier) = self.notifier.lock() {
            if let Some(notifier) = notifier.as_ref() {
                if !notifier.notify() {
                    debug!(resource = %self.name, "Server not running, no observers notified");
                }
            }
        }
        true
    }
}

impl<T: IotData + Clone> ResourceHandler for ObservableResource<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_observable(&self) -> bool {
        true
    }

    fn render_get(&self) -> Reply {
        let Some(data) = self.current() else {
            debug!(resource = %self.name, "No {} available yet", T::KIND);
            return Reply::code(Code::EMPTY);
        };

        let reply = match to_json(&data) {
            Ok(body) => Reply::json(Code::CONTENT, body).with_max_age(self.max_age),
            Err(e) => {
                warn!(resource = %self.name, error = %e, "Failed to encode {}", T::KIND);
                Reply::code(Code::INTERNAL_SERVER_ERROR)
            }
        };

        self.changed.store(false, Ordering::Release);
        reply
    }

    fn attach_notifier(&self, notifier: ChangeNotifier) {
        debug!(resource = %self.name, path = %notifier.path(), "Observer notifications attached");
        if let Ok(mut slot) = self.notifier.lock() {
            *slot = Some(notifier);
        }
    }
}

impl TelemetryDataListener for ObservableResource<SensorData> {
    fn on_sensor_data_update(&self, data: &SensorData) -> bool {
        self.update(data)
    }
}

impl SystemPerformanceDataListener for ObservableResource<SystemPerformanceData> {
    fn on_system_performance_data_update(&self, data: &SystemPerformanceData) -> bool {
        self.update(data)
    }
}

/// PUT handler relaying actuator commands to the data-message listener
pub struct UpdateActuatorResourceHandler {
    name: String,
    listener: Arc<ListenerSlot>,
}

impl UpdateActuatorResourceHandler {
    pub fn new(name: &str, listener: Arc<ListenerSlot>) -> Self {
        Self {
            name: name.to_string(),
            listener,
        }
    }
}

impl ResourceHandler for UpdateActuatorResourceHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn render_put(&self, payload: &[u8]) -> Reply {
        let command: ActuatorData = match from_json_bytes(payload) {
            Ok(command) => command,
            Err(e) => {
                warn!(
                    resource = %self.name,
                    payload = %String::from_utf8_lossy(payload),
                    error = %e,
                    "Rejecting undecodable actuator command"
                );
                return Reply::code(Code::BAD_REQUEST);
            }
        };

        info!(
            resource = %self.name,
            actuator = %command.base().name,
            command = command.command,
            "Actuator command received"
        );

        let response = self
            .listener
            .get()
            .and_then(|listener| listener.handle_actuator_command_message(&command));

        let (code, record) = match response {
            Some(record) => (Code::CHANGED, record),
            None => {
                warn!(resource = %self.name, "Actuator command not applied, answering with failure response");
                (Code::PRECONDITION_FAILED, ActuatorData::failure_response(&command))
            }
        };

        match actuator_data_to_json(&record) {
            Ok(body) => Reply::json(code, body),
            Err(e) => {
                warn!(resource = %self.name, error = %e, "Failed to encode actuator response");
                Reply::code(Code::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::DataMessageListener;
    use crate::data::codec::json_to_actuator_data;
    use crate::data::{COMMAND_ON, HVAC_ACTUATOR_TYPE};
    use crate::testing::mocks::MockDataMessageListener;

    #[test]
    fn test_telemetry_get_before_update_is_empty() {
        let handler = GetTelemetryResourceHandler::new("SensorMsg", 5);
        let reply = handler.render_get();
        assert_eq!(reply.code, Code::EMPTY);
        assert!(reply.payload.is_none());
    }

    #[test]
    fn test_telemetry_get_serves_latest_and_clears_changed() {
        let handler = GetTelemetryResourceHandler::new("SensorMsg", 7);
        handler.on_sensor_data_update(&SensorData::new("temp", 1, 20.0));
        handler.on_sensor_data_update(&SensorData::new("temp", 1, 21.5));
        assert!(handler.has_changed());

        let reply = handler.render_get();
        assert_eq!(reply.code, Code::CONTENT);
        assert_eq!(reply.max_age, Some(7));
        assert_eq!(reply.content_format, Some(content_format::JSON));
        assert!(reply.payload.unwrap().contains("21.5"));
        assert!(!handler.has_changed());
    }

    #[test]
    fn test_update_notifies_attached_server() {
        let handler = GetSystemPerformanceResourceHandler::new("SystemPerfMsg", 5);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        handler.attach_notifier(ChangeNotifier::new("PIOT/ConstrainedDevice/SystemPerfMsg".to_string(), tx));

        handler.on_system_performance_data_update(&SystemPerformanceData::new(10.0, 20.0, 30.0));
        assert_eq!(rx.try_recv().unwrap(), "PIOT/ConstrainedDevice/SystemPerfMsg");
    }

    #[test]
    fn test_observable_rejects_put() {
        let handler = GetTelemetryResourceHandler::new("SensorMsg", 5);
        assert_eq!(handler.render_put(b"{}").code, Code::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn test_actuator_put_success_is_changed() {
        let listener: Arc<dyn DataMessageListener> = Arc::new(MockDataMessageListener::new());
        let handler = UpdateActuatorResourceHandler::new("HvacActuator", Arc::new(ListenerSlot::new(Some(listener))));

        let command = ActuatorData::new("hvac", HVAC_ACTUATOR_TYPE, COMMAND_ON, 22.0);
        let body = actuator_data_to_json(&command).unwrap();
        let reply = handler.render_put(body.as_bytes());

        assert_eq!(reply.code, Code::CHANGED);
        let response = json_to_actuator_data(&reply.payload.unwrap()).unwrap();
        assert!(response.is_response);
        assert_eq!(response.base.status_code, 0);
    }

    #[test]
    fn test_actuator_put_without_result_is_precondition_failed() {
        let listener: Arc<dyn DataMessageListener> = Arc::new(MockDataMessageListener::rejecting());
        let handler = UpdateActuatorResourceHandler::new("HvacActuator", Arc::new(ListenerSlot::new(Some(listener))));

        let command = ActuatorData::new("hvac", HVAC_ACTUATOR_TYPE, COMMAND_ON, 22.0);
        let reply = handler.render_put(actuator_data_to_json(&command).unwrap().as_bytes());

        assert_eq!(reply.code, Code::PRECONDITION_FAILED);
        let response = json_to_actuator_data(&reply.payload.unwrap()).unwrap();
        assert_eq!(response.base.status_code, -1);
        assert!(response.is_response);
        assert_eq!(response.command, COMMAND_ON);
        assert_eq!(response.value, 22.0);
    }

    #[test]
    fn test_actuator_put_without_listener_is_precondition_failed() {
        let handler = UpdateActuatorResourceHandler::new("HvacActuator", Arc::new(ListenerSlot::new(None)));
        let command = ActuatorData::new("hvac", HVAC_ACTUATOR_TYPE, COMMAND_ON, 22.0);
        let reply = handler.render_put(actuator_data_to_json(&command).unwrap().as_bytes());
        assert_eq!(reply.code, Code::PRECONDITION_FAILED);
    }

    #[test]
    fn test_actuator_put_malformed_is_bad_request() {
        let handler = UpdateActuatorResourceHandler::new("HvacActuator", Arc::new(ListenerSlot::new(None)));
        assert_eq!(handler.render_put(b"{oops").code, Code::BAD_REQUEST);
        assert_eq!(handler.render_put(&[0xff, 0xfe]).code, Code::BAD_REQUEST);
        assert_eq!(handler.render_get().code, Code::METHOD_NOT_ALLOWED);
    }
}
