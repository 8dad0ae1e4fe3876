//! Data-message listener bridge between protocol adapters and domain logic
//!
//! Adapters hand decoded commands up through [`DataMessageListener`] and
//! register their observable resources as telemetry/system-performance
//! listeners so domain logic can push fresh records down to them.

use super::resource::ResourceName;
use crate::data::{ActuatorData, SensorData, SystemPerformanceData};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Receives pushed telemetry records
pub trait TelemetryDataListener: Send + Sync {
    fn on_sensor_data_update(&self, data: &SensorData) -> bool;
}

/// Receives pushed system-performance records
pub trait SystemPerformanceDataListener: Send + Sync {
    fn on_system_performance_data_update(&self, data: &SystemPerformanceData) -> bool;
}

/// Single callback abstraction implemented by domain logic
pub trait DataMessageListener: Send + Sync {
    /// Handle an inbound actuator command. Returns the response record, or
    /// `None` when the command could not be applied.
    fn handle_actuator_command_message(&self, data: &ActuatorData) -> Option<ActuatorData>;

    /// Handle an inbound message on any other resource
    fn handle_incoming_message(&self, resource: ResourceName, msg: &str) -> bool {
        debug!(resource = %resource, "Unhandled incoming message: {}", msg);
        false
    }

    fn set_telemetry_data_listener(&self, listener: Arc<dyn TelemetryDataListener>);

    fn set_system_performance_data_listener(&self, listener: Arc<dyn SystemPerformanceDataListener>);
}

/// At-most-one listener binding; setting replaces the previous listener.
#[derive(Default)]
pub struct ListenerSlot {
    inner: RwLock<Option<Arc<dyn DataMessageListener>>>,
}

impl ListenerSlot {
    pub fn new(listener: Option<Arc<dyn DataMessageListener>>) -> Self {
        Self {
            inner: RwLock::new(listener),
        }
    }

    /// Replace the bound listener, returning the previous one
    pub fn set(&self, listener: Arc<dyn DataMessageListener>) -> Option<Arc<dyn DataMessageListener>> {
        let mut slot = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        slot.replace(listener)
    }

    pub fn get(&self) -> Option<Arc<dyn DataMessageListener>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_set(&self) -> bool {
        self.get().is_some()
    }
}

impl std::fmt::Debug for ListenerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSlot")
            .field("bound", &self.is_set())
            .finish()
    }
}

/// Logging listener used when no domain logic is attached.
///
/// Acknowledges every actuator command with a status-0 response and relays
/// pushed records to whichever resource listeners registered last.
#[derive(Default)]
pub struct DefaultDataMessageListener {
    telemetry_listener: Mutex<Option<Arc<dyn TelemetryDataListener>>>,
    sys_perf_listener: Mutex<Option<Arc<dyn SystemPerformanceDataListener>>>,
    latest_command: Mutex<Option<ActuatorData>>,
}

impl DefaultDataMessageListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a telemetry record to the registered telemetry listener
    pub fn handle_sensor_message(&self, data: &SensorData) -> bool {
        let listener = self
            .telemetry_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match listener {
            Some(listener) => listener.on_sensor_data_update(data),
            None => {
                debug!("No telemetry listener registered, dropping sensor update");
                false
            }
        }
    }

    /// Push a system-performance record to the registered listener
    pub fn handle_system_performance_message(&self, data: &SystemPerformanceData) -> bool {
        let listener = self
            .sys_perf_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match listener {
            Some(listener) => listener.on_system_performance_data_update(data),
            None => {
                debug!("No system performance listener registered, dropping update");
                false
            }
        }
    }

    pub fn latest_actuator_command(&self) -> Option<ActuatorData> {
        self.latest_command
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl DataMessageListener for DefaultDataMessageListener {
    fn handle_actuator_command_message(&self, data: &ActuatorData) -> Option<ActuatorData> {
        info!(
            name = %data.base.name,
            command = data.command,
            value = data.value,
            "Actuator command received"
        );

        if let Ok(mut latest) = self.latest_command.lock() {
            *latest = Some(data.clone());
        }

        let mut response = ActuatorData::default();
        response.update_data(data);
        response.set_as_response();
        response.set_status_code(0);
        Some(response)
    }

    fn handle_incoming_message(&self, resource: ResourceName, msg: &str) -> bool {
        info!(resource = %resource, "Incoming message: {}", msg);
        true
    }

    fn set_telemetry_data_listener(&self, listener: Arc<dyn TelemetryDataListener>) {
        match self.telemetry_listener.lock() {
            Ok(mut slot) => *slot = Some(listener),
            Err(_) => warn!("Telemetry listener lock poisoned, listener not registered"),
        }
    }

    fn set_system_performance_data_listener(&self, listener: Arc<dyn SystemPerformanceDataListener>) {
        match self.sys_perf_listener.lock() {
            Ok(mut slot) => *slot = Some(listener),
            Err(_) => warn!("System performance listener lock poisoned, listener not registered"),
        }
    }
}
