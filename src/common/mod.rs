//! Shared resource naming, host resolution and the data-message listener bridge

pub mod listener;
pub mod net;
pub mod resource;

pub use listener::{
    DataMessageListener, DefaultDataMessageListener, ListenerSlot, SystemPerformanceDataListener,
    TelemetryDataListener,
};
pub use net::resolve_host;
pub use resource::{is_actuator_command_path, resolve_path, ResourceName};
