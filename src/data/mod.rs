//! Telemetry, actuation and system-performance records
//!
//! These are plain value objects created by domain logic. The connection
//! layer only serializes them (see [`codec`]) and, for actuator commands,
//! stamps response status.

pub mod codec;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub use codec::CodecError;

pub const DEFAULT_NAME: &str = "Not Set";
pub const DEFAULT_LOCATION_ID: &str = "constraineddevice001";
pub const DEFAULT_STATUS: i32 = 0;
pub const DEFAULT_TYPE_ID: i32 = 0;

pub const COMMAND_OFF: i32 = 0;
pub const COMMAND_ON: i32 = 1;

pub const HUMIDIFIER_ACTUATOR_TYPE: i32 = 1;
pub const HVAC_ACTUATOR_TYPE: i32 = 2;
pub const SYSTEM_PERF_TYPE: i32 = 9;

/// Metadata shared by every record type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BaseIotData {
    pub name: String,
    #[serde(rename = "typeID")]
    pub type_id: i32,
    pub time_stamp: DateTime<Utc>,
    pub status_code: i32,
    pub has_error: bool,
    #[serde(rename = "locationID")]
    pub location_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: f64,
}

impl Default for BaseIotData {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            type_id: DEFAULT_TYPE_ID,
            time_stamp: Utc::now(),
            status_code: DEFAULT_STATUS,
            has_error: false,
            location_id: DEFAULT_LOCATION_ID.to_string(),
            latitude: 0.0,
            longitude: 0.0,
            elevation: 0.0,
        }
    }
}

impl BaseIotData {
    pub fn with_name(name: &str, type_id: i32) -> Self {
        Self {
            name: name.to_string(),
            type_id,
            ..Default::default()
        }
    }

    /// Set the status code; a negative code marks the record as errored.
    pub fn set_status_code(&mut self, status_code: i32) {
        self.status_code = status_code;
        self.has_error = status_code < 0;
    }

    /// Copy metadata from another record and refresh the timestamp
    pub fn update_base(&mut self, other: &BaseIotData) {
        self.name = other.name.clone();
        self.type_id = other.type_id;
        self.status_code = other.status_code;
        self.has_error = other.has_error;
        self.location_id = other.location_id.clone();
        self.latitude = other.latitude;
        self.longitude = other.longitude;
        self.elevation = other.elevation;
        self.time_stamp = Utc::now();
    }
}

/// Record types the codec can carry
pub trait IotData: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Human-readable kind used in logs and codec errors
    const KIND: &'static str;

    fn base(&self) -> &BaseIotData;
}

/// Single telemetry reading
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SensorData {
    #[serde(flatten)]
    pub base: BaseIotData,
    pub value: f64,
}

impl SensorData {
    pub fn new(name: &str, type_id: i32, value: f64) -> Self {
        Self {
            base: BaseIotData::with_name(name, type_id),
            value,
        }
    }
}

impl IotData for SensorData {
    const KIND: &'static str = "SensorData";

    fn base(&self) -> &BaseIotData {
        &self.base
    }
}

/// Actuation command, or the response to one
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActuatorData {
    #[serde(flatten)]
    pub base: BaseIotData,
    pub command: i32,
    pub value: f64,
    pub state_data: String,
    pub is_response: bool,
}

impl ActuatorData {
    pub fn new(name: &str, type_id: i32, command: i32, value: f64) -> Self {
        Self {
            base: BaseIotData::with_name(name, type_id),
            command,
            value,
            ..Default::default()
        }
    }

    pub fn set_as_response(&mut self) {
        self.is_response = true;
    }

    pub fn set_status_code(&mut self, status_code: i32) {
        self.base.set_status_code(status_code);
    }

    /// Copy every field of `other` into this record
    pub fn update_data(&mut self, other: &ActuatorData) {
        self.base.update_base(&other.base);
        self.command = other.command;
        self.value = other.value;
        self.state_data = other.state_data.clone();
        self.is_response = other.is_response;
    }

    /// Failure response echoing `command`: marked as a response with status -1
    pub fn failure_response(command: &ActuatorData) -> Self {
        let mut response = ActuatorData::default();
        response.update_data(command);
        response.set_as_response();
        response.set_status_code(-1);
        response
    }
}

impl IotData for ActuatorData {
    const KIND: &'static str = "ActuatorData";

    fn base(&self) -> &BaseIotData {
        &self.base
    }
}

/// Device resource utilization snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SystemPerformanceData {
    #[serde(flatten)]
    pub base: BaseIotData,
    pub cpu_util: f64,
    pub mem_util: f64,
    pub disk_util: f64,
}

impl SystemPerformanceData {
    pub fn new(cpu_util: f64, mem_util: f64, disk_util: f64) -> Self {
        Self {
            base: BaseIotData::with_name("SystemPerfMsg", SYSTEM_PERF_TYPE),
            cpu_util,
            mem_util,
            disk_util,
        }
    }
}

impl IotData for SystemPerformanceData {
    const KIND: &'static str = "SystemPerformanceData";

    fn base(&self) -> &BaseIotData {
        &self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_status_marks_error() {
        let mut data = ActuatorData::new("hvac", HVAC_ACTUATOR_TYPE, COMMAND_ON, 21.5);
        data.set_status_code(-1);
        assert!(data.base.has_error);

        data.set_status_code(0);
        assert!(!data.base.has_error);
    }

    #[test]
    fn test_failure_response_echoes_command() {
        let mut command = ActuatorData::new("humidifier", HUMIDIFIER_ACTUATOR_TYPE, COMMAND_ON, 42.0);
        command.state_data = "target".to_string();
        command.base.location_id = "greenhouse".to_string();

        let response = ActuatorData::failure_response(&command);

        assert!(response.is_response);
        assert_eq!(response.base.status_code, -1);
        assert!(response.base.has_error);
        assert_eq!(response.base.name, "humidifier");
        assert_eq!(response.base.type_id, HUMIDIFIER_ACTUATOR_TYPE);
        assert_eq!(response.base.location_id, "greenhouse");
        assert_eq!(response.command, COMMAND_ON);
        assert_eq!(response.value, 42.0);
        assert_eq!(response.state_data, "target");
        // Input is untouched
        assert!(!command.is_response);
    }

    #[test]
    fn test_defaults() {
        let data = SensorData::default();
        assert_eq!(data.base.name, DEFAULT_NAME);
        assert_eq!(data.base.location_id, DEFAULT_LOCATION_ID);
        assert_eq!(data.base.status_code, DEFAULT_STATUS);
        assert_eq!(data.value, 0.0);
    }
}
