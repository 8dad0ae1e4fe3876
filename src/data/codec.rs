//! JSON wire codec for device records
//!
//! Every adapter encodes outbound records and decodes inbound payloads here.
//! Decode failures are reported as [`CodecError::Decode`] so callers can tell
//! a malformed payload apart from any other failure.

use super::{ActuatorData, IotData, SensorData, SystemPerformanceData};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Failed to decode {kind} payload: {source}")]
    Decode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{kind} payload is not valid UTF-8")]
    InvalidUtf8 { kind: &'static str },
    #[error("Failed to encode {kind}: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl CodecError {
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            CodecError::Decode { .. } | CodecError::InvalidUtf8 { .. }
        )
    }
}

/// Encode any record as a JSON object
pub fn to_json<T: IotData>(data: &T) -> Result<String, CodecError> {
    serde_json::to_string(data).map_err(|source| CodecError::Encode {
        kind: T::KIND,
        source,
    })
}

/// Decode a JSON object into a record
pub fn from_json<T: IotData>(json: &str) -> Result<T, CodecError> {
    serde_json::from_str(json).map_err(|source| CodecError::Decode {
        kind: T::KIND,
        source,
    })
}

/// Decode a raw payload, rejecting non UTF-8 bytes before parsing
pub fn from_json_bytes<T: IotData>(payload: &[u8]) -> Result<T, CodecError> {
    let json = std::str::from_utf8(payload).map_err(|_| CodecError::InvalidUtf8 { kind: T::KIND })?;
    from_json(json)
}

pub fn actuator_data_to_json(data: &ActuatorData) -> Result<String, CodecError> {
    to_json(data)
}

pub fn json_to_actuator_data(json: &str) -> Result<ActuatorData, CodecError> {
    from_json(json)
}

pub fn sensor_data_to_json(data: &SensorData) -> Result<String, CodecError> {
    to_json(data)
}

pub fn json_to_sensor_data(json: &str) -> Result<SensorData, CodecError> {
    from_json(json)
}

pub fn system_performance_data_to_json(data: &SystemPerformanceData) -> Result<String, CodecError> {
    to_json(data)
}

pub fn json_to_system_performance_data(json: &str) -> Result<SystemPerformanceData, CodecError> {
    from_json(json)
}
