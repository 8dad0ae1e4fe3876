//! Resource names and path resolution
//!
//! Every resource the device exposes (or consumes) has a canonical,
//! slash-delimited path rooted at `PIOT/ConstrainedDevice`. The same string
//! is used as the CoAP resource path and as the MQTT topic.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Product root segment shared by all resources
pub const PRODUCT_NAME: &str = "PIOT";
/// Device-class segment for constrained device resources
pub const CONSTRAINED_DEVICE: &str = "ConstrainedDevice";

pub const ACTUATOR_CMD: &str = "ActuatorCmd";
pub const ACTUATOR_RESPONSE: &str = "ActuatorResponse";
pub const MGMT_STATUS_MSG: &str = "MgmtStatusMsg";
pub const MGMT_STATUS_CMD: &str = "MgmtStatusCmd";
pub const REGISTRATION_REQUEST: &str = "RegRequest";
pub const SENSOR_MSG: &str = "SensorMsg";
pub const SYSTEM_PERF_MSG: &str = "SystemPerfMsg";

/// Default actuator names served under the actuator-command resource
pub const HUMIDIFIER_ACTUATOR_NAME: &str = "HumidifierActuator";
pub const HVAC_ACTUATOR_NAME: &str = "HvacActuator";

/// Separator between path segments
pub const PATH_SEPARATOR: char = '/';

/// Named, addressable device resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceName {
    CdaActuatorCmd,
    CdaActuatorResponse,
    CdaMgmtStatusMsg,
    CdaMgmtStatusCmd,
    CdaRegistrationRequest,
    CdaSensorMsg,
    CdaSystemPerfMsg,
}

impl ResourceName {
    /// All known resources, in declaration order
    pub const ALL: [ResourceName; 7] = [
        ResourceName::CdaActuatorCmd,
        ResourceName::CdaActuatorResponse,
        ResourceName::CdaMgmtStatusMsg,
        ResourceName::CdaMgmtStatusCmd,
        ResourceName::CdaRegistrationRequest,
        ResourceName::CdaSensorMsg,
        ResourceName::CdaSystemPerfMsg,
    ];

    /// Canonical path segment, e.g. `PIOT/ConstrainedDevice/ActuatorCmd`
    pub fn segment(&self) -> &'static str {
        match self {
            ResourceName::CdaActuatorCmd => "PIOT/ConstrainedDevice/ActuatorCmd",
            ResourceName::CdaActuatorResponse => "PIOT/ConstrainedDevice/ActuatorResponse",
            ResourceName::CdaMgmtStatusMsg => "PIOT/ConstrainedDevice/MgmtStatusMsg",
            ResourceName::CdaMgmtStatusCmd => "PIOT/ConstrainedDevice/MgmtStatusCmd",
            ResourceName::CdaRegistrationRequest => "PIOT/ConstrainedDevice/RegRequest",
            ResourceName::CdaSensorMsg => "PIOT/ConstrainedDevice/SensorMsg",
            ResourceName::CdaSystemPerfMsg => "PIOT/ConstrainedDevice/SystemPerfMsg",
        }
    }

    /// Final segment naming the data type, e.g. `ActuatorCmd`
    pub fn data_type(&self) -> &'static str {
        match self {
            ResourceName::CdaActuatorCmd => ACTUATOR_CMD,
            ResourceName::CdaActuatorResponse => ACTUATOR_RESPONSE,
            ResourceName::CdaMgmtStatusMsg => MGMT_STATUS_MSG,
            ResourceName::CdaMgmtStatusCmd => MGMT_STATUS_CMD,
            ResourceName::CdaRegistrationRequest => REGISTRATION_REQUEST,
            ResourceName::CdaSensorMsg => SENSOR_MSG,
            ResourceName::CdaSystemPerfMsg => SYSTEM_PERF_MSG,
        }
    }

    /// Map a topic or resource path back to its resource.
    ///
    /// Leading and trailing separators are ignored; sub-paths below a
    /// resource (e.g. `.../ActuatorCmd/HvacActuator`) map to that resource.
    pub fn from_path(path: &str) -> Option<Self> {
        let trimmed = path.trim_matches(PATH_SEPARATOR);
        ResourceName::ALL.into_iter().find(|resource| {
            let segment = resource.segment();
            trimmed == segment
                || trimmed
                    .strip_prefix(segment)
                    .is_some_and(|rest| rest.starts_with(PATH_SEPARATOR))
        })
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.segment())
    }
}

/// Build a resource path from an optional resource and an optional sub-name.
///
/// An empty name counts as absent. With both present the two are joined by a
/// single separator.
pub fn resolve_path(resource: Option<ResourceName>, name: Option<&str>) -> String {
    let name = name.filter(|n| !n.is_empty());

    match (resource, name) {
        (Some(resource), Some(name)) => {
            format!("{}{}{}", resource.segment(), PATH_SEPARATOR, name)
        }
        (Some(resource), None) => resource.segment().to_string(),
        (None, Some(name)) => name.to_string(),
        (None, None) => String::new(),
    }
}

/// Data-type segment of a resolved path (the third segment), if any
pub fn data_type_of(path: &str) -> Option<&str> {
    path.trim_start_matches(PATH_SEPARATOR)
        .split(PATH_SEPARATOR)
        .nth(2)
        .filter(|segment| !segment.is_empty())
}

/// True when the path addresses the actuator-command resource or a child of it
pub fn is_actuator_command_path(path: &str) -> bool {
    data_type_of(path) == Some(ACTUATOR_CMD)
}
