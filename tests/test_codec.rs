//! Tests for the JSON record codec
//!
//! Property tests check that every record type survives encoding with all
//! fields intact; example tests pin the wire field names and the error
//! classification for malformed input.

use cda_agent::data::codec::{
    actuator_data_to_json, from_json_bytes, json_to_actuator_data, json_to_sensor_data,
    json_to_system_performance_data, sensor_data_to_json, system_performance_data_to_json,
};
use cda_agent::data::{ActuatorData, BaseIotData, SensorData, SystemPerformanceData};
use chrono::{DateTime, Utc};
use proptest::prelude::*;

fn finite_f64() -> impl Strategy<Value = f64> {
    any::<f64>().prop_filter("finite", |v| v.is_finite())
}

fn timestamp() -> impl Strategy<Value = DateTime<Utc>> {
    (0i64..4_102_444_800, 0u32..1_000_000_000)
        .prop_filter_map("valid timestamp", |(secs, nanos)| DateTime::from_timestamp(secs, nanos))
}

prop_compose! {
    fn base_iot_data()(
        name in "\\PC{0,24}",
        type_id in any::<i32>(),
        time_stamp in timestamp(),
        status_code in any::<i32>(),
        location_id in "\\PC{0,24}",
        latitude in finite_f64(),
        longitude in finite_f64(),
        elevation in finite_f64(),
    ) -> BaseIotData {
        BaseIotData {
            name,
            type_id,
            time_stamp,
            status_code,
            has_error: status_code < 0,
            location_id,
            latitude,
            longitude,
            elevation,
        }
    }
}

prop_compose! {
    fn sensor_data()(base in base_iot_data(), value in finite_f64()) -> SensorData {
        SensorData { base, value }
    }
}

prop_compose! {
    fn actuator_data()(
        base in base_iot_data(),
        command in any::<i32>(),
        value in finite_f64(),
        state_data in "\\PC{0,64}",
        is_response in any::<bool>(),
    ) -> ActuatorData {
        ActuatorData { base, command, value, state_data, is_response }
    }
}

prop_compose! {
    fn system_performance_data()(
        base in base_iot_data(),
        cpu_util in finite_f64(),
        mem_util in finite_f64(),
        disk_util in finite_f64(),
    ) -> SystemPerformanceData {
        SystemPerformanceData { base, cpu_util, mem_util, disk_util }
    }
}

/// Bit-exact comparison; zero is compared by value since its sign may be
/// written either way.
fn same_float(left: f64, right: f64) -> bool {
    left == right && (left == 0.0 || left.to_bits() == right.to_bits())
}

proptest! {
    #[test]
    fn prop_float_value_is_bit_exact(value in finite_f64()) {
        let data = SensorData::new("TempSensor", 1, value);
        let decoded = json_to_sensor_data(&sensor_data_to_json(&data).unwrap()).unwrap();
        prop_assert!(same_float(decoded.value, value), "{} decoded as {}", value, decoded.value);
    }

    #[test]
    fn prop_sensor_data_round_trips(data in sensor_data()) {
        let decoded = json_to_sensor_data(&sensor_data_to_json(&data).unwrap()).unwrap();
        prop_assert_eq!(decoded, data);
    }

    #[test]
    fn prop_actuator_data_round_trips(data in actuator_data()) {
        let decoded = json_to_actuator_data(&actuator_data_to_json(&data).unwrap()).unwrap();
        prop_assert_eq!(decoded, data);
    }

    #[test]
    fn prop_system_performance_data_round_trips(data in system_performance_data()) {
        let json = system_performance_data_to_json(&data).unwrap();
        let decoded = json_to_system_performance_data(&json).unwrap();
        prop_assert!(same_float(decoded.cpu_util, data.cpu_util));
        prop_assert!(same_float(decoded.mem_util, data.mem_util));
        prop_assert!(same_float(decoded.disk_util, data.disk_util));
        prop_assert_eq!(decoded, data);
    }

    #[test]
    fn prop_actuator_status_sets_error_flag(status in -100i32..100) {
        let mut data = ActuatorData::new("HvacActuator", 2, 1, 20.0);
        data.set_status_code(status);
        let decoded = json_to_actuator_data(&actuator_data_to_json(&data).unwrap()).unwrap();
        prop_assert_eq!(decoded.base.status_code, status);
        prop_assert_eq!(decoded.base.has_error, status < 0);
    }

    #[test]
    fn prop_garbage_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
        if let Err(e) = from_json_bytes::<SensorData>(&bytes) {
            prop_assert!(e.is_decode_error());
        }
    }
}

#[test]
fn test_default_records_round_trip() {
    let sensor = SensorData::default();
    assert_eq!(json_to_sensor_data(&sensor_data_to_json(&sensor).unwrap()).unwrap(), sensor);

    let actuator = ActuatorData::default();
    assert_eq!(
        json_to_actuator_data(&actuator_data_to_json(&actuator).unwrap()).unwrap(),
        actuator
    );

    let perf = SystemPerformanceData::default();
    assert_eq!(
        json_to_system_performance_data(&system_performance_data_to_json(&perf).unwrap()).unwrap(),
        perf
    );
}

#[test]
fn test_populated_actuator_fields_on_the_wire() {
    let mut data = ActuatorData::new("HvacActuator", 2, 1, 29272.919534364562);
    data.state_data = "{\"mode\":\"heat\"}".to_string();
    data.set_as_response();
    data.set_status_code(-1);

    let json = actuator_data_to_json(&data).unwrap();
    for field in ["\"command\"", "\"stateData\"", "\"isResponse\"", "\"hasError\"", "\"statusCode\""] {
        assert!(json.contains(field), "missing {field} in {json}");
    }

    let decoded = json_to_actuator_data(&json).unwrap();
    assert_eq!(decoded.value.to_bits(), data.value.to_bits());
    assert_eq!(decoded, data);
}

#[test]
fn test_wire_field_names() {
    let data = SystemPerformanceData::new(10.0, 20.0, 30.0);
    let json = system_performance_data_to_json(&data).unwrap();

    for field in ["\"cpuUtil\"", "\"memUtil\"", "\"diskUtil\"", "\"typeID\"", "\"locationID\"", "\"timeStamp\""] {
        assert!(json.contains(field), "missing {field} in {json}");
    }
    assert_eq!(json_to_system_performance_data(&json).unwrap(), data);
}

#[test]
fn test_missing_fields_take_defaults() {
    let data = json_to_actuator_data(r#"{"name":"HvacActuator","command":1}"#).unwrap();

    assert_eq!(data.base.name, "HvacActuator");
    assert_eq!(data.command, 1);
    assert_eq!(data.value, 0.0);
    assert!(!data.is_response);
}

#[test]
fn test_malformed_input_is_decode_error() {
    let error = json_to_sensor_data("{\"value\": ").unwrap_err();
    assert!(error.is_decode_error());

    let error = json_to_actuator_data("\"not an object\"").unwrap_err();
    assert!(error.is_decode_error());

    let error = from_json_bytes::<ActuatorData>(&[0xFF, 0xFE, b'{']).unwrap_err();
    assert!(error.is_decode_error());
    assert!(error.to_string().contains("ActuatorData"));
}
