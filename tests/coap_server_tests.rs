//! Wire-level tests for the CoAP server adapter, driven by a raw UDP peer

mod test_helpers;

use cda_agent::coap::message::content_format;
use cda_agent::coap::server::{Reply, ResourceHandler};
use cda_agent::coap::{Code, CoapServerAdapter, Message, MessageType};
use cda_agent::common::ResourceName;
use cda_agent::data::codec::{actuator_data_to_json, json_to_actuator_data, json_to_sensor_data};
use cda_agent::data::{ActuatorData, SensorData, SystemPerformanceData, COMMAND_ON, HVAC_ACTUATOR_TYPE};
use cda_agent::testing::MockDataMessageListener;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{loopback_config, RawPeer};

const HVAC_PATH: &str = "PIOT/ConstrainedDevice/ActuatorCmd/HvacActuator";

struct Echo;

impl ResourceHandler for Echo {
    fn name(&self) -> &str {
        "Echo"
    }

    fn render_post(&self, payload: &[u8]) -> Reply {
        Reply::text(Code::CREATED, &String::from_utf8_lossy(payload))
    }
}

fn serve(listener: MockDataMessageListener) -> (CoapServerAdapter, Arc<MockDataMessageListener>, RawPeer) {
    let listener = Arc::new(listener);
    let server = CoapServerAdapter::new(&loopback_config(), Some(listener.clone())).unwrap();
    assert!(server.start_server());
    let peer = RawPeer::new(server.local_addr().unwrap());
    (server, listener, peer)
}

fn command_json() -> String {
    actuator_data_to_json(&ActuatorData::new("HvacActuator", HVAC_ACTUATOR_TYPE, COMMAND_ON, 21.0)).unwrap()
}

#[test]
fn test_put_actuator_command_is_changed() {
    let (server, listener, peer) = serve(MockDataMessageListener::new());

    let response = peer.request(Code::PUT, HVAC_PATH, Some(&command_json()));
    assert_eq!(response.code, Code::CHANGED);
    assert_eq!(response.content_format(), Some(content_format::JSON));

    let record = json_to_actuator_data(response.payload_str().unwrap()).unwrap();
    assert!(record.is_response);
    assert_eq!(record.base.status_code, 0);
    assert_eq!(listener.actuator_commands().len(), 1);

    server.stop_server();
}

#[test]
fn test_large_actuator_command_is_not_truncated() {
    let (server, listener, peer) = serve(MockDataMessageListener::new());

    let mut command = ActuatorData::new("HvacActuator", HVAC_ACTUATOR_TYPE, COMMAND_ON, 21.0);
    command.state_data = "schedule:".repeat(400);
    let payload = actuator_data_to_json(&command).unwrap();
    assert!(payload.len() > 3000);

    let response = peer.request(Code::PUT, HVAC_PATH, Some(&payload));
    assert_eq!(response.code, Code::CHANGED);

    let received = listener.actuator_commands();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].state_data, command.state_data);

    // The echoed record is larger than a default CoAP datagram as well
    let record = json_to_actuator_data(response.payload_str().unwrap()).unwrap();
    assert_eq!(record.state_data, command.state_data);

    server.stop_server();
}

#[test]
fn test_rejected_actuator_command_answers_failure_record() {
    let (server, _listener, peer) = serve(MockDataMessageListener::rejecting());

    let response = peer.request(Code::PUT, HVAC_PATH, Some(&command_json()));
    assert_eq!(response.code, Code::PRECONDITION_FAILED);

    let record = json_to_actuator_data(response.payload_str().unwrap()).unwrap();
    assert!(record.is_response);
    assert!(record.base.has_error);
    assert_eq!(record.base.status_code, -1);
    assert_eq!(record.command, COMMAND_ON);

    server.stop_server();
}

#[test]
fn test_malformed_actuator_payload_is_bad_request() {
    let (server, listener, peer) = serve(MockDataMessageListener::new());

    let response = peer.request(Code::PUT, HVAC_PATH, Some("{not json"));
    assert_eq!(response.code, Code::BAD_REQUEST);
    assert!(listener.actuator_commands().is_empty());

    server.stop_server();
}

#[test]
fn test_get_telemetry_before_and_after_push() {
    let (server, listener, peer) = serve(MockDataMessageListener::new());
    let path = ResourceName::CdaSensorMsg.segment();

    let response = peer.request(Code::GET, path, None);
    assert_eq!(response.code, Code::EMPTY);
    assert!(response.payload.is_empty());

    listener.push_sensor_data(&SensorData::new("TempSensor", 1, 19.25));

    let response = peer.request(Code::GET, path, None);
    assert_eq!(response.code, Code::CONTENT);
    assert_eq!(response.max_age(), Some(5));
    let data = json_to_sensor_data(response.payload_str().unwrap()).unwrap();
    assert_eq!(data.base.name, "TempSensor");
    assert_eq!(data.value, 19.25);

    server.stop_server();
}

#[test]
fn test_observable_resources_refuse_put() {
    let (server, _listener, peer) = serve(MockDataMessageListener::new());

    let response = peer.request(Code::PUT, ResourceName::CdaSystemPerfMsg.segment(), Some("{}"));
    assert_eq!(response.code, Code::METHOD_NOT_ALLOWED);

    server.stop_server();
}

#[test]
fn test_unknown_path_is_not_found() {
    let (server, _listener, peer) = serve(MockDataMessageListener::new());

    let response = peer.request(Code::GET, "PIOT/ConstrainedDevice/Nowhere", None);
    assert_eq!(response.code, Code::NOT_FOUND);

    // Containers exist but carry no handler
    let response = peer.request(Code::GET, ResourceName::CdaActuatorCmd.segment(), None);
    assert_eq!(response.code, Code::NOT_FOUND);

    server.stop_server();
}

#[test]
fn test_discovery_over_the_wire() {
    let (server, _listener, peer) = serve(MockDataMessageListener::new());

    let response = peer.request(Code::GET, ".well-known/core", None);
    assert_eq!(response.code, Code::CONTENT);
    assert_eq!(response.content_format(), Some(content_format::LINK_FORMAT));

    let body = response.payload_str().unwrap();
    assert!(body.contains("</PIOT/ConstrainedDevice/SensorMsg>;obs"));
    assert!(body.contains("</PIOT/ConstrainedDevice/ActuatorCmd/HumidifierActuator>"));

    server.stop_server();
}

#[test]
fn test_observer_receives_notifications_until_reset() {
    let (server, listener, peer) = serve(MockDataMessageListener::new());
    let path = ResourceName::CdaSystemPerfMsg.segment();

    let mut register = Message::request(Code::GET, false, 0x2000, vec![0x0B], path);
    register.set_observe(0);
    peer.send(&register);

    let response = peer.recv().expect("registration response");
    assert_eq!(response.token, vec![0x0B]);
    assert_eq!(response.code, Code::EMPTY);
    assert!(response.observe().is_some());

    listener.push_system_performance_data(&SystemPerformanceData::new(12.5, 40.0, 70.0));
    let first = peer.recv().expect("first notification");
    assert_eq!(first.message_type, MessageType::NonConfirmable);
    assert_eq!(first.code, Code::CONTENT);
    assert_eq!(first.token, vec![0x0B]);
    let first_seq = first.observe().unwrap();

    listener.push_system_performance_data(&SystemPerformanceData::new(15.0, 41.0, 70.0));
    let second = peer.recv().expect("second notification");
    assert!(second.observe().unwrap() > first_seq);

    // Reset the last notification; further updates are not delivered
    peer.send(&Message::reset(second.message_id));
    std::thread::sleep(Duration::from_millis(100));
    listener.push_system_performance_data(&SystemPerformanceData::new(20.0, 42.0, 70.0));
    assert!(peer.recv().is_none());

    server.stop_server();
}

#[test]
fn test_resource_added_before_start_is_served() {
    let listener = Arc::new(MockDataMessageListener::new());
    let server = CoapServerAdapter::new(&loopback_config(), Some(listener)).unwrap();

    assert!(server.add_resource(Some(ResourceName::CdaMgmtStatusCmd), Some("Echo"), Some(Arc::new(Echo))));
    assert!(!server.add_resource(None, Some("a/b/c"), Some(Arc::new(Echo))));

    assert!(server.start_server());
    let peer = RawPeer::new(server.local_addr().unwrap());

    let response = peer.request(Code::POST, "PIOT/ConstrainedDevice/MgmtStatusCmd/Echo", Some("ping"));
    assert_eq!(response.code, Code::CREATED);
    assert_eq!(response.payload_str(), Some("ping"));

    let response = peer.request(Code::GET, "PIOT/ConstrainedDevice/MgmtStatusCmd/Echo", None);
    assert_eq!(response.code, Code::METHOD_NOT_ALLOWED);

    let response = peer.request(Code::GET, "a/b/c", None);
    assert_eq!(response.code, Code::NOT_FOUND);

    server.stop_server();
}

#[test]
fn test_stopped_server_no_longer_answers() {
    let (server, _listener, peer) = serve(MockDataMessageListener::new());
    assert!(server.stop_server());
    assert!(!server.is_running());
    assert!(!server.stop_server());

    let request = Message::request(Code::GET, true, 1, vec![1], ".well-known/core");
    peer.send(&request);
    assert!(peer.recv().is_none());
}
