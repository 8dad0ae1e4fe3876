//! Testing utilities and mock implementations
//!
//! Mocks for exercising the protocol adapters without a gateway or an MQTT
//! broker.

pub mod mocks;

pub use mocks::*;
