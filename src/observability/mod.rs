//! Observability: structured logging and protocol span macros

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};

// Span macros for structured logging
pub use logging::{coap_span, lifecycle_span, mqtt_span};
