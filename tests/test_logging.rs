//! Tests for logging configuration and format parsing
//!
//! Tests the pure functions in the logging module that turn environment
//! variable values into logging settings.

use cda_agent::observability::logging::{parse_level, parse_spans_flag, LogFormat};
use tracing::Level;

#[test]
fn test_log_format_parse_known_formats() {
    assert!(matches!(LogFormat::parse("json"), LogFormat::Json));
    assert!(matches!(LogFormat::parse("PRETTY"), LogFormat::Pretty));
    assert!(matches!(LogFormat::parse("Compact"), LogFormat::Compact));
}

#[test]
fn test_log_format_parse_invalid_defaults_to_json() {
    // Invalid formats should default to JSON for production safety
    assert!(matches!(LogFormat::parse("invalid"), LogFormat::Json));
    assert!(matches!(LogFormat::parse(""), LogFormat::Json));
    assert!(matches!(LogFormat::parse("xml"), LogFormat::Json));
}

#[test]
fn test_log_format_parse_whitespace() {
    assert!(matches!(LogFormat::parse("  pretty  "), LogFormat::Pretty));
    assert!(matches!(LogFormat::parse("json\n"), LogFormat::Json));
    assert!(matches!(LogFormat::parse("\tcompact"), LogFormat::Compact));
}

#[test]
fn test_log_level_parsing() {
    assert_eq!(parse_level("error"), Level::ERROR);
    assert_eq!(parse_level("WARN"), Level::WARN);
    assert_eq!(parse_level(" debug "), Level::DEBUG);
    assert_eq!(parse_level("trace"), Level::TRACE);
    assert_eq!(parse_level("info"), Level::INFO);
}

#[test]
fn test_log_level_unknown_defaults_to_info() {
    assert_eq!(parse_level("verbose"), Level::INFO);
    assert_eq!(parse_level(""), Level::INFO);
}

#[test]
fn test_spans_flag() {
    assert!(parse_spans_flag("true"));
    assert!(parse_spans_flag("TRUE "));
    assert!(!parse_spans_flag("false"));
    assert!(!parse_spans_flag("1"));
    assert!(!parse_spans_flag(""));
}

#[test]
fn test_log_format_debug() {
    assert_eq!(format!("{:?}", LogFormat::Json), "Json");
    assert_eq!(format!("{:?}", LogFormat::Pretty), "Pretty");
    assert_eq!(format!("{:?}", LogFormat::Compact), "Compact");
}
