//! Integration tests for configuration parsing
//!
//! Tests benchmark configuration files, including:
//! - Minimal and full configurations
//! - Hex endpoint addresses and device filters
//! - Invalid configuration handling

use std::fs;
use streamer::usb::DeviceFilter;
use streamer::validate_endpoint;
use tempfile::TempDir;

const MINIMAL_CONFIG: &str = r#"
[device]
filter = "0x04b4:0x00f1"

[stream]
endpoint = 0x81
"#;

const FULL_CONFIG: &str = r#"
[device]
filter = "0x04b4:0x00f1"

[stream]
endpoint = 0x82
request_size = 32
queue_depth = 64
duration_secs = 100
packet_size = 3072

[logging]
level = "debug"
"#;

#[test]
fn test_parse_minimal_config() {
    let config: toml::Value = toml::from_str(MINIMAL_CONFIG).unwrap();

    let device = config.get("device").unwrap();
    let filter: DeviceFilter = device
        .get("filter")
        .unwrap()
        .as_str()
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(filter, DeviceFilter::new(0x04b4, 0x00f1));

    let stream = config.get("stream").unwrap();
    assert_eq!(stream.get("endpoint").unwrap().as_integer().unwrap(), 0x81);
    assert!(stream.get("queue_depth").is_none());
    assert!(config.get("logging").is_none());
}

#[test]
fn test_parse_full_config() {
    let config: toml::Value = toml::from_str(FULL_CONFIG).unwrap();

    let stream = config.get("stream").unwrap();
    let endpoint = stream.get("endpoint").unwrap().as_integer().unwrap();
    assert_eq!(endpoint, 0x82);
    assert!(validate_endpoint(endpoint as u8).is_ok());
    assert_eq!(stream.get("request_size").unwrap().as_integer().unwrap(), 32);
    assert_eq!(stream.get("queue_depth").unwrap().as_integer().unwrap(), 64);
    assert_eq!(
        stream.get("duration_secs").unwrap().as_integer().unwrap(),
        100
    );
    assert_eq!(stream.get("packet_size").unwrap().as_integer().unwrap(), 3072);

    let logging = config.get("logging").unwrap();
    assert_eq!(logging.get("level").unwrap().as_str().unwrap(), "debug");
}

#[test]
fn test_config_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bench.toml");
    fs::write(&path, FULL_CONFIG).unwrap();

    let content = fs::read_to_string(&path).unwrap();
    let config: toml::Value = toml::from_str(&content).unwrap();
    let rewritten = toml::to_string_pretty(&config).unwrap();
    let reparsed: toml::Value = toml::from_str(&rewritten).unwrap();
    assert_eq!(config, reparsed);
}

#[test]
fn test_invalid_config_values() {
    // Reserved bits set in the endpoint address
    assert!(validate_endpoint(0x91).is_err());
    // Endpoint 0 is the control pipe
    assert!(validate_endpoint(0x80).is_err());
    // Filters need hex IDs with a 0x prefix
    assert!("04b4:00f1".parse::<DeviceFilter>().is_err());
    assert!("0x04b4".parse::<DeviceFilter>().is_err());
}

#[test]
fn test_malformed_toml_rejected() {
    let result: Result<toml::Value, _> = toml::from_str("[stream\nendpoint = 0x81");
    assert!(result.is_err());
}
