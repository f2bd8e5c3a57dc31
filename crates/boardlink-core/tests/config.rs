use boardlink_core::config::Config;
use boardlink_core::protocol::{FramingPolicy, ProtocolError};
use pretty_assertions::assert_eq;
use std::io::Write;

#[test]
fn test_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "port": {{ "name": "/dev/ttyUSB0", "baud_rate": 460800 }},
            "link": {{ "sync_probes": 3, "framing_policy": "skip" }},
            "repl": {{ "settle_delay_ms": 250 }}
        }}"#
    )
    .unwrap();

    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(config.port.name, "/dev/ttyUSB0");
    assert_eq!(config.port.baud_rate, 460800);
    assert_eq!(config.port.vendor_id, 0x10C4);
    assert_eq!(config.link.sync_probes, 3);
    assert_eq!(config.link.framing_policy, FramingPolicy::Skip);
    assert_eq!(config.repl.settle_delay_ms, 250);
    assert_eq!(config.repl.banner_timeout_ms, 2000);
}

#[test]
fn test_missing_file_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Config::from_file(dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err, ProtocolError::Config(_)));
}

#[test]
fn test_json_roundtrip_through_file() {
    let mut config = Config::default();
    config.port.name = "COM3".to_string();
    config.link.framing_policy = FramingPolicy::Skip;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(config.to_json().unwrap().as_bytes()).unwrap();
    assert_eq!(Config::from_file(file.path()).unwrap(), config);
}
