use std::collections::HashMap;
use std::io::Write;

use loadexc_relay::config::{CaptureBackend, Config, TopicTransport};
use loadexc_relay::error::ConfigError;
use loadexc_relay::overlay::Corner;
use loadexc_relay::TargetEncoding;

fn toml_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn no_env() -> Option<HashMap<String, String>> {
    Some(HashMap::new())
}

#[test]
fn file_values_layer_over_defaults() {
    let file = toml_file(
        r#"
[capture]
device = "/dev/video2"
backend = "gstreamer"
fourcc = "YUYV"

[pipeline]
queue_capacity = 1
publish_rate = 20.0
target_encoding = "bgr8"

[overlay]
position = "br"

[topic]
name = "/camera_rear"
transport = "mqtt"

[topic.mqtt]
host = "broker.local"
"#,
    );

    let config = Config::load_with_env(Some(file.path()), no_env()).unwrap();
    assert_eq!(config.capture.device, "/dev/video2");
    assert_eq!(config.capture.backend, CaptureBackend::Gstreamer);
    assert_eq!(config.capture.fourcc, "YUYV");
    assert_eq!(config.pipeline.queue_capacity, 1);
    assert_eq!(config.pipeline.target_encoding, TargetEncoding::Bgr8);
    assert_eq!(config.overlay.position, Corner::Br);
    assert_eq!(config.topic.transport, TopicTransport::Mqtt);
    assert_eq!(config.topic.mqtt.host, "broker.local");

    // Untouched keys keep their defaults
    assert_eq!(config.capture.width, 1280);
    assert_eq!(config.topic.mqtt.port, 1883);
    assert_eq!(config.pipeline.poll_interval_ms, 1000);
}

#[test]
fn environment_beats_file() {
    let file = toml_file("[capture]\nwidth = 640\nheight = 480\n");
    let env = HashMap::from([
        ("LOADEXC__CAPTURE__WIDTH".to_string(), "800".to_string()),
        ("LOADEXC__OVERLAY__ENABLED".to_string(), "false".to_string()),
    ]);

    let config = Config::load_with_env(Some(file.path()), Some(env)).unwrap();
    assert_eq!(config.capture.width, 800);
    assert_eq!(config.capture.height, 480);
    assert!(!config.overlay.enabled);
}

#[test]
fn invalid_capacity_in_file_is_rejected() {
    let file = toml_file("[pipeline]\nqueue_capacity = 4\n");
    let err = Config::load_with_env(Some(file.path()), no_env()).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::Invalid {
            field: "pipeline.queue_capacity",
            ..
        }
    ));
}

#[test]
fn unknown_encoding_is_a_load_error() {
    let file = toml_file("[pipeline]\ntarget_encoding = \"yuv444\"\n");
    assert!(matches!(
        Config::load_with_env(Some(file.path()), no_env()),
        Err(ConfigError::Load(_))
    ));
}

#[test]
fn missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    assert!(Config::load_with_env(Some(&path), no_env()).is_err());
}
