//! Layered configuration: defaults, then an optional TOML file, then
//! `LOADEXC__SECTION__KEY` environment overrides.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capture::TargetEncoding;
use crate::error::ConfigError;
use crate::overlay::Corner;

pub const ENV_PREFIX: &str = "LOADEXC";

/// Highest accepted tick rate, for publishing and for control snapshots
pub const MAX_TICK_RATE: f64 = 1000.0;

/// Period of a tick firing `rate` times per second. `None` unless the rate
/// is in `(0, MAX_TICK_RATE]`.
pub fn tick_period(rate: f64) -> Option<Duration> {
    (rate.is_finite() && rate > 0.0 && rate <= MAX_TICK_RATE)
        .then(|| Duration::from_secs_f64(1.0 / rate))
}

/// Relay configuration. Read once at startup, never mutated while running.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub overlay: OverlayConfig,
    pub topic: TopicConfig,
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBackend {
    #[default]
    V4l2,
    Gstreamer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// `/dev/videoN`, `auto`, `stub://` or `file://<path>`
    pub device: String,
    pub backend: CaptureBackend,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Requested V4L2 fourcc (MJPG, YUYV, RGB3, BGR3)
    pub fourcc: String,
    pub buffer_count: u32,
    /// Longest wait for one frame before the read reports nothing
    pub read_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
    pub poll_interval_ms: u64,
    /// Publish ticks per second
    pub publish_rate: f64,
    pub target_encoding: TargetEncoding,
    pub capture_backoff_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub enabled: bool,
    pub position: Corner,
    pub scale: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicTransport {
    #[default]
    Local,
    Mqtt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub name: String,
    pub transport: TopicTransport,
    /// Per-subscriber queue depth on the local bus
    pub depth: usize,
    pub mqtt: MqttConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Launch string appended after the `appsrc` element
    pub launch: String,
    pub track_name: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "auto".into(),
            backend: CaptureBackend::V4l2,
            width: 1280,
            height: 720,
            fps: 30,
            fourcc: "MJPG".into(),
            buffer_count: 4,
            read_timeout_ms: 1000,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 2,
            poll_interval_ms: 1000,
            publish_rate: 15.0,
            target_encoding: TargetEncoding::I420,
            capture_backoff_ms: 10,
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            position: Corner::Tl,
            scale: 3,
        }
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            name: "/camera_front_wide".into(),
            transport: TopicTransport::Local,
            depth: 10,
            mqtt: MqttConfig::default(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "loadexc-relay".into(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            launch: "videoconvert ! autovideosink sync=false".into(),
            track_name: "camera0".into(),
        }
    }
}

impl CaptureConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn publish_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.publish_rate)
    }

    pub fn capture_backoff(&self) -> Duration {
        Duration::from_millis(self.capture_backoff_ms)
    }
}

impl Config {
    /// Load from the process environment and an optional TOML file.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, None)
    }

    /// Like [`Config::load`], but reads overrides from `env` instead of the
    /// process environment when given.
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder =
            ::config::Config::builder().add_source(::config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            debug!("Loading config file {}", path.display());
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: &str| {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        };

        if !(1..=2).contains(&self.pipeline.queue_capacity) {
            return invalid("pipeline.queue_capacity", "must be 1 or 2");
        }
        if tick_period(self.pipeline.publish_rate).is_none() {
            return invalid(
                "pipeline.publish_rate",
                "must be above 0 and at most 1000 ticks per second",
            );
        }
        if self.pipeline.poll_interval_ms == 0 {
            return invalid("pipeline.poll_interval_ms", "must be non-zero");
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return invalid("capture.width", "frame size must be non-zero");
        }
        if self.capture.fps == 0 {
            return invalid("capture.fps", "must be non-zero");
        }
        if self.capture.buffer_count == 0 {
            return invalid("capture.buffer_count", "must be non-zero");
        }
        if self.capture.read_timeout_ms == 0 {
            return invalid("capture.read_timeout_ms", "must be non-zero");
        }
        if self.overlay.scale == 0 {
            return invalid("overlay.scale", "must be at least 1");
        }
        if self.topic.depth == 0 {
            return invalid("topic.depth", "must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Option<HashMap<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::load_with_env(None, env(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.pipeline.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.pipeline.capture_backoff(), Duration::from_millis(10));
    }

    #[test]
    fn env_overrides_nested_keys() {
        let config = Config::load_with_env(
            None,
            env(&[
                ("LOADEXC__CAPTURE__WIDTH", "640"),
                ("LOADEXC__PIPELINE__TARGET_ENCODING", "rgb8"),
                ("LOADEXC__TOPIC__MQTT__PORT", "8883"),
            ]),
        )
        .unwrap();
        assert_eq!(config.capture.width, 640);
        assert_eq!(config.pipeline.target_encoding, TargetEncoding::Rgb8);
        assert_eq!(config.topic.mqtt.port, 8883);
        assert_eq!(config.capture.height, 720);
    }

    #[test]
    fn zero_publish_rate_is_rejected() {
        let err = Config::load_with_env(None, env(&[("LOADEXC__PIPELINE__PUBLISH_RATE", "0")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "pipeline.publish_rate",
                ..
            }
        ));
    }

    #[test]
    fn rate_with_zero_period_is_rejected() {
        let mut config = Config::default();
        config.pipeline.publish_rate = 5e9;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "pipeline.publish_rate",
                ..
            })
        ));

        config.pipeline.publish_rate = MAX_TICK_RATE;
        assert!(config.validate().is_ok());
        assert_eq!(config.pipeline.publish_period(), Duration::from_millis(1));
    }

    #[test]
    fn tick_period_bounds() {
        assert_eq!(tick_period(10.0), Some(Duration::from_millis(100)));
        assert_eq!(tick_period(0.0), None);
        assert_eq!(tick_period(-1.0), None);
        assert_eq!(tick_period(f64::NAN), None);
        assert_eq!(tick_period(1e12), None);
    }

    #[test]
    fn zero_read_timeout_is_rejected() {
        let mut config = Config::default();
        assert_eq!(config.capture.read_timeout(), Duration::from_secs(1));
        config.capture.read_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn capacity_outside_range_is_rejected() {
        let mut config = Config::default();
        config.pipeline.queue_capacity = 3;
        assert!(config.validate().is_err());
        config.pipeline.queue_capacity = 0;
        assert!(config.validate().is_err());
        config.pipeline.queue_capacity = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn publish_period_from_rate() {
        let pipeline = PipelineConfig {
            publish_rate: 20.0,
            ..Default::default()
        };
        assert_eq!(pipeline.publish_period(), Duration::from_millis(50));
    }
}
