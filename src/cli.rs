//! Command line surface of the relay binary

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use loadexc_relay::config::{CaptureBackend, Config, TopicTransport};
use loadexc_relay::overlay::Corner;
use loadexc_relay::TargetEncoding;

#[derive(Parser, Debug)]
#[command(
    name = "loadexc-relay",
    version,
    about = "Camera to topic / stream relay for teleoperated loaders"
)]
pub struct Cli {
    /// TOML configuration file, layered over the defaults
    #[arg(long, global = true, env = "LOADEXC_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Publish camera frames as image records on a topic
    Topic {
        #[command(flatten)]
        capture: CaptureArgs,
        #[command(flatten)]
        topic: TopicArgs,
        /// Also show frames in a local window
        #[arg(long)]
        preview: bool,
        /// Draw the latest control state read from stdin into every frame
        #[arg(long)]
        controls: bool,
    },

    /// Feed camera frames to a streaming video source
    Stream {
        #[command(flatten)]
        capture: CaptureArgs,
        #[command(flatten)]
        stream: StreamArgs,
        /// Draw the latest control state read from stdin into every frame
        #[arg(long)]
        controls: bool,
    },

    /// Forward i420 image records from a topic to a streaming video source.
    /// With the local transport the camera pipeline runs in-process.
    Bridge {
        #[command(flatten)]
        capture: CaptureArgs,
        #[command(flatten)]
        topic: TopicArgs,
        #[command(flatten)]
        stream: StreamArgs,
    },

    /// Merge control JSON lines from stdin and print the latest state
    Control {
        /// Snapshots printed per second
        #[arg(long, default_value_t = 10.0)]
        rate: f64,
    },

    /// List V4L2 capture devices
    Devices,

    /// Run a topic pipeline on the in-process bus and report what arrives
    Echo {
        #[command(flatten)]
        capture: CaptureArgs,
        /// Stop after this many records
        #[arg(long)]
        frames: Option<u64>,
    },
}

/// Overrides for the `capture`, `pipeline` and `overlay` sections
#[derive(Args, Debug, Default)]
pub struct CaptureArgs {
    /// `/dev/videoN`, `auto`, `stub://[FOURCC]` or `file://<image>`
    #[arg(long)]
    pub device: Option<String>,
    #[arg(long, value_parser = parse_backend)]
    pub backend: Option<CaptureBackend>,
    #[arg(long)]
    pub width: Option<u32>,
    #[arg(long)]
    pub height: Option<u32>,
    #[arg(long)]
    pub fps: Option<u32>,
    /// Requested camera fourcc, e.g. MJPG or YUYV
    #[arg(long)]
    pub fourcc: Option<String>,
    /// rgb8, bgr8, rgba8 or i420
    #[arg(long)]
    pub encoding: Option<TargetEncoding>,
    /// Publish ticks per second
    #[arg(long)]
    pub rate: Option<f64>,
    #[arg(long)]
    pub no_overlay: bool,
    /// tl, tr, bl or br
    #[arg(long)]
    pub overlay_position: Option<Corner>,
    #[arg(long)]
    pub overlay_scale: Option<u32>,
}

#[derive(Args, Debug, Default)]
pub struct TopicArgs {
    #[arg(long)]
    pub topic: Option<String>,
    #[arg(long, value_parser = parse_transport)]
    pub transport: Option<TopicTransport>,
    #[arg(long)]
    pub mqtt_host: Option<String>,
    #[arg(long)]
    pub mqtt_port: Option<u16>,
}

#[derive(Args, Debug, Default)]
pub struct StreamArgs {
    /// GStreamer launch string placed after the appsrc
    #[arg(long)]
    pub launch: Option<String>,
    #[arg(long)]
    pub track_name: Option<String>,
}

fn parse_backend(s: &str) -> Result<CaptureBackend, String> {
    match s.to_ascii_lowercase().as_str() {
        "v4l2" => Ok(CaptureBackend::V4l2),
        "gstreamer" | "gst" => Ok(CaptureBackend::Gstreamer),
        other => Err(format!("unknown capture backend {other:?}")),
    }
}

fn parse_transport(s: &str) -> Result<TopicTransport, String> {
    match s.to_ascii_lowercase().as_str() {
        "local" => Ok(TopicTransport::Local),
        "mqtt" => Ok(TopicTransport::Mqtt),
        other => Err(format!("unknown topic transport {other:?}")),
    }
}

impl CaptureArgs {
    pub fn apply(&self, config: &mut Config) {
        let capture = &mut config.capture;
        if let Some(device) = &self.device {
            capture.device = device.clone();
        }
        if let Some(backend) = self.backend {
            capture.backend = backend;
        }
        if let Some(width) = self.width {
            capture.width = width;
        }
        if let Some(height) = self.height {
            capture.height = height;
        }
        if let Some(fps) = self.fps {
            capture.fps = fps;
        }
        if let Some(fourcc) = &self.fourcc {
            capture.fourcc = fourcc.clone();
        }

        if let Some(encoding) = self.encoding {
            config.pipeline.target_encoding = encoding;
        }
        if let Some(rate) = self.rate {
            config.pipeline.publish_rate = rate;
        }

        if self.no_overlay {
            config.overlay.enabled = false;
        }
        if let Some(position) = self.overlay_position {
            config.overlay.position = position;
        }
        if let Some(scale) = self.overlay_scale {
            config.overlay.scale = scale;
        }
    }
}

impl TopicArgs {
    pub fn apply(&self, config: &mut Config) {
        if let Some(topic) = &self.topic {
            config.topic.name = topic.clone();
        }
        if let Some(transport) = self.transport {
            config.topic.transport = transport;
        }
        if let Some(host) = &self.mqtt_host {
            config.topic.mqtt.host = host.clone();
        }
        if let Some(port) = self.mqtt_port {
            config.topic.mqtt.port = port;
        }
    }
}

impl StreamArgs {
    pub fn apply(&self, config: &mut Config) {
        if let Some(launch) = &self.launch {
            config.stream.launch = launch.clone();
        }
        if let Some(track_name) = &self.track_name {
            config.stream.track_name = track_name.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from([
            "loadexc-relay",
            "topic",
            "--device",
            "stub://YUYV",
            "--encoding",
            "RGB8",
            "--rate",
            "5",
            "--overlay-position",
            "br",
            "--transport",
            "mqtt",
        ]);
        let Command::Topic { capture, topic, .. } = cli.command else {
            panic!("expected topic command");
        };
        let mut config = Config::default();
        capture.apply(&mut config);
        topic.apply(&mut config);

        assert_eq!(config.capture.device, "stub://YUYV");
        assert_eq!(config.pipeline.target_encoding, TargetEncoding::Rgb8);
        assert_eq!(config.pipeline.publish_rate, 5.0);
        assert_eq!(config.overlay.position, Corner::Br);
        assert_eq!(config.topic.transport, TopicTransport::Mqtt);
        assert!(config.overlay.enabled);
    }

    #[test]
    fn bridge_takes_topic_and_stream_flags() {
        let cli = Cli::parse_from([
            "loadexc-relay",
            "bridge",
            "--transport",
            "mqtt",
            "--topic",
            "/loader/cam0",
            "--track-name",
            "front",
        ]);
        let Command::Bridge {
            capture,
            topic,
            stream,
        } = cli.command
        else {
            panic!("expected bridge command");
        };
        let mut config = Config::default();
        capture.apply(&mut config);
        topic.apply(&mut config);
        stream.apply(&mut config);

        assert_eq!(config.topic.transport, TopicTransport::Mqtt);
        assert_eq!(config.topic.name, "/loader/cam0");
        assert_eq!(config.stream.track_name, "front");
        assert_eq!(config.stream.launch, Config::default().stream.launch);
    }

    #[test]
    fn controls_flag_is_opt_in() {
        let cli = Cli::parse_from(["loadexc-relay", "stream", "--controls"]);
        assert!(matches!(cli.command, Command::Stream { controls: true, .. }));
        let cli = Cli::parse_from(["loadexc-relay", "topic"]);
        assert!(matches!(cli.command, Command::Topic { controls: false, .. }));
    }

    #[test]
    fn config_flag_is_global() {
        let cli = Cli::parse_from(["loadexc-relay", "devices", "--config", "relay.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("relay.toml")));
    }
}
