//! LoadExc camera relay

mod cli;

use std::time::{Duration, SystemTime};

use clap::Parser;
use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use loadexc_relay::capture::{self, FrameSource};
use loadexc_relay::config::{tick_period, Config, TopicTransport, MAX_TICK_RATE};
use loadexc_relay::control::{ControlParser, ControlState, SnapshotReader};
use loadexc_relay::sink::topic::Stamp;
use loadexc_relay::sink::{FrameSink, LocalBus, Subscription, TopicSink};
use loadexc_relay::{Lifecycle, Pipeline};

use crate::cli::{CaptureArgs, Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).wrap_err("loading configuration")?;

    match cli.command {
        Command::Topic {
            capture,
            topic,
            preview,
            controls,
        } => {
            capture.apply(&mut config);
            topic.apply(&mut config);
            config.validate()?;
            run_topic(config, preview, controls.then(stdin_controls)).await
        }
        Command::Stream {
            capture,
            stream,
            controls,
        } => {
            capture.apply(&mut config);
            stream.apply(&mut config);
            config.validate()?;
            run_stream(config, controls.then(stdin_controls)).await
        }
        Command::Bridge {
            capture,
            topic,
            stream,
        } => {
            capture.apply(&mut config);
            topic.apply(&mut config);
            stream.apply(&mut config);
            config.validate()?;
            run_bridge(config).await
        }
        Command::Control { rate } => run_control(rate).await,
        Command::Devices => list_devices(),
        Command::Echo { capture, frames } => {
            capture.apply(&mut config);
            config.validate()?;
            run_echo(config, frames).await
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("loadexc_relay=info"));
    let fmt = tracing_subscriber::fmt::layer()
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .with_writer(std::io::stderr);

    use tracing_subscriber::prelude::*;
    let registry = tracing_subscriber::registry().with(filter).with(fmt);
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();
}

fn open_source(config: &Config) -> Result<Box<dyn FrameSource>> {
    capture::open_source(&config.capture)
        .wrap_err_with(|| format!("opening capture device {}", config.capture.device))
}

/// Run until Ctrl+C, then wait for every stage to wind down.
async fn run_pipeline<K: FrameSink + 'static>(
    config: &Config,
    source: Box<dyn FrameSource>,
    sink: K,
    stop_on: Option<Lifecycle>,
    controls: Option<SnapshotReader>,
) -> Result<()> {
    let mut pipeline = Pipeline::new(config, source, sink);
    if let Some(controls) = controls {
        pipeline = pipeline.with_controls(controls);
    }
    let lifecycle = pipeline.lifecycle();
    watch_ctrl_c(lifecycle.clone());
    if let Some(external) = stop_on {
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            external.stopping().await;
            lifecycle.request_stop();
        });
    }

    let report = pipeline.run().await.wrap_err("starting pipeline stages")?;
    info!(
        captured = report.capture.captured,
        processed = report.process.processed,
        sent = report.publish.sent,
        raw_dropped = report.raw_queue.dropped,
        packaged_dropped = report.packaged_queue.dropped,
        "Relay finished"
    );
    Ok(())
}

fn watch_ctrl_c(lifecycle: Lifecycle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, stopping");
            lifecycle.request_stop();
        }
    });
}

/// Merge control JSON lines from stdin in the background until EOF.
fn stdin_controls() -> SnapshotReader {
    let (mut parser, reader) = ControlParser::new(ControlState::default());
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => {}
                // Rejections are logged by the parser
                Ok(Some(line)) => {
                    let _ = parser.handle(&line);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(stage = "control", error = %e, "Failed to read stdin");
                    break;
                }
            }
        }
        info!("Control input closed, overlay keeps the last state");
    });
    reader
}

async fn run_topic(config: Config, preview: bool, controls: Option<SnapshotReader>) -> Result<()> {
    let source = open_source(&config)?;
    let topic = config.topic.name.clone();

    let sink: Box<dyn FrameSink> = match config.topic.transport {
        TopicTransport::Local => {
            warn!("Local transport only reaches in-process subscribers; see `echo`");
            let bus = LocalBus::new(config.topic.depth);
            Box::new(TopicSink::new(bus.publisher(&topic)))
        }
        TopicTransport::Mqtt => mqtt_sink(&config)?,
    };
    let sink = with_preview(sink, &config, preview)?;

    info!("Publishing {} on {}", config.pipeline.target_encoding, topic);
    run_pipeline(&config, source, sink, None, controls).await
}

#[cfg(feature = "mqtt")]
fn mqtt_sink(config: &Config) -> Result<Box<dyn FrameSink>> {
    use loadexc_relay::sink::MqttPublisher;

    let publisher = MqttPublisher::connect(&config.topic.mqtt, &config.topic.name)?;
    Ok(Box::new(TopicSink::new(publisher)))
}

#[cfg(not(feature = "mqtt"))]
fn mqtt_sink(_config: &Config) -> Result<Box<dyn FrameSink>> {
    bail!("MQTT transport needs the `mqtt` feature")
}

#[cfg(feature = "preview")]
fn with_preview(
    sink: Box<dyn FrameSink>,
    config: &Config,
    preview: bool,
) -> Result<Box<dyn FrameSink>> {
    use loadexc_relay::sink::{PreviewSink, TeeSink};

    if !preview {
        return Ok(sink);
    }
    let window = PreviewSink::spawn(
        "LoadExc Relay",
        config.capture.width,
        config.capture.height,
    )?;
    Ok(Box::new(TeeSink::new(sink, window)))
}

#[cfg(not(feature = "preview"))]
fn with_preview(
    sink: Box<dyn FrameSink>,
    _config: &Config,
    preview: bool,
) -> Result<Box<dyn FrameSink>> {
    if preview {
        bail!("--preview needs the `preview` feature");
    }
    Ok(sink)
}

#[cfg(feature = "gstreamer-pipeline")]
async fn run_stream(config: Config, controls: Option<SnapshotReader>) -> Result<()> {
    use loadexc_relay::sink::{GstVideoSource, StreamSink};

    let source = open_source(&config)?;
    let video = GstVideoSource::new(&config.stream.track_name, &config.stream.launch)?;
    let sink = StreamSink::new(&config.stream.track_name, video);
    info!("Streaming track {}", config.stream.track_name);
    run_pipeline(&config, source, sink, None, controls).await
}

#[cfg(not(feature = "gstreamer-pipeline"))]
async fn run_stream(_config: Config, _controls: Option<SnapshotReader>) -> Result<()> {
    bail!("streaming needs the `gstreamer-pipeline` feature")
}

#[cfg(feature = "gstreamer-pipeline")]
async fn run_bridge(config: Config) -> Result<()> {
    use loadexc_relay::sink::{GstVideoSource, TopicBridge};

    let topic = config.topic.name.clone();
    let bus = LocalBus::new(config.topic.depth);
    let subscription = bus.subscribe(&topic);
    let video = GstVideoSource::new(&config.stream.track_name, &config.stream.launch)?;
    let mut bridge = TopicBridge::new(video);

    let lifecycle = Lifecycle::new();
    watch_ctrl_c(lifecycle.clone());
    info!("Bridging {} to track {}", topic, config.stream.track_name);

    let stats = match config.topic.transport {
        TopicTransport::Local => {
            if config.pipeline.target_encoding != loadexc_relay::TargetEncoding::I420 {
                warn!(
                    "Pipeline encodes {}, the bridge only forwards i420",
                    config.pipeline.target_encoding
                );
            }
            let source = open_source(&config)?;
            let sink = TopicSink::new(bus.publisher(&topic));
            let camera = async {
                let result = run_pipeline(&config, source, sink, Some(lifecycle.clone()), None).await;
                lifecycle.request_stop();
                result
            };
            let (camera, stats) = tokio::join!(camera, bridge.run(&subscription, &lifecycle));
            camera?;
            stats
        }
        TopicTransport::Mqtt => {
            bridge_from_mqtt(&config, &bus, &mut bridge, &subscription, &lifecycle).await?
        }
    };

    info!(
        received = stats.received,
        forwarded = stats.forwarded,
        rejected = stats.rejected,
        dropped = bus.dropped(),
        "Bridge finished"
    );
    Ok(())
}

#[cfg(not(feature = "gstreamer-pipeline"))]
async fn run_bridge(_config: Config) -> Result<()> {
    bail!("bridging needs the `gstreamer-pipeline` feature")
}

#[cfg(all(feature = "gstreamer-pipeline", feature = "mqtt"))]
async fn bridge_from_mqtt<V: loadexc_relay::sink::VideoSource>(
    config: &Config,
    bus: &LocalBus,
    bridge: &mut loadexc_relay::sink::TopicBridge<V>,
    subscription: &Subscription,
    lifecycle: &Lifecycle,
) -> Result<loadexc_relay::sink::BridgeStats> {
    use loadexc_relay::sink::MqttSubscriber;

    let mut subscriber = MqttSubscriber::spawn(&config.topic.mqtt, bus.publisher(&config.topic.name))?;
    let stats = bridge.run(subscription, lifecycle).await;
    if let Err(e) = subscriber.close() {
        warn!(stage = "bridge", error = %e, "Failed to close MQTT subscriber");
    }
    Ok(stats)
}

#[cfg(all(feature = "gstreamer-pipeline", not(feature = "mqtt")))]
async fn bridge_from_mqtt<V: loadexc_relay::sink::VideoSource>(
    _config: &Config,
    _bus: &LocalBus,
    _bridge: &mut loadexc_relay::sink::TopicBridge<V>,
    _subscription: &Subscription,
    _lifecycle: &Lifecycle,
) -> Result<loadexc_relay::sink::BridgeStats> {
    bail!("MQTT transport needs the `mqtt` feature")
}

async fn run_control(rate: f64) -> Result<()> {
    let period = tick_period(rate).ok_or_else(|| {
        eyre!("control rate must be above 0 and at most {MAX_TICK_RATE} per second, got {rate}")
    })?;
    let (mut parser, reader) = ControlParser::new(ControlState::default());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.wrap_err("reading stdin")? {
                    Some(line) if line.trim().is_empty() => {}
                    // Rejections are logged by the parser
                    Some(line) => { let _ = parser.handle(&line); }
                    None => break,
                }
            }
            _ = ticker.tick() => {
                println!("{}", serde_json::to_string(&*reader.latest())?);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!("{}", serde_json::to_string(&*reader.latest())?);
    Ok(())
}

#[cfg(feature = "v4l2")]
fn list_devices() -> Result<()> {
    let devices = capture::discover::list_devices();
    if devices.is_empty() {
        warn!("No V4L2 capture devices found");
    }
    for device in devices {
        println!("{}", serde_json::to_string(&device)?);
    }
    Ok(())
}

#[cfg(not(feature = "v4l2"))]
fn list_devices() -> Result<()> {
    bail!("device listing needs the `v4l2` feature")
}

async fn run_echo(config: Config, frames: Option<u64>) -> Result<()> {
    let source = open_source(&config)?;
    let bus = LocalBus::new(config.topic.depth);
    let subscription = bus.subscribe(&config.topic.name);
    let sink = TopicSink::new(bus.publisher(&config.topic.name));

    let done = Lifecycle::new();
    let echo = tokio::spawn(echo_records(subscription, frames, done.clone()));

    run_pipeline(&config, source, sink, Some(done.clone()), None).await?;
    done.request_stop();
    let received = echo.await.map_err(|e| eyre!("echo task failed: {e}"))?;

    info!(received, dropped = bus.dropped(), "Echo finished");
    if frames.is_some_and(|wanted| received < wanted) {
        bail!("received {received} records, wanted {}", frames.unwrap_or_default());
    }
    Ok(())
}

/// Log per-second arrival statistics. Requests a stop after `limit` records.
async fn echo_records(subscription: Subscription, limit: Option<u64>, done: Lifecycle) -> u64 {
    let mut received = 0u64;
    let mut window = 0u64;
    let mut bytes = 0usize;
    let mut latency_ms = 0.0f64;
    let mut report = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            record = subscription.recv() => {
                let Some(record) = record else { break };
                received += 1;
                window += 1;
                bytes += record.data.len();
                latency_ms += age_ms(record.capture_stamp);
                if limit.is_some_and(|limit| received >= limit) {
                    done.request_stop();
                    break;
                }
            }
            _ = report.tick() => {
                if window > 0 {
                    info!(
                        topic = subscription.topic(),
                        fps = window,
                        avg_bytes = bytes / window as usize,
                        avg_latency_ms = latency_ms / window as f64,
                        "Received"
                    );
                }
                window = 0;
                bytes = 0;
                latency_ms = 0.0;
            }
            _ = done.stopping() => break,
        }
    }
    received
}

fn age_ms(stamp: Stamp) -> f64 {
    SystemTime::now()
        .duration_since(stamp.to_system())
        .map(|age| age.as_secs_f64() * 1000.0)
        .unwrap_or_default()
}
