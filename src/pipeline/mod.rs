//! Bounded relay pipeline.
//!
//! ```text
//! source -> [relay-capture] -> raw queue -> [relay-process] -> packaged queue -> publish tick -> sink
//! ```
//!
//! Capture and processing run on dedicated threads; the publish tick runs on
//! the async runtime. The two drop-oldest queues are the only place the
//! stages meet.

pub mod capture;
pub mod lifecycle;
pub mod process;
pub mod publish;
pub mod relay;

pub use capture::CaptureStats;
pub use lifecycle::{Lifecycle, LifecycleState};
pub use process::{FrameProcessor, ProcessStats};
pub use publish::{PublishStage, PublishStats, TickOutcome};
pub use relay::{relay, RelayReceiver, RelaySender, RelayStats};

use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::capture::{Frame, FrameSource, PackagedFrame};
use crate::config::{Config, PipelineConfig};
use crate::control::SnapshotReader;
use crate::sink::FrameSink;

/// What every stage did during one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub capture: CaptureStats,
    pub process: ProcessStats,
    pub publish: PublishStats,
    pub raw_queue: RelayStats,
    pub packaged_queue: RelayStats,
}

pub struct Pipeline<S, K> {
    settings: PipelineConfig,
    processor: FrameProcessor,
    source: S,
    sink: K,
    lifecycle: Lifecycle,
}

impl<S, K> Pipeline<S, K>
where
    S: FrameSource + 'static,
    K: FrameSink + 'static,
{
    pub fn new(config: &Config, source: S, sink: K) -> Self {
        Self::with_processor(
            config.pipeline.clone(),
            FrameProcessor::from_config(config),
            source,
            sink,
        )
    }

    pub fn with_processor(
        settings: PipelineConfig,
        processor: FrameProcessor,
        source: S,
        sink: K,
    ) -> Self {
        Self {
            settings,
            processor,
            source,
            sink,
            lifecycle: Lifecycle::new(),
        }
    }

    /// Draw the latest control snapshot into every processed frame.
    pub fn with_controls(mut self, controls: SnapshotReader) -> Self {
        self.processor = self.processor.with_controls(controls);
        self
    }

    /// Handle for requesting a stop and observing progress.
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.clone()
    }

    /// Run every stage until a stop is requested, then release the source
    /// and the sink.
    ///
    /// Only failing to start a stage thread is an error.
    pub async fn run(self) -> io::Result<PipelineReport> {
        let Pipeline {
            settings,
            processor,
            source,
            sink,
            lifecycle,
        } = self;

        let (raw_tx, raw_rx) = relay::<Frame>("raw", settings.queue_capacity);
        let (packaged_tx, packaged_rx) = relay::<PackagedFrame>("packaged", settings.queue_capacity);
        let mut publish = PublishStage::new(packaged_rx, sink);

        lifecycle.advance(LifecycleState::Running);
        info!(
            queue_capacity = settings.queue_capacity,
            publish_rate = settings.publish_rate,
            "Pipeline running"
        );

        let capture_handle = {
            let lifecycle = lifecycle.clone();
            let backoff = settings.capture_backoff();
            spawn_stage("relay-capture", move || {
                let stats = capture::run_capture(source, &raw_tx, lifecycle, backoff);
                (stats, raw_tx.stats())
            })
        };
        let capture_handle = match capture_handle {
            Ok(handle) => handle,
            Err(e) => {
                shutdown(&lifecycle, publish.sink_mut());
                return Err(e);
            }
        };

        let process_handle = {
            let lifecycle = lifecycle.clone();
            let poll = settings.poll_interval();
            spawn_stage("relay-process", move || {
                process::run_processing(&raw_rx, &packaged_tx, processor, lifecycle, poll)
            })
        };
        let process_handle = match process_handle {
            Ok(handle) => handle,
            Err(e) => {
                lifecycle.request_stop();
                join_stage("relay-capture", capture_handle).await;
                shutdown(&lifecycle, publish.sink_mut());
                return Err(e);
            }
        };

        publish::run_publish(&mut publish, &lifecycle, settings.publish_period()).await;

        let (capture, raw_queue) = join_stage("relay-capture", capture_handle)
            .await
            .unwrap_or_default();
        let process = join_stage("relay-process", process_handle)
            .await
            .unwrap_or_default();

        let report = PipelineReport {
            capture,
            process,
            publish: publish.stats(),
            raw_queue,
            packaged_queue: publish.input().stats(),
        };
        shutdown(&lifecycle, publish.sink_mut());
        info!(?report, "Pipeline stopped");
        Ok(report)
    }
}

fn spawn_stage<T, F>(name: &str, f: F) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new().name(name.to_string()).spawn(f)
}

async fn join_stage<T: Send + 'static>(name: &'static str, handle: JoinHandle<T>) -> Option<T> {
    match tokio::task::spawn_blocking(move || handle.join()).await {
        Ok(Ok(stats)) => Some(stats),
        Ok(Err(_)) => {
            error!(stage = name, "Stage thread panicked");
            None
        }
        Err(e) => {
            error!(stage = name, error = %e, "Failed to join stage thread");
            None
        }
    }
}

/// Close the sink and mark the pipeline stopped. Close errors are logged.
fn shutdown<K: FrameSink>(lifecycle: &Lifecycle, sink: &mut K) {
    lifecycle.request_stop();
    if let Err(e) = sink.close() {
        warn!(stage = "publish", sink = sink.name(), error = %e, "Failed to close sink");
    }
    lifecycle.advance(LifecycleState::Stopped);
}

/// Stop-request latency bound for a given configuration
pub fn stop_deadline(settings: &PipelineConfig) -> Duration {
    settings.poll_interval() + settings.capture_backoff() + settings.publish_period()
}
