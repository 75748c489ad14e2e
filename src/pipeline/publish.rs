//! Publish stage: one non-blocking take per tick, handed to the sink.

use std::time::{Duration, SystemTime};

use tokio::time::{self, MissedTickBehavior};
use tracing::{info, trace, warn};

use crate::capture::PackagedFrame;
use crate::pipeline::lifecycle::Lifecycle;
use crate::pipeline::relay::RelayReceiver;
use crate::sink::FrameSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Sent,
    Idle,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub ticks: u64,
    pub sent: u64,
    pub idle: u64,
    pub failed: u64,
}

pub struct PublishStage<K> {
    input: RelayReceiver<PackagedFrame>,
    sink: K,
    stats: PublishStats,
}

impl<K: FrameSink> PublishStage<K> {
    pub fn new(input: RelayReceiver<PackagedFrame>, sink: K) -> Self {
        Self {
            input,
            sink,
            stats: PublishStats::default(),
        }
    }

    /// Take at most one frame and send it. Never waits for a frame.
    pub fn tick(&mut self) -> TickOutcome {
        self.stats.ticks += 1;
        let Some(frame) = self.input.try_take() else {
            self.stats.idle += 1;
            return TickOutcome::Idle;
        };

        let sequence = frame.sequence;
        let latency = frame.capture_instant.elapsed();
        match self.sink.send(frame, SystemTime::now()) {
            Ok(()) => {
                self.stats.sent += 1;
                metrics::counter!("publish_frames_sent").increment(1);
                metrics::histogram!("frame_latency_ms").record(latency.as_secs_f64() * 1000.0);
                trace!(sequence, latency_ms = latency.as_millis() as u64, "frame sent");
                TickOutcome::Sent
            }
            Err(e) => {
                self.stats.failed += 1;
                metrics::counter!("publish_frames_failed").increment(1);
                warn!(stage = "publish", sink = self.sink.name(), sequence, error = %e, "Send failed");
                TickOutcome::Failed
            }
        }
    }

    pub fn stats(&self) -> PublishStats {
        self.stats
    }

    pub fn input(&self) -> &RelayReceiver<PackagedFrame> {
        &self.input
    }

    pub fn sink_mut(&mut self) -> &mut K {
        &mut self.sink
    }
}

/// Tick every `period` until a stop is requested. Late ticks are skipped,
/// never bursted.
pub async fn run_publish<K: FrameSink>(
    stage: &mut PublishStage<K>,
    lifecycle: &Lifecycle,
    period: Duration,
) {
    info!(sink = stage.sink.name(), period_ms = period.as_millis() as u64, "Publish stage started");

    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let stopping = lifecycle.stopping();
    tokio::pin!(stopping);

    loop {
        tokio::select! {
            biased;
            _ = &mut stopping => break,
            _ = ticker.tick() => {
                stage.tick();
            }
        }
    }

    let stats = stage.stats();
    info!(
        sent = stats.sent,
        idle = stats.idle,
        failed = stats.failed,
        "Publish stage stopped"
    );
}
