//! Topic to stream bridge: i420 image records received on a subscription are
//! forwarded to a [`VideoSource`].

use tracing::{debug, info, warn};

use crate::capture::TargetEncoding;
use crate::error::RecordError;
use crate::pipeline::{Lifecycle, LifecycleState};
use crate::sink::stream::{VideoBufferType, VideoFrame, VideoSource};
use crate::sink::topic::{ImageRecord, Subscription};

/// Tight i420 frame from a record, dropping row padding when `step` exceeds
/// the width. Chroma rows are assumed to be padded to half the luma step.
pub fn i420_video_frame(record: &ImageRecord) -> Result<VideoFrame, RecordError> {
    if !record.encoding.eq_ignore_ascii_case(TargetEncoding::I420.tag()) {
        return Err(RecordError::Encoding(record.encoding.clone()));
    }
    let (width, height, step) = (record.width, record.height, record.step);
    if step < width {
        return Err(RecordError::Step { width, step });
    }

    let (w, h, s) = (width as usize, height as usize, step as usize);
    let (cw, ch, cs) = (w.div_ceil(2), h.div_ceil(2), s.div_ceil(2));
    let expected = s * h + 2 * cs * ch;
    if record.data.len() < expected {
        return Err(RecordError::Short {
            width,
            height,
            step,
            expected,
            actual: record.data.len(),
        });
    }

    let data = if s == w {
        record.data.slice(..expected)
    } else {
        debug!(width, step, "Repacking padded i420 rows");
        let planes = [
            (0, s, h, w),
            (s * h, cs, ch, cw),
            (s * h + cs * ch, cs, ch, cw),
        ];
        let mut tight = Vec::with_capacity(TargetEncoding::I420.frame_len(width, height));
        for (offset, stride, rows, row) in planes {
            for r in 0..rows {
                let start = offset + r * stride;
                tight.extend_from_slice(&record.data[start..start + row]);
            }
        }
        tight.into()
    };

    let stamp = record.capture_stamp;
    Ok(VideoFrame {
        width,
        height,
        buffer_type: VideoBufferType::I420,
        data,
        timestamp_us: i64::from(stamp.sec) * 1_000_000 + i64::from(stamp.nanosec / 1_000),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    Forwarded,
    Rejected,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub received: u64,
    pub forwarded: u64,
    pub rejected: u64,
    pub failed: u64,
}

pub struct TopicBridge<V> {
    source: V,
    stats: BridgeStats,
}

impl<V: VideoSource> TopicBridge<V> {
    pub fn new(source: V) -> Self {
        Self {
            source,
            stats: BridgeStats::default(),
        }
    }

    /// Forward one record. Rejected records and source failures are logged
    /// and skipped.
    pub fn forward(&mut self, record: &ImageRecord) -> ForwardOutcome {
        self.stats.received += 1;
        let frame = match i420_video_frame(record) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.rejected += 1;
                metrics::counter!("bridge_records_rejected").increment(1);
                warn!(stage = "bridge", error = %e, "Skipping record");
                return ForwardOutcome::Rejected;
            }
        };

        match self.source.capture_frame(frame) {
            Ok(()) => {
                self.stats.forwarded += 1;
                ForwardOutcome::Forwarded
            }
            Err(e) => {
                self.stats.failed += 1;
                warn!(stage = "bridge", error = %e, "Video source refused frame");
                ForwardOutcome::Failed
            }
        }
    }

    /// Forward records from `subscription` until a stop is requested or the
    /// bus goes away, then close the video source.
    pub async fn run(&mut self, subscription: &Subscription, lifecycle: &Lifecycle) -> BridgeStats {
        lifecycle.advance(LifecycleState::Running);
        info!(topic = subscription.topic(), "Bridge running");

        loop {
            tokio::select! {
                biased;
                _ = lifecycle.stopping() => break,
                record = subscription.recv() => {
                    let Some(record) = record else { break };
                    self.forward(&record);
                }
            }
        }

        lifecycle.request_stop();
        if let Err(e) = self.source.close() {
            warn!(stage = "bridge", error = %e, "Failed to close video source");
        }
        lifecycle.advance(LifecycleState::Stopped);
        info!(
            forwarded = self.stats.forwarded,
            rejected = self.stats.rejected,
            failed = self.stats.failed,
            "Bridge stopped"
        );
        self.stats
    }

    pub fn stats(&self) -> BridgeStats {
        self.stats
    }
}
