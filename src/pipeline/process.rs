//! Processing stage: raw frame in, packaged frame out.

use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use chrono::{DateTime, Local};
use tracing::{debug, info, instrument, warn};

use crate::capture::{Frame, PackagedFrame, TargetEncoding};
use crate::config::Config;
use crate::control::SnapshotReader;
use crate::convert::convert_frame;
use crate::error::ConvertError;
use crate::overlay::{control_lines, TelemetryOverlay};
use crate::pipeline::lifecycle::Lifecycle;
use crate::pipeline::relay::{RelayReceiver, RelaySender};

/// Converts frames to the target encoding and stamps the overlay.
#[derive(Debug, Clone)]
pub struct FrameProcessor {
    target: TargetEncoding,
    overlay: Option<TelemetryOverlay>,
    controls: Option<SnapshotReader>,
}

impl FrameProcessor {
    pub fn new(target: TargetEncoding, overlay: Option<TelemetryOverlay>) -> Self {
        Self {
            target,
            overlay,
            controls: None,
        }
    }

    /// Also draw the latest control snapshot under the clock.
    pub fn with_controls(mut self, controls: SnapshotReader) -> Self {
        self.controls = Some(controls);
        self
    }

    pub fn from_config(config: &Config) -> Self {
        let overlay = config
            .overlay
            .enabled
            .then(|| TelemetryOverlay::new(config.overlay.position, config.overlay.scale as usize));
        Self::new(config.pipeline.target_encoding, overlay)
    }

    pub fn target(&self) -> TargetEncoding {
        self.target
    }

    pub fn process(&self, frame: &Frame) -> Result<PackagedFrame, ConvertError> {
        self.process_at(frame, Local::now())
    }

    fn process_at(&self, frame: &Frame, now: DateTime<Local>) -> Result<PackagedFrame, ConvertError> {
        let mut converted = convert_frame(frame, self.target)?;

        if let Some(overlay) = &self.overlay {
            let mut lines = vec![TelemetryOverlay::stamp_text(now)];
            if let Some(controls) = &self.controls {
                lines.extend(control_lines(&controls.latest(), now.timestamp_millis()));
            }
            overlay.draw_lines(
                &mut converted.data,
                self.target,
                converted.width,
                converted.height,
                &lines,
            );
        }

        Ok(PackagedFrame {
            data: Bytes::from(converted.data),
            width: converted.width,
            height: converted.height,
            encoding: self.target,
            stride: self.target.stride(converted.width),
            sequence: frame.meta.sequence,
            captured_at: frame.captured_at,
            processed_at: SystemTime::now(),
            capture_instant: frame.timestamp,
        })
    }
}

/// Counters of one processing run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessStats {
    pub processed: u64,
    pub failed: u64,
}

/// Processing loop; returns once the lifecycle asks to stop.
///
/// Each wait on `input` is bounded by `poll`, and the stop flag is checked
/// right after every wait.
#[instrument(name = "processing", skip_all)]
pub fn run_processing(
    input: &RelayReceiver<Frame>,
    output: &RelaySender<PackagedFrame>,
    processor: FrameProcessor,
    lifecycle: Lifecycle,
    poll: Duration,
) -> ProcessStats {
    info!(target_encoding = %processor.target(), "Processing stage started");
    let mut stats = ProcessStats::default();

    loop {
        let next = input.take_timeout(poll);
        if lifecycle.should_stop() {
            break;
        }
        let Some(frame) = next else {
            continue;
        };

        let started = Instant::now();
        match processor.process(&frame) {
            Ok(packaged) => {
                metrics::histogram!("process_time_us").record(started.elapsed().as_micros() as f64);
                stats.processed += 1;
                if output.try_put(packaged).is_some() {
                    debug!("Publish queue full, dropped oldest packaged frame");
                }
            }
            Err(e) => {
                stats.failed += 1;
                warn!(stage = "processing", sequence = frame.meta.sequence, error = %e, "Dropping frame");
            }
        }
    }

    info!(
        processed = stats.processed,
        failed = stats.failed,
        "Processing stage stopped"
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use crate::control::{ControlParser, ControlState};
    use crate::overlay::Corner;
    use crate::pipeline::lifecycle::LifecycleState;
    use crate::pipeline::relay::relay;

    #[test]
    fn packages_720p_rgb_as_i420() {
        let frame = Frame::new(vec![0u8; 1280 * 720 * 3], 1280, 720, PixelFormat::Rgb24);
        let packaged = FrameProcessor::new(TargetEncoding::I420, None)
            .process(&frame)
            .unwrap();
        assert_eq!(packaged.data.len(), 1_382_400);
        assert_eq!(packaged.stride, 1280);
        assert_eq!(packaged.encoding, TargetEncoding::I420);
    }

    #[test]
    fn packed_stride_is_width_times_bpp() {
        let frame = Frame::new(vec![7u8; 10 * 4 * 3], 10, 4, PixelFormat::Rgb24);
        let packaged = FrameProcessor::new(TargetEncoding::Rgba8, None)
            .process(&frame)
            .unwrap();
        assert_eq!(packaged.stride, 40);
        assert_eq!(packaged.data.len(), 160);
    }

    #[test]
    fn overlay_changes_pixels() {
        let frame = Frame::new(vec![16u8; 320 * 120 * 3], 320, 120, PixelFormat::Rgb24);
        let plain = FrameProcessor::new(TargetEncoding::Rgb8, None)
            .process(&frame)
            .unwrap();
        let stamped = FrameProcessor::new(
            TargetEncoding::Rgb8,
            Some(TelemetryOverlay::new(Corner::Br, 1)),
        )
        .process(&frame)
        .unwrap();
        assert_eq!(plain.data.len(), stamped.data.len());
        assert_ne!(plain.data, stamped.data);
    }

    #[test]
    fn overlay_follows_latest_control_snapshot() {
        let (mut parser, reader) = ControlParser::new(ControlState::default());
        let processor = FrameProcessor::new(
            TargetEncoding::I420,
            Some(TelemetryOverlay::new(Corner::Tl, 1)),
        )
        .with_controls(reader);
        let frame = Frame::new(vec![0u8; 320 * 120 * 3], 320, 120, PixelFormat::Rgb24);
        let now = Local::now();

        let before = processor.process_at(&frame, now).unwrap();
        assert_eq!(before.data, processor.process_at(&frame, now).unwrap().data);

        parser.handle(r#"{"type":"gear","gear":"R"}"#).unwrap();
        let after = processor.process_at(&frame, now).unwrap();
        assert_ne!(before.data, after.data);

        let unlabelled = FrameProcessor::new(
            TargetEncoding::I420,
            Some(TelemetryOverlay::new(Corner::Tl, 1)),
        )
        .process_at(&frame, now)
        .unwrap();
        assert_ne!(unlabelled.data, before.data);
    }

    #[test]
    fn short_frame_is_an_error() {
        let frame = Frame::new(vec![0u8; 10], 16, 16, PixelFormat::Rgb24);
        assert!(FrameProcessor::new(TargetEncoding::I420, None)
            .process(&frame)
            .is_err());
    }

    #[test]
    fn loop_converts_then_stops_within_poll() {
        let (raw_tx, raw_rx) = relay::<Frame>("raw", 2);
        let (out_tx, out_rx) = relay::<PackagedFrame>("packaged", 2);
        let lifecycle = Lifecycle::new();
        lifecycle.advance(LifecycleState::Running);

        // Short buffer first; seeing the second frame means the first was handled
        raw_tx.try_put(Frame::new(vec![0u8; 3], 4, 4, PixelFormat::Rgb24).with_sequence(1));
        raw_tx.try_put(Frame::new(vec![0u8; 4 * 4 * 3], 4, 4, PixelFormat::Rgb24).with_sequence(2));

        let stage_lifecycle = lifecycle.clone();
        let handle = std::thread::spawn(move || {
            run_processing(
                &raw_rx,
                &out_tx,
                FrameProcessor::new(TargetEncoding::Rgb8, None),
                stage_lifecycle,
                Duration::from_millis(20),
            )
        });

        let packaged = out_rx.take_timeout(Duration::from_secs(2)).expect("packaged frame");
        assert_eq!(packaged.sequence, 2);

        let stop_requested = Instant::now();
        lifecycle.request_stop();
        let stats = handle.join().unwrap();
        assert!(stop_requested.elapsed() < Duration::from_secs(1));
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.failed, 1);
    }
}
