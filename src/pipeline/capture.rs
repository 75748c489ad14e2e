//! Capture stage: pulls frames from the source onto the raw relay queue.

use std::thread;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::capture::{Frame, FrameSource};
use crate::pipeline::lifecycle::Lifecycle;
use crate::pipeline::relay::RelaySender;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub captured: u64,
    pub empty_reads: u64,
    pub errors: u64,
}

/// Capture loop; returns once the lifecycle asks to stop, after releasing the
/// source.
///
/// An empty read or a read error backs off for `backoff` before retrying.
#[instrument(name = "capture", skip_all, fields(source = source.name()))]
pub fn run_capture<S: FrameSource>(
    mut source: S,
    output: &RelaySender<Frame>,
    lifecycle: Lifecycle,
    backoff: Duration,
) -> CaptureStats {
    info!("Capture stage started");
    let mut stats = CaptureStats::default();

    while !lifecycle.should_stop() {
        match source.read() {
            Ok(Some(frame)) => {
                stats.captured += 1;
                if let Some(stale) = output.try_put(frame) {
                    debug!(sequence = stale.meta.sequence, "Raw queue full, dropped oldest frame");
                }
            }
            Ok(None) => {
                stats.empty_reads += 1;
                thread::sleep(backoff);
            }
            Err(e) => {
                stats.errors += 1;
                warn!(stage = "capture", error = %e, "Frame read failed");
                thread::sleep(backoff);
            }
        }
    }

    if let Err(e) = source.release() {
        warn!(stage = "capture", error = %e, "Failed to release source");
    }
    info!(
        captured = stats.captured,
        errors = stats.errors,
        "Capture stage stopped"
    );
    stats
}
