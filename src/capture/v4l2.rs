//! V4L2 capture over memory-mapped buffers

use std::io;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::{CaptureStream, Stream as _};
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::capture::source::FrameSource;
use crate::config::CaptureConfig;
use crate::error::SourceError;

/// V4L2 camera
pub struct V4l2Capture {
    path: String,
    // Declared before `device` so it is dropped first
    stream: Option<MmapStream<'static>>,
    device: Option<Device>,
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
    sequence: u64,
}

fn open_error(path: &str, reason: impl ToString) -> SourceError {
    SourceError::Open {
        device: path.to_string(),
        reason: reason.to_string(),
    }
}

impl V4l2Capture {
    /// Open and configure the device, then start streaming.
    pub fn open(config: &CaptureConfig, path: &str) -> Result<Self, SourceError> {
        info!("Initializing V4L2 capture: {}", path);

        let device = Device::with_path(path).map_err(|e| open_error(path, e))?;

        let caps = device.query_caps().map_err(|e| open_error(path, e))?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(open_error(path, "device doesn't support video capture"));
        }

        let wanted: PixelFormat = config
            .fourcc
            .parse()
            .map_err(|e: String| open_error(path, e))?;

        let mut fmt = device.format().map_err(|e| open_error(path, e))?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = FourCC::new(&wanted.fourcc());
        let actual = device.set_format(&fmt).map_err(|e| open_error(path, e))?;

        let format = PixelFormat::from_fourcc(&actual.fourcc.repr).ok_or_else(|| {
            open_error(path, format!("driver picked unsupported fourcc {}", actual.fourcc))
        })?;
        if format != wanted || actual.width != config.width || actual.height != config.height {
            warn!(
                "Requested {}x{} {:?}, driver gave {}x{} {:?}",
                config.width, config.height, wanted, actual.width, actual.height, format
            );
        }

        // Some drivers refuse programmatic frame intervals; keep theirs then.
        match device.set_params(&Parameters::with_fps(config.fps)) {
            Ok(params) => debug!("Frame interval: {}", params.interval),
            Err(e) => warn!("Could not set {} fps, keeping driver rate: {}", config.fps, e),
        }

        let mut stream = MmapStream::with_buffers(&device, Type::VideoCapture, config.buffer_count)
            .map_err(|e| open_error(path, e))?;
        // Bounded so a stalled camera still lets the capture loop see a stop
        stream.set_timeout(poll_timeout(config.read_timeout()));
        info!("Capture stream started with {} buffers", config.buffer_count);

        Ok(Self {
            path: path.to_string(),
            stream: Some(stream),
            device: Some(device),
            width: actual.width,
            height: actual.height,
            stride: actual.stride,
            format,
            sequence: 0,
        })
    }
}

/// `MmapStream` keeps its timeout as whole milliseconds in an `i32`.
fn poll_timeout(timeout: Duration) -> Duration {
    timeout.clamp(Duration::from_millis(1), Duration::from_millis(i32::MAX as u64))
}

fn is_stall(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::TimedOut
}

impl FrameSource for V4l2Capture {
    fn name(&self) -> &str {
        &self.path
    }

    /// Waits up to the read timeout for the next buffer; `None` on timeout.
    #[instrument(skip(self), level = "trace")]
    fn read(&mut self) -> Result<Option<Frame>, SourceError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(SourceError::Read("stream not started".into()));
        };

        let (buf, meta) = match stream.next() {
            Ok(next) => next,
            Err(e) if is_stall(&e) => {
                // The last buffer was already requeued; STREAMOFF returns every
                // buffer so the next read starts the stream afresh.
                debug!("No frame from {} within the read timeout", self.path);
                if let Err(e) = stream.stop() {
                    return Err(SourceError::Read(format!("restarting stalled stream: {e}")));
                }
                return Ok(None);
            }
            Err(e) => return Err(SourceError::Read(e.to_string())),
        };
        let timestamp = Instant::now();
        let captured_at = SystemTime::now();

        // Compressed buffers are only partially filled
        let used = match meta.bytesused as usize {
            0 => buf.len(),
            n => n.min(buf.len()),
        };
        if used == 0 {
            return Ok(None);
        }
        let data = Bytes::copy_from_slice(&buf[..used]);

        self.sequence += 1;
        let stride = if self.format == PixelFormat::Mjpeg {
            0
        } else {
            self.stride
        };

        Ok(Some(Frame {
            data,
            meta: FrameMetadata {
                sequence: self.sequence,
                width: self.width,
                height: self.height,
                stride,
                format: self.format,
                device_timestamp: Some(
                    Duration::from_secs(meta.timestamp.sec as u64)
                        + Duration::from_micros(meta.timestamp.usec as u64),
                ),
            },
            timestamp,
            captured_at,
        }))
    }

    fn release(&mut self) -> Result<(), SourceError> {
        let result = match self.stream.as_mut() {
            Some(stream) => stream
                .stop()
                .map_err(|e| SourceError::Release(format!("{}: {e}", self.path))),
            None => Ok(()),
        };
        self.stream = None;
        self.device = None;
        info!("Released {}", self.path);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeouts_count_as_stalls() {
        assert!(is_stall(&io::Error::new(io::ErrorKind::TimedOut, "VIDIOC_DQBUF")));
        assert!(!is_stall(&io::Error::new(io::ErrorKind::Other, "EIO")));
    }

    #[test]
    fn poll_timeout_fits_the_driver_field() {
        assert_eq!(poll_timeout(Duration::from_millis(250)), Duration::from_millis(250));
        assert_eq!(poll_timeout(Duration::ZERO), Duration::from_millis(1));
        assert_eq!(
            poll_timeout(Duration::from_secs(u64::MAX / 2)),
            Duration::from_millis(i32::MAX as u64)
        );
    }
}
