//! Frame source boundary plus the camera-less sources used for demos and tests.

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::info;

use crate::capture::frame::{Frame, PixelFormat};
use crate::convert::{rgb_to_i420, rgb_to_yuyv};
use crate::error::SourceError;

/// Anything that hands out raw frames.
///
/// `read` may block on I/O. `Ok(None)` means "nothing right now"; the capture
/// loop backs off briefly and calls again.
pub trait FrameSource: Send {
    fn name(&self) -> &str;

    fn read(&mut self) -> Result<Option<Frame>, SourceError>;

    /// Release the device handle. Called once when the pipeline stops.
    fn release(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn read(&mut self) -> Result<Option<Frame>, SourceError> {
        (**self).read()
    }

    fn release(&mut self) -> Result<(), SourceError> {
        (**self).release()
    }
}

/// Sleeps until the next frame slot so sources without hardware pacing still
/// deliver at their nominal rate.
pub(crate) struct Pacer {
    interval: Duration,
    next: Option<Instant>,
}

impl Pacer {
    pub(crate) fn new(fps: u32) -> Self {
        let interval = if fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(1.0 / f64::from(fps))
        };
        Self {
            interval,
            next: None,
        }
    }

    pub(crate) fn wait(&mut self) {
        let now = Instant::now();
        let due = self.next.unwrap_or(now);
        if due > now {
            thread::sleep(due - now);
        }
        // Late frames restart the schedule instead of bursting
        self.next = Some(due.max(now) + self.interval);
    }
}

const BARS: [[u8; 3]; 8] = [
    [235, 235, 235],
    [235, 235, 16],
    [16, 235, 235],
    [16, 235, 16],
    [235, 16, 235],
    [235, 16, 16],
    [16, 16, 235],
    [16, 16, 16],
];

/// Scrolling colour bars, selected with `stub://` device paths.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    format: PixelFormat,
    pacer: Pacer,
    sequence: u64,
    limit: Option<u64>,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, fps: u32, format: PixelFormat) -> Result<Self, SourceError> {
        if format == PixelFormat::Mjpeg {
            return Err(SourceError::Open {
                device: "stub://".into(),
                reason: "synthetic source cannot produce MJPEG".into(),
            });
        }
        if width == 0 || height == 0 {
            return Err(SourceError::Open {
                device: "stub://".into(),
                reason: format!("invalid size {width}x{height}"),
            });
        }
        info!("Synthetic source {}x{} {:?} @ {}fps", width, height, format, fps);
        Ok(Self {
            width,
            height,
            format,
            pacer: Pacer::new(fps),
            sequence: 0,
            limit: None,
        })
    }

    /// Report "no frame" once `frames` frames were produced.
    pub fn with_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    fn render_rgb(&self) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let bar_w = w.div_ceil(BARS.len()).max(1);
        let shift = self.sequence as usize;
        let mut rgb = Vec::with_capacity(w * h * 3);
        for _ in 0..h {
            for x in 0..w {
                rgb.extend_from_slice(&BARS[((x + shift) / bar_w) % BARS.len()]);
            }
        }
        rgb
    }
}

impl FrameSource for SyntheticSource {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn read(&mut self) -> Result<Option<Frame>, SourceError> {
        if self.limit.is_some_and(|limit| self.sequence >= limit) {
            return Ok(None);
        }
        self.pacer.wait();

        let rgb = self.render_rgb();
        let (w, h) = (self.width, self.height);
        let data = match self.format {
            PixelFormat::Rgb24 => rgb,
            PixelFormat::Bgr24 => rgb.chunks_exact(3).flat_map(|p| [p[2], p[1], p[0]]).collect(),
            PixelFormat::Rgba32 => rgb.chunks_exact(3).flat_map(|p| [p[0], p[1], p[2], 255]).collect(),
            PixelFormat::Yuyv422 => rgb_to_yuyv(&rgb, w, h),
            PixelFormat::I420 => rgb_to_i420(&rgb, w, h),
            PixelFormat::Mjpeg => unreachable!("rejected in SyntheticSource::new"),
        };

        self.sequence += 1;
        Ok(Some(
            Frame::new(data, w, h, self.format).with_sequence(self.sequence),
        ))
    }
}

/// Repeats one decoded still image at a fixed rate.
pub struct StillImageSource {
    path: String,
    data: Bytes,
    width: u32,
    height: u32,
    pacer: Pacer,
    sequence: u64,
}

impl StillImageSource {
    pub fn open(path: impl AsRef<Path>, fps: u32) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let image = image::open(path).map_err(|e| SourceError::Open {
            device: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let rgb = image.to_rgb8();
        let (width, height) = rgb.dimensions();
        info!("Still image source {} ({}x{})", path.display(), width, height);

        Ok(Self {
            path: path.display().to_string(),
            data: Bytes::from(rgb.into_raw()),
            width,
            height,
            pacer: Pacer::new(fps),
            sequence: 0,
        })
    }
}

impl FrameSource for StillImageSource {
    fn name(&self) -> &str {
        &self.path
    }

    fn read(&mut self) -> Result<Option<Frame>, SourceError> {
        self.pacer.wait();
        self.sequence += 1;
        Ok(Some(
            Frame::new(self.data.clone(), self.width, self.height, PixelFormat::Rgb24)
                .with_sequence(self.sequence),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_frames_have_declared_size() {
        for format in [
            PixelFormat::Rgb24,
            PixelFormat::Bgr24,
            PixelFormat::Rgba32,
            PixelFormat::Yuyv422,
            PixelFormat::I420,
        ] {
            let mut source = SyntheticSource::new(64, 48, 0, format).unwrap();
            let frame = source.read().unwrap().expect("frame");
            assert_eq!(frame.data.len(), format.frame_len(64, 48).unwrap(), "{format:?}");
            assert_eq!(frame.meta.sequence, 1);
        }
    }

    #[test]
    fn synthetic_limit_reports_absent() {
        let mut source = SyntheticSource::new(8, 8, 0, PixelFormat::Rgb24)
            .unwrap()
            .with_limit(2);
        assert!(source.read().unwrap().is_some());
        assert!(source.read().unwrap().is_some());
        assert!(source.read().unwrap().is_none());
    }

    #[test]
    fn synthetic_rejects_mjpeg() {
        assert!(SyntheticSource::new(8, 8, 0, PixelFormat::Mjpeg).is_err());
    }

    #[test]
    fn pacer_spaces_frames() {
        let mut pacer = Pacer::new(100);
        let start = Instant::now();
        for _ in 0..4 {
            pacer.wait();
        }
        // first slot is immediate, then three 10ms gaps
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn still_image_repeats_decoded_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("still.png");
        image::RgbImage::from_pixel(4, 2, image::Rgb([1, 2, 3]))
            .save(&path)
            .unwrap();

        let mut source = StillImageSource::open(&path, 0).unwrap();
        let a = source.read().unwrap().unwrap();
        let b = source.read().unwrap().unwrap();
        assert_eq!((a.meta.width, a.meta.height), (4, 2));
        assert_eq!(&a.data[..3], &[1, 2, 3]);
        assert_eq!(a.data, b.data);
        assert_eq!(b.meta.sequence, 2);
    }

    #[test]
    fn missing_image_is_an_open_error() {
        assert!(matches!(
            StillImageSource::open("/nonexistent/frame.png", 0),
            Err(SourceError::Open { .. })
        ));
    }
}
