pub mod decoder;
pub mod frame;
pub mod source;

#[cfg(feature = "v4l2")]
pub mod discover;
#[cfg(feature = "v4l2")]
pub mod v4l2;

#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_capture;

pub use frame::{Frame, FrameMetadata, PackagedFrame, PixelFormat, TargetEncoding};
pub use source::{FrameSource, StillImageSource, SyntheticSource};

#[cfg(feature = "gstreamer-pipeline")]
pub use gst_capture::GstCapture;
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Capture;

use tracing::info;

use crate::config::{CaptureBackend, CaptureConfig};
use crate::error::SourceError;

pub const STUB_PREFIX: &str = "stub://";
pub const FILE_PREFIX: &str = "file://";

/// Open the frame source named by `config.device`.
///
/// `stub://[FOURCC]` yields colour bars (RGB24 unless a fourcc follows),
/// `file://<path>` repeats a still image and `auto` probes `/dev/video*`.
/// Anything else is a device node opened with the configured backend.
pub fn open_source(config: &CaptureConfig) -> Result<Box<dyn FrameSource>, SourceError> {
    let device = config.device.as_str();

    if let Some(rest) = device.strip_prefix(STUB_PREFIX) {
        let format = if rest.is_empty() {
            PixelFormat::Rgb24
        } else {
            rest.parse().map_err(|reason| SourceError::Open {
                device: device.to_string(),
                reason,
            })?
        };
        let source = SyntheticSource::new(config.width, config.height, config.fps, format)?;
        return Ok(Box::new(source));
    }

    if let Some(path) = device.strip_prefix(FILE_PREFIX) {
        return Ok(Box::new(StillImageSource::open(path, config.fps)?));
    }

    let mut config = config.clone();
    if device == "auto" {
        let (path, fourcc) = auto_detect(&config)?;
        info!("Using capture device {} ({})", path, fourcc);
        config.device = path;
        config.fourcc = fourcc;
    }

    open_device(&config)
}

#[cfg(feature = "v4l2")]
fn auto_detect(_config: &CaptureConfig) -> Result<(String, String), SourceError> {
    discover::auto_detect_device()
}

#[cfg(not(feature = "v4l2"))]
fn auto_detect(_config: &CaptureConfig) -> Result<(String, String), SourceError> {
    Err(SourceError::Open {
        device: "auto".into(),
        reason: "device discovery needs the `v4l2` feature".into(),
    })
}

fn open_device(config: &CaptureConfig) -> Result<Box<dyn FrameSource>, SourceError> {
    match config.backend {
        #[cfg(feature = "v4l2")]
        CaptureBackend::V4l2 => Ok(Box::new(V4l2Capture::open(config, &config.device)?)),
        #[cfg(feature = "gstreamer-pipeline")]
        CaptureBackend::Gstreamer => Ok(Box::new(GstCapture::open(config, &config.device)?)),
        #[allow(unreachable_patterns)]
        backend => Err(SourceError::Open {
            device: config.device.clone(),
            reason: format!("capture backend {backend:?} not compiled in"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub(device: &str) -> CaptureConfig {
        CaptureConfig {
            device: device.into(),
            width: 32,
            height: 16,
            fps: 0,
            ..Default::default()
        }
    }

    #[test]
    fn stub_defaults_to_rgb() {
        let mut source = open_source(&stub("stub://")).unwrap();
        let frame = source.read().unwrap().unwrap();
        assert_eq!(frame.meta.format, PixelFormat::Rgb24);
        assert_eq!((frame.meta.width, frame.meta.height), (32, 16));
    }

    #[test]
    fn stub_accepts_fourcc() {
        let mut source = open_source(&stub("stub://YUYV")).unwrap();
        let frame = source.read().unwrap().unwrap();
        assert_eq!(frame.meta.format, PixelFormat::Yuyv422);
    }

    #[test]
    fn stub_rejects_unknown_fourcc() {
        assert!(matches!(
            open_source(&stub("stub://XXXX")),
            Err(SourceError::Open { .. })
        ));
    }

    #[test]
    fn missing_file_fails_at_open() {
        assert!(open_source(&stub("file:///nonexistent.png")).is_err());
    }
}
