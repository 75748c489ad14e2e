//! GStreamer-based capture with hardware JPEG decode when available

use std::time::{Instant, SystemTime};

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::capture::source::FrameSource;
use crate::config::CaptureConfig;
use crate::error::SourceError;

const PULL_TIMEOUT_MS: u64 = 500;

/// v4l2src ! decode ! videoconvert ! appsink
pub struct GstCapture {
    path: String,
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    sequence: u64,
    released: bool,
}

fn open_error(path: &str, reason: impl ToString) -> SourceError {
    SourceError::Open {
        device: path.to_string(),
        reason: reason.to_string(),
    }
}

impl GstCapture {
    /// Build and start the capture pipeline. Frames come out as RGB24.
    pub fn open(config: &CaptureConfig, path: &str) -> Result<Self, SourceError> {
        gst::init().map_err(|e| open_error(path, format!("failed to initialize GStreamer: {e}")))?;

        info!("Initializing GStreamer capture pipeline");

        let pipeline_str = Self::build_pipeline_string(config, path)?;
        info!("Pipeline: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| open_error(path, e))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| open_error(path, "failed to create pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| open_error(path, "failed to find appsink element"))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| open_error(path, "failed to cast to AppSink"))?;

        appsink.set_property("emit-signals", false);
        appsink.set_property("max-buffers", 2u32);
        appsink.set_property("drop", true); // Keep the freshest buffers only
        appsink.set_property("sync", false);

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| open_error(path, format!("failed to start pipeline: {e:?}")))?;

        Ok(Self {
            path: path.to_string(),
            pipeline,
            appsink,
            sequence: 0,
            released: false,
        })
    }

    fn build_pipeline_string(config: &CaptureConfig, path: &str) -> Result<String, SourceError> {
        let (width, height, fps) = (config.width, config.height, config.fps);
        let source: PixelFormat = config.fourcc.parse().map_err(|e: String| open_error(path, e))?;

        let caps = match source {
            PixelFormat::Mjpeg => format!(
                "image/jpeg,width={width},height={height},framerate={fps}/1 ! {}",
                Self::detect_jpeg_decoder()
            ),
            PixelFormat::Yuyv422 => {
                format!("video/x-raw,format=YUY2,width={width},height={height},framerate={fps}/1")
            }
            PixelFormat::Rgb24 => {
                format!("video/x-raw,format=RGB,width={width},height={height},framerate={fps}/1")
            }
            other => return Err(open_error(path, format!("unsupported capture fourcc {other:?}"))),
        };

        Ok(format!(
            "v4l2src device={path} name=source ! {caps} ! \
             queue max-size-buffers=2 max-size-time=0 max-size-bytes=0 leaky=downstream ! \
             videoconvert ! video/x-raw,format=RGB ! appsink name=appsink"
        ))
    }

    /// Hardware decoders first, software `jpegdec` as the fallback
    fn detect_jpeg_decoder() -> &'static str {
        let decoders = ["nvjpegdec", "vaapijpegdec", "v4l2jpegdec", "jpegdec"];

        for decoder in decoders {
            if let Some(factory) = gst::ElementFactory::find(decoder) {
                debug!(
                    "Found decoder: {} - {}",
                    decoder,
                    factory.metadata("long-name").unwrap_or("")
                );
                return decoder;
            }
        }

        warn!("No JPEG decoder element found, trying jpegdec anyway");
        "jpegdec"
    }
}

impl FrameSource for GstCapture {
    fn name(&self) -> &str {
        &self.path
    }

    fn read(&mut self) -> Result<Option<Frame>, SourceError> {
        let Some(sample) = self
            .appsink
            .try_pull_sample(gst::ClockTime::from_mseconds(PULL_TIMEOUT_MS))
        else {
            if self.appsink.is_eos() {
                return Err(SourceError::Read("capture pipeline reached end of stream".into()));
            }
            return Ok(None);
        };
        let timestamp = Instant::now();
        let captured_at = SystemTime::now();

        let buffer = sample
            .buffer()
            .ok_or_else(|| SourceError::Read("sample contains no buffer".into()))?;
        let map = buffer
            .map_readable()
            .map_err(|_| SourceError::Read("failed to map buffer".into()))?;
        let data = Bytes::copy_from_slice(map.as_slice());

        let caps = sample
            .caps()
            .ok_or_else(|| SourceError::Read("sample has no caps".into()))?;
        let info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|_| SourceError::Read("failed to parse video info from caps".into()))?;

        self.sequence += 1;
        // RGB rows are padded to four bytes
        let stride = info.stride()[0] as u32;

        Ok(Some(Frame {
            data,
            meta: FrameMetadata {
                sequence: self.sequence,
                width: info.width(),
                height: info.height(),
                stride,
                format: PixelFormat::Rgb24,
                device_timestamp: buffer.pts().map(|pts| pts.into()),
            },
            timestamp,
            captured_at,
        }))
    }

    fn release(&mut self) -> Result<(), SourceError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        info!("Stopping GStreamer capture pipeline");
        self.pipeline
            .set_state(gst::State::Null)
            .map(|_| ())
            .map_err(|e| SourceError::Release(format!("{e:?}")))
    }
}

impl Drop for GstCapture {
    fn drop(&mut self) {
        let _ = self.release();
    }
}
