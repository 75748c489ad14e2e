//! Streaming sink: packaged frames become video frames for a real-time
//! video source (a WebRTC track, a local GStreamer pipeline, ...).

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tracing::trace;

use crate::capture::{PackagedFrame, TargetEncoding};
use crate::error::SinkError;
use crate::sink::FrameSink;

/// Buffer layouts a video source accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoBufferType {
    I420,
    Rgba,
    Rgb24,
    Bgr24,
}

impl From<TargetEncoding> for VideoBufferType {
    fn from(encoding: TargetEncoding) -> Self {
        match encoding {
            TargetEncoding::I420 => VideoBufferType::I420,
            TargetEncoding::Rgba8 => VideoBufferType::Rgba,
            TargetEncoding::Rgb8 => VideoBufferType::Rgb24,
            TargetEncoding::Bgr8 => VideoBufferType::Bgr24,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub buffer_type: VideoBufferType,
    pub data: Bytes,
    /// Capture time in microseconds since the Unix epoch
    pub timestamp_us: i64,
}

impl VideoFrame {
    pub fn from_packaged(frame: &PackagedFrame) -> Self {
        let timestamp_us = frame
            .captured_at
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
            .unwrap_or_default();
        Self {
            width: frame.width,
            height: frame.height,
            buffer_type: frame.encoding.into(),
            data: frame.data.clone(),
            timestamp_us,
        }
    }
}

/// Destination for video frames. Session and track setup happen elsewhere.
pub trait VideoSource: Send {
    fn capture_frame(&mut self, frame: VideoFrame) -> Result<(), SinkError>;

    fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Submits each packaged frame to a [`VideoSource`].
pub struct StreamSink<V> {
    name: String,
    source: V,
}

impl<V: VideoSource> StreamSink<V> {
    pub fn new(track_name: &str, source: V) -> Self {
        Self {
            name: format!("stream:{track_name}"),
            source,
        }
    }
}

impl<V: VideoSource> FrameSink for StreamSink<V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&mut self, frame: PackagedFrame, _sent_at: SystemTime) -> Result<(), SinkError> {
        let video = VideoFrame::from_packaged(&frame);
        trace!(sequence = frame.sequence, ts = video.timestamp_us, "submit video frame");
        self.source.capture_frame(video)
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.source.close()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::sink::testing::packaged;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<VideoFrame>>>);

    impl VideoSource for Captured {
        fn capture_frame(&mut self, frame: VideoFrame) -> Result<(), SinkError> {
            self.0.lock().unwrap().push(frame);
            Ok(())
        }
    }

    #[test]
    fn frames_keep_layout_and_capture_time() {
        let captured = Captured::default();
        let mut sink = StreamSink::new("camera0", captured.clone());
        assert_eq!(sink.name(), "stream:camera0");

        let mut frame = packaged(4);
        frame.captured_at = UNIX_EPOCH + Duration::from_micros(1_500);
        sink.send(frame, SystemTime::now()).unwrap();

        let frames = captured.0.lock().unwrap();
        assert_eq!(frames[0].buffer_type, VideoBufferType::I420);
        assert_eq!(frames[0].timestamp_us, 1_500);
        assert_eq!((frames[0].width, frames[0].height), (2, 2));
    }

    #[test]
    fn buffer_type_per_encoding() {
        assert_eq!(VideoBufferType::from(TargetEncoding::Rgba8), VideoBufferType::Rgba);
        assert_eq!(VideoBufferType::from(TargetEncoding::Bgr8), VideoBufferType::Bgr24);
    }
}
