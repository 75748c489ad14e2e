//! Video source backed by a GStreamer `appsrc`

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{info, warn};

use crate::error::SinkError;
use crate::sink::stream::{VideoBufferType, VideoFrame, VideoSource};

/// `appsrc ! queue ! <launch>`. Caps follow the first frame and are renewed
/// whenever the frame geometry changes.
pub struct GstVideoSource {
    name: String,
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    info: Option<gst_video::VideoInfo>,
    closed: bool,
}

fn transport(reason: impl ToString) -> SinkError {
    SinkError::Transport(reason.to_string())
}

impl GstVideoSource {
    pub fn new(track_name: &str, launch: &str) -> Result<Self, SinkError> {
        gst::init().map_err(|e| transport(format!("failed to initialize GStreamer: {e}")))?;

        let pipeline_str = format!(
            "appsrc name=appsrc ! \
             queue max-size-buffers=2 max-size-time=0 max-size-bytes=0 leaky=downstream ! \
             {launch}"
        );
        info!("Pipeline: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(transport)?
            .downcast::<gst::Pipeline>()
            .map_err(|_| transport("failed to create pipeline"))?;

        let appsrc = pipeline
            .by_name("appsrc")
            .ok_or_else(|| transport("failed to find appsrc"))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| transport("failed to cast to AppSrc"))?;

        appsrc.set_property("is-live", true);
        appsrc.set_property("block", false);
        appsrc.set_property("do-timestamp", true);
        appsrc.set_property("format", gst::Format::Time);

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| transport(format!("failed to start pipeline: {e:?}")))?;

        Ok(Self {
            name: track_name.to_string(),
            pipeline,
            appsrc,
            info: None,
            closed: false,
        })
    }

    fn video_info(&mut self, frame: &VideoFrame) -> Result<gst_video::VideoInfo, SinkError> {
        if let Some(info) = &self.info {
            if info.width() == frame.width
                && info.height() == frame.height
                && info.format() == video_format(frame.buffer_type)
            {
                return Ok(info.clone());
            }
        }

        let info =
            gst_video::VideoInfo::builder(video_format(frame.buffer_type), frame.width, frame.height)
                .build()
                .map_err(transport)?;
        let caps = info.to_caps().map_err(transport)?;
        info!("{}: caps {}", self.name, caps);
        self.appsrc.set_caps(Some(&caps));
        self.info = Some(info.clone());
        Ok(info)
    }
}

fn video_format(buffer_type: VideoBufferType) -> gst_video::VideoFormat {
    match buffer_type {
        VideoBufferType::I420 => gst_video::VideoFormat::I420,
        VideoBufferType::Rgba => gst_video::VideoFormat::Rgba,
        VideoBufferType::Rgb24 => gst_video::VideoFormat::Rgb,
        VideoBufferType::Bgr24 => gst_video::VideoFormat::Bgr,
    }
}

/// Tight row length and row count of every plane
fn planes(buffer_type: VideoBufferType, width: usize, height: usize) -> Vec<(usize, usize)> {
    match buffer_type {
        VideoBufferType::I420 => {
            let (cw, ch) = (width.div_ceil(2), height.div_ceil(2));
            vec![(width, height), (cw, ch), (cw, ch)]
        }
        VideoBufferType::Rgba => vec![(width * 4, height)],
        VideoBufferType::Rgb24 | VideoBufferType::Bgr24 => vec![(width * 3, height)],
    }
}

impl VideoSource for GstVideoSource {
    fn capture_frame(&mut self, frame: VideoFrame) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed(self.name.clone()));
        }
        let info = self.video_info(&frame)?;
        let layout = planes(frame.buffer_type, frame.width as usize, frame.height as usize);
        let tight: usize = layout.iter().map(|(row, rows)| row * rows).sum();
        if frame.data.len() < tight {
            return Err(transport(format!(
                "frame holds {} bytes, layout needs {}",
                frame.data.len(),
                tight
            )));
        }

        let mut buffer = gst::Buffer::with_size(info.size())
            .map_err(|_| transport("failed to allocate buffer"))?;
        {
            let buffer_ref = buffer
                .get_mut()
                .ok_or_else(|| transport("buffer is not writable"))?;
            let mut map = buffer_ref
                .map_writable()
                .map_err(|_| transport("failed to map buffer"))?;
            let dst = map.as_mut_slice();

            // GStreamer rows may be padded; ours are tight
            let mut src_offset = 0;
            for (plane, &(row, rows)) in layout.iter().enumerate() {
                let dst_stride = info.stride()[plane] as usize;
                let dst_offset = info.offset()[plane];
                for r in 0..rows {
                    let d = dst_offset + r * dst_stride;
                    dst[d..d + row].copy_from_slice(&frame.data[src_offset..src_offset + row]);
                    src_offset += row;
                }
            }
        }

        self.appsrc
            .push_buffer(buffer)
            .map(|_| ())
            .map_err(|e| SinkError::Publish {
                target: self.name.clone(),
                reason: format!("{e:?}"),
            })
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Err(e) = self.appsrc.end_of_stream() {
            warn!("{}: end of stream failed: {:?}", self.name, e);
        }
        self.pipeline
            .set_state(gst::State::Null)
            .map(|_| ())
            .map_err(|e| transport(format!("failed to stop pipeline: {e:?}")))
    }
}

impl Drop for GstVideoSource {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i420_planes_round_up_chroma() {
        assert_eq!(
            planes(VideoBufferType::I420, 5, 3),
            vec![(5, 3), (3, 2), (3, 2)]
        );
        assert_eq!(planes(VideoBufferType::Rgba, 5, 3), vec![(20, 3)]);
    }
}
