//! Consumers of packaged frames, driven by the publish stage.

pub mod bridge;
pub mod stream;
pub mod topic;

#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_source;
#[cfg(feature = "mqtt")]
pub mod mqtt;
#[cfg(feature = "preview")]
pub mod preview;

pub use bridge::{BridgeStats, TopicBridge};
pub use stream::{StreamSink, VideoBufferType, VideoFrame, VideoSource};
pub use topic::{ImageRecord, LocalBus, LocalPublisher, Subscription, TopicPublisher, TopicSink};

#[cfg(feature = "gstreamer-pipeline")]
pub use gst_source::GstVideoSource;
#[cfg(feature = "mqtt")]
pub use mqtt::{MqttPublisher, MqttSubscriber};
#[cfg(feature = "preview")]
pub use preview::PreviewSink;

use std::time::SystemTime;

use tracing::warn;

use crate::capture::PackagedFrame;
use crate::error::SinkError;

/// One frame at a time, called from the publish tick.
///
/// `send` must not block for long; a slow sink skews the tick cadence.
pub trait FrameSink: Send {
    fn name(&self) -> &str;

    fn send(&mut self, frame: PackagedFrame, sent_at: SystemTime) -> Result<(), SinkError>;

    /// Flush and release transport resources. Called once at shutdown.
    fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

impl<K: FrameSink + ?Sized> FrameSink for Box<K> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn send(&mut self, frame: PackagedFrame, sent_at: SystemTime) -> Result<(), SinkError> {
        (**self).send(frame, sent_at)
    }

    fn close(&mut self) -> Result<(), SinkError> {
        (**self).close()
    }
}

/// Sends every frame to two sinks, e.g. a topic and a local preview.
///
/// Both sinks are always tried; the first failure is reported.
pub struct TeeSink<A, B> {
    name: String,
    first: A,
    second: B,
}

impl<A: FrameSink, B: FrameSink> TeeSink<A, B> {
    pub fn new(first: A, second: B) -> Self {
        let name = format!("{}+{}", first.name(), second.name());
        Self {
            name,
            first,
            second,
        }
    }
}

impl<A: FrameSink, B: FrameSink> FrameSink for TeeSink<A, B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&mut self, frame: PackagedFrame, sent_at: SystemTime) -> Result<(), SinkError> {
        let a = self.first.send(frame.clone(), sent_at);
        let b = self.second.send(frame, sent_at);
        a.and(b)
    }

    fn close(&mut self) -> Result<(), SinkError> {
        let a = self.first.close();
        if let Err(e) = &a {
            warn!(sink = self.first.name(), error = %e, "Close failed");
        }
        let b = self.second.close();
        a.and(b)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{packaged, RecordingSink};
    use super::*;

    #[test]
    fn tee_delivers_to_both() {
        let a = RecordingSink::default();
        let b = RecordingSink::default();
        let mut tee = TeeSink::new(a.clone(), b.clone());
        assert_eq!(tee.name(), "recording+recording");

        tee.send(packaged(1), SystemTime::now()).unwrap();
        assert_eq!(a.frames.lock().unwrap().len(), 1);
        assert_eq!(b.frames.lock().unwrap()[0].0.sequence, 1);
    }

    #[test]
    fn tee_tries_second_when_first_fails() {
        let a = RecordingSink {
            fail: true,
            ..Default::default()
        };
        let b = RecordingSink::default();
        let mut tee = TeeSink::new(a, b.clone());

        assert!(tee.send(packaged(1), SystemTime::now()).is_err());
        assert_eq!(b.frames.lock().unwrap().len(), 1);

        tee.close().unwrap();
        assert!(*b.closed.lock().unwrap());
    }
}
