//! Image records published on a named topic.
//!
//! The record mirrors the usual robotics image message: a header carrying the
//! publish stamp and `camera_link` frame id, geometry, encoding tag, row step
//! and the raw payload. On the wire a record is a `u32` big-endian header
//! length, the JSON header, then the payload bytes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::capture::PackagedFrame;
use crate::error::SinkError;
use crate::sink::FrameSink;

pub const FRAME_ID: &str = "camera_link";

/// Seconds and nanoseconds since the Unix epoch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    pub sec: i32,
    pub nanosec: u32,
}

impl Stamp {
    pub fn from_system(time: SystemTime) -> Self {
        let since = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            sec: i32::try_from(since.as_secs()).unwrap_or(i32::MAX),
            nanosec: since.subsec_nanos(),
        }
    }

    pub fn to_system(self) -> SystemTime {
        UNIX_EPOCH + Duration::new(self.sec.max(0) as u64, self.nanosec)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordHeader {
    pub stamp: Stamp,
    pub frame_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub header: RecordHeader,
    pub height: u32,
    pub width: u32,
    /// `rgb8`, `bgr8`, `rgba8` or `i420`
    pub encoding: String,
    pub is_bigendian: u8,
    /// Row length in bytes; the luma row for `i420`
    pub step: u32,
    pub capture_stamp: Stamp,
    #[serde(skip)]
    pub data: Bytes,
}

impl ImageRecord {
    pub fn from_frame(frame: &PackagedFrame, sent_at: SystemTime) -> Self {
        Self {
            header: RecordHeader {
                stamp: Stamp::from_system(sent_at),
                frame_id: FRAME_ID.to_string(),
            },
            height: frame.height,
            width: frame.width,
            encoding: frame.encoding.tag().to_string(),
            is_bigendian: 0,
            step: frame.stride,
            capture_stamp: Stamp::from_system(frame.captured_at),
            data: frame.data.clone(),
        }
    }

    pub fn encode_wire(&self) -> Result<Bytes, SinkError> {
        let header =
            serde_json::to_vec(self).map_err(|e| SinkError::Malformed(e.to_string()))?;
        let header_len = u32::try_from(header.len())
            .map_err(|_| SinkError::Malformed("header too large".into()))?;

        let mut buf = BytesMut::with_capacity(4 + header.len() + self.data.len());
        buf.put_u32(header_len);
        buf.put_slice(&header);
        buf.put_slice(&self.data);
        Ok(buf.freeze())
    }

    pub fn decode_wire(mut wire: Bytes) -> Result<Self, SinkError> {
        if wire.len() < 4 {
            return Err(SinkError::Malformed(format!(
                "{} bytes is shorter than the length prefix",
                wire.len()
            )));
        }
        let header_len = wire.get_u32() as usize;
        if header_len > wire.len() {
            return Err(SinkError::Malformed(format!(
                "header length {} exceeds remaining {} bytes",
                header_len,
                wire.len()
            )));
        }
        let header = wire.split_to(header_len);
        let mut record: ImageRecord =
            serde_json::from_slice(&header).map_err(|e| SinkError::Malformed(e.to_string()))?;
        record.data = wire;
        Ok(record)
    }
}

/// Transport for image records
pub trait TopicPublisher: Send {
    fn topic(&self) -> &str;

    fn publish(&mut self, record: ImageRecord) -> Result<(), SinkError>;

    fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Publishes every packaged frame as an [`ImageRecord`].
pub struct TopicSink<P> {
    name: String,
    publisher: P,
}

impl<P: TopicPublisher> TopicSink<P> {
    pub fn new(publisher: P) -> Self {
        Self {
            name: format!("topic:{}", publisher.topic()),
            publisher,
        }
    }
}

impl<P: TopicPublisher> FrameSink for TopicSink<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&mut self, frame: PackagedFrame, sent_at: SystemTime) -> Result<(), SinkError> {
        let record = ImageRecord::from_frame(&frame, sent_at);
        trace!(sequence = frame.sequence, bytes = record.data.len(), "publish record");
        self.publisher.publish(record)
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.publisher.close()
    }
}

struct BusInner {
    depth: usize,
    topics: Mutex<HashMap<String, Vec<flume::Sender<ImageRecord>>>>,
    dropped: AtomicU64,
}

/// In-process topic bus.
///
/// Every subscriber owns a bounded queue of `depth` records. A record that
/// does not fit is dropped for that subscriber only.
#[derive(Clone)]
pub struct LocalBus {
    inner: Arc<BusInner>,
}

impl LocalBus {
    pub fn new(depth: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                depth: depth.max(1),
                topics: Mutex::new(HashMap::new()),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self, topic: &str) -> Subscription {
        let (tx, rx) = flume::bounded(self.inner.depth);
        self.inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        debug!("New subscriber on {}", topic);
        Subscription {
            topic: topic.to_string(),
            rx,
        }
    }

    pub fn publisher(&self, topic: &str) -> LocalPublisher {
        LocalPublisher {
            topic: topic.to_string(),
            bus: self.clone(),
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map_or(0, Vec::len)
    }

    /// Records dropped on full subscriber queues so far
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    fn deliver(&self, topic: &str, record: ImageRecord) {
        let mut topics = self.inner.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(subscribers) = topics.get_mut(topic) else {
            return;
        };
        subscribers.retain(|tx| match tx.try_send(record.clone()) {
            Ok(()) => true,
            Err(flume::TrySendError::Full(_)) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("topic_records_dropped").increment(1);
                true
            }
            Err(flume::TrySendError::Disconnected(_)) => false,
        });
    }
}

/// [`TopicPublisher`] onto a [`LocalBus`]
pub struct LocalPublisher {
    topic: String,
    bus: LocalBus,
}

impl TopicPublisher for LocalPublisher {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn publish(&mut self, record: ImageRecord) -> Result<(), SinkError> {
        self.bus.deliver(&self.topic, record);
        Ok(())
    }
}

/// Receiving end of a [`LocalBus`] subscription
pub struct Subscription {
    topic: String,
    rx: flume::Receiver<ImageRecord>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn try_recv(&self) -> Option<ImageRecord> {
        self.rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<ImageRecord> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// `None` once every publisher handle and the bus are gone.
    pub async fn recv(&self) -> Option<ImageRecord> {
        self.rx.recv_async().await.ok()
    }
}
