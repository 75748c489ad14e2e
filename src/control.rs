//! Operator control messages.
//!
//! Incoming JSON is merged into the previous [`ControlState`], yielding a new
//! immutable snapshot. Snapshots go through a single-slot latest-value
//! channel; readers always see the most recent one and never block the
//! writer.

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ControlError;

/// Merged machine control state, serialized with snake_case names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlState {
    pub rotation: f64,
    pub brake: f64,
    pub throttle: f64,
    pub gear: String,
    pub boom: f64,
    pub bucket: f64,
    pub left_track: f64,
    pub right_track: f64,
    pub swing: f64,
    pub stick: f64,
    pub device_type: String,
    /// Milliseconds, as sent by the operator console
    pub timestamp: i64,
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            rotation: 0.0,
            brake: 0.0,
            throttle: 0.0,
            gear: "N".into(),
            boom: 0.0,
            bucket: 0.0,
            left_track: 0.0,
            right_track: 0.0,
            swing: 0.0,
            stick: 0.0,
            device_type: "wheel_loader".into(),
            timestamp: 0,
        }
    }
}

/// Wire form of one control message. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlMessage {
    pub kind: Option<String>,
    pub t: Option<i64>,
    pub gear: Option<String>,
    pub v: Option<AnalogAxes>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalogAxes {
    pub rotation: Option<f64>,
    pub brake: Option<f64>,
    pub throttle: Option<f64>,
    pub boom: Option<f64>,
    pub bucket: Option<f64>,
    pub left_track: Option<f64>,
    pub right_track: Option<f64>,
    pub swing: Option<f64>,
    pub stick: Option<f64>,
}

impl ControlMessage {
    /// Only text that is not JSON at all is an error.
    pub fn parse(text: &str) -> Result<Self, ControlError> {
        let value: Value = serde_json::from_str(text)?;
        Ok(Self::from_value(&value))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ControlError> {
        Self::parse(std::str::from_utf8(bytes)?)
    }

    /// A field of the wrong type is skipped; the rest of the message still
    /// applies. `t` must be an integer.
    pub fn from_value(value: &Value) -> Self {
        let text = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_owned);
        Self {
            kind: text("type"),
            t: value.get("t").and_then(Value::as_i64),
            gear: text("gear"),
            v: value.get("v").filter(|v| v.is_object()).map(AnalogAxes::from_value),
        }
    }
}

impl AnalogAxes {
    fn from_value(v: &Value) -> Self {
        let axis = |key: &str| v.get(key).and_then(Value::as_f64);
        Self {
            rotation: axis("rotation"),
            brake: axis("brake"),
            throttle: axis("throttle"),
            boom: axis("boom"),
            bucket: axis("bucket"),
            left_track: axis("leftTrack"),
            right_track: axis("rightTrack"),
            swing: axis("swing"),
            stick: axis("stick"),
        }
    }
}

impl ControlState {
    /// New snapshot with `msg` applied on top of `self`.
    ///
    /// `t` always updates the timestamp. `gear` messages set the gear and
    /// `analog` messages overwrite only the axes they carry. Other message
    /// types leave everything but the timestamp alone.
    pub fn merged(&self, msg: &ControlMessage) -> ControlState {
        let mut next = self.clone();
        if let Some(t) = msg.t {
            next.timestamp = t;
        }

        match msg.kind.as_deref() {
            Some("gear") => {
                if let Some(gear) = &msg.gear {
                    next.gear = gear.clone();
                }
            }
            Some("analog") => {
                if let Some(v) = &msg.v {
                    let axes = [
                        (&mut next.rotation, v.rotation),
                        (&mut next.brake, v.brake),
                        (&mut next.throttle, v.throttle),
                        (&mut next.boom, v.boom),
                        (&mut next.bucket, v.bucket),
                        (&mut next.left_track, v.left_track),
                        (&mut next.right_track, v.right_track),
                        (&mut next.swing, v.swing),
                        (&mut next.stick, v.stick),
                    ];
                    for (slot, value) in axes {
                        if let Some(value) = value {
                            *slot = value;
                        }
                    }
                }
            }
            Some(other) => debug!("Ignoring control message type {:?}", other),
            None => {}
        }
        next
    }
}

/// Write half of the latest-value channel
#[derive(Debug)]
pub struct SnapshotWriter {
    slot: Arc<ArcSwap<ControlState>>,
}

/// Read half of the latest-value channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SnapshotReader {
    slot: Arc<ArcSwap<ControlState>>,
}

pub fn latest_channel(initial: ControlState) -> (SnapshotWriter, SnapshotReader) {
    let slot = Arc::new(ArcSwap::from_pointee(initial));
    (
        SnapshotWriter { slot: slot.clone() },
        SnapshotReader { slot },
    )
}

impl SnapshotWriter {
    /// Replace the published snapshot.
    pub fn publish(&self, state: Arc<ControlState>) {
        self.slot.store(state);
    }
}

impl SnapshotReader {
    pub fn latest(&self) -> Arc<ControlState> {
        self.slot.load_full()
    }
}

/// Owns the previous state and publishes every merged snapshot.
pub struct ControlParser {
    current: Arc<ControlState>,
    writer: SnapshotWriter,
}

impl ControlParser {
    pub fn new(initial: ControlState) -> (Self, SnapshotReader) {
        let (writer, reader) = latest_channel(initial.clone());
        let parser = Self {
            current: Arc::new(initial),
            writer,
        };
        (parser, reader)
    }

    /// Parse and merge one message. Malformed input leaves the state as is.
    pub fn handle(&mut self, text: &str) -> Result<Arc<ControlState>, ControlError> {
        let msg = ControlMessage::parse(text).map_err(|e| {
            warn!(stage = "control", error = %e, "Rejected control message");
            e
        })?;
        let next = Arc::new(self.current.merged(&msg));
        self.writer.publish(next.clone());
        self.current = next.clone();
        Ok(next)
    }

    pub fn current(&self) -> Arc<ControlState> {
        self.current.clone()
    }
}
