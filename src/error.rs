//! Error taxonomy shared by every stage.
//!
//! Only [`SourceError::Open`] and [`ConfigError`] are meant to end the process.
//! Everything else is absorbed by the stage that produced it and logged.

use thiserror::Error;

use crate::capture::PixelFormat;

/// Frame source failures.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Device could not be opened or configured. Fatal at startup.
    #[error("failed to open frame source {device}: {reason}")]
    Open { device: String, reason: String },

    /// A single read failed. The capture loop backs off and retries.
    #[error("frame read failed: {0}")]
    Read(String),

    /// Releasing the device handle failed.
    #[error("failed to release frame source: {0}")]
    Release(String),
}

/// Pixel conversion failures. The offending frame is dropped.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("{format:?} frame {width}x{height} needs {expected} bytes, got {actual}")]
    Size {
        format: PixelFormat,
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("stride {stride} is smaller than a {width}px {format:?} row")]
    Stride {
        format: PixelFormat,
        width: u32,
        stride: u32,
    },

    #[error("unsupported conversion: {0}")]
    Unsupported(String),

    #[error("jpeg decode failed: {0}")]
    Decode(String),
}

/// Sink submission failures. The frame is dropped, the next tick supersedes it.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("publish to {target} failed: {reason}")]
    Publish { target: String, reason: String },

    #[error("sink {0} is closed")]
    Closed(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed image record: {0}")]
    Malformed(String),
}

/// Received image records that cannot be forwarded as video. The record is
/// skipped.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("expected i420 record, got {0:?}")]
    Encoding(String),

    #[error("i420 record {width}x{height} (step {step}) needs {expected} bytes, got {actual}")]
    Short {
        width: u32,
        height: u32,
        step: u32,
        expected: usize,
        actual: usize,
    },

    #[error("step {step} is smaller than width {width}")]
    Step { width: u32, step: u32 },
}

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Control message parse failures. Prior control state is kept.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("control payload is not UTF-8")]
    Utf8(#[from] std::str::Utf8Error),
}
