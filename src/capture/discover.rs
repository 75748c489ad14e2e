//! V4L2 device discovery

use std::path::Path;

use serde::Serialize;
use tracing::info;
use v4l::capability::Flags;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::error::SourceError;

/// Capture-capable device node
#[derive(Debug, Clone, Serialize)]
pub struct FoundDevice {
    pub path: String,
    pub card: String,
    pub driver: String,
    pub fourccs: Vec<String>,
}

/// Probe `/dev/video0..9` for capture-capable nodes.
pub fn list_devices() -> Vec<FoundDevice> {
    (0..10)
        .map(|i| format!("/dev/video{i}"))
        .filter(|path| Path::new(path).exists())
        .filter_map(|path| {
            let dev = Device::with_path(&path).ok()?;
            let caps = dev.query_caps().ok()?;
            if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
                return None;
            }
            let fourccs = dev
                .enum_formats()
                .map(|formats| formats.iter().map(|f| f.fourcc.to_string()).collect())
                .unwrap_or_default();
            Some(FoundDevice {
                path,
                card: caps.card,
                driver: caps.driver,
                fourccs,
            })
        })
        .collect()
}

/// Pick the first device offering MJPEG, else the first offering YUYV.
///
/// Returns the device path and the fourcc to request.
pub fn auto_detect_device() -> Result<(String, String), SourceError> {
    info!("Auto-detecting capture devices...");

    let devices = list_devices();
    for preferred in [FourCC::new(b"MJPG"), FourCC::new(b"YUYV")] {
        let wanted = preferred.to_string();
        if let Some(dev) = devices.iter().find(|d| d.fourccs.contains(&wanted)) {
            info!("Found {} device: {} - {}", wanted, dev.path, dev.card);
            return Ok((dev.path.clone(), wanted));
        }
    }

    Err(SourceError::Open {
        device: "auto".into(),
        reason: "no MJPEG or YUYV capture device found".into(),
    })
}
