use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant, SystemTime};

/// Raw frame as handed over by a frame source.
///
/// Frames are moved from stage to stage, never shared for mutation. Cloning is
/// cheap since the payload is reference counted.
#[derive(Clone)]
pub struct Frame {
    /// Immutable pixel data
    pub data: Bytes,

    pub meta: FrameMetadata,

    /// Monotonic capture instant for latency tracking
    pub timestamp: Instant,

    /// Wall-clock capture time, used for record stamps
    pub captured_at: SystemTime,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Bytes per row as delivered by the source; 0 for compressed formats
    pub stride: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

impl Frame {
    /// Build a frame stamped with the current time and a tightly packed stride.
    pub fn new(data: impl Into<Bytes>, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data: data.into(),
            meta: FrameMetadata {
                sequence: 0,
                width,
                height,
                stride: format.min_stride(width).unwrap_or(0),
                format,
                device_timestamp: None,
            },
            timestamp: Instant::now(),
            captured_at: SystemTime::now(),
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.meta.sequence = sequence;
        self
    }

    pub fn with_stride(mut self, stride: u32) -> Self {
        self.meta.stride = stride;
        self
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("meta", &self.meta)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Pixel formats a frame source can deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Rgba32,
    Yuyv422,
    I420,
    Mjpeg,
}

impl PixelFormat {
    /// Bytes per pixel of packed formats. Planar and compressed formats have none.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(3),
            PixelFormat::Rgba32 => Some(4),
            PixelFormat::Yuyv422 => Some(2),
            PixelFormat::I420 | PixelFormat::Mjpeg => None,
        }
    }

    /// Minimum bytes per row (for I420 this is the luma plane).
    pub fn min_stride(self, width: u32) -> Option<u32> {
        match self {
            PixelFormat::I420 => Some(width),
            PixelFormat::Mjpeg => None,
            packed => packed.bytes_per_pixel().map(|bpp| width * bpp as u32),
        }
    }

    /// Tightly packed payload length, `None` for compressed data.
    pub fn frame_len(self, width: u32, height: u32) -> Option<usize> {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::I420 => Some(i420_len(w, h)),
            PixelFormat::Mjpeg => None,
            packed => packed.bytes_per_pixel().map(|bpp| w * h * bpp),
        }
    }

    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Rgb24 => *b"RGB3",
            PixelFormat::Bgr24 => *b"BGR3",
            PixelFormat::Rgba32 => *b"AB24",
            PixelFormat::Yuyv422 => *b"YUYV",
            PixelFormat::I420 => *b"YU12",
            PixelFormat::Mjpeg => *b"MJPG",
        }
    }

    pub fn from_fourcc(code: &[u8; 4]) -> Option<Self> {
        match code {
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"BGR3" => Some(PixelFormat::Bgr24),
            b"AB24" => Some(PixelFormat::Rgba32),
            b"YUYV" | b"YUY2" => Some(PixelFormat::Yuyv422),
            b"YU12" | b"I420" => Some(PixelFormat::I420),
            b"MJPG" | b"JPEG" => Some(PixelFormat::Mjpeg),
            _ => None,
        }
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let mut code = [b' '; 4];
        for (slot, byte) in code.iter_mut().zip(upper.bytes()) {
            *slot = byte;
        }
        PixelFormat::from_fourcc(&code).ok_or_else(|| format!("unknown fourcc {s:?}"))
    }
}

/// Encodings the processing stage can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetEncoding {
    #[serde(alias = "RGB8")]
    Rgb8,
    #[serde(alias = "BGR8")]
    Bgr8,
    #[serde(alias = "RGBA8")]
    Rgba8,
    #[serde(alias = "I420")]
    I420,
}

impl TargetEncoding {
    /// Tag carried in image records
    pub fn tag(self) -> &'static str {
        match self {
            TargetEncoding::Rgb8 => "rgb8",
            TargetEncoding::Bgr8 => "bgr8",
            TargetEncoding::Rgba8 => "rgba8",
            TargetEncoding::I420 => "i420",
        }
    }

    pub fn pixel_format(self) -> PixelFormat {
        match self {
            TargetEncoding::Rgb8 => PixelFormat::Rgb24,
            TargetEncoding::Bgr8 => PixelFormat::Bgr24,
            TargetEncoding::Rgba8 => PixelFormat::Rgba32,
            TargetEncoding::I420 => PixelFormat::I420,
        }
    }

    pub fn stride(self, width: u32) -> u32 {
        self.pixel_format().min_stride(width).unwrap_or(width)
    }

    pub fn frame_len(self, width: u32, height: u32) -> usize {
        self.pixel_format().frame_len(width, height).unwrap_or(0)
    }
}

impl FromStr for TargetEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rgb8" => Ok(TargetEncoding::Rgb8),
            "bgr8" => Ok(TargetEncoding::Bgr8),
            "rgba8" => Ok(TargetEncoding::Rgba8),
            "i420" => Ok(TargetEncoding::I420),
            other => Err(format!("unknown encoding {other:?}")),
        }
    }
}

impl fmt::Display for TargetEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Converted frame ready for a sink.
#[derive(Clone)]
pub struct PackagedFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub encoding: TargetEncoding,
    /// Bytes per row; the luma plane row for I420
    pub stride: u32,
    pub sequence: u64,
    pub captured_at: SystemTime,
    pub processed_at: SystemTime,
    /// Monotonic capture instant carried over from the raw frame
    pub capture_instant: Instant,
}

impl fmt::Debug for PackagedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackagedFrame")
            .field("sequence", &self.sequence)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("encoding", &self.encoding)
            .field("stride", &self.stride)
            .field("len", &self.data.len())
            .finish()
    }
}

fn i420_len(w: usize, h: usize) -> usize {
    w * h + 2 * w.div_ceil(2) * h.div_ceil(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i420_len_for_720p() {
        assert_eq!(PixelFormat::I420.frame_len(1280, 720), Some(1_382_400));
        assert_eq!(TargetEncoding::I420.stride(1280), 1280);
    }

    #[test]
    fn i420_len_rounds_odd_chroma_up() {
        // 3x3 luma, 2x2 chroma planes
        assert_eq!(PixelFormat::I420.frame_len(3, 3), Some(9 + 8));
    }

    #[test]
    fn packed_strides() {
        assert_eq!(TargetEncoding::Rgb8.stride(640), 1920);
        assert_eq!(TargetEncoding::Rgba8.stride(640), 2560);
        assert_eq!(PixelFormat::Yuyv422.min_stride(640), Some(1280));
        assert_eq!(PixelFormat::Mjpeg.frame_len(640, 480), None);
    }

    #[test]
    fn parses_fourcc_and_encoding_tags() {
        assert_eq!("mjpg".parse::<PixelFormat>(), Ok(PixelFormat::Mjpeg));
        assert_eq!("YUY2".parse::<PixelFormat>(), Ok(PixelFormat::Yuyv422));
        assert!("H264".parse::<PixelFormat>().is_err());
        assert_eq!("I420".parse::<TargetEncoding>(), Ok(TargetEncoding::I420));
        assert_eq!("bgr8".parse::<TargetEncoding>(), Ok(TargetEncoding::Bgr8));
        assert!("nv12".parse::<TargetEncoding>().is_err());
    }
}
