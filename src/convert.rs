//! Pixel format conversion for the processing stage.
//!
//! RGB <-> YUV uses BT.601 limited-range integer coefficients. Chroma for 4:2:0
//! output is the average of the (up to) four pixels of each 2x2 block.

use crate::capture::decoder::decode_jpeg;
use crate::capture::{Frame, PixelFormat, TargetEncoding};
use crate::error::ConvertError;

/// Tightly packed conversion output
#[derive(Debug)]
pub struct Converted {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Convert a raw frame into `target`, stripping any source row padding.
pub fn convert_frame(frame: &Frame, target: TargetEncoding) -> Result<Converted, ConvertError> {
    let meta = &frame.meta;
    let (width, height) = (meta.width, meta.height);

    match meta.format {
        PixelFormat::Mjpeg => {
            let rgb = decode_jpeg(&frame.data)?;
            if (width, height) != (0, 0) && (rgb.width, rgb.height) != (width, height) {
                tracing::debug!(
                    "jpeg is {}x{}, source announced {}x{}",
                    rgb.width,
                    rgb.height,
                    width,
                    height
                );
            }
            let data = from_rgb(&rgb.data, rgb.width, rgb.height, target);
            Ok(Converted {
                data,
                width: rgb.width,
                height: rgb.height,
            })
        }
        PixelFormat::I420 => {
            let planes = check_i420(frame)?;
            let data = match target {
                TargetEncoding::I420 => planes.to_vec(),
                _ => from_rgb(&i420_to_rgb(planes, width, height), width, height, target),
            };
            Ok(Converted { data, width, height })
        }
        PixelFormat::Yuyv422 if target == TargetEncoding::I420 => {
            let packed = packed_rows(frame)?;
            let data = yuyv_to_i420(&packed, width, height)?;
            Ok(Converted { data, width, height })
        }
        format => {
            let packed = packed_rows(frame)?;
            let data = match (format, target) {
                (PixelFormat::Rgb24, TargetEncoding::Rgb8)
                | (PixelFormat::Bgr24, TargetEncoding::Bgr8)
                | (PixelFormat::Rgba32, TargetEncoding::Rgba8) => packed,
                _ => {
                    let rgb = to_rgb(&packed, format, width, height)?;
                    from_rgb(&rgb, width, height, target)
                }
            };
            Ok(Converted { data, width, height })
        }
    }
}

/// Copy the visible part of every row into a tightly packed buffer.
fn packed_rows(frame: &Frame) -> Result<Vec<u8>, ConvertError> {
    let meta = &frame.meta;
    let row = meta
        .format
        .min_stride(meta.width)
        .ok_or_else(|| ConvertError::Unsupported(format!("{:?} has no row layout", meta.format)))?
        as usize;
    let stride = if meta.stride == 0 { row } else { meta.stride as usize };
    if stride < row {
        return Err(ConvertError::Stride {
            format: meta.format,
            width: meta.width,
            stride: meta.stride,
        });
    }

    let height = meta.height as usize;
    let expected = if height == 0 {
        0
    } else {
        stride * (height - 1) + row
    };
    if frame.data.len() < expected {
        return Err(ConvertError::Size {
            format: meta.format,
            width: meta.width,
            height: meta.height,
            expected,
            actual: frame.data.len(),
        });
    }

    if stride == row {
        return Ok(frame.data[..row * height].to_vec());
    }
    let mut out = Vec::with_capacity(row * height);
    for y in 0..height {
        out.extend_from_slice(&frame.data[y * stride..y * stride + row]);
    }
    Ok(out)
}

fn check_i420(frame: &Frame) -> Result<&[u8], ConvertError> {
    let meta = &frame.meta;
    let expected = PixelFormat::I420.frame_len(meta.width, meta.height).unwrap_or(0);
    if frame.data.len() < expected {
        return Err(ConvertError::Size {
            format: PixelFormat::I420,
            width: meta.width,
            height: meta.height,
            expected,
            actual: frame.data.len(),
        });
    }
    Ok(&frame.data[..expected])
}

/// Packed source pixels to RGB24.
fn to_rgb(
    src: &[u8],
    format: PixelFormat,
    width: u32,
    height: u32,
) -> Result<Vec<u8>, ConvertError> {
    match format {
        PixelFormat::Rgb24 => Ok(src.to_vec()),
        PixelFormat::Bgr24 => Ok(src
            .chunks_exact(3)
            .flat_map(|px| [px[2], px[1], px[0]])
            .collect()),
        PixelFormat::Rgba32 => Ok(src
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect()),
        PixelFormat::Yuyv422 => yuyv_to_rgb(src, width, height),
        other => Err(ConvertError::Unsupported(format!("{other:?} is not packed"))),
    }
}

/// RGB24 to any target encoding.
fn from_rgb(rgb: &[u8], width: u32, height: u32, target: TargetEncoding) -> Vec<u8> {
    match target {
        TargetEncoding::Rgb8 => rgb.to_vec(),
        TargetEncoding::Bgr8 => rgb
            .chunks_exact(3)
            .flat_map(|px| [px[2], px[1], px[0]])
            .collect(),
        TargetEncoding::Rgba8 => rgb
            .chunks_exact(3)
            .flat_map(|px| [px[0], px[1], px[2], 255])
            .collect(),
        TargetEncoding::I420 => rgb_to_i420(rgb, width, height),
    }
}

#[inline]
fn luma(r: i32, g: i32, b: i32) -> u8 {
    (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16) as u8
}

#[inline]
fn chroma(r: i32, g: i32, b: i32) -> (i32, i32) {
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (u, v)
}

#[inline]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = 298 * (i32::from(y) - 16);
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;
    let clip = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [clip(c + 409 * e), clip(c - 100 * d - 208 * e), clip(c + 516 * d)]
}

pub fn rgb_to_i420(rgb: &[u8], width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    let mut out = vec![0u8; w * h + 2 * cw * ch];
    let (y_plane, uv) = out.split_at_mut(w * h);
    let (u_plane, v_plane) = uv.split_at_mut(cw * ch);

    for (i, px) in rgb.chunks_exact(3).take(w * h).enumerate() {
        y_plane[i] = luma(px[0].into(), px[1].into(), px[2].into());
    }

    for cy in 0..ch {
        for cx in 0..cw {
            let (mut u_acc, mut v_acc, mut n) = (0i32, 0i32, 0i32);
            for y in (cy * 2)..(cy * 2 + 2).min(h) {
                for x in (cx * 2)..(cx * 2 + 2).min(w) {
                    let idx = (y * w + x) * 3;
                    let (u, v) = chroma(rgb[idx].into(), rgb[idx + 1].into(), rgb[idx + 2].into());
                    u_acc += u;
                    v_acc += v;
                    n += 1;
                }
            }
            u_plane[cy * cw + cx] = (u_acc / n).clamp(0, 255) as u8;
            v_plane[cy * cw + cx] = (v_acc / n).clamp(0, 255) as u8;
        }
    }
    out
}

/// RGB24 to YUYV 4:2:2; chroma is the average of each horizontal pixel pair.
pub fn rgb_to_yuyv(rgb: &[u8], width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let mut out = Vec::with_capacity(w * h * 2);
    if w == 0 {
        return out;
    }
    for row in rgb.chunks_exact(w * 3).take(h) {
        for pair in row.chunks(6) {
            let (r0, g0, b0): (i32, i32, i32) = (pair[0].into(), pair[1].into(), pair[2].into());
            // Odd width: the last pixel pairs with itself
            let (r1, g1, b1) = if pair.len() == 6 {
                (pair[3].into(), pair[4].into(), pair[5].into())
            } else {
                (r0, g0, b0)
            };
            let (u0, v0) = chroma(r0, g0, b0);
            let (u1, v1) = chroma(r1, g1, b1);
            out.extend_from_slice(&[
                luma(r0, g0, b0),
                ((u0 + u1) / 2).clamp(0, 255) as u8,
                luma(r1, g1, b1),
                ((v0 + v1) / 2).clamp(0, 255) as u8,
            ]);
        }
    }
    out
}

/// YUYV 4:2:2 straight to I420, averaging chroma over the two source rows.
pub fn yuyv_to_i420(src: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
    let (w, h) = (width as usize, height as usize);
    if w % 2 != 0 {
        return Err(ConvertError::Unsupported(format!(
            "YUYV needs an even width, got {w}"
        )));
    }
    let expected = w * h * 2;
    if src.len() < expected {
        return Err(ConvertError::Size {
            format: PixelFormat::Yuyv422,
            width,
            height,
            expected,
            actual: src.len(),
        });
    }

    let (cw, ch) = (w / 2, h.div_ceil(2));
    let mut out = vec![0u8; w * h + 2 * cw * ch];
    let (y_plane, uv) = out.split_at_mut(w * h);
    let (u_plane, v_plane) = uv.split_at_mut(cw * ch);

    for (dst, src) in y_plane.iter_mut().zip(src.iter().step_by(2)) {
        *dst = *src;
    }

    for cy in 0..ch {
        let row0 = cy * 2 * w * 2;
        // Odd height: the last chroma row only has one source row
        let row1 = if cy * 2 + 1 < h { row0 + w * 2 } else { row0 };
        for cx in 0..cw {
            let i0 = row0 + cx * 4;
            let i1 = row1 + cx * 4;
            let u = (u16::from(src[i0 + 1]) + u16::from(src[i1 + 1])) / 2;
            let v = (u16::from(src[i0 + 3]) + u16::from(src[i1 + 3])) / 2;
            u_plane[cy * cw + cx] = u as u8;
            v_plane[cy * cw + cx] = v as u8;
        }
    }
    Ok(out)
}

fn yuyv_to_rgb(src: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
    let (w, h) = (width as usize, height as usize);
    if w % 2 != 0 {
        return Err(ConvertError::Unsupported(format!(
            "YUYV needs an even width, got {w}"
        )));
    }
    let mut out = Vec::with_capacity(w * h * 3);
    for quad in src.chunks_exact(4).take(w * h / 2) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        out.extend_from_slice(&yuv_to_rgb(y0, u, v));
        out.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    Ok(out)
}

fn i420_to_rgb(planes: &[u8], width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let cw = w.div_ceil(2);
    let (y_plane, uv) = planes.split_at(w * h);
    let (u_plane, v_plane) = uv.split_at(uv.len() / 2);

    let mut out = Vec::with_capacity(w * h * 3);
    for y in 0..h {
        for x in 0..w {
            let ci = (y / 2) * cw + x / 2;
            out.extend_from_slice(&yuv_to_rgb(y_plane[y * w + x], u_plane[ci], v_plane[ci]));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(format: PixelFormat, width: u32, height: u32, px: &[u8]) -> Frame {
        let data: Vec<u8> = px
            .iter()
            .copied()
            .cycle()
            .take(format.frame_len(width, height).unwrap())
            .collect();
        Frame::new(data, width, height, format)
    }

    #[test]
    fn bgr_720p_to_i420_has_planar_size_and_luma_stride() {
        let frame = solid(PixelFormat::Bgr24, 1280, 720, &[10, 20, 30]);
        let out = convert_frame(&frame, TargetEncoding::I420).unwrap();

        assert_eq!(out.data.len(), 1_382_400);
        assert_eq!((out.width, out.height), (1280, 720));
        assert_eq!(TargetEncoding::I420.stride(out.width), 1280);
    }

    #[test]
    fn white_and_black_map_to_limited_range() {
        let white = convert_frame(&solid(PixelFormat::Rgb24, 4, 2, &[255, 255, 255]), TargetEncoding::I420)
            .unwrap();
        assert!(white.data[..8].iter().all(|&y| y == 235));
        assert!(white.data[8..].iter().all(|&c| c == 128));

        let black = convert_frame(&solid(PixelFormat::Rgb24, 4, 2, &[0, 0, 0]), TargetEncoding::I420)
            .unwrap();
        assert!(black.data[..8].iter().all(|&y| y == 16));
        assert!(black.data[8..].iter().all(|&c| c == 128));
    }

    #[test]
    fn uniform_yuyv_gives_uniform_planes() {
        let frame = solid(PixelFormat::Yuyv422, 6, 4, &[90, 60, 90, 200]);
        let out = convert_frame(&frame, TargetEncoding::I420).unwrap();

        assert_eq!(out.data.len(), 6 * 4 + 2 * 3 * 2);
        let (y, uv) = out.data.split_at(24);
        let (u, v) = uv.split_at(6);
        assert!(y.iter().all(|&b| b == 90));
        assert!(u.iter().all(|&b| b == 60));
        assert!(v.iter().all(|&b| b == 200));
    }

    #[test]
    fn yuyv_chroma_is_averaged_over_row_pairs() {
        // 2x2 frame: row 0 U=100 V=50, row 1 U=200 V=150
        let data = vec![16, 100, 16, 50, 16, 200, 16, 150];
        let out = yuyv_to_i420(&data, 2, 2).unwrap();
        assert_eq!(out, vec![16, 16, 16, 16, 150, 100]);
    }

    #[test]
    fn bgr_to_rgb_swaps_channels() {
        let frame = solid(PixelFormat::Bgr24, 2, 1, &[1, 2, 3]);
        let out = convert_frame(&frame, TargetEncoding::Rgb8).unwrap();
        assert_eq!(out.data, vec![3, 2, 1, 3, 2, 1]);

        let rgba = convert_frame(&frame, TargetEncoding::Rgba8).unwrap();
        assert_eq!(rgba.data, vec![3, 2, 1, 255, 3, 2, 1, 255]);
    }

    #[test]
    fn strips_row_padding() {
        // 2x2 RGB with 8-byte rows (2 bytes padding)
        let data = vec![
            1, 1, 1, 2, 2, 2, 0xEE, 0xEE, //
            3, 3, 3, 4, 4, 4, 0xEE, 0xEE,
        ];
        let frame = Frame::new(data, 2, 2, PixelFormat::Rgb24).with_stride(8);
        let out = convert_frame(&frame, TargetEncoding::Rgb8).unwrap();
        assert_eq!(out.data, vec![1, 1, 1, 2, 2, 2, 3, 3, 3, 4, 4, 4]);
    }

    #[test]
    fn short_buffer_is_a_size_error() {
        let frame = Frame::new(vec![0u8; 10], 4, 4, PixelFormat::Rgb24);
        let err = convert_frame(&frame, TargetEncoding::I420).unwrap_err();
        assert!(matches!(err, ConvertError::Size { expected: 48, actual: 10, .. }));
    }

    #[test]
    fn stride_below_row_width_is_rejected() {
        let frame = Frame::new(vec![0u8; 48], 4, 4, PixelFormat::Rgb24).with_stride(6);
        assert!(matches!(
            convert_frame(&frame, TargetEncoding::Rgb8),
            Err(ConvertError::Stride { .. })
        ));
    }

    #[test]
    fn i420_round_trips_grey_through_rgb() {
        let grey = solid(PixelFormat::I420, 4, 4, &[126]);
        let rgb = convert_frame(&grey, TargetEncoding::Rgb8).unwrap();
        assert_eq!(rgb.data.len(), 48);
        let back = rgb_to_i420(&rgb.data, 4, 4);
        assert!(back[..16].iter().all(|&y| (125..=127).contains(&y)));
    }
}
