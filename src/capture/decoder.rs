//! MJPEG decode to packed RGB24.

use crate::error::ConvertError;

/// Decoded RGB24 image
pub struct DecodedRgb {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Decode one JPEG image into tightly packed RGB24.
#[cfg(feature = "fast-jpeg")]
pub fn decode_jpeg(data: &[u8]) -> Result<DecodedRgb, ConvertError> {
    use zune_jpeg::zune_core::colorspace::ColorSpace;
    use zune_jpeg::zune_core::options::DecoderOptions;
    use zune_jpeg::JpegDecoder;

    let options = DecoderOptions::default().jpeg_set_out_colorspace(ColorSpace::RGB);
    let mut decoder = JpegDecoder::new_with_options(data, options);
    let pixels = decoder
        .decode()
        .map_err(|e| ConvertError::Decode(format!("{e:?}")))?;
    let (width, height) = decoder
        .dimensions()
        .ok_or_else(|| ConvertError::Decode("missing jpeg dimensions".into()))?;

    Ok(DecodedRgb {
        data: pixels,
        width: width as u32,
        height: height as u32,
    })
}

/// Decode one JPEG image into tightly packed RGB24.
#[cfg(not(feature = "fast-jpeg"))]
pub fn decode_jpeg(data: &[u8]) -> Result<DecodedRgb, ConvertError> {
    use jpeg_decoder::{Decoder, PixelFormat as JpegFormat};

    let mut decoder = Decoder::new(data);
    let pixels = decoder
        .decode()
        .map_err(|e| ConvertError::Decode(e.to_string()))?;
    let info = decoder
        .info()
        .ok_or_else(|| ConvertError::Decode("missing jpeg header".into()))?;

    let data = match info.pixel_format {
        JpegFormat::RGB24 => pixels,
        JpegFormat::L8 => pixels.iter().flat_map(|&l| [l, l, l]).collect(),
        other => {
            return Err(ConvertError::Unsupported(format!(
                "jpeg pixel format {other:?}"
            )))
        }
    };

    Ok(DecodedRgb {
        data,
        width: u32::from(info.width),
        height: u32::from(info.height),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_jpeg(width: u32, height: u32, rgb: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 95);
        image::ImageEncoder::write_image(
            encoder,
            rgb,
            width,
            height,
            image::ExtendedColorType::Rgb8,
        )
        .expect("encode jpeg");
        out
    }

    #[test]
    fn decodes_to_rgb_with_dimensions() {
        let rgb = vec![200u8; 16 * 8 * 3];
        let jpeg = encode_jpeg(16, 8, &rgb);

        let decoded = decode_jpeg(&jpeg).expect("decode");
        assert_eq!((decoded.width, decoded.height), (16, 8));
        assert_eq!(decoded.data.len(), 16 * 8 * 3);
        // Lossy, but a flat grey stays close
        assert!(decoded.data.iter().all(|&v| (190..=210).contains(&v)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(decode_jpeg(&[0x00, 0x11, 0x22, 0x33]).is_err());
    }
}
