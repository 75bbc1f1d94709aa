//! Decoding of base64 capture images into RGBA

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;

use super::RawVideoFrame;
use crate::error::{AppError, Result};

/// Decodes an encoded still image into an RGBA [`RawVideoFrame`]
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, encoded: &str) -> Result<RawVideoFrame>;
}

/// PNG/JPEG decoder for base64 payloads, with or without a `data:` URL prefix
#[derive(Debug, Default, Clone, Copy)]
pub struct Base64ImageDecoder;

impl Base64ImageDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl ImageDecoder for Base64ImageDecoder {
    fn decode(&self, encoded: &str) -> Result<RawVideoFrame> {
        let payload = match encoded.split_once(";base64,") {
            Some((prefix, data)) if prefix.starts_with("data:") => data,
            _ => encoded,
        };

        let bytes = STANDARD
            .decode(payload.trim())
            .map_err(|e| AppError::MediaError(format!("Invalid base64 frame: {}", e)))?;
        let image = ::image::load_from_memory(&bytes)
            .map_err(|e| AppError::MediaError(format!("Failed to decode image: {}", e)))?;
        let rgba = image.to_rgba8();
        let (width, height) = rgba.dimensions();

        Ok(RawVideoFrame {
            width: width as i32,
            height: height as i32,
            data: Some(Bytes::from(rgba.into_raw())),
            rotation: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    fn png_base64() -> String {
        let mut img = RgbaImage::new(3, 2);
        img.put_pixel(0, 0, Rgba([10, 20, 30, 255]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        STANDARD.encode(out.into_inner())
    }

    #[test]
    fn test_decode_png() {
        let frame = Base64ImageDecoder::new().decode(&png_base64()).unwrap();
        assert_eq!((frame.width, frame.height), (3, 2));
        let data = frame.data.unwrap();
        assert_eq!(data.len(), 3 * 2 * 4);
        assert_eq!(&data[..4], &[10, 20, 30, 255]);
    }

    #[test]
    fn test_decode_data_url() {
        let url = format!("data:image/png;base64,{}", png_base64());
        let frame = Base64ImageDecoder::new().decode(&url).unwrap();
        assert_eq!(frame.width, 3);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let decoder = Base64ImageDecoder::new();
        assert!(decoder.decode("not base64!").is_err());
        assert!(decoder.decode(&STANDARD.encode(b"plain text")).is_err());
    }
}
