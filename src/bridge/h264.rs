//! H.264 decoding with OpenH264

use openh264::decoder::Decoder;
use openh264::formats::YUVSource;
use openh264::nal_units;
use std::sync::Arc;
use tracing::debug;

use super::sink::{VideoDecoder, VideoDecoderFactory};
use crate::error::{AppError, Result};
use crate::media::RawVideoFrame;

pub const MIME_TYPE_H264: &str = "video/h264";

/// Decodes Annex-B access units into tightly packed I420 frames
pub struct OpenH264Decoder {
    decoder: Decoder,
}

impl OpenH264Decoder {
    pub fn new() -> Result<Self> {
        let decoder = Decoder::new()
            .map_err(|e| AppError::MediaError(format!("Failed to create H.264 decoder: {}", e)))?;
        Ok(Self { decoder })
    }

    /// Factory for [`DecodingSinkFactory::with_video_decoder`](super::DecodingSinkFactory::with_video_decoder)
    pub fn factory() -> VideoDecoderFactory {
        Arc::new(|| Ok(Box::new(OpenH264Decoder::new()?) as Box<dyn VideoDecoder>))
    }
}

impl VideoDecoder for OpenH264Decoder {
    fn decode(&mut self, access_unit: &[u8]) -> Result<Option<RawVideoFrame>> {
        let mut frame = None;
        for nal in nal_units(access_unit) {
            match self.decoder.decode(nal) {
                Ok(Some(yuv)) => frame = Some(pack_i420(&yuv)),
                Ok(None) => {}
                // Parameter sets and the frames before the first IDR fail here
                Err(e) => debug!("H.264 NAL skipped: {}", e),
            }
        }
        Ok(frame)
    }
}

fn pack_i420(yuv: &impl YUVSource) -> RawVideoFrame {
    let (width, height) = yuv.dimensions();
    let (y_stride, u_stride, v_stride) = yuv.strides();
    let (chroma_w, chroma_h) = (width.div_ceil(2), height.div_ceil(2));

    let mut out = Vec::with_capacity(width * height + 2 * chroma_w * chroma_h);
    copy_plane(&mut out, yuv.y(), y_stride, width, height);
    copy_plane(&mut out, yuv.u(), u_stride, chroma_w, chroma_h);
    copy_plane(&mut out, yuv.v(), v_stride, chroma_w, chroma_h);

    RawVideoFrame::new(width as i32, height as i32, out)
}

/// Append `height` rows of `width` bytes, dropping the stride padding
fn copy_plane(out: &mut Vec<u8>, plane: &[u8], stride: usize, width: usize, height: usize) {
    if stride == 0 {
        return;
    }
    for row in plane.chunks(stride).take(height) {
        out.extend_from_slice(&row[..width.min(row.len())]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_plane_strips_stride_padding() {
        let plane = vec![1, 2, 0, 0, 3, 4, 0, 0];
        let mut out = Vec::new();
        copy_plane(&mut out, &plane, 4, 2, 2);
        assert_eq!(out, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_garbage_access_unit_yields_no_frame() {
        let mut decoder = OpenH264Decoder::new().unwrap();
        let frame = decoder.decode(&[0, 0, 0, 1, 0x65, 0xff, 0xff]).unwrap();
        assert!(frame.is_none());
    }
}
