//! Pixel format detection and conversion to RGBA
//!
//! Sinks hand over bare buffers without a format tag, so the layout is
//! inferred from the buffer length relative to `width * height`.

use bytes::Bytes;
use tracing::debug;

use super::RawVideoFrame;

/// Tolerance when matching bytes-per-pixel against a known layout
const BPP_TOLERANCE: f64 = 0.1;

/// Largest frame converted, 8K UHD
pub const MAX_FRAME_PIXELS: usize = 7680 * 4320;

/// Buffer layout inferred from its size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    Rgba,
    Rgb,
    /// Planar YUV 4:2:0 (Y, then U, then V)
    I420,
    Gray,
    /// Unrecognized; copied raw and resized to fit
    Unknown,
}

impl PixelLayout {
    pub fn detect(len: usize, width: usize, height: usize) -> Self {
        let pixels = width.saturating_mul(height);
        if pixels == 0 {
            return PixelLayout::Unknown;
        }
        let bpp = len as f64 / pixels as f64;
        let near = |target: f64| (bpp - target).abs() < BPP_TOLERANCE;

        if near(4.0) {
            PixelLayout::Rgba
        } else if near(3.0) {
            PixelLayout::Rgb
        } else if near(1.5) {
            PixelLayout::I420
        } else if near(1.0) {
            PixelLayout::Gray
        } else {
            PixelLayout::Unknown
        }
    }
}

/// Convert a sink frame to tightly packed RGBA
///
/// Returns `(width, height, rgba)`; `None` for non-positive dimensions, more
/// than [`MAX_FRAME_PIXELS`] pixels or a missing buffer. RGBA input is
/// returned without copying.
pub fn to_rgba(frame: &RawVideoFrame) -> Option<(u32, u32, Bytes)> {
    if frame.width <= 0 || frame.height <= 0 {
        debug!(
            "Dropping frame with invalid size {}x{}",
            frame.width, frame.height
        );
        return None;
    }
    let Some(data) = frame.data.as_ref() else {
        debug!("Dropping frame without buffer");
        return None;
    };

    let width = frame.width as usize;
    let height = frame.height as usize;
    let Some(out_len) = width
        .checked_mul(height)
        .filter(|&pixels| pixels <= MAX_FRAME_PIXELS)
        .map(|pixels| pixels * 4)
    else {
        debug!("Dropping oversized frame {}x{}", frame.width, frame.height);
        return None;
    };

    let rgba = match PixelLayout::detect(data.len(), width, height) {
        PixelLayout::Rgba if data.len() == out_len => data.clone(),
        PixelLayout::Rgba => Bytes::from(resize(data, out_len)),
        PixelLayout::Rgb => Bytes::from(rgb_to_rgba(data, width, height)),
        PixelLayout::I420 => Bytes::from(i420_to_rgba(data, width, height)),
        PixelLayout::Gray => Bytes::from(gray_to_rgba(data, width, height)),
        PixelLayout::Unknown => Bytes::from(resize(data, out_len)),
    };

    Some((frame.width as u32, frame.height as u32, rgba))
}

fn resize(data: &[u8], len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    let n = data.len().min(len);
    out[..n].copy_from_slice(&data[..n]);
    out
}

pub fn rgb_to_rgba(rgb: &[u8], width: usize, height: usize) -> Vec<u8> {
    let pixels = width * height;
    let mut out = Vec::with_capacity(pixels * 4);
    for px in rgb.chunks_exact(3).take(pixels) {
        out.extend_from_slice(&[px[0], px[1], px[2], 255]);
    }
    out.resize(pixels * 4, 0);
    out
}

pub fn gray_to_rgba(gray: &[u8], width: usize, height: usize) -> Vec<u8> {
    let pixels = width * height;
    let mut out = Vec::with_capacity(pixels * 4);
    for &y in gray.iter().take(pixels) {
        out.extend_from_slice(&[y, y, y, 255]);
    }
    out.resize(pixels * 4, 0);
    out
}

/// I420 to RGBA with BT.601 coefficients in 8.8 fixed point
///
/// Luma is expanded from the 16..235 range so reference white maps to 255.
/// Chroma planes are `ceil(w/2) x ceil(h/2)`. Missing bytes read as neutral.
pub fn i420_to_rgba(yuv: &[u8], width: usize, height: usize) -> Vec<u8> {
    let chroma_w = width.div_ceil(2);
    let chroma_h = height.div_ceil(2);
    let y_size = width * height;
    let c_size = chroma_w * chroma_h;

    let sample = |idx: usize, neutral: u8| yuv.get(idx).copied().unwrap_or(neutral);

    let mut out = vec![0u8; y_size * 4];
    for row in 0..height {
        for col in 0..width {
            let c_idx = (row / 2) * chroma_w + col / 2;
            let c = 298 * (sample(row * width + col, 16) as i32 - 16);
            let d = sample(y_size + c_idx, 128) as i32 - 128;
            let e = sample(y_size + c_size + c_idx, 128) as i32 - 128;

            let r = (c + 409 * e + 128) >> 8;
            let g = (c - 100 * d - 208 * e + 128) >> 8;
            let b = (c + 516 * d + 128) >> 8;

            let o = (row * width + col) * 4;
            out[o] = r.clamp(0, 255) as u8;
            out[o + 1] = g.clamp(0, 255) as u8;
            out[o + 2] = b.clamp(0, 255) as u8;
            out[o + 3] = 255;
        }
    }
    out
}
