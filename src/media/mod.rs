//! Raw media shapes exchanged between sinks, converters and the monitor

pub mod convert;
pub mod image;
pub mod wav;

pub use convert::{to_rgba, PixelLayout};
pub use self::image::{Base64ImageDecoder, ImageDecoder};
pub use wav::{pcm16_to_wav, WAV_HEADER_LEN};

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::signaling::StreamType;

/// Opus decodes at this rate regardless of the encoder's input rate
pub const OPUS_SAMPLE_RATE: u32 = 48_000;

/// 10 ms of mono audio at [`OPUS_SAMPLE_RATE`]
pub const SAMPLES_PER_BATCH: usize = (OPUS_SAMPLE_RATE / 100) as usize;

/// Batch of mono PCM samples emitted by an audio sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioBatch {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl AudioBatch {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Encode as a mono 16-bit WAV buffer
    pub fn to_wav(&self) -> Vec<u8> {
        pcm16_to_wav(&self.samples, self.sample_rate)
    }
}

/// Frame as delivered by a video sink, before format detection
///
/// Dimensions are signed because decoders report them that way; frames with
/// non-positive sizes are rejected by [`to_rgba`].
#[derive(Debug, Clone)]
pub struct RawVideoFrame {
    pub width: i32,
    pub height: i32,
    pub data: Option<Bytes>,
    pub rotation: Option<i32>,
}

impl RawVideoFrame {
    pub fn new(width: i32, height: i32, data: impl Into<Bytes>) -> Self {
        Self {
            width,
            height,
            data: Some(data.into()),
            rotation: None,
        }
    }
}

/// RGBA frame handed to the stream monitor
#[derive(Debug, Clone)]
pub struct RgbaFrame {
    pub width: u32,
    pub height: u32,
    /// `width * height * 4` bytes
    pub data: Bytes,
    pub rotation: Option<i32>,
    pub participant_id: String,
    pub stream_type: StreamType,
    pub timestamp: DateTime<Utc>,
}

impl RgbaFrame {
    /// Convert a raw sink frame; `None` when the frame is unusable
    pub fn from_raw(
        raw: &RawVideoFrame,
        participant_id: impl Into<String>,
        stream_type: StreamType,
    ) -> Option<Self> {
        let (width, height, data) = to_rgba(raw)?;
        Some(Self {
            width,
            height,
            data,
            rotation: raw.rotation,
            participant_id: participant_id.into(),
            stream_type,
            timestamp: Utc::now(),
        })
    }
}
