//! Media sinks: turn inbound RTP into raw samples
//!
//! A sink reads one [`InboundTrack`] until the track ends or the owning
//! connection is cancelled, and emits [`MediaSample`]s in track order.
//! Video packets are reordered and reassembled into whole pictures with
//! [`SampleBuilder`] before they reach a [`VideoDecoder`].

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::media::io::sample_builder::SampleBuilder;
use webrtc::rtp::codecs::h264::H264Packet;
use webrtc::rtp::codecs::vp8::Vp8Packet;
use webrtc::rtp::codecs::vp9::Vp9Packet;
use webrtc::rtp::packet::Packet;
use webrtc::rtp::packetizer::Depacketizer;

use super::peer::{InboundTrack, MediaKind, RtpSource};
use crate::error::{AppError, Result};
use crate::media::{AudioBatch, RawVideoFrame, OPUS_SAMPLE_RATE, SAMPLES_PER_BATCH};

/// Longest Opus frame (120 ms) at 48 kHz mono
const MAX_OPUS_FRAME_SAMPLES: usize = 5760;

/// RTP clock rate of every video payload format
const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Packets held for reordering before an incomplete picture is dropped
const MAX_LATE_PACKETS: u16 = 256;

/// Decoded output of a sink
#[derive(Debug, Clone)]
pub enum MediaSample {
    Audio(AudioBatch),
    Video(RawVideoFrame),
}

/// Running sink attached to one track
pub trait MediaSink: Send + Sync {
    fn stop(&self) -> Result<()>;
}

pub trait SinkFactory: Send + Sync {
    /// Start reading `track`, emitting samples on `output` until `cancel` fires
    fn attach(
        &self,
        track: InboundTrack,
        output: mpsc::UnboundedSender<MediaSample>,
        cancel: CancellationToken,
    ) -> Result<Box<dyn MediaSink>>;
}

/// Decoder from encoded pictures to raw frames
///
/// `decode` receives one complete access unit as reassembled from RTP: an
/// Annex-B byte stream for H.264, one compressed frame for VP8 and VP9.
pub trait VideoDecoder: Send {
    fn decode(&mut self, access_unit: &[u8]) -> Result<Option<RawVideoFrame>>;
}

/// Builds a fresh decoder for one track
pub type VideoDecoderFactory = Arc<dyn Fn() -> Result<Box<dyn VideoDecoder>> + Send + Sync>;

/// RTP depacketizer for the video codecs browsers negotiate
#[derive(Debug, Clone)]
pub enum VideoDepacketizer {
    H264(H264Packet),
    Vp8(Vp8Packet),
    Vp9(Vp9Packet),
}

impl VideoDepacketizer {
    pub fn for_codec(mime_type: &str) -> Option<Self> {
        match mime_type.to_ascii_lowercase().as_str() {
            "video/h264" => Some(Self::H264(H264Packet::default())),
            "video/vp8" => Some(Self::Vp8(Vp8Packet::default())),
            "video/vp9" => Some(Self::Vp9(Vp9Packet::default())),
            _ => None,
        }
    }
}

impl Depacketizer for VideoDepacketizer {
    fn depacketize(&mut self, b: &Bytes) -> std::result::Result<Bytes, webrtc::rtp::Error> {
        match self {
            Self::H264(p) => p.depacketize(b),
            Self::Vp8(p) => p.depacketize(b),
            Self::Vp9(p) => p.depacketize(b),
        }
    }

    fn is_partition_head(&self, payload: &Bytes) -> bool {
        match self {
            Self::H264(p) => p.is_partition_head(payload),
            Self::Vp8(p) => p.is_partition_head(payload),
            Self::Vp9(p) => p.is_partition_head(payload),
        }
    }

    fn is_partition_tail(&self, marker: bool, payload: &Bytes) -> bool {
        match self {
            Self::H264(p) => p.is_partition_tail(marker, payload),
            Self::Vp8(p) => p.is_partition_tail(marker, payload),
            Self::Vp9(p) => p.is_partition_tail(marker, payload),
        }
    }
}

/// Opus decoder producing fixed 10 ms batches
pub struct OpusBatcher {
    decoder: audiopus::coder::Decoder,
    pcm: Vec<i16>,
    pending: Vec<i16>,
}

impl OpusBatcher {
    pub fn new() -> Result<Self> {
        let decoder = audiopus::coder::Decoder::new(
            audiopus::SampleRate::Hz48000,
            audiopus::Channels::Mono,
        )
        .map_err(|e| AppError::MediaError(format!("Failed to create Opus decoder: {}", e)))?;

        Ok(Self {
            decoder,
            pcm: vec![0i16; MAX_OPUS_FRAME_SAMPLES],
            pending: Vec::with_capacity(SAMPLES_PER_BATCH * 2),
        })
    }

    /// Decode one payload and return every complete batch
    pub fn push(&mut self, payload: &[u8]) -> Result<Vec<AudioBatch>> {
        let decoded = self
            .decoder
            .decode(Some(payload), &mut self.pcm, false)
            .map_err(|e| AppError::MediaError(format!("Opus decode failed: {}", e)))?;

        self.pending.extend_from_slice(&self.pcm[..decoded]);

        let mut batches = Vec::new();
        while self.pending.len() >= SAMPLES_PER_BATCH {
            let rest = self.pending.split_off(SAMPLES_PER_BATCH);
            let batch = std::mem::replace(&mut self.pending, rest);
            batches.push(AudioBatch::new(batch, OPUS_SAMPLE_RATE));
        }
        Ok(batches)
    }
}

/// Sink whose reader task stops on cancellation
struct TaskSink {
    cancel: CancellationToken,
}

impl MediaSink for TaskSink {
    fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }
}

/// Default sink factory: Opus audio, video through registered decoders
#[derive(Default, Clone)]
pub struct DecodingSinkFactory {
    /// Decoders keyed by lowercase MIME type
    video: HashMap<String, VideoDecoderFactory>,
}

impl DecodingSinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_video_decoder(mut self, mime_type: &str, factory: VideoDecoderFactory) -> Self {
        self.video.insert(mime_type.to_ascii_lowercase(), factory);
        self
    }

    /// MIME types of the video codecs this factory can decode, sorted
    pub fn video_codecs(&self) -> Vec<String> {
        let mut codecs: Vec<String> = self.video.keys().cloned().collect();
        codecs.sort();
        codecs
    }

    fn video_decoder(&self, mime_type: &str) -> Result<Box<dyn VideoDecoder>> {
        let factory = self.video.get(&mime_type.to_ascii_lowercase()).ok_or_else(|| {
            AppError::MediaError(format!("Unsupported video codec {}", mime_type))
        })?;
        factory()
    }
}

impl SinkFactory for DecodingSinkFactory {
    fn attach(
        &self,
        track: InboundTrack,
        output: mpsc::UnboundedSender<MediaSample>,
        cancel: CancellationToken,
    ) -> Result<Box<dyn MediaSink>> {
        match track.kind {
            MediaKind::Audio => {
                if track.codec != "audio/opus" {
                    return Err(AppError::MediaError(format!(
                        "Unsupported audio codec {}",
                        track.codec
                    )));
                }
                let mut batcher = OpusBatcher::new()?;
                let token = cancel.clone();
                tokio::spawn(read_loop(track.source, cancel, move |packet| {
                    match batcher.push(&packet.payload) {
                        Ok(batches) => batches
                            .into_iter()
                            .try_for_each(|b| output.send(MediaSample::Audio(b)))
                            .is_ok(),
                        Err(e) => {
                            debug!("{}", e);
                            true
                        }
                    }
                }));
                Ok(Box::new(TaskSink { cancel: token }))
            }
            MediaKind::Video => {
                let Some(depacketizer) = VideoDepacketizer::for_codec(&track.codec) else {
                    warn!("No depacketizer for {}, track not decoded", track.codec);
                    return Err(AppError::MediaError(format!(
                        "Unsupported video codec {}",
                        track.codec
                    )));
                };
                let mut decoder = self.video_decoder(&track.codec).inspect_err(|e| {
                    warn!("{}, track not decoded", e);
                })?;
                let mut builder =
                    SampleBuilder::new(MAX_LATE_PACKETS, depacketizer, VIDEO_CLOCK_RATE);
                let token = cancel.clone();
                tokio::spawn(read_loop(track.source, cancel, move |packet| {
                    builder.push(packet);
                    while let Some(sample) = builder.pop() {
                        if sample.prev_dropped_packets > 0 {
                            debug!("Dropped {} video packets", sample.prev_dropped_packets);
                        }
                        match decoder.decode(&sample.data) {
                            Ok(Some(frame)) => {
                                if output.send(MediaSample::Video(frame)).is_err() {
                                    return false;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => debug!("{}", e),
                        }
                    }
                    true
                }));
                Ok(Box::new(TaskSink { cancel: token }))
            }
        }
    }
}

/// Pump packets into `handle` until the track ends, the token fires, or
/// `handle` reports the consumer is gone
async fn read_loop<F>(source: Arc<dyn RtpSource>, cancel: CancellationToken, mut handle: F)
where
    F: FnMut(Packet) -> bool + Send,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            packet = source.next_packet() => {
                let Some(packet) = packet else { break };
                if !handle(packet) {
                    break;
                }
            }
        }
    }
    info!("Track reader stopped");
}
