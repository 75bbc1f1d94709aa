//! Receive-only peer connections
//!
//! [`MediaPeer`] is the narrow surface the bridge needs from a WebRTC peer
//! connection. [`RtcPeerFactory`] provides it with the `webrtc` crate.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{
    MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8, MIME_TYPE_VP9,
};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCPFeedback, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

use super::connection::ConnectionKey;
use crate::config::WebRtcConfig;
use crate::error::{AppError, Result};
use crate::signaling::{IceCandidate, StreamType};

/// Media kind of a transceiver or inbound track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Kind received for a stream type; everything but audio is video
    pub fn for_stream(stream_type: StreamType) -> Self {
        match stream_type {
            StreamType::Audio => MediaKind::Audio,
            _ => MediaKind::Video,
        }
    }

    fn codec_type(self) -> RTPCodecType {
        match self {
            MediaKind::Audio => RTPCodecType::Audio,
            MediaKind::Video => RTPCodecType::Video,
        }
    }

    fn from_codec_type(codec_type: RTPCodecType) -> Option<Self> {
        match codec_type {
            RTPCodecType::Audio => Some(MediaKind::Audio),
            RTPCodecType::Video => Some(MediaKind::Video),
            _ => None,
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Transport-level connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// SDP negotiation state of the local side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

impl SignalingState {
    /// Whether a remote offer may be applied in this state
    pub fn accepts_offer(self) -> bool {
        matches!(self, SignalingState::Stable | SignalingState::HaveRemoteOffer)
    }
}

impl std::fmt::Display for SignalingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SignalingState::Stable => "stable",
            SignalingState::HaveLocalOffer => "have-local-offer",
            SignalingState::HaveRemoteOffer => "have-remote-offer",
            SignalingState::HaveLocalPranswer => "have-local-pranswer",
            SignalingState::HaveRemotePranswer => "have-remote-pranswer",
            SignalingState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Source of RTP packets for one inbound track
#[async_trait]
pub trait RtpSource: Send + Sync {
    /// Next packet, or `None` once the track has ended
    async fn next_packet(&self) -> Option<Packet>;
}

/// Remote track announced by a peer
#[derive(Clone)]
pub struct InboundTrack {
    pub kind: MediaKind,
    /// MIME type of the negotiated codec, e.g. `audio/opus`
    pub codec: String,
    pub source: Arc<dyn RtpSource>,
}

impl std::fmt::Debug for InboundTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundTrack")
            .field("kind", &self.kind)
            .field("codec", &self.codec)
            .finish()
    }
}

/// Callbacks of a peer, delivered in order on one channel
#[derive(Debug)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    Track(InboundTrack),
    StateChanged(ConnectionState),
}

#[async_trait]
pub trait MediaPeer: Send + Sync {
    async fn add_receive_transceiver(&self, kind: MediaKind) -> Result<()>;

    fn signaling_state(&self) -> SignalingState;

    async fn has_remote_description(&self) -> bool;

    /// Apply a remote offer and return the local answer SDP
    async fn accept_offer(&self, sdp: &str) -> Result<String>;

    async fn accept_answer(&self, sdp: &str) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Creates one peer per bridge connection
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        key: &ConnectionKey,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn MediaPeer>>;
}

/// [`PeerFactory`] backed by the `webrtc` crate
pub struct RtcPeerFactory {
    config: WebRtcConfig,
    /// Video codecs offered in answers; `None` keeps the library defaults
    video_codecs: Option<Vec<String>>,
}

impl RtcPeerFactory {
    pub fn new(config: WebRtcConfig) -> Self {
        Self {
            config,
            video_codecs: None,
        }
    }

    /// Answer only with these video codecs (lowercase MIME types) so the
    /// remote side sends something the sinks can decode
    pub fn with_video_codecs(mut self, codecs: Vec<String>) -> Self {
        self.video_codecs = Some(codecs);
        self
    }

    fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut ice_servers = vec![];

        for stun_url in &self.config.stun_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![stun_url.clone()],
                ..Default::default()
            });
        }

        for turn in &self.config.turn_servers {
            ice_servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        ice_servers
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(
        &self,
        key: &ConnectionKey,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn MediaPeer>> {
        let mut media_engine = MediaEngine::default();
        match &self.video_codecs {
            Some(video) => register_codecs(&mut media_engine, video)?,
            None => media_engine
                .register_default_codecs()
                .map_err(|e| AppError::WebRtcError(format!("Failed to register codecs: {}", e)))?,
        }

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            AppError::WebRtcError(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_setting_engine(SettingEngine::default())
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers(),
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?;

        let peer = RtcPeer {
            name: key.to_string(),
            pc: Arc::new(pc),
        };
        peer.setup_event_handlers(events);

        debug!("Created peer connection {}", peer.name);
        Ok(Arc::new(peer))
    }
}

struct RtcPeer {
    name: String,
    pc: Arc<RTCPeerConnection>,
}

impl RtcPeer {
    fn setup_event_handlers(&self, events: mpsc::UnboundedSender<PeerEvent>) {
        let tx = events.clone();
        let name = self.name.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let tx = tx.clone();
                let name = name.clone();

                Box::pin(async move {
                    let state = match s {
                        RTCPeerConnectionState::New => ConnectionState::New,
                        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                        RTCPeerConnectionState::Connected => ConnectionState::Connected,
                        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                        RTCPeerConnectionState::Failed => ConnectionState::Failed,
                        RTCPeerConnectionState::Closed => ConnectionState::Closed,
                        _ => return,
                    };

                    info!("Peer {} connection state: {}", name, state);
                    let _ = tx.send(PeerEvent::StateChanged(state));
                })
            }));

        let tx = events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let tx = tx.clone();

                Box::pin(async move {
                    let Some(init) = candidate.and_then(|c| c.to_json().ok()) else {
                        return;
                    };
                    let _ = tx.send(PeerEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                })
            }));

        let tx = events;
        let name = self.name.clone();
        self.pc
            .on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
                let tx = tx.clone();
                let name = name.clone();

                Box::pin(async move {
                    let Some(kind) = MediaKind::from_codec_type(track.kind()) else {
                        debug!("Peer {} announced a track of unknown kind", name);
                        return;
                    };
                    let codec = track.codec().capability.mime_type.to_lowercase();
                    info!("Peer {} remote {} track ({})", name, kind, codec);

                    let _ = tx.send(PeerEvent::Track(InboundTrack {
                        kind,
                        codec,
                        source: Arc::new(RemoteTrackSource(track)),
                    }));
                })
            }));
    }
}

#[async_trait]
impl MediaPeer for RtcPeer {
    async fn add_receive_transceiver(&self, kind: MediaKind) -> Result<()> {
        self.pc
            .add_transceiver_from_kind(
                kind.codec_type(),
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add transceiver: {}", e)))?;
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| AppError::WebRtcError(format!("Invalid SDP offer: {}", e)))?;

        self.pc.set_remote_description(offer).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to set remote description: {}", e))
        })?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create answer: {}", e)))?;

        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to set local description: {}", e)))?;

        Ok(answer.sdp)
    }

    async fn accept_answer(&self, sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| AppError::WebRtcError(format!("Invalid SDP answer: {}", e)))?;

        self.pc.set_remote_description(answer).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to set remote description: {}", e))
        })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to close peer connection: {}", e)))
    }
}

/// Codec parameters for a video MIME type, matching what browsers offer
fn video_codec_parameters(mime_type: &str) -> Vec<(u8, &'static str, &'static str)> {
    match mime_type {
        "video/h264" => vec![
            (
                102,
                MIME_TYPE_H264,
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f",
            ),
            (
                125,
                MIME_TYPE_H264,
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
            ),
            (
                123,
                MIME_TYPE_H264,
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=640032",
            ),
        ],
        "video/vp8" => vec![(96, MIME_TYPE_VP8, "")],
        "video/vp9" => vec![(98, MIME_TYPE_VP9, "profile-id=0")],
        _ => Vec::new(),
    }
}

/// Register Opus and only the given video codecs
fn register_codecs(media_engine: &mut MediaEngine, video: &[String]) -> Result<()> {
    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                    rtcp_feedback: vec![],
                },
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )
        .map_err(|e| AppError::WebRtcError(format!("Failed to register Opus codec: {}", e)))?;

    let video_rtcp_feedback = vec![
        RTCPFeedback {
            typ: "goog-remb".to_owned(),
            parameter: "".to_owned(),
        },
        RTCPFeedback {
            typ: "ccm".to_owned(),
            parameter: "fir".to_owned(),
        },
        RTCPFeedback {
            typ: "nack".to_owned(),
            parameter: "".to_owned(),
        },
        RTCPFeedback {
            typ: "nack".to_owned(),
            parameter: "pli".to_owned(),
        },
    ];

    for codec in video {
        let params = video_codec_parameters(codec);
        if params.is_empty() {
            warn!("Video codec {} cannot be negotiated, skipped", codec);
        }
        for (payload_type, mime_type, fmtp) in params {
            media_engine
                .register_codec(
                    RTCRtpCodecParameters {
                        capability: RTCRtpCodecCapability {
                            mime_type: mime_type.to_owned(),
                            clock_rate: 90000,
                            channels: 0,
                            sdp_fmtp_line: fmtp.to_owned(),
                            rtcp_feedback: video_rtcp_feedback.clone(),
                        },
                        payload_type,
                        ..Default::default()
                    },
                    RTPCodecType::Video,
                )
                .map_err(|e| {
                    AppError::WebRtcError(format!("Failed to register {} codec: {}", codec, e))
                })?;
        }
    }
    Ok(())
}

struct RemoteTrackSource(Arc<TrackRemote>);

#[async_trait]
impl RtpSource for RemoteTrackSource {
    async fn next_packet(&self) -> Option<Packet> {
        match self.0.read_rtp().await {
            Ok((packet, _)) => Some(packet),
            Err(e) => {
                debug!("Track {} ended: {}", self.0.id(), e);
                None
            }
        }
    }
}
