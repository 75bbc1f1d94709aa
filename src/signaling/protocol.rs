//! Signaling wire protocol
//!
//! Frames on the signaling socket are JSON objects of the form
//! `{"event": "<name>", "data": {...}}`. The `signal` event carries a
//! [`SignalMessage`], whose loosely typed payload is decoded into the closed
//! [`Signal`] union before any state machine looks at it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Participant role
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Human,
    Agent,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Human => "human",
            Role::Agent => "agent",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Independent logical media channel of a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Camera,
    Screen,
    Audio,
    Url,
}

impl StreamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::Camera => "camera",
            StreamType::Screen => "screen",
            StreamType::Audio => "audio",
            StreamType::Url => "url",
        }
    }
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signal message type. Unrecognized types decode to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "&'static str")]
pub enum SignalKind {
    PeerJoined,
    PeerLeft,
    PublishState,
    Offer,
    Answer,
    Candidate,
    RequestPublishState,
    Unknown,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::PeerJoined => "peer-joined",
            SignalKind::PeerLeft => "peer-left",
            SignalKind::PublishState => "publishState",
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
            SignalKind::RequestPublishState => "requestPublishState",
            SignalKind::Unknown => "unknown",
        }
    }
}

impl From<String> for SignalKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "peer-joined" => SignalKind::PeerJoined,
            "peer-left" => SignalKind::PeerLeft,
            "publishState" => SignalKind::PublishState,
            "offer" => SignalKind::Offer,
            "answer" => SignalKind::Answer,
            "candidate" => SignalKind::Candidate,
            "requestPublishState" => SignalKind::RequestPublishState,
            _ => SignalKind::Unknown,
        }
    }
}

impl From<SignalKind> for &'static str {
    fn from(kind: SignalKind) -> Self {
        kind.as_str()
    }
}

/// Combined audio/video publish flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishState {
    #[serde(default)]
    pub audio: bool,
    #[serde(default)]
    pub video: bool,
}

impl PublishState {
    pub fn is_active(&self) -> bool {
        self.audio || self.video
    }
}

/// URL capture sharing state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlSharing {
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Relayed signaling message as it appears on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub space_id: String,
    pub from_id: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Legacy combined publish object; only read by [`SignalMessage::decode`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish: Option<PublishState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_type: Option<StreamType>,
}

impl SignalMessage {
    pub fn new(
        kind: SignalKind,
        space_id: impl Into<String>,
        from_id: impl Into<String>,
        role: Role,
    ) -> Self {
        Self {
            kind,
            space_id: space_id.into(),
            from_id: from_id.into(),
            role,
            target_id: None,
            data: None,
            publish: None,
            stream_type: None,
        }
    }

    pub fn to(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_stream(mut self, stream_type: StreamType) -> Self {
        self.stream_type = Some(stream_type);
        self
    }

    /// Stream type of the message, defaulting to camera
    pub fn stream(&self) -> StreamType {
        self.stream_type.unwrap_or(StreamType::Camera)
    }

    /// Whether the message is addressed to `participant_id` (or to everyone)
    pub fn is_for(&self, participant_id: &str) -> bool {
        self.target_id.as_deref().map_or(true, |t| t == participant_id)
    }

    /// Decode the wire payload into a typed signal
    pub fn decode(&self) -> Result<Signal, serde_json::Error> {
        let signal = match self.kind {
            SignalKind::PeerJoined => Signal::PeerJoined,
            SignalKind::PeerLeft => Signal::PeerLeft,
            SignalKind::PublishState => {
                let explicit = match &self.data {
                    Some(data) => serde_json::from_value::<PublishPayload>(data.clone())?,
                    None => PublishPayload::default(),
                };
                Signal::PublishState(PublishIntent {
                    stream_type: self.stream(),
                    publishing: explicit.publishing,
                    legacy: self.publish,
                    url: explicit.url,
                    session_id: explicit.session_id,
                })
            }
            SignalKind::Offer => Signal::Offer(self.payload()?),
            SignalKind::Answer => Signal::Answer(self.payload()?),
            SignalKind::Candidate => Signal::Candidate(self.payload()?),
            SignalKind::RequestPublishState => Signal::RequestPublishState,
            SignalKind::Unknown => Signal::Unknown,
        };
        Ok(signal)
    }

    fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone().unwrap_or(Value::Null))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishPayload {
    #[serde(default)]
    publishing: Option<bool>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

/// Typed signal, exhaustively matched by the registry and the bridge
#[derive(Debug, Clone)]
pub enum Signal {
    PeerJoined,
    PeerLeft,
    PublishState(PublishIntent),
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
    RequestPublishState,
    Unknown,
}

/// Canonical publish announcement for one stream type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishIntent {
    pub stream_type: StreamType,
    /// Explicit per-stream flag
    pub publishing: Option<bool>,
    /// Legacy combined flags, used only when no explicit flag is present
    pub legacy: Option<PublishState>,
    pub url: Option<String>,
    pub session_id: Option<String>,
}

impl PublishIntent {
    pub fn explicit(stream_type: StreamType, publishing: bool) -> Self {
        Self {
            stream_type,
            publishing: Some(publishing),
            legacy: None,
            url: None,
            session_id: None,
        }
    }

    /// Whether this announcement means the stream is live
    ///
    /// For audio the legacy fallback requires audio without video, so a
    /// combined camera stream is not counted twice.
    pub fn is_publishing(&self) -> bool {
        if let Some(publishing) = self.publishing {
            return publishing;
        }
        let legacy = self.legacy.unwrap_or_default();
        match self.stream_type {
            StreamType::Audio => legacy.audio && !legacy.video,
            _ => legacy.audio || legacy.video,
        }
    }

    /// Combined audio/video flags implied by a camera announcement
    pub fn media_state(&self) -> PublishState {
        match (self.legacy, self.publishing) {
            (Some(legacy), None) => legacy,
            (_, Some(publishing)) => PublishState {
                audio: publishing,
                video: publishing,
            },
            (None, None) => PublishState::default(),
        }
    }
}

/// SDP offer or answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: Some("offer".to_string()),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: Some("answer".to_string()),
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP mid (media ID)
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    /// Username fragment
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }
}

/// Public view of a participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSummary {
    pub participant_id: String,
    pub role: Role,
    #[serde(default)]
    pub publish_state: PublishState,
    #[serde(default)]
    pub screen_sharing: bool,
    #[serde(default)]
    pub url_sharing: UrlSharing,
}

impl ParticipantSummary {
    pub fn new(participant_id: impl Into<String>, role: Role) -> Self {
        Self {
            participant_id: participant_id.into(),
            role,
            publish_state: PublishState::default(),
            screen_sharing: false,
            url_sharing: UrlSharing::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub space_id: String,
    pub from_id: String,
    #[serde(default)]
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRequest {
    pub space_id: String,
    pub from_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartWebCapture {
    pub space_id: String,
    pub from_id: String,
    pub url: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopWebCapture {
    pub space_id: String,
    pub from_id: String,
    pub session_id: String,
}

/// One captured web page frame (base64 encoded image)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebFrame {
    pub session_id: String,
    pub participant_id: String,
    pub frame: String,
    pub timestamp: i64,
}

/// One captured screen-share frame (base64 encoded image)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenFrame {
    pub space_id: String,
    pub from_id: String,
    pub frame: String,
    pub timestamp: i64,
}

/// Client-to-server message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientMessage {
    Join(JoinRequest),
    Signal(SignalMessage),
    Leave(LeaveRequest),
    StartWebCapture(StartWebCapture),
    WebFrame(WebFrame),
    ScreenFrame(ScreenFrame),
    StopWebCapture(StopWebCapture),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinedPayload {
    pub participants: Vec<ParticipantSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureAck {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureError {
    pub session_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Server-to-client message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
    Joined(JoinedPayload),
    Signal(SignalMessage),
    WebCaptureStarted(CaptureAck),
    WebCaptureError(CaptureError),
    WebCaptureStopped(CaptureAck),
    Error(ErrorPayload),
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error(ErrorPayload {
            message: message.into(),
        })
    }
}
