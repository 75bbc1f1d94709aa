//! Signaling registry and relay
//!
//! Participants join a space over a transport, announce what they publish,
//! and exchange SDP/ICE through the relay. Media never passes through here.

pub mod protocol;
pub mod registry;
pub mod session;

pub use protocol::{
    CaptureAck, ClientMessage, IceCandidate, JoinRequest, LeaveRequest, ParticipantSummary,
    PublishIntent, PublishState, Role, ServerMessage, SessionDescription, Signal, SignalKind,
    SignalMessage, StreamType, UrlSharing,
};
pub use registry::{
    ClientContext, ClientHandle, ConnectionId, ConnectionType, DetailedStream, Registration,
    SpaceRegistry, SpaceStream, StreamInfo,
};
pub use session::ClientSession;
