//! Agent media bridge
//!
//! The bridge joins spaces as a non-browser participant, opens one
//! receive-only peer connection per (remote peer, stream type), decodes the
//! inbound media and hands it to the stream monitor.

pub mod connection;
pub mod context;
#[cfg(feature = "h264")]
pub mod h264;
pub mod peer;
pub mod service;
pub mod sink;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{BridgeConnection, ConnectionKey, ConnectionPhase};
pub use context::{AgentContext, BridgeDeps, ConnectionStatus, ContextState, ContextStatus};
pub use peer::{MediaKind, MediaPeer, PeerEvent, PeerFactory, RtcPeerFactory};
pub use service::{AgentBridge, BridgeOptions, BridgeStatus};
pub use sink::{
    DecodingSinkFactory, MediaSample, MediaSink, SinkFactory, VideoDecoder, VideoDecoderFactory,
};
#[cfg(feature = "h264")]
pub use h264::OpenH264Decoder;
pub use transport::{LocalConnector, SignalingChannel, SignalingConnector, WsConnector};
