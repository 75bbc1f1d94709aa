//! In-memory peers and sinks for bridge tests

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;

use super::connection::ConnectionKey;
use super::peer::{
    InboundTrack, MediaKind, MediaPeer, PeerEvent, PeerFactory, RtpSource, SignalingState,
};
use super::sink::{MediaSample, MediaSink, SinkFactory};
use crate::error::{AppError, Result};
use crate::signaling::IceCandidate;

struct FakePeerState {
    transceivers: Vec<MediaKind>,
    signaling: SignalingState,
    remote: bool,
    offers: Vec<String>,
    answers: Vec<String>,
    candidates: Vec<IceCandidate>,
    closes: usize,
}

impl Default for FakePeerState {
    fn default() -> Self {
        Self {
            transceivers: Vec::new(),
            signaling: SignalingState::Stable,
            remote: false,
            offers: Vec::new(),
            answers: Vec::new(),
            candidates: Vec::new(),
            closes: 0,
        }
    }
}

/// Peer that records every call; candidates need a remote description
#[derive(Default)]
pub struct FakePeer {
    state: Mutex<FakePeerState>,
}

impl FakePeer {
    pub fn transceivers(&self) -> Vec<MediaKind> {
        self.state.lock().transceivers.clone()
    }

    pub fn offers(&self) -> Vec<String> {
        self.state.lock().offers.clone()
    }

    pub fn answers(&self) -> Vec<String> {
        self.state.lock().answers.clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().closes
    }

    pub fn set_signaling_state(&self, state: SignalingState) {
        self.state.lock().signaling = state;
    }
}

#[async_trait]
impl MediaPeer for FakePeer {
    async fn add_receive_transceiver(&self, kind: MediaKind) -> Result<()> {
        self.state.lock().transceivers.push(kind);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String> {
        let mut state = self.state.lock();
        state.offers.push(sdp.to_string());
        state.remote = true;
        Ok(format!("answer:{}", sdp))
    }

    async fn accept_answer(&self, sdp: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.answers.push(sdp.to_string());
        state.remote = true;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        if !state.remote {
            return Err(AppError::WebRtcError("no remote description".to_string()));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().closes += 1;
        Ok(())
    }
}

struct CreatedPeer {
    key: ConnectionKey,
    peer: Arc<FakePeer>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

/// Factory handing out [`FakePeer`]s and keeping their event senders
#[derive(Default)]
pub struct FakePeerFactory {
    created: Mutex<Vec<CreatedPeer>>,
}

impl FakePeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Keys in creation order
    pub fn created(&self) -> Vec<ConnectionKey> {
        self.created.lock().iter().map(|c| c.key.clone()).collect()
    }

    /// Most recent peer created for `key`
    pub fn peer(&self, key: &ConnectionKey) -> Option<Arc<FakePeer>> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|c| &c.key == key)
            .map(|c| c.peer.clone())
    }

    /// Inject a peer callback for `key`
    pub fn emit(&self, key: &ConnectionKey, event: PeerEvent) -> bool {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|c| &c.key == key)
            .is_some_and(|c| c.events.send(event).is_ok())
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(
        &self,
        key: &ConnectionKey,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn MediaPeer>> {
        let peer = Arc::new(FakePeer::default());
        self.created.lock().push(CreatedPeer {
            key: key.clone(),
            peer: peer.clone(),
            events,
        });
        Ok(peer)
    }
}

/// Timestamp step between queued packets, one 30 fps frame at 90 kHz
const QUEUE_TICKS_PER_PACKET: u32 = 3000;

/// RTP source replaying queued packets, then ending
pub struct QueueSource {
    packets: Mutex<VecDeque<Packet>>,
}

impl QueueSource {
    /// One marked packet per payload, each with its own timestamp
    pub fn new(payloads: Vec<Vec<u8>>) -> Arc<dyn RtpSource> {
        let packets = payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| {
                rtp_packet(i as u16, i as u32 * QUEUE_TICKS_PER_PACKET, true, payload)
            })
            .collect();
        Self::from_packets(packets)
    }

    pub fn from_packets(packets: Vec<Packet>) -> Arc<dyn RtpSource> {
        Arc::new(Self {
            packets: Mutex::new(packets.into()),
        })
    }
}

#[async_trait]
impl RtpSource for QueueSource {
    async fn next_packet(&self) -> Option<Packet> {
        self.packets.lock().pop_front()
    }
}

pub fn rtp_packet(sequence_number: u16, timestamp: u32, marker: bool, payload: Vec<u8>) -> Packet {
    Packet {
        header: Header {
            version: 2,
            marker,
            sequence_number,
            timestamp,
            ..Header::default()
        },
        payload: Bytes::from(payload),
    }
}

/// Sink counting its stop calls
#[derive(Clone, Default)]
pub struct CountingSink {
    stops: Arc<AtomicUsize>,
    fail: bool,
}

impl CountingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink whose stop reports an error
    pub fn failing() -> Self {
        Self {
            stops: Arc::default(),
            fail: true,
        }
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl MediaSink for CountingSink {
    fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(AppError::MediaError("stop failed".to_string()));
        }
        Ok(())
    }
}

/// Sink factory exposing each attached sink's output sender
#[derive(Default)]
pub struct FakeSinkFactory {
    attached: Mutex<Vec<(MediaKind, mpsc::UnboundedSender<MediaSample>, CountingSink)>>,
}

impl FakeSinkFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attached_count(&self) -> usize {
        self.attached.lock().len()
    }

    /// Output sender of the n-th attached sink
    pub fn output(&self, index: usize) -> Option<mpsc::UnboundedSender<MediaSample>> {
        self.attached.lock().get(index).map(|(_, tx, _)| tx.clone())
    }

    pub fn sink(&self, index: usize) -> Option<CountingSink> {
        self.attached.lock().get(index).map(|(_, _, s)| s.clone())
    }
}

impl SinkFactory for FakeSinkFactory {
    fn attach(
        &self,
        track: InboundTrack,
        output: mpsc::UnboundedSender<MediaSample>,
        _cancel: CancellationToken,
    ) -> Result<Box<dyn MediaSink>> {
        let sink = CountingSink::new();
        self.attached.lock().push((track.kind, output, sink.clone()));
        Ok(Box::new(sink))
    }
}
