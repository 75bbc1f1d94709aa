//! Stream monitor collaborator
//!
//! The bridge forwards decoded media to a [`StreamMonitor`] per monitoring
//! session. Analysis is out of scope here; [`InMemoryStreamMonitor`] keeps
//! per-stream counters and the most recent payloads.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::media::RgbaFrame;
use crate::signaling::StreamType;

/// Per-stream totals for one monitoring session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoredStream {
    pub participant_id: String,
    pub stream_type: StreamType,
    pub audio_chunks: u64,
    pub video_frames: u64,
}

#[async_trait]
pub trait StreamMonitor: Send + Sync {
    /// Open a session and return its id
    async fn start_monitoring(&self, agent_id: &str, space_id: &str) -> Result<String>;

    /// Deliver one WAV-encoded audio chunk
    async fn push_audio_data(
        &self,
        session_id: &str,
        participant_id: &str,
        stream_type: StreamType,
        wav: Bytes,
    ) -> Result<()>;

    async fn push_video_frame(&self, session_id: &str, frame: &RgbaFrame) -> Result<()>;

    async fn stop_monitoring(&self, session_id: &str) -> Result<()>;

    /// Streams that delivered data to a session
    async fn active_streams(&self, session_id: &str) -> Result<Vec<MonitoredStream>>;
}

#[derive(Debug, Default)]
struct SessionRecord {
    agent_id: String,
    space_id: String,
    streams: HashMap<(String, StreamType), MonitoredStream>,
    last_audio: Option<Bytes>,
    last_frame: Option<RgbaFrame>,
}

impl SessionRecord {
    fn stream(&mut self, participant_id: &str, stream_type: StreamType) -> &mut MonitoredStream {
        self.streams
            .entry((participant_id.to_string(), stream_type))
            .or_insert_with(|| MonitoredStream {
                participant_id: participant_id.to_string(),
                stream_type,
                audio_chunks: 0,
                video_frames: 0,
            })
    }
}

/// Monitor that records what it receives
#[derive(Default)]
pub struct InMemoryStreamMonitor {
    sessions: Mutex<HashMap<String, SessionRecord>>,
}

impl InMemoryStreamMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Most recent audio chunk of a session
    pub fn last_audio(&self, session_id: &str) -> Option<Bytes> {
        self.sessions
            .lock()
            .get(session_id)
            .and_then(|s| s.last_audio.clone())
    }

    /// Most recent video frame of a session
    pub fn last_frame(&self, session_id: &str) -> Option<RgbaFrame> {
        self.sessions
            .lock()
            .get(session_id)
            .and_then(|s| s.last_frame.clone())
    }

    /// `(agent_id, space_id)` a session was opened for
    pub fn owner(&self, session_id: &str) -> Option<(String, String)> {
        self.sessions
            .lock()
            .get(session_id)
            .map(|s| (s.agent_id.clone(), s.space_id.clone()))
    }

    fn with_session<T>(&self, session_id: &str, f: impl FnOnce(&mut SessionRecord) -> T) -> Result<T> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| AppError::NotFound(format!("Monitoring session {}", session_id)))?;
        Ok(f(session))
    }
}

#[async_trait]
impl StreamMonitor for InMemoryStreamMonitor {
    async fn start_monitoring(&self, agent_id: &str, space_id: &str) -> Result<String> {
        let session_id = Uuid::new_v4().to_string();
        self.sessions.lock().insert(
            session_id.clone(),
            SessionRecord {
                agent_id: agent_id.to_string(),
                space_id: space_id.to_string(),
                ..Default::default()
            },
        );
        info!(
            "Monitoring session {} started for {} in {}",
            session_id, agent_id, space_id
        );
        Ok(session_id)
    }

    async fn push_audio_data(
        &self,
        session_id: &str,
        participant_id: &str,
        stream_type: StreamType,
        wav: Bytes,
    ) -> Result<()> {
        self.with_session(session_id, |s| {
            s.stream(participant_id, stream_type).audio_chunks += 1;
            s.last_audio = Some(wav);
        })
    }

    async fn push_video_frame(&self, session_id: &str, frame: &RgbaFrame) -> Result<()> {
        self.with_session(session_id, |s| {
            s.stream(&frame.participant_id, frame.stream_type).video_frames += 1;
            s.last_frame = Some(frame.clone());
        })
    }

    async fn stop_monitoring(&self, session_id: &str) -> Result<()> {
        if self.sessions.lock().remove(session_id).is_some() {
            info!("Monitoring session {} stopped", session_id);
        } else {
            debug!("Monitoring session {} already stopped", session_id);
        }
        Ok(())
    }

    async fn active_streams(&self, session_id: &str) -> Result<Vec<MonitoredStream>> {
        self.with_session(session_id, |s| {
            let mut streams: Vec<_> = s.streams.values().cloned().collect();
            streams.sort_by(|a, b| {
                (a.participant_id.as_str(), a.stream_type)
                    .cmp(&(b.participant_id.as_str(), b.stream_type))
            });
            streams
        })
    }
}
