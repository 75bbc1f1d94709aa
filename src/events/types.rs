//! Space event types
//!
//! Events flow from the signaling sessions to in-process consumers such as
//! the agent bridge. Capture frames arrive over the signaling socket as
//! base64 images and are republished here without decoding.

use std::sync::Arc;

use crate::signaling::StreamType;

/// A captured image frame relayed from a participant
#[derive(Debug, Clone)]
pub struct CaptureFrameEvent {
    pub space_id: String,
    pub participant_id: String,
    /// Capture session for URL sharing; screen frames carry none
    pub session_id: Option<String>,
    /// Base64 encoded PNG or JPEG
    pub frame: Arc<str>,
    /// Sender timestamp in milliseconds
    pub timestamp: i64,
}

/// Events published on the [`super::EventBus`]
#[derive(Debug, Clone)]
pub enum SpaceEvent {
    /// Screen-share frame from a participant
    ScreenShareFrame(CaptureFrameEvent),
    /// Web page capture frame for a URL-sharing session
    WebCaptureFrame(CaptureFrameEvent),
}

impl SpaceEvent {
    pub fn frame(&self) -> &CaptureFrameEvent {
        match self {
            SpaceEvent::ScreenShareFrame(frame) | SpaceEvent::WebCaptureFrame(frame) => frame,
        }
    }

    /// Stream type the frame belongs to
    pub fn stream_type(&self) -> StreamType {
        match self {
            SpaceEvent::ScreenShareFrame(_) => StreamType::Screen,
            SpaceEvent::WebCaptureFrame(_) => StreamType::Url,
        }
    }
}
