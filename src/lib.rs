//! spacelink - signaling relay and agent media bridge
//!
//! Human and agent participants join shared spaces and exchange WebRTC media.
//! The relay carries signaling only; the agent bridge receives media as a
//! non-browser peer and hands decoded audio and frames to a stream monitor.

pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod membership;
pub mod monitor;
pub mod signaling;
pub mod state;
pub mod web;

pub use error::{AppError, Result};
