//! Parley voice client audio pipeline
//!
//! Microphone and system-audio capture, per-peer playback, speaking
//! detection, recording, and the media session against an SFU. Hosts
//! drive everything through [`client::VoiceClient`].

pub mod client;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod graph;
pub mod media;
pub mod ptt;
pub mod recording;
pub mod session;
pub mod signaling;

#[cfg(test)]
mod testing;

pub use client::{ClientSeams, VoiceClient};
pub use error::{PipelineError, PipelineResult};
pub use events::PipelineEvent;
