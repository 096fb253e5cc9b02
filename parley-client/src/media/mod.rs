//! Media sources and sinks
//!
//! Tracks, the platform audio seam, and its cpal implementation.

pub mod backend;
pub mod cpal_backend;
pub mod track;

pub use backend::{AudioBackend, AudioDevice, OutputSink};
pub use cpal_backend::CpalBackend;
pub use track::{MediaStream, MediaTrack, TrackSink};
