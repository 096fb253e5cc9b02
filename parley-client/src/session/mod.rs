//! Media session against the SFU
//!
//! Transport, producer and consumer lifecycle, the media engine seam, and
//! per-peer state.

pub mod engine;
pub mod manager;
pub mod peers;

pub use engine::{Consumer, MediaDevice, Producer, RecvTransport, SendTransport, SignalingBridge};
pub use manager::{SessionState, TransportSessionManager};
pub use peers::{ConnectionStatus, PeerAudioState};
