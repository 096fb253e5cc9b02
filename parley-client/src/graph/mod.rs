//! Audio processing graph
//!
//! The shared context and its buses, the processing nodes, the speaking
//! detector, and the three graphs built on them: local microphone, system
//! audio (mix mode) and per-peer playback.

pub mod context;
pub mod detector;
pub mod local;
pub mod mix;
pub mod node;
pub mod remote;

pub use context::{AudioContext, AudioContextManager};
pub use detector::{DetectionHandle, LevelGate, SpeakingDetector};
pub use local::LocalCaptureGraph;
pub use mix::MixCaptureGraph;
pub use node::{AnalyserNode, CaptureChain, GainNode, MixBus, NodeId};
pub use remote::RemoteRenderGraph;
