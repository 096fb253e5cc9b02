//! Events emitted by the pipeline to the host UI

use std::path::PathBuf;

use crate::session::{ConnectionStatus, SessionState};

/// Notifications from the pipeline
///
/// Sent over an unbounded channel returned by
/// [`crate::client::VoiceClient::new`]. The host applies them to its own
/// view state; nothing in the pipeline waits on the receiver.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// Speaking level of a participant (0 = silent, otherwise 2-100)
    SpeakingLevel { id: String, percent: f32 },
    /// The transport session changed state
    SessionStateChanged {
        state: SessionState,
        channel_id: Option<String>,
    },
    /// A peer's render path changed status
    PeerStatusChanged {
        peer_user_id: String,
        status: ConnectionStatus,
    },
    /// A peer's consumer was torn down
    PeerRemoved { peer_user_id: String },
    /// The microphone could not be captured; the session is listen-only
    MicrophoneUnavailable { reason: String },
    /// System audio capture started or stopped
    MixModeChanged { active: bool },
    /// A recording started
    RecordingStarted,
    /// A recording was finalized and delivered
    RecordingSaved { name: String, path: PathBuf },
}
