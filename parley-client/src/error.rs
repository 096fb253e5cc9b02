//! Error types for the audio pipeline and media session

use thiserror::Error;

/// Result type alias for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors raised inside the pipeline
///
/// These never cross the [`crate::client::VoiceClient`] boundary: every public
/// operation logs and swallows them so the host UI only sees a feature that
/// did not activate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// A transport, producer or consumer request was rejected
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Capture permission denied or device unavailable
    #[error("Audio device error: {0}")]
    Device(String),

    /// The platform audio subsystem could not be created
    #[error("Audio context unavailable: {0}")]
    ContextUnavailable(String),

    /// The transport (or signaling channel) closed while a request was in flight
    #[error("Transport closed")]
    TransportClosed,

    /// The operation is not valid in the current session state
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    /// Recording could not be finalized or delivered
    #[error("Recording error: {0}")]
    Recording(String),

    /// Settings could not be persisted
    #[error("Settings error: {0}")]
    Settings(String),

    /// Underlying I/O failure
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(err.to_string())
    }
}

impl From<cpal::DevicesError> for PipelineError {
    fn from(err: cpal::DevicesError) -> Self {
        PipelineError::Device(err.to_string())
    }
}

impl From<cpal::SupportedStreamConfigsError> for PipelineError {
    fn from(err: cpal::SupportedStreamConfigsError) -> Self {
        PipelineError::Device(format!("Failed to get supported configs: {}", err))
    }
}

impl From<cpal::BuildStreamError> for PipelineError {
    fn from(err: cpal::BuildStreamError) -> Self {
        PipelineError::Device(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for PipelineError {
    fn from(err: cpal::PlayStreamError) -> Self {
        PipelineError::Device(err.to_string())
    }
}

impl From<hound::Error> for PipelineError {
    fn from(err: hound::Error) -> Self {
        PipelineError::Recording(err.to_string())
    }
}
