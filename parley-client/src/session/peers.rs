//! Per-peer audio state

/// Render path status of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    /// Consumer requested, render chain not attached yet
    #[default]
    Connecting,
    /// Render chain attached
    Connected,
    /// Consumer or render chain failed
    Disconnected,
}

/// Audio state of one remote peer
///
/// Exists from consumer creation until the consumer is torn down.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerAudioState {
    pub peer_user_id: String,
    pub connection_status: ConnectionStatus,
    pub volume_percent: u8,
    pub muted: bool,
}

impl PeerAudioState {
    pub fn new(peer_user_id: &str, volume_percent: u8, muted: bool) -> Self {
        Self {
            peer_user_id: peer_user_id.to_string(),
            connection_status: ConnectionStatus::Connecting,
            volume_percent,
            muted,
        }
    }
}
