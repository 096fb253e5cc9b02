//! Client-side media engine seam
//!
//! The engine negotiates transports with the media server and turns tracks
//! into RTP. It is external to the pipeline; the session manager drives it
//! through these traits. Transport-level callbacks (DTLS connect, produce)
//! go back through signaling via a [`SignalingBridge`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::debug;

use parley_common::protocol::{
    Capabilities, ConsumerInfo, DtlsParameters, MediaKind, RtpParameters, TransportInfo,
};

use crate::error::{PipelineError, PipelineResult};
use crate::media::MediaTrack;
use crate::signaling::Signaling;

// =============================================================================
// Engine Traits
// =============================================================================

/// Callbacks a transport raises while negotiating
#[async_trait]
pub trait TransportListener: Send + Sync {
    /// The transport needs its DTLS parameters sent to the server
    async fn on_connect(&self, dtls_parameters: DtlsParameters) -> PipelineResult<()>;

    /// The transport wants to register a producer; returns the server id
    async fn on_produce(&self, kind: MediaKind, rtp_parameters: RtpParameters) -> PipelineResult<String>;
}

/// The client-side media device
#[async_trait]
pub trait MediaDevice: Send + Sync {
    /// Whether server capabilities have been loaded
    fn is_loaded(&self) -> bool;

    /// Load the server's router capabilities
    async fn load(&self, server_capabilities: &Capabilities) -> PipelineResult<()>;

    /// Capabilities of this client, sent with every consume request
    fn rtp_capabilities(&self) -> Capabilities;

    async fn create_send_transport(
        &self,
        info: &TransportInfo,
        listener: Arc<dyn TransportListener>,
    ) -> PipelineResult<Box<dyn SendTransport>>;

    async fn create_recv_transport(
        &self,
        info: &TransportInfo,
        listener: Arc<dyn TransportListener>,
    ) -> PipelineResult<Box<dyn RecvTransport>>;
}

/// Outbound transport
#[async_trait]
pub trait SendTransport: Send + Sync {
    fn id(&self) -> &str;

    /// Start sending `track`
    async fn produce(&self, track: MediaTrack) -> PipelineResult<Box<dyn Producer>>;

    /// Close the transport and every producer on it
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Inbound transport
#[async_trait]
pub trait RecvTransport: Send + Sync {
    fn id(&self) -> &str;

    /// Start receiving the producer described by `info`
    async fn consume(&self, info: &ConsumerInfo) -> PipelineResult<Consumer>;

    /// Close the transport and every consumer on it
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// The local outbound media unit
#[async_trait]
pub trait Producer: Send + Sync {
    fn id(&self) -> &str;

    fn is_paused(&self) -> bool;

    fn pause(&self);

    fn resume(&self);

    /// Swap the track being sent without renegotiating
    async fn replace_track(&self, track: MediaTrack) -> PipelineResult<()>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Inbound media from one remote producer
#[derive(Debug, Clone)]
pub struct Consumer {
    pub id: String,
    pub producer_id: String,
    pub peer_user_id: String,
    /// Decoded audio, written by the engine
    pub track: MediaTrack,
}

impl Consumer {
    pub fn new(info: &ConsumerInfo, track: MediaTrack) -> Self {
        Self {
            id: info.id.clone(),
            producer_id: info.producer_id.clone(),
            peer_user_id: info.peer_user_id.clone(),
            track,
        }
    }

    /// Stop receiving
    pub fn close(&self) {
        self.track.stop();
    }

    pub fn is_closed(&self) -> bool {
        !self.track.is_live()
    }
}

// =============================================================================
// Signaling Bridge
// =============================================================================

/// Routes a transport's listener callbacks through signaling
///
/// Once the owning transport is closed ([`SignalingBridge::close`]), every
/// callback resolves with [`PipelineError::TransportClosed`] instead of
/// touching the server, including callbacks whose request was already in
/// flight.
pub struct SignalingBridge {
    signaling: Arc<dyn Signaling>,
    transport_id: String,
    channel_id: String,
    live: AtomicBool,
}

impl SignalingBridge {
    pub fn new(signaling: Arc<dyn Signaling>, transport_id: &str, channel_id: &str) -> Arc<Self> {
        Arc::new(Self {
            signaling,
            transport_id: transport_id.to_string(),
            channel_id: channel_id.to_string(),
            live: AtomicBool::new(true),
        })
    }

    pub fn close(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn check_live(&self) -> PipelineResult<()> {
        if self.is_live() {
            Ok(())
        } else {
            Err(PipelineError::TransportClosed)
        }
    }
}

#[async_trait]
impl TransportListener for SignalingBridge {
    async fn on_connect(&self, dtls_parameters: DtlsParameters) -> PipelineResult<()> {
        self.check_live()?;
        self.signaling
            .connect_transport(&self.transport_id, dtls_parameters)
            .await?;
        self.check_live()?;
        debug!(transport_id = %self.transport_id, "transport connected");
        Ok(())
    }

    async fn on_produce(&self, kind: MediaKind, rtp_parameters: RtpParameters) -> PipelineResult<String> {
        self.check_live()?;
        let id = self
            .signaling
            .create_producer(&self.transport_id, kind, rtp_parameters, &self.channel_id)
            .await?;
        self.check_live()?;
        Ok(id)
    }
}
