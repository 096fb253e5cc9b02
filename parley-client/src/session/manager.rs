//! Transport session manager
//!
//! Drives the `Idle -> Joining -> Joined -> Leaving -> Idle` lifecycle
//! against signaling and the media engine. Owns transport, producer and
//! consumer identity; the capture and render graphs are created and torn
//! down in response, never on their own.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use parley_common::protocol::{Capabilities, ExistingProducer, SignalingEvent, TransportDirection};

use super::engine::{Consumer, MediaDevice, RecvTransport, SendTransport, SignalingBridge};
use super::peers::{ConnectionStatus, PeerAudioState};
use crate::config::AudioSettings;
use crate::events::PipelineEvent;
use crate::error::{PipelineError, PipelineResult};
use crate::graph::{
    AudioContextManager, LocalCaptureGraph, MixCaptureGraph, RemoteRenderGraph, SpeakingDetector,
};
use crate::media::MediaStream;
use crate::signaling::Signaling;

// =============================================================================
// Session State
// =============================================================================

/// Lifecycle state of the media session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Joining,
    Joined,
    Leaving,
}

struct SendSlot {
    transport: Box<dyn SendTransport>,
    bridge: Arc<SignalingBridge>,
}

struct RecvSlot {
    transport: Box<dyn RecvTransport>,
    bridge: Arc<SignalingBridge>,
}

// =============================================================================
// Manager
// =============================================================================

pub struct TransportSessionManager {
    signaling: Arc<dyn Signaling>,
    device: Arc<dyn MediaDevice>,
    contexts: Arc<AudioContextManager>,
    events: mpsc::UnboundedSender<PipelineEvent>,

    state: SessionState,
    channel_id: Option<String>,
    send: Option<SendSlot>,
    recv: Option<RecvSlot>,
    /// Set once the device has loaded server capabilities; never reloaded
    capabilities_loaded: bool,
    /// Live consumers keyed by producer id
    consumers: HashMap<String, Consumer>,
    /// Peer state keyed by peer user id
    peers: HashMap<String, PeerAudioState>,

    local: LocalCaptureGraph,
    mix: MixCaptureGraph,
    remote: RemoteRenderGraph,
}

impl TransportSessionManager {
    /// Create a manager and the graphs it drives
    ///
    /// # Arguments
    /// * `signaling` - Request channel to the media server
    /// * `device` - Client-side media engine
    /// * `contexts` - Shared audio context manager
    /// * `detector` - Speaking detector shared by every graph
    /// * `local_user_id` - Detection id of the local user
    /// * `settings` - Settings at construction time (speaking mode)
    /// * `events` - Pipeline event channel
    pub fn new(
        signaling: Arc<dyn Signaling>,
        device: Arc<dyn MediaDevice>,
        contexts: Arc<AudioContextManager>,
        detector: SpeakingDetector,
        local_user_id: &str,
        settings: &AudioSettings,
        events: mpsc::UnboundedSender<PipelineEvent>,
    ) -> Self {
        Self {
            local: LocalCaptureGraph::new(
                contexts.clone(),
                detector.clone(),
                local_user_id,
                settings.speaking_mode,
            ),
            mix: MixCaptureGraph::new(contexts.clone(), detector.clone()),
            remote: RemoteRenderGraph::new(contexts.clone(), detector),
            signaling,
            device,
            contexts,
            events,
            state: SessionState::Idle,
            channel_id: None,
            send: None,
            recv: None,
            capabilities_loaded: false,
            consumers: HashMap::new(),
            peers: HashMap::new(),
        }
    }

    fn emit(&self, event: PipelineEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        self.emit(PipelineEvent::SessionStateChanged {
            state,
            channel_id: self.channel_id.clone(),
        });
    }

    // =========================================================================
    // Join / Leave
    // =========================================================================

    /// Join a channel, leaving the current one first
    ///
    /// Creates the receive transport, then the send transport, then the
    /// single producer. Any failure in those steps releases whatever was
    /// created and returns to `Idle`. Producers already in the room are
    /// consumed once joined; a failure for one of them is logged and skipped.
    pub async fn join_room(&mut self, channel_id: &str, settings: &AudioSettings) -> PipelineResult<()> {
        if self.state != SessionState::Idle {
            info!(from = ?self.channel_id, to = channel_id, "switching rooms");
            self.leave_room();
        }
        if self.contexts.ensure_initialized().is_none() {
            return Err(PipelineError::ContextUnavailable(
                "join skipped".to_string(),
            ));
        }

        self.channel_id = Some(channel_id.to_string());
        self.set_state(SessionState::Joining);

        let existing = match self.setup_transports(channel_id, settings).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!(channel_id, error = %e, "join failed");
                self.teardown(false);
                self.set_state(SessionState::Idle);
                return Err(e);
            }
        };

        self.set_state(SessionState::Joined);
        info!(channel_id, existing = existing.len(), "joined room");

        for producer in existing {
            if let Err(e) = self
                .consume(&producer.producer_id, &producer.peer_user_id, settings)
                .await
            {
                warn!(
                    producer_id = %producer.producer_id,
                    peer = %producer.peer_user_id,
                    error = %e,
                    "failed to consume existing producer"
                );
            }
        }
        Ok(())
    }

    async fn setup_transports(
        &mut self,
        channel_id: &str,
        settings: &AudioSettings,
    ) -> PipelineResult<Vec<ExistingProducer>> {
        let recv_info = self
            .signaling
            .create_transport(TransportDirection::Recv, channel_id)
            .await?;
        self.load_capabilities(&recv_info.server_capabilities).await?;
        let bridge = SignalingBridge::new(self.signaling.clone(), &recv_info.id, channel_id);
        match self.device.create_recv_transport(&recv_info, bridge.clone()).await {
            Ok(transport) => self.recv = Some(RecvSlot { transport, bridge }),
            Err(e) => {
                bridge.close();
                return Err(e);
            }
        }
        debug!(transport_id = %recv_info.id, "receive transport created");

        let send_info = self
            .signaling
            .create_transport(TransportDirection::Send, channel_id)
            .await?;
        self.load_capabilities(&send_info.server_capabilities).await?;
        let bridge = SignalingBridge::new(self.signaling.clone(), &send_info.id, channel_id);
        match self.device.create_send_transport(&send_info, bridge.clone()).await {
            Ok(transport) => self.send = Some(SendSlot { transport, bridge }),
            Err(e) => {
                bridge.close();
                return Err(e);
            }
        }
        debug!(transport_id = %send_info.id, "send transport created");

        if !self.local.has_microphone() {
            self.capture_microphone(settings).await;
        }

        let Some(send) = &self.send else {
            return Err(PipelineError::InvalidState("send transport missing"));
        };
        self.local.produce(send.transport.as_ref()).await?;

        Ok(recv_info.existing_producers)
    }

    /// Load server capabilities into the device the first time only
    async fn load_capabilities(&mut self, capabilities: &Capabilities) -> PipelineResult<()> {
        if self.capabilities_loaded {
            return Ok(());
        }
        if !self.device.is_loaded() {
            self.device.load(capabilities).await?;
            debug!("device capabilities loaded");
        }
        self.capabilities_loaded = true;
        Ok(())
    }

    /// Leave the current room and release every session resource
    ///
    /// Mix mode is stopped too. No-op when idle.
    pub fn leave_room(&mut self) {
        if self.state == SessionState::Idle {
            return;
        }
        self.set_state(SessionState::Leaving);
        self.teardown(true);
        self.set_state(SessionState::Idle);
        info!("left room");
    }

    fn teardown(&mut self, stop_mix: bool) {
        for (_, consumer) in self.consumers.drain() {
            consumer.close();
        }
        self.remote.detach_all();
        let peers: Vec<String> = self.peers.drain().map(|(id, _)| id).collect();
        for peer_user_id in peers {
            self.emit(PipelineEvent::PeerRemoved { peer_user_id });
        }

        self.local.detach();

        if let Some(slot) = self.send.take() {
            slot.bridge.close();
            slot.transport.close();
        }
        if let Some(slot) = self.recv.take() {
            slot.bridge.close();
            slot.transport.close();
        }

        if stop_mix && self.mix.stop_mix() {
            self.emit(PipelineEvent::MixModeChanged { active: false });
        }
        self.channel_id = None;
    }

    // =========================================================================
    // Microphone
    // =========================================================================

    /// Capture the configured input device and attach it
    ///
    /// A capture failure leaves the current chain (if any) running and is
    /// reported as [`PipelineEvent::MicrophoneUnavailable`].
    pub async fn capture_microphone(&mut self, settings: &AudioSettings) -> bool {
        let stream = match self
            .contexts
            .backend()
            .capture_microphone(&settings.input_device)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!(device = %settings.input_device, error = %e, "microphone unavailable");
                self.emit(PipelineEvent::MicrophoneUnavailable {
                    reason: e.to_string(),
                });
                return false;
            }
        };

        match self.local.attach_microphone(stream, settings.mic_volume).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "failed to attach microphone");
                false
            }
        }
    }

    // =========================================================================
    // Consumers
    // =========================================================================

    /// Consume a remote producer and render it
    ///
    /// Ignored if the producer is already consumed.
    pub async fn consume(
        &mut self,
        producer_id: &str,
        peer_user_id: &str,
        settings: &AudioSettings,
    ) -> PipelineResult<()> {
        if self.consumers.contains_key(producer_id) {
            debug!(producer_id, "producer already consumed");
            return Ok(());
        }
        let (Some(recv), Some(channel_id)) = (&self.recv, &self.channel_id) else {
            return Err(PipelineError::InvalidState("not joined"));
        };
        let transport_id = recv.transport.id().to_string();
        let channel_id = channel_id.clone();

        let muted = settings.is_user_muted(peer_user_id);
        let volume = settings.peer_volume(peer_user_id);
        if !self.peers.contains_key(peer_user_id) {
            self.peers.insert(
                peer_user_id.to_string(),
                PeerAudioState::new(peer_user_id, volume, muted),
            );
            self.emit_peer_status(peer_user_id, ConnectionStatus::Connecting);
        }

        let consumer = match self
            .request_consumer(&transport_id, producer_id, &channel_id)
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                self.drop_peer_if_unused(peer_user_id, ConnectionStatus::Disconnected);
                return Err(e);
            }
        };

        let stream = MediaStream::single(consumer.track.clone());
        if let Err(e) = self.remote.attach_peer(peer_user_id, stream, muted, volume) {
            consumer.close();
            self.drop_peer_if_unused(peer_user_id, ConnectionStatus::Disconnected);
            return Err(e);
        }

        info!(
            producer_id,
            peer = peer_user_id,
            consumer_id = %consumer.id,
            "consumer created"
        );
        self.consumers.insert(producer_id.to_string(), consumer);
        if let Some(peer) = self.peers.get_mut(peer_user_id) {
            peer.connection_status = ConnectionStatus::Connected;
        }
        self.emit_peer_status(peer_user_id, ConnectionStatus::Connected);
        Ok(())
    }

    async fn request_consumer(
        &self,
        transport_id: &str,
        producer_id: &str,
        channel_id: &str,
    ) -> PipelineResult<Consumer> {
        let info = self
            .signaling
            .create_consumer(
                transport_id,
                producer_id,
                self.device.rtp_capabilities(),
                channel_id,
            )
            .await?;
        let recv = self.recv.as_ref().ok_or(PipelineError::TransportClosed)?;
        if recv.transport.is_closed() {
            return Err(PipelineError::TransportClosed);
        }
        recv.transport.consume(&info).await
    }

    /// Tear down the consumer of `producer_id`; unknown ids are ignored
    pub fn close_consumer(&mut self, producer_id: &str) -> bool {
        let Some(consumer) = self.consumers.remove(producer_id) else {
            debug!(producer_id, "close for unknown producer ignored");
            return false;
        };
        consumer.close();

        // Only detach the chain if it is still rendering this consumer
        let peer_user_id = consumer.peer_user_id.clone();
        if self
            .remote
            .track(&peer_user_id)
            .is_some_and(|track| track.same_track(&consumer.track))
        {
            self.remote.detach_peer(&peer_user_id);
            self.render_remaining_consumer(&peer_user_id);
        }
        if !self.peer_has_consumer(&peer_user_id) && self.peers.remove(&peer_user_id).is_some() {
            self.emit(PipelineEvent::PeerRemoved {
                peer_user_id: peer_user_id.clone(),
            });
        }

        info!(producer_id, peer = %peer_user_id, "consumer closed");
        true
    }

    /// Render another live consumer of the peer after its rendered one closed
    fn render_remaining_consumer(&mut self, peer_user_id: &str) {
        let Some(track) = self
            .consumers
            .values()
            .find(|c| c.peer_user_id == peer_user_id && !c.is_closed())
            .map(|c| c.track.clone())
        else {
            return;
        };
        let Some((muted, volume)) = self
            .peers
            .get(peer_user_id)
            .map(|peer| (peer.muted, peer.volume_percent))
        else {
            return;
        };

        let status = match self
            .remote
            .attach_peer(peer_user_id, MediaStream::single(track), muted, volume)
        {
            Ok(()) => {
                debug!(peer = peer_user_id, "peer rendering remaining consumer");
                ConnectionStatus::Connected
            }
            Err(e) => {
                warn!(peer = peer_user_id, error = %e, "failed to render remaining consumer");
                ConnectionStatus::Disconnected
            }
        };
        if let Some(peer) = self.peers.get_mut(peer_user_id)
            && peer.connection_status != status
        {
            peer.connection_status = status;
            self.emit_peer_status(peer_user_id, status);
        }
    }

    fn peer_has_consumer(&self, peer_user_id: &str) -> bool {
        self.consumers
            .values()
            .any(|c| c.peer_user_id == peer_user_id)
    }

    fn drop_peer_if_unused(&mut self, peer_user_id: &str, status: ConnectionStatus) {
        if self.peer_has_consumer(peer_user_id) {
            return;
        }
        if self.peers.remove(peer_user_id).is_some() {
            self.emit_peer_status(peer_user_id, status);
        }
    }

    fn emit_peer_status(&self, peer_user_id: &str, status: ConnectionStatus) {
        self.emit(PipelineEvent::PeerStatusChanged {
            peer_user_id: peer_user_id.to_string(),
            status,
        });
    }

    // =========================================================================
    // Signaling Events
    // =========================================================================

    /// Apply one signaling event
    ///
    /// Events are applied in arrival order. Failures are logged.
    pub async fn handle_event(&mut self, event: SignalingEvent, settings: &AudioSettings) {
        match event {
            SignalingEvent::SessionJoined { channel_id } => {
                if let Err(e) = self.join_room(&channel_id, settings).await {
                    warn!(channel_id, error = %e, "session setup failed");
                }
            }
            SignalingEvent::SessionLeft => self.leave_room(),
            SignalingEvent::NewProducer {
                peer_user_id,
                producer_id,
                channel_id,
            } => {
                if self.state != SessionState::Joined
                    || self.channel_id.as_deref() != Some(channel_id.as_str())
                {
                    debug!(producer_id, channel_id, "new producer outside current room ignored");
                    return;
                }
                if let Err(e) = self.consume(&producer_id, &peer_user_id, settings).await {
                    warn!(producer_id, peer = peer_user_id, error = %e, "failed to consume producer");
                }
            }
            SignalingEvent::ProducerClosed { producer_id, .. } => {
                self.close_consumer(&producer_id);
            }
        }
    }

    // =========================================================================
    // Peer Controls
    // =========================================================================

    /// Mute or unmute a peer locally without touching its consumer
    pub fn set_peer_muted(&mut self, peer_user_id: &str, muted: bool) -> bool {
        if let Some(peer) = self.peers.get_mut(peer_user_id) {
            peer.muted = muted;
        }
        self.remote.set_muted(peer_user_id, muted)
    }

    pub fn set_peer_volume(&mut self, peer_user_id: &str, volume: u8) -> bool {
        if let Some(peer) = self.peers.get_mut(peer_user_id) {
            peer.volume_percent = volume;
        }
        self.remote.set_volume(peer_user_id, volume)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn channel_id(&self) -> Option<&str> {
        self.channel_id.as_deref()
    }

    pub fn capabilities_loaded(&self) -> bool {
        self.capabilities_loaded
    }

    pub fn send_transport_id(&self) -> Option<&str> {
        self.send.as_ref().map(|s| s.transport.id())
    }

    pub fn recv_transport_id(&self) -> Option<&str> {
        self.recv.as_ref().map(|r| r.transport.id())
    }

    pub fn consumer(&self, producer_id: &str) -> Option<&Consumer> {
        self.consumers.get(producer_id)
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn peer_state(&self, peer_user_id: &str) -> Option<&PeerAudioState> {
        self.peers.get(peer_user_id)
    }

    pub fn local(&self) -> &LocalCaptureGraph {
        &self.local
    }

    pub fn local_mut(&mut self) -> &mut LocalCaptureGraph {
        &mut self.local
    }

    pub fn mix(&self) -> &MixCaptureGraph {
        &self.mix
    }

    pub fn mix_mut(&mut self) -> &mut MixCaptureGraph {
        &mut self.mix
    }

    pub fn remote(&self) -> &RemoteRenderGraph {
        &self.remote
    }
}

// =============================================================================
// Tests
// =============================================================================
