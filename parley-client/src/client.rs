//! Voice client facade
//!
//! [`VoiceClient`] is the single entry point the host UI talks to. It owns
//! the settings store, the shared audio context, the speaking detector, the
//! session manager (and through it every graph) and the recording
//! controller. Every operation logs and swallows pipeline errors: the host
//! only ever sees a `bool`/`Option` result and the [`PipelineEvent`] stream.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use parley_common::protocol::SignalingEvent;

use crate::config::{AudioSettings, RecordFormat, SettingsStore, SpeakingMode};
use crate::events::PipelineEvent;
use crate::graph::{AudioContextManager, CaptureChain, SpeakingDetector};
use crate::media::{AudioBackend, AudioDevice};
use crate::ptt::PttState;
use crate::recording::{ArtifactSink, RecordingArtifact, RecordingController};
use crate::session::{MediaDevice, SessionState, TransportSessionManager};
use crate::signaling::Signaling;

/// External collaborators the client is built on
pub struct ClientSeams {
    /// Platform audio (capture and output)
    pub backend: Arc<dyn AudioBackend>,
    /// Request channel to the media server
    pub signaling: Arc<dyn Signaling>,
    /// Client-side media engine
    pub device: Arc<dyn MediaDevice>,
    /// Where recordings are delivered
    pub artifacts: Box<dyn ArtifactSink>,
}

pub struct VoiceClient {
    settings: SettingsStore,
    contexts: Arc<AudioContextManager>,
    _detector: SpeakingDetector,
    session: TransportSessionManager,
    recording: RecordingController,
    events: mpsc::UnboundedSender<PipelineEvent>,
}

impl VoiceClient {
    /// Create a client
    ///
    /// Must be called from within a tokio runtime; the render clock starts
    /// with the audio context on first use.
    ///
    /// # Arguments
    /// * `local_user_id` - Id used for the local speaking indicator
    /// * `settings` - Persisted settings store
    /// * `seams` - Audio platform, signaling, media engine and artifact sink
    ///
    /// # Returns
    /// The client and the receiver of pipeline events
    pub fn new(
        local_user_id: &str,
        settings: SettingsStore,
        seams: ClientSeams,
    ) -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        Self::build(local_user_id, settings, seams, true)
    }

    pub(crate) fn build(
        local_user_id: &str,
        settings: SettingsStore,
        seams: ClientSeams,
        run_clock: bool,
    ) -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let current = settings.settings().clone();

        let contexts = Arc::new(AudioContextManager::new(
            seams.backend,
            &current.output_device,
            current.speaker_volume,
            run_clock,
        ));
        let detector = SpeakingDetector::new(events.clone());
        let session = TransportSessionManager::new(
            seams.signaling,
            seams.device,
            contexts.clone(),
            detector.clone(),
            local_user_id,
            &current,
            events.clone(),
        );
        let recording = RecordingController::new(contexts.clone(), seams.artifacts);

        let client = Self {
            settings,
            contexts,
            _detector: detector,
            session,
            recording,
            events,
        };
        (client, event_rx)
    }

    fn emit(&self, event: PipelineEvent) {
        let _ = self.events.send(event);
    }

    // =========================================================================
    // Signaling
    // =========================================================================

    /// Apply a signaling event (join, leave, new or closed producer)
    pub async fn handle_signaling_event(&mut self, event: SignalingEvent) {
        self.session
            .handle_event(event, self.settings.settings())
            .await;
    }

    // =========================================================================
    // Floor & Push-to-talk
    // =========================================================================

    /// The local user took the floor; the producer resumes
    pub fn take_mic(&mut self) {
        self.session.local_mut().set_mic_taken(true);
    }

    /// The local user released the floor; the producer pauses
    pub fn release_mic(&mut self) {
        self.session.local_mut().set_mic_taken(false);
    }

    /// Push-to-talk key pressed; ignored in automatic mode
    pub fn ptt_key_down(&mut self) -> bool {
        self.session.local_mut().set_key_held(true)
    }

    /// Push-to-talk key released; ignored in automatic mode
    pub fn ptt_key_up(&mut self) -> bool {
        self.session.local_mut().set_key_held(false)
    }

    /// Apply a state change reported by [`crate::ptt::PttManager`]
    pub fn handle_ptt(&mut self, state: PttState) -> bool {
        self.session
            .local_mut()
            .set_key_held(state.is_transmitting())
    }

    pub fn set_speaking_mode(&mut self, mode: SpeakingMode) {
        self.settings.set_speaking_mode(mode);
        self.session.local_mut().set_speaking_mode(mode);
    }

    // =========================================================================
    // Peers
    // =========================================================================

    /// Locally mute a peer; the consumer stays up
    pub fn mute_peer(&mut self, peer_user_id: &str) -> bool {
        self.settings.mute_user(peer_user_id);
        self.session.set_peer_muted(peer_user_id, true)
    }

    pub fn unmute_peer(&mut self, peer_user_id: &str) -> bool {
        self.settings.unmute_user(peer_user_id);
        self.session.set_peer_muted(peer_user_id, false)
    }

    pub fn set_peer_volume(&mut self, peer_user_id: &str, volume: u8) -> bool {
        self.settings.set_peer_volume(peer_user_id, volume);
        self.session.set_peer_volume(peer_user_id, volume)
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    /// Set the mic volume; zero mutes and remembers the previous level
    pub fn set_mic_volume(&mut self, volume: u8) {
        self.settings.set_mic_volume(volume);
        self.apply_mic_volume();
    }

    /// Mute the mic, or restore the volume it had before muting
    pub fn toggle_mic_mute(&mut self) {
        self.settings.toggle_mic_mute();
        self.apply_mic_volume();
    }

    fn apply_mic_volume(&self) {
        let settings = self.settings.settings();
        let volume = if settings.mic_muted {
            0
        } else {
            settings.mic_volume
        };
        self.session.local().set_mic_volume(volume);
    }

    pub fn set_speaker_volume(&mut self, volume: u8) {
        self.settings.set_speaker_volume(volume);
        if let Some(context) = self.contexts.get() {
            context.set_speaker_volume(self.settings.settings().speaker_volume);
        }
    }

    pub fn set_mix_volume(&mut self, volume: u8) {
        self.settings.set_mix_volume(volume);
        self.session
            .mix()
            .set_volume(self.settings.settings().mix_volume);
    }

    // =========================================================================
    // Devices
    // =========================================================================

    pub fn input_devices(&self) -> Vec<AudioDevice> {
        self.contexts.backend().list_input_devices()
    }

    pub fn output_devices(&self) -> Vec<AudioDevice> {
        self.contexts.backend().list_output_devices()
    }

    /// Switch the microphone
    ///
    /// The new device is captured before the current chain is touched, so a
    /// failed capture leaves the previous microphone running.
    pub async fn set_input_device(&mut self, device: &str) -> bool {
        self.settings.set_input_device(device);
        if !self.session.local().has_microphone() {
            return true;
        }
        let switched = self
            .session
            .capture_microphone(self.settings.settings())
            .await;
        if switched {
            self.apply_mic_volume();
            info!(device, "input device switched");
        }
        switched
    }

    /// Switch the speaker; the previous output stays on failure
    pub fn set_output_device(&mut self, device: &str) -> bool {
        match self.contexts.set_output_device(device) {
            Ok(()) => {
                self.settings.set_output_device(device);
                true
            }
            Err(e) => {
                warn!(device, error = %e, "failed to switch output device");
                false
            }
        }
    }

    // =========================================================================
    // Mix Mode
    // =========================================================================

    /// Start or stop system-audio capture; returns whether mix is now active
    pub async fn toggle_mix(&mut self) -> bool {
        if self.session.mix_mut().stop_mix() {
            self.emit(PipelineEvent::MixModeChanged { active: false });
            return false;
        }

        let volume = self.settings.settings().mix_volume;
        match self.session.mix_mut().start_mix(volume).await {
            Ok(_) => {
                self.emit(PipelineEvent::MixModeChanged { active: true });
                true
            }
            Err(e) => {
                warn!(error = %e, "failed to start mix mode");
                false
            }
        }
    }

    // =========================================================================
    // Recording
    // =========================================================================

    pub fn set_record_format(&mut self, format: RecordFormat) {
        self.settings.set_record_format(format);
    }

    pub fn start_recording(&mut self) -> bool {
        let format = self.settings.settings().record_format;
        match self.recording.start(
            self.session.local().chain(),
            self.session.mix().chain(),
            format,
        ) {
            Ok(true) => {
                self.emit(PipelineEvent::RecordingStarted);
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(error = %e, "failed to start recording");
                false
            }
        }
    }

    pub fn stop_recording(&mut self) -> Option<RecordingArtifact> {
        let chains: Vec<&Arc<CaptureChain>> = [self.session.local().chain(), self.session.mix().chain()]
            .into_iter()
            .flatten()
            .collect();

        match self.recording.stop(&chains) {
            Ok(Some(artifact)) => {
                self.emit(PipelineEvent::RecordingSaved {
                    name: artifact.name.clone(),
                    path: artifact.path.clone(),
                });
                Some(artifact)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "failed to save recording");
                None
            }
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_active()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Release everything: recording, session, graphs and the output device
    pub fn shutdown(&mut self) {
        self.stop_recording();
        self.session.leave_room();
        if self.session.mix_mut().stop_mix() {
            self.emit(PipelineEvent::MixModeChanged { active: false });
        }
        self.session.local_mut().detach();
        self.contexts.shutdown();
        info!("voice client shut down");
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn settings(&self) -> &AudioSettings {
        self.settings.settings()
    }

    pub fn subscribe_settings(&self) -> watch::Receiver<AudioSettings> {
        self.settings.subscribe()
    }

    pub fn session(&self) -> &TransportSessionManager {
        &self.session
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn recording(&self) -> &RecordingController {
        &self.recording
    }
}

// =============================================================================
// Tests
// =============================================================================
