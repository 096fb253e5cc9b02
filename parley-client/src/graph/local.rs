//! Local microphone capture graph
//!
//! `mic -> gain -> analyser -> input bus -> outbound track -> producer`.
//! The graph also owns the single outbound producer and the "mic taken"
//! flag (whether the user currently holds the floor).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use super::context::AudioContext;
use super::detector::{LevelGate, SpeakingDetector};
use super::node::CaptureChain;
use super::AudioContextManager;
use crate::config::audio::{SpeakingMode, mic_gain};
use crate::error::{PipelineError, PipelineResult};
use crate::media::{MediaStream, MediaTrack};
use crate::session::engine::{Producer, SendTransport};

/// Label of outbound tracks handed to the producer
const OUTBOUND_TRACK_LABEL: &str = "outbound";

pub struct LocalCaptureGraph {
    contexts: Arc<AudioContextManager>,
    detector: SpeakingDetector,
    /// Detection id of the local user
    local_user_id: String,
    chain: Option<Arc<CaptureChain>>,
    /// Track the input bus renders into; feeds the producer
    outbound: Option<MediaTrack>,
    /// The only outbound producer
    producer: Option<Box<dyn Producer>>,
    mic_taken: Arc<AtomicBool>,
    speaking_mode: SpeakingMode,
    key_held: bool,
}

impl LocalCaptureGraph {
    pub fn new(
        contexts: Arc<AudioContextManager>,
        detector: SpeakingDetector,
        local_user_id: &str,
        speaking_mode: SpeakingMode,
    ) -> Self {
        Self {
            contexts,
            detector,
            local_user_id: local_user_id.to_string(),
            chain: None,
            outbound: None,
            producer: None,
            mic_taken: Arc::new(AtomicBool::new(false)),
            speaking_mode,
            key_held: false,
        }
    }

    // =========================================================================
    // Microphone
    // =========================================================================

    /// Attach a freshly captured microphone stream
    ///
    /// Tears down the previous chain (detection loop included), builds the
    /// new one with gain `mic_volume / 20`, and swaps the producer's track.
    /// If the swap is rejected the producer keeps its previous track.
    ///
    /// # Arguments
    /// * `stream` - Captured microphone stream (stopped if the context is disabled)
    /// * `mic_volume` - Persisted mic volume, 0-100
    pub async fn attach_microphone(&mut self, stream: MediaStream, mic_volume: u8) -> PipelineResult<()> {
        let Some(context) = self.contexts.ensure_initialized() else {
            stream.stop_all();
            return Err(PipelineError::ContextUnavailable(
                "microphone not attached".to_string(),
            ));
        };

        // Carry the previous chain's routing over (recording bus included)
        let buses = match self.chain.take() {
            Some(old) => {
                let buses = old.connected_buses();
                old.teardown();
                buses
            }
            None => vec![context.input().clone()],
        };

        let chain = CaptureChain::build(stream, mic_gain(mic_volume));
        for bus in &buses {
            chain.connect(bus);
        }
        chain.set_detection(self.detector.detect(
            &self.local_user_id,
            chain.analyser(),
            LevelGate::WhileTaken(self.mic_taken.clone()),
        ));
        self.chain = Some(chain);

        let track = MediaTrack::new(OUTBOUND_TRACK_LABEL);
        match &self.producer {
            Some(producer) => match producer.replace_track(track.clone()).await {
                Ok(()) => self.install_outbound(&context, track),
                Err(e) => {
                    warn!(error = %e, "failed to replace outbound track, keeping previous");
                    track.stop();
                }
            },
            None => self.install_outbound(&context, track),
        }

        self.apply_gating();
        self.sync_producer();
        debug!(volume = mic_volume, "microphone attached");
        Ok(())
    }

    /// Tear down the microphone chain, leaving the producer in place
    pub fn detach_microphone(&mut self) {
        if let Some(chain) = self.chain.take() {
            chain.teardown();
            debug!("microphone detached");
        }
    }

    pub fn set_mic_volume(&self, volume: u8) {
        if let Some(chain) = &self.chain {
            chain.gain().set_gain(mic_gain(volume));
        }
    }

    fn install_outbound(&mut self, context: &AudioContext, track: MediaTrack) {
        if let Some(previous) = self.outbound.replace(track.clone()) {
            previous.stop();
        }
        context.set_outbound_track(Some(track));
    }

    fn ensure_outbound(&mut self, context: &AudioContext) -> MediaTrack {
        match &self.outbound {
            Some(track) if track.is_live() => track.clone(),
            _ => {
                let track = MediaTrack::new(OUTBOUND_TRACK_LABEL);
                self.install_outbound(context, track.clone());
                self.apply_gating();
                track
            }
        }
    }

    // =========================================================================
    // Producer
    // =========================================================================

    /// Produce the outbound track on `transport`
    ///
    /// Any existing producer is closed first so at most one is ever live.
    pub async fn produce(&mut self, transport: &dyn SendTransport) -> PipelineResult<()> {
        self.close_producer();

        let context = self.contexts.ensure_initialized().ok_or_else(|| {
            PipelineError::ContextUnavailable("cannot produce".to_string())
        })?;
        let track = self.ensure_outbound(&context);

        let producer = transport.produce(track).await?;
        info!(producer_id = producer.id(), "producer created");
        self.producer = Some(producer);
        self.sync_producer();
        Ok(())
    }

    pub fn close_producer(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.close();
            info!(producer_id = producer.id(), "producer closed");
        }
    }

    /// Release everything: chain, outbound track and producer
    ///
    /// Also clears the floor and the push-to-talk key state.
    pub fn detach(&mut self) {
        self.detach_microphone();
        self.close_producer();
        if let Some(track) = self.outbound.take() {
            track.stop();
        }
        if let Some(context) = self.contexts.get() {
            context.set_outbound_track(None);
        }
        self.mic_taken.store(false, Ordering::SeqCst);
        self.key_held = false;
        self.apply_gating();
    }

    /// Resume the producer while the mic is taken, pause it otherwise
    fn sync_producer(&self) {
        if let Some(producer) = &self.producer {
            if self.is_mic_taken() {
                producer.resume();
            } else {
                producer.pause();
            }
        }
    }

    // =========================================================================
    // Floor & Gating
    // =========================================================================

    pub fn set_mic_taken(&mut self, taken: bool) {
        self.mic_taken.store(taken, Ordering::SeqCst);
        self.sync_producer();
    }

    pub fn is_mic_taken(&self) -> bool {
        self.mic_taken.load(Ordering::SeqCst)
    }

    pub fn set_speaking_mode(&mut self, mode: SpeakingMode) {
        self.speaking_mode = mode;
        self.key_held = false;
        self.apply_gating();
    }

    /// Push-to-talk key state; ignored in automatic mode
    pub fn set_key_held(&mut self, held: bool) -> bool {
        if self.speaking_mode != SpeakingMode::PushToTalk {
            return false;
        }
        self.key_held = held;
        self.apply_gating();
        true
    }

    fn apply_gating(&self) {
        let enabled = match self.speaking_mode {
            SpeakingMode::Automatic => true,
            SpeakingMode::PushToTalk => self.key_held,
        };
        if let Some(track) = &self.outbound {
            track.set_enabled(enabled);
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn chain(&self) -> Option<&Arc<CaptureChain>> {
        self.chain.as_ref()
    }

    pub fn has_microphone(&self) -> bool {
        self.chain.is_some()
    }

    pub fn producer(&self) -> Option<&dyn Producer> {
        self.producer.as_deref()
    }

    pub fn outbound_track(&self) -> Option<&MediaTrack> {
        self.outbound.as_ref()
    }
}

// =============================================================================
// Tests
// =============================================================================
