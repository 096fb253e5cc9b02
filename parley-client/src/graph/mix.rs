//! System-audio (mix mode) capture graph
//!
//! An independent `system audio -> gain -> analyser -> input bus` chain,
//! mixed with the microphone into the outbound track.

use std::sync::Arc;

use tracing::info;

use super::AudioContextManager;
use super::detector::{LevelGate, SpeakingDetector};
use super::node::CaptureChain;
use crate::config::audio::linear_gain;
use crate::constants::MIX_LEVEL_ID;
use crate::error::{PipelineError, PipelineResult};

pub struct MixCaptureGraph {
    contexts: Arc<AudioContextManager>,
    detector: SpeakingDetector,
    chain: Option<Arc<CaptureChain>>,
}

impl MixCaptureGraph {
    pub fn new(contexts: Arc<AudioContextManager>, detector: SpeakingDetector) -> Self {
        Self {
            contexts,
            detector,
            chain: None,
        }
    }

    /// Start capturing system audio
    ///
    /// Returns `Ok(false)` without doing anything if mix mode is already
    /// active. A capture failure leaves mix mode off.
    pub async fn start_mix(&mut self, mix_volume: u8) -> PipelineResult<bool> {
        if self.chain.is_some() {
            return Ok(false);
        }
        let context = self.contexts.ensure_initialized().ok_or_else(|| {
            PipelineError::ContextUnavailable("mix mode unavailable".to_string())
        })?;

        let stream = self.contexts.backend().capture_system_audio().await?;
        let chain = CaptureChain::build(stream, linear_gain(mix_volume));
        chain.connect(context.input());
        chain.set_detection(
            self.detector
                .detect(MIX_LEVEL_ID, chain.analyser(), LevelGate::Always),
        );
        self.chain = Some(chain);

        info!(volume = mix_volume, "mix mode started");
        Ok(true)
    }

    /// Stop capturing system audio; returns false if mix mode was not active
    pub fn stop_mix(&mut self) -> bool {
        let Some(chain) = self.chain.take() else {
            return false;
        };
        chain.teardown();
        info!("mix mode stopped");
        true
    }

    pub fn is_active(&self) -> bool {
        self.chain.is_some()
    }

    pub fn chain(&self) -> Option<&Arc<CaptureChain>> {
        self.chain.as_ref()
    }

    pub fn set_volume(&self, volume: u8) {
        if let Some(chain) = &self.chain {
            chain.gain().set_gain(linear_gain(volume));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, test_detector};

    fn graph(backend: &Arc<FakeBackend>) -> (MixCaptureGraph, SpeakingDetector) {
        let contexts = Arc::new(AudioContextManager::new(backend.clone(), "", 100, false));
        let detector = test_detector();
        (MixCaptureGraph::new(contexts, detector.clone()), detector)
    }

    #[tokio::test]
    async fn test_toggle_twice_releases_everything() {
        let backend = Arc::new(FakeBackend::new());
        let (mut mix, detector) = graph(&backend);

        assert!(mix.start_mix(100).await.unwrap());
        assert!(mix.is_active());
        assert_eq!(detector.active_loops(), 1);
        assert_eq!(backend.live_captures(), 1);

        assert!(mix.stop_mix());
        assert!(!mix.is_active());
        assert_eq!(detector.active_loops(), 0);
        assert_eq!(backend.live_captures(), 0);
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let backend = Arc::new(FakeBackend::new());
        let (mut mix, detector) = graph(&backend);

        assert!(!mix.stop_mix());
        assert!(mix.start_mix(50).await.unwrap());
        assert!(!mix.start_mix(50).await.unwrap());
        assert_eq!(backend.captures_started(), 1);
        assert_eq!(detector.active_loops(), 1);
        assert_eq!(mix.chain().unwrap().gain().gain(), 0.5);
    }

    #[tokio::test]
    async fn test_capture_failure_leaves_mix_off() {
        let backend = Arc::new(FakeBackend::new());
        backend.fail_system_audio(true);
        let (mut mix, detector) = graph(&backend);

        assert!(mix.start_mix(100).await.is_err());
        assert!(!mix.is_active());
        assert_eq!(detector.active_loops(), 0);
    }
}
