//! Per-peer playback graph
//!
//! Each connected peer gets `consumer track -> gain -> analyser -> master`.
//! Muting only flips the track's enabled flag; the chain stays in place.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::AudioContextManager;
use super::detector::{LevelGate, SpeakingDetector};
use super::node::CaptureChain;
use crate::config::audio::linear_gain;
use crate::error::{PipelineError, PipelineResult};
use crate::media::{MediaStream, MediaTrack};

pub struct RemoteRenderGraph {
    contexts: Arc<AudioContextManager>,
    detector: SpeakingDetector,
    /// Render chains keyed by peer user id
    peers: HashMap<String, Arc<CaptureChain>>,
}

impl RemoteRenderGraph {
    pub fn new(contexts: Arc<AudioContextManager>, detector: SpeakingDetector) -> Self {
        Self {
            contexts,
            detector,
            peers: HashMap::new(),
        }
    }

    /// Build the render chain for a peer, replacing any previous one
    ///
    /// # Arguments
    /// * `peer_user_id` - Peer whose audio this is (also the detection id)
    /// * `stream` - Decoded inbound stream
    /// * `muted` - Whether the peer is in the local mute list
    /// * `volume` - Peer playback volume, 0-100
    pub fn attach_peer(
        &mut self,
        peer_user_id: &str,
        stream: MediaStream,
        muted: bool,
        volume: u8,
    ) -> PipelineResult<()> {
        let context = self.contexts.ensure_initialized().ok_or_else(|| {
            PipelineError::ContextUnavailable("peer not rendered".to_string())
        })?;

        self.detach_peer(peer_user_id);

        stream.set_enabled(!muted);
        let chain = CaptureChain::build(stream, linear_gain(volume));
        chain.connect(context.master());
        chain.set_detection(
            self.detector
                .detect(peer_user_id, chain.analyser(), LevelGate::Always),
        );
        self.peers.insert(peer_user_id.to_string(), chain);

        debug!(peer = peer_user_id, muted, volume, "peer attached");
        Ok(())
    }

    /// Cancel detection and release the chain of a peer
    pub fn detach_peer(&mut self, peer_user_id: &str) -> bool {
        match self.peers.remove(peer_user_id) {
            Some(chain) => {
                chain.teardown();
                debug!(peer = peer_user_id, "peer detached");
                true
            }
            None => false,
        }
    }

    pub fn detach_all(&mut self) {
        for (_, chain) in self.peers.drain() {
            chain.teardown();
        }
    }

    /// Enable or disable the peer's inbound track
    pub fn set_muted(&self, peer_user_id: &str, muted: bool) -> bool {
        match self.peers.get(peer_user_id) {
            Some(chain) => {
                chain.stream().set_enabled(!muted);
                true
            }
            None => false,
        }
    }

    pub fn set_volume(&self, peer_user_id: &str, volume: u8) -> bool {
        match self.peers.get(peer_user_id) {
            Some(chain) => {
                chain.gain().set_gain(linear_gain(volume));
                true
            }
            None => false,
        }
    }

    pub fn is_attached(&self, peer_user_id: &str) -> bool {
        self.peers.contains_key(peer_user_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn chain(&self, peer_user_id: &str) -> Option<&Arc<CaptureChain>> {
        self.peers.get(peer_user_id)
    }

    /// First inbound track of a peer
    pub fn track(&self, peer_user_id: &str) -> Option<MediaTrack> {
        self.peers
            .get(peer_user_id)
            .and_then(|chain| chain.stream().tracks().first().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, test_detector};
    use parley_common::audio::SAMPLES_PER_QUANTUM;

    fn graph(backend: &Arc<FakeBackend>) -> (RemoteRenderGraph, Arc<AudioContextManager>, SpeakingDetector) {
        let contexts = Arc::new(AudioContextManager::new(backend.clone(), "", 100, false));
        let detector = test_detector();
        (
            RemoteRenderGraph::new(contexts.clone(), detector.clone()),
            contexts,
            detector,
        )
    }

    #[tokio::test]
    async fn test_attach_renders_into_master() {
        let backend = Arc::new(FakeBackend::new());
        let (mut remote, contexts, detector) = graph(&backend);
        let track = MediaTrack::new("peer");

        remote
            .attach_peer("bob", MediaStream::single(track.clone()), false, 50)
            .unwrap();
        assert!(detector.is_running("bob"));

        track.write(&[0.4; SAMPLES_PER_QUANTUM]);
        contexts.get().unwrap().render_quantum();
        assert!(backend.played().iter().all(|s| (*s - 0.2).abs() < 1e-6));
    }

    #[tokio::test]
    async fn test_mute_round_trip_keeps_chain() {
        let backend = Arc::new(FakeBackend::new());
        let (mut remote, _contexts, _detector) = graph(&backend);
        let track = MediaTrack::new("peer");
        remote
            .attach_peer("bob", MediaStream::single(track.clone()), false, 100)
            .unwrap();
        let chain_id = remote.chain("bob").unwrap().id();

        assert!(remote.set_muted("bob", true));
        assert!(!track.is_enabled());
        assert!(remote.set_muted("bob", false));
        assert!(track.is_enabled());
        assert_eq!(remote.chain("bob").unwrap().id(), chain_id);
    }

    #[tokio::test]
    async fn test_attach_applies_mute_list() {
        let backend = Arc::new(FakeBackend::new());
        let (mut remote, _contexts, _detector) = graph(&backend);
        let track = MediaTrack::new("peer");
        remote
            .attach_peer("eve", MediaStream::single(track.clone()), true, 100)
            .unwrap();
        assert!(!track.is_enabled());
    }

    #[tokio::test]
    async fn test_reattach_and_detach_cancel_loops() {
        let backend = Arc::new(FakeBackend::new());
        let (mut remote, _contexts, detector) = graph(&backend);
        let first = MediaTrack::new("peer");

        remote
            .attach_peer("bob", MediaStream::single(first.clone()), false, 100)
            .unwrap();
        remote
            .attach_peer("bob", MediaStream::single(MediaTrack::new("peer")), false, 100)
            .unwrap();
        assert!(!first.is_live());
        assert_eq!(detector.active_loops(), 1);

        assert!(remote.detach_peer("bob"));
        assert!(!remote.detach_peer("bob"));
        assert_eq!(detector.active_loops(), 0);
        assert_eq!(remote.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_set_volume_adjusts_gain_only() {
        let backend = Arc::new(FakeBackend::new());
        let (mut remote, _contexts, _detector) = graph(&backend);
        remote
            .attach_peer("bob", MediaStream::single(MediaTrack::new("peer")), false, 100)
            .unwrap();

        assert!(remote.set_volume("bob", 30));
        assert!((remote.chain("bob").unwrap().gain().gain() - 0.3).abs() < 1e-6);
        assert!(!remote.set_volume("nobody", 30));
    }
}
