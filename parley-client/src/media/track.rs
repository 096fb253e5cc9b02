//! Media tracks and streams
//!
//! A [`MediaTrack`] is the unit every source hands to the graph: capture
//! devices, decoded consumers and the outbound mix all look the same. A
//! track forwards the samples written to it to a single downstream sink.
//! Disabled tracks forward silence; stopped tracks forward nothing and
//! release the hardware behind them.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

/// Receives samples from a track
pub trait TrackSink: Send + Sync {
    /// Accept a block of mono f32 samples
    fn accept(&self, samples: &[f32]);
}

/// Called exactly once when a track stops, to release its source
type ReleaseHook = Box<dyn FnOnce() + Send>;

struct TrackInner {
    id: Uuid,
    label: String,
    enabled: AtomicBool,
    ended: AtomicBool,
    sink: Mutex<Option<Arc<dyn TrackSink>>>,
    release: Mutex<Option<ReleaseHook>>,
}

/// Handle to a mono audio track
///
/// Cloning yields another handle to the same track.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    /// Create a live, enabled track with no release hook
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: Uuid::new_v4(),
                label: label.into(),
                enabled: AtomicBool::new(true),
                ended: AtomicBool::new(false),
                sink: Mutex::new(None),
                release: Mutex::new(None),
            }),
        }
    }

    /// Create a track whose source is released by `release` on stop
    pub fn with_release(label: impl Into<String>, release: impl FnOnce() + Send + 'static) -> Self {
        let track = Self::new(label);
        if let Ok(mut slot) = track.inner.release.lock() {
            *slot = Some(Box::new(release));
        }
        track
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable the track (disabled tracks emit silence)
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether the track has not been stopped
    pub fn is_live(&self) -> bool {
        !self.inner.ended.load(Ordering::SeqCst)
    }

    /// Stop the track
    ///
    /// Idempotent: the sink is detached and the release hook runs only on
    /// the first call.
    pub fn stop(&self) {
        if self.inner.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut sink) = self.inner.sink.lock() {
            sink.take();
        }
        let hook = self.inner.release.lock().ok().and_then(|mut h| h.take());
        if let Some(hook) = hook {
            hook();
        }
    }

    /// Attach (or detach with `None`) the downstream sink
    ///
    /// Ignored once the track has stopped.
    pub fn set_sink(&self, sink: Option<Arc<dyn TrackSink>>) {
        if !self.is_live() {
            return;
        }
        if let Ok(mut slot) = self.inner.sink.lock() {
            *slot = sink;
        }
    }

    /// Whether a sink is attached
    pub fn has_sink(&self) -> bool {
        self.inner
            .sink
            .lock()
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    /// Push samples from the source into the track
    pub fn write(&self, samples: &[f32]) {
        if !self.is_live() {
            return;
        }
        // Clone the sink out so the lock isn't held while it runs
        let sink = self.inner.sink.lock().ok().and_then(|s| s.clone());
        let Some(sink) = sink else {
            return;
        };

        if self.is_enabled() {
            sink.accept(samples);
        } else {
            sink.accept(&vec![0.0; samples.len()]);
        }
    }

    /// Whether two handles refer to the same track
    pub fn same_track(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// A group of tracks obtained from one capture request or one consumer
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: Uuid,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tracks,
        }
    }

    /// Stream with a single track
    pub fn single(track: MediaTrack) -> Self {
        Self::new(vec![track])
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    /// Whether any track is still live
    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(MediaTrack::is_live)
    }

    /// Set every track's enabled flag
    pub fn set_enabled(&self, enabled: bool) {
        for track in &self.tracks {
            track.set_enabled(enabled);
        }
    }

    /// Stop every track
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
