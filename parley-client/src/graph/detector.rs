//! RMS voice-activity detection
//!
//! Every participant with an analyser gets one detection loop: a tokio task
//! ticking every 16ms that turns the analyser's RMS into a 0-100 speaking
//! level. Loops are registered by id; starting a loop for an id that already
//! has one cancels the old loop first, and dropping the returned
//! [`DetectionHandle`] cancels the loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::trace;

use super::node::AnalyserNode;
use crate::events::PipelineEvent;

// =============================================================================
// Constants
// =============================================================================

/// Sampling period of a detection loop
pub const DETECTION_INTERVAL: Duration = Duration::from_millis(16);

/// Minimum time between two level reports for the same id
pub const REPORT_THROTTLE: Duration = Duration::from_millis(80);

/// Levels at or below this percentage are reported as silence
pub const SPEAKING_THRESHOLD_PERCENT: f32 = 2.0;

/// RMS that maps to a 100% level
const FULL_SCALE_RMS: f32 = 0.5;

// =============================================================================
// Level Math
// =============================================================================

/// Map an RMS value to a 0-100 percentage
pub fn level_percent(rms: f32) -> f32 {
    (rms / FULL_SCALE_RMS).min(1.0) * 100.0
}

/// Apply the speaking threshold: the level itself above it, 0 otherwise
pub fn speaking_level(percent: f32) -> f32 {
    if percent > SPEAKING_THRESHOLD_PERCENT {
        percent
    } else {
        0.0
    }
}

/// Whether a loop may report a non-zero level
#[derive(Debug, Clone)]
pub enum LevelGate {
    /// Remote peers and the mix path always report
    Always,
    /// The local user reports only while the mic is taken
    WhileTaken(Arc<AtomicBool>),
}

impl LevelGate {
    fn is_open(&self) -> bool {
        match self {
            LevelGate::Always => true,
            LevelGate::WhileTaken(taken) => taken.load(Ordering::SeqCst),
        }
    }
}

// =============================================================================
// Detector
// =============================================================================

struct LoopEntry {
    generation: u64,
    task: JoinHandle<()>,
}

struct DetectorInner {
    loops: Mutex<HashMap<String, LoopEntry>>,
    next_generation: AtomicU64,
    events: mpsc::UnboundedSender<PipelineEvent>,
}

impl DetectorInner {
    fn cancel(&self, id: &str, generation: Option<u64>) -> bool {
        let Ok(mut loops) = self.loops.lock() else {
            return false;
        };
        let matches = loops
            .get(id)
            .is_some_and(|entry| generation.is_none_or(|g| g == entry.generation));
        if !matches {
            return false;
        }
        if let Some(entry) = loops.remove(id) {
            entry.task.abort();
            trace!(id, "detection loop cancelled");
        }
        true
    }
}

impl Drop for DetectorInner {
    fn drop(&mut self) {
        if let Ok(mut loops) = self.loops.lock() {
            for (_, entry) in loops.drain() {
                entry.task.abort();
            }
        }
    }
}

/// Shared speaking detector
///
/// Cloning yields another handle to the same loop registry.
#[derive(Clone)]
pub struct SpeakingDetector {
    inner: Arc<DetectorInner>,
}

impl SpeakingDetector {
    /// Create a detector reporting levels on `events`
    pub fn new(events: mpsc::UnboundedSender<PipelineEvent>) -> Self {
        Self {
            inner: Arc::new(DetectorInner {
                loops: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                events,
            }),
        }
    }

    /// Start a detection loop for `id`
    ///
    /// Must be called from within a tokio runtime. Any loop already running
    /// for `id` is cancelled first.
    pub fn detect(&self, id: &str, analyser: Arc<AnalyserNode>, gate: LevelGate) -> DetectionHandle {
        self.inner.cancel(id, None);

        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        let task = tokio::spawn(run_detection(
            id.to_string(),
            analyser,
            gate,
            self.inner.events.clone(),
        ));
        if let Ok(mut loops) = self.inner.loops.lock() {
            loops.insert(id.to_string(), LoopEntry { generation, task });
        }

        trace!(id, generation, "detection loop started");
        DetectionHandle {
            id: id.to_string(),
            generation,
            detector: Arc::downgrade(&self.inner),
        }
    }

    /// Cancel whatever loop is running for `id`
    pub fn cancel(&self, id: &str) -> bool {
        self.inner.cancel(id, None)
    }

    /// Number of running loops
    pub fn active_loops(&self) -> usize {
        self.inner.loops.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.inner
            .loops
            .lock()
            .map(|l| l.contains_key(id))
            .unwrap_or(false)
    }
}

/// Cancels its detection loop when cancelled or dropped
///
/// A handle only ever cancels the loop it started, never a newer loop
/// registered under the same id.
#[derive(Debug)]
pub struct DetectionHandle {
    id: String,
    generation: u64,
    detector: Weak<DetectorInner>,
}

impl DetectionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Stop the loop
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for DetectionHandle {
    fn drop(&mut self) {
        if let Some(detector) = self.detector.upgrade() {
            detector.cancel(&self.id, Some(self.generation));
        }
    }
}

impl std::fmt::Debug for DetectorInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorInner").finish_non_exhaustive()
    }
}

async fn run_detection(
    id: String,
    analyser: Arc<AnalyserNode>,
    gate: LevelGate,
    events: mpsc::UnboundedSender<PipelineEvent>,
) {
    let mut ticker = interval(DETECTION_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut last_report: Option<(Instant, f32)> = None;
    loop {
        ticker.tick().await;

        let level = if gate.is_open() {
            speaking_level(level_percent(analyser.rms()))
        } else {
            0.0
        };

        let now = Instant::now();
        if let Some((at, previous)) = last_report
            && (now.duration_since(at) < REPORT_THROTTLE || previous == level)
        {
            continue;
        }
        last_report = Some((now, level));

        let event = PipelineEvent::SpeakingLevel {
            id: id.clone(),
            percent: level,
        };
        if events.send(event).is_err() {
            break;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> (SpeakingDetector, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SpeakingDetector::new(tx), rx)
    }

    #[test]
    fn test_threshold_boundary() {
        assert_eq!(speaking_level(2.0), 0.0);
        assert_eq!(speaking_level(2.01), 2.01);
        assert_eq!(speaking_level(0.0), 0.0);
    }

    #[test]
    fn test_level_percent_saturates() {
        assert_eq!(level_percent(0.0), 0.0);
        assert_eq!(level_percent(0.25), 50.0);
        assert_eq!(level_percent(0.5), 100.0);
        assert_eq!(level_percent(2.0), 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_level_and_gate() {
        let (detector, mut rx) = detector();
        let analyser = Arc::new(AnalyserNode::new());
        analyser.push(&[0.25; 2048]);
        let taken = Arc::new(AtomicBool::new(true));

        let _handle = detector.detect("alice", analyser, LevelGate::WhileTaken(taken.clone()));

        let first = rx.recv().await.unwrap();
        assert_eq!(
            first,
            PipelineEvent::SpeakingLevel {
                id: "alice".to_string(),
                percent: 50.0
            }
        );

        // Releasing the mic forces 0 regardless of the measured level
        taken.store(false, Ordering::SeqCst);
        let second = rx.recv().await.unwrap();
        assert_eq!(
            second,
            PipelineEvent::SpeakingLevel {
                id: "alice".to_string(),
                percent: 0.0
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_are_throttled() {
        let (detector, mut rx) = detector();
        let analyser = Arc::new(AnalyserNode::new());
        let _handle = detector.detect("bob", analyser.clone(), LevelGate::Always);

        let start = Instant::now();
        rx.recv().await.unwrap();
        analyser.push(&[0.5; 2048]);
        rx.recv().await.unwrap();
        assert!(Instant::now().duration_since(start) >= REPORT_THROTTLE);
    }

    #[tokio::test]
    async fn test_redetect_replaces_loop() {
        let (detector, _rx) = detector();
        let analyser = Arc::new(AnalyserNode::new());

        let old = detector.detect("peer", analyser.clone(), LevelGate::Always);
        let new = detector.detect("peer", analyser, LevelGate::Always);
        assert_eq!(detector.active_loops(), 1);

        // The stale handle must not cancel the replacement loop
        old.cancel();
        assert!(detector.is_running("peer"));

        new.cancel();
        assert_eq!(detector.active_loops(), 0);
    }

    #[tokio::test]
    async fn test_dropping_handle_cancels() {
        let (detector, _rx) = detector();
        {
            let _handle = detector.detect("mix", Arc::new(AnalyserNode::new()), LevelGate::Always);
            assert_eq!(detector.active_loops(), 1);
        }
        assert_eq!(detector.active_loops(), 0);
    }
}
