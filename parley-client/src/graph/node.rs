//! Processing nodes
//!
//! The graph is push-driven. Sources write into a [`CaptureChain`], which
//! applies its gain, feeds its analyser and queues the result on every
//! [`MixBus`] it is connected to. Buses are pulled by the render clock.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use parley_common::audio::SAMPLES_PER_QUANTUM;

use super::detector::DetectionHandle;
use crate::media::{MediaStream, TrackSink};

/// Identifies a node that can feed a bus
pub type NodeId = Uuid;

/// Size of the analyser's time-domain window in samples
pub const ANALYSER_WINDOW: usize = 1024;

/// Maximum queued audio per bus input, in quanta (prevents latency buildup)
const MAX_BUS_QUEUE_QUANTA: usize = 20;

/// Soft clipping to prevent harsh distortion when summing inputs
pub fn soft_clip(sample: f32) -> f32 {
    (sample * 0.7).tanh() / 0.7_f32.tanh()
}

// =============================================================================
// Gain
// =============================================================================

/// Linear gain stage, adjustable from any thread
#[derive(Debug)]
pub struct GainNode {
    bits: AtomicU32,
}

impl GainNode {
    pub fn new(gain: f32) -> Self {
        Self {
            bits: AtomicU32::new(gain.to_bits()),
        }
    }

    pub fn gain(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub fn set_gain(&self, gain: f32) {
        self.bits.store(gain.max(0.0).to_bits(), Ordering::Relaxed);
    }

    /// Apply the gain to a block of samples
    pub fn process(&self, samples: &[f32]) -> Vec<f32> {
        let gain = self.gain();
        samples.iter().map(|s| s * gain).collect()
    }
}

// =============================================================================
// Analyser
// =============================================================================

/// Keeps the most recent [`ANALYSER_WINDOW`] samples for level metering
#[derive(Debug)]
pub struct AnalyserNode {
    window: Mutex<VecDeque<f32>>,
}

impl Default for AnalyserNode {
    fn default() -> Self {
        Self {
            window: Mutex::new(VecDeque::from(vec![0.0; ANALYSER_WINDOW])),
        }
    }
}

impl AnalyserNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append samples, discarding the oldest beyond the window size
    pub fn push(&self, samples: &[f32]) {
        if let Ok(mut window) = self.window.lock() {
            window.extend(samples.iter().copied());
            let excess = window.len().saturating_sub(ANALYSER_WINDOW);
            window.drain(..excess);
        }
    }

    /// Snapshot of the time-domain buffer
    pub fn time_domain(&self) -> Vec<f32> {
        self.window
            .lock()
            .map(|w| w.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Root mean square over the window
    pub fn rms(&self) -> f32 {
        let data = self.time_domain();
        if data.is_empty() {
            return 0.0;
        }
        let sum: f32 = data.iter().map(|s| s * s).sum();
        (sum / data.len() as f32).sqrt()
    }
}

// =============================================================================
// Mix Bus
// =============================================================================

struct BusState {
    /// Queued samples per connected input
    queues: HashMap<NodeId, VecDeque<f32>>,
    /// Buses that receive a copy of every rendered quantum
    taps: Vec<Arc<MixBus>>,
}

/// Sums any number of inputs into one signal
///
/// Each input has its own queue so simultaneous sources are mixed rather
/// than concatenated. Samples queued by an input that is not connected are
/// dropped.
pub struct MixBus {
    id: NodeId,
    label: &'static str,
    gain: GainNode,
    state: Mutex<BusState>,
}

impl MixBus {
    pub fn new(label: &'static str) -> Self {
        Self {
            id: Uuid::new_v4(),
            label,
            gain: GainNode::new(1.0),
            state: Mutex::new(BusState {
                queues: HashMap::new(),
                taps: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Output gain applied after mixing
    pub fn gain(&self) -> &GainNode {
        &self.gain
    }

    pub fn connect_input(&self, input: NodeId) {
        if let Ok(mut state) = self.state.lock() {
            state.queues.entry(input).or_default();
        }
    }

    pub fn disconnect_input(&self, input: NodeId) {
        if let Ok(mut state) = self.state.lock() {
            state.queues.remove(&input);
        }
    }

    /// Disconnect every input and every tap
    pub fn disconnect_all(&self) {
        let taps = match self.state.lock() {
            Ok(mut state) => {
                state.queues.clear();
                std::mem::take(&mut state.taps)
            }
            Err(_) => return,
        };
        for tap in taps {
            tap.disconnect_input(self.id);
        }
    }

    pub fn has_input(&self, input: NodeId) -> bool {
        self.state
            .lock()
            .map(|s| s.queues.contains_key(&input))
            .unwrap_or(false)
    }

    /// Ids of the connected inputs
    pub fn inputs(&self) -> Vec<NodeId> {
        self.state
            .lock()
            .map(|s| s.queues.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Queue samples from a connected input
    pub fn queue(&self, input: NodeId, samples: &[f32]) {
        if let Ok(mut state) = self.state.lock()
            && let Some(queue) = state.queues.get_mut(&input)
        {
            queue.extend(samples.iter().copied());
            let max = SAMPLES_PER_QUANTUM * MAX_BUS_QUEUE_QUANTA;
            if queue.len() > max {
                let excess = queue.len() - max;
                queue.drain(..excess);
            }
        }
    }

    /// Route a copy of this bus's output into `target`
    pub fn add_tap(&self, target: &Arc<MixBus>) {
        target.connect_input(self.id);
        if let Ok(mut state) = self.state.lock()
            && !state.taps.iter().any(|t| t.id == target.id)
        {
            state.taps.push(target.clone());
        }
    }

    pub fn remove_tap(&self, target: NodeId) {
        let removed: Vec<Arc<MixBus>> = match self.state.lock() {
            Ok(mut state) => {
                let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.taps)
                    .into_iter()
                    .partition(|t| t.id == target);
                state.taps = kept;
                removed
            }
            Err(_) => return,
        };
        for tap in removed {
            tap.disconnect_input(self.id);
        }
    }

    pub fn has_tap(&self, target: NodeId) -> bool {
        self.state
            .lock()
            .map(|s| s.taps.iter().any(|t| t.id == target))
            .unwrap_or(false)
    }

    /// Mix `len` samples from every input and forward them to the taps
    ///
    /// Inputs short on data contribute silence for the missing part.
    pub fn render(&self, len: usize) -> Vec<f32> {
        let mut mixed = vec![0.0_f32; len];
        let taps = match self.state.lock() {
            Ok(mut state) => {
                let mut contributors = vec![0_u8; len];
                for queue in state.queues.values_mut() {
                    let take = len.min(queue.len());
                    for (i, sample) in queue.drain(..take).enumerate() {
                        mixed[i] += sample;
                        contributors[i] = contributors[i].saturating_add(1);
                    }
                }
                // Single sources pass through untouched
                for (sample, count) in mixed.iter_mut().zip(contributors) {
                    if count > 1 {
                        *sample = soft_clip(*sample);
                    }
                }
                state.taps.clone()
            }
            Err(_) => Vec::new(),
        };

        let gain = self.gain.gain();
        if gain != 1.0 {
            mixed.iter_mut().for_each(|s| *s *= gain);
        }

        for tap in taps {
            tap.queue(self.id, &mixed);
        }
        mixed
    }
}

impl std::fmt::Debug for MixBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MixBus")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("inputs", &self.inputs().len())
            .finish()
    }
}

// =============================================================================
// Capture Chain
// =============================================================================

/// `source -> gain -> analyser -> buses`
///
/// Owned exclusively by the graph that built it. [`CaptureChain::teardown`]
/// must run before the chain is replaced.
pub struct CaptureChain {
    id: NodeId,
    stream: MediaStream,
    gain: GainNode,
    analyser: Arc<AnalyserNode>,
    outputs: Mutex<Vec<Arc<MixBus>>>,
    detection: Mutex<Option<DetectionHandle>>,
}

impl CaptureChain {
    /// Build a chain over every track of `stream`
    pub fn build(stream: MediaStream, gain: f32) -> Arc<Self> {
        let chain = Arc::new(Self {
            id: Uuid::new_v4(),
            stream,
            gain: GainNode::new(gain),
            analyser: Arc::new(AnalyserNode::new()),
            outputs: Mutex::new(Vec::new()),
            detection: Mutex::new(None),
        });
        for track in chain.stream.tracks() {
            track.set_sink(Some(chain.clone() as Arc<dyn TrackSink>));
        }
        chain
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn stream(&self) -> &MediaStream {
        &self.stream
    }

    pub fn gain(&self) -> &GainNode {
        &self.gain
    }

    pub fn analyser(&self) -> Arc<AnalyserNode> {
        self.analyser.clone()
    }

    pub fn connect(&self, bus: &Arc<MixBus>) {
        bus.connect_input(self.id);
        if let Ok(mut outputs) = self.outputs.lock()
            && !outputs.iter().any(|b| b.id() == bus.id())
        {
            outputs.push(bus.clone());
        }
    }

    pub fn disconnect(&self, bus: NodeId) {
        let removed: Vec<Arc<MixBus>> = match self.outputs.lock() {
            Ok(mut outputs) => {
                let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut *outputs)
                    .into_iter()
                    .partition(|b| b.id() == bus);
                *outputs = kept;
                removed
            }
            Err(_) => Vec::new(),
        };
        for b in removed {
            b.disconnect_input(self.id);
        }
    }

    /// Buses this chain feeds
    pub fn connected_buses(&self) -> Vec<Arc<MixBus>> {
        self.outputs.lock().map(|o| o.clone()).unwrap_or_default()
    }

    pub fn is_connected_to(&self, bus: NodeId) -> bool {
        self.outputs
            .lock()
            .map(|o| o.iter().any(|b| b.id() == bus))
            .unwrap_or(false)
    }

    /// Attach the level detection loop; a previous handle is cancelled
    pub fn set_detection(&self, handle: DetectionHandle) {
        let previous = self
            .detection
            .lock()
            .ok()
            .and_then(|mut slot| slot.replace(handle));
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    /// Cancel detection, disconnect from every bus and stop all tracks
    ///
    /// Safe to call more than once.
    pub fn teardown(&self) {
        if let Some(handle) = self.detection.lock().ok().and_then(|mut d| d.take()) {
            handle.cancel();
        }
        let outputs = self
            .outputs
            .lock()
            .map(|mut o| std::mem::take(&mut *o))
            .unwrap_or_default();
        for bus in outputs {
            bus.disconnect_input(self.id);
        }
        self.stream.stop_all();
    }
}

impl TrackSink for CaptureChain {
    fn accept(&self, samples: &[f32]) {
        let processed = self.gain.process(samples);
        self.analyser.push(&processed);
        let outputs = self.outputs.lock().map(|o| o.clone()).unwrap_or_default();
        for bus in outputs {
            bus.queue(self.id, &processed);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
