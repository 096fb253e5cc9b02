//! Shared audio context
//!
//! One [`AudioContext`] exists per client. It owns the master bus (every
//! remote peer mixes into it, and it plays on the output device), the input
//! bus (microphone and system audio mix into the outbound track) and, once
//! recording has been used, the recording bus.
//!
//! [`AudioContextManager`] creates the context exactly once. If the output
//! device cannot be opened the context is disabled for the life of the
//! manager and every graph operation turns into a no-op.

use std::sync::{Arc, Mutex, Weak};

use once_cell::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use parley_common::audio::{QUANTUM_DURATION_MS, SAMPLES_PER_QUANTUM};

use super::node::MixBus;
use crate::config::audio::linear_gain;
use crate::error::{PipelineError, PipelineResult};
use crate::media::{AudioBackend, MediaTrack, OutputSink, TrackSink};

// =============================================================================
// Audio Context
// =============================================================================

pub struct AudioContext {
    master: Arc<MixBus>,
    input: Arc<MixBus>,
    recording: Mutex<Option<Arc<MixBus>>>,
    output: Mutex<Box<dyn OutputSink>>,
    outbound: Mutex<Option<MediaTrack>>,
    recorder: Mutex<Option<Arc<dyn TrackSink>>>,
    clock: Mutex<Option<JoinHandle<()>>>,
}

impl AudioContext {
    fn new(output: Box<dyn OutputSink>, speaker_volume: u8) -> Self {
        let master = Arc::new(MixBus::new("master"));
        master.gain().set_gain(linear_gain(speaker_volume));
        Self {
            master,
            input: Arc::new(MixBus::new("input")),
            recording: Mutex::new(None),
            output: Mutex::new(output),
            outbound: Mutex::new(None),
            recorder: Mutex::new(None),
            clock: Mutex::new(None),
        }
    }

    /// Bus every remote peer renders into; its gain is the speaker volume
    pub fn master(&self) -> &Arc<MixBus> {
        &self.master
    }

    /// Bus mixed into the outbound track
    pub fn input(&self) -> &Arc<MixBus> {
        &self.input
    }

    /// The recording bus, created on first use
    pub fn recording_bus(&self) -> Arc<MixBus> {
        match self.recording.lock() {
            Ok(mut slot) => slot
                .get_or_insert_with(|| Arc::new(MixBus::new("recording")))
                .clone(),
            Err(_) => Arc::new(MixBus::new("recording")),
        }
    }

    /// The recording bus if it has been created
    pub fn existing_recording_bus(&self) -> Option<Arc<MixBus>> {
        self.recording.lock().ok().and_then(|slot| slot.clone())
    }

    /// Set the track the input bus renders into
    pub fn set_outbound_track(&self, track: Option<MediaTrack>) {
        if let Ok(mut slot) = self.outbound.lock() {
            *slot = track;
        }
    }

    pub fn outbound_track(&self) -> Option<MediaTrack> {
        self.outbound.lock().ok().and_then(|slot| slot.clone())
    }

    /// Set the sink receiving rendered recording quanta
    pub fn set_recorder(&self, recorder: Option<Arc<dyn TrackSink>>) {
        if let Ok(mut slot) = self.recorder.lock() {
            *slot = recorder;
        }
    }

    pub fn set_speaker_volume(&self, volume: u8) {
        self.master.gain().set_gain(linear_gain(volume));
    }

    /// Swap the output device, closing the previous one
    pub fn replace_output(&self, output: Box<dyn OutputSink>) {
        let previous = match self.output.lock() {
            Ok(mut slot) => std::mem::replace(&mut *slot, output),
            Err(_) => return,
        };
        previous.close();
    }

    /// Render one quantum
    ///
    /// Order: master bus to the output device (and its taps), input bus to
    /// the outbound track, recording bus to the recorder.
    pub fn render_quantum(&self) {
        let played = self.master.render(SAMPLES_PER_QUANTUM);
        if let Ok(output) = self.output.lock() {
            output.write(&played);
            if let Some(err) = output.check_error() {
                warn!(error = %err, "audio output error");
            }
        }

        let sent = self.input.render(SAMPLES_PER_QUANTUM);
        if let Some(track) = self.outbound_track() {
            track.write(&sent);
        }

        if let Some(bus) = self.existing_recording_bus() {
            let recorded = bus.render(SAMPLES_PER_QUANTUM);
            let recorder = self.recorder.lock().ok().and_then(|r| r.clone());
            if let Some(recorder) = recorder {
                recorder.accept(&recorded);
            }
        }
    }

    /// Drive [`AudioContext::render_quantum`] from a tokio interval
    fn start_clock(self: &Arc<Self>) {
        let weak: Weak<AudioContext> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(QUANTUM_DURATION_MS));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
            loop {
                ticker.tick().await;
                let Some(context) = weak.upgrade() else {
                    break;
                };
                context.render_quantum();
            }
        });
        if let Ok(mut clock) = self.clock.lock() {
            *clock = Some(task);
        }
    }

    /// Stop the clock and release the output device
    pub fn shutdown(&self) {
        if let Some(clock) = self.clock.lock().ok().and_then(|mut c| c.take()) {
            clock.abort();
        }
        if let Ok(output) = self.output.lock() {
            output.close();
        }
        self.master.disconnect_all();
        self.input.disconnect_all();
        if let Some(bus) = self.existing_recording_bus() {
            bus.disconnect_all();
        }
    }
}

impl Drop for AudioContext {
    fn drop(&mut self) {
        if let Ok(mut clock) = self.clock.lock()
            && let Some(task) = clock.take()
        {
            task.abort();
        }
    }
}

// =============================================================================
// Context Manager
// =============================================================================

enum ContextState {
    Ready(Arc<AudioContext>),
    Disabled(String),
}

/// Creates and hands out the shared [`AudioContext`]
pub struct AudioContextManager {
    backend: Arc<dyn AudioBackend>,
    state: OnceCell<ContextState>,
    output_device: Mutex<String>,
    speaker_volume: u8,
    run_clock: bool,
}

impl AudioContextManager {
    /// Create a manager
    ///
    /// # Arguments
    /// * `backend` - Platform audio backend
    /// * `output_device` - Output device name (empty for system default)
    /// * `speaker_volume` - Initial master volume, 0-100
    /// * `run_clock` - Spawn the render clock on init (requires a tokio runtime)
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        output_device: &str,
        speaker_volume: u8,
        run_clock: bool,
    ) -> Self {
        Self {
            backend,
            state: OnceCell::new(),
            output_device: Mutex::new(output_device.to_string()),
            speaker_volume,
            run_clock,
        }
    }

    pub fn backend(&self) -> &Arc<dyn AudioBackend> {
        &self.backend
    }

    /// Create the context on first call; later calls return the same one
    ///
    /// Returns None if the pipeline is disabled.
    pub fn ensure_initialized(&self) -> Option<Arc<AudioContext>> {
        let state = self.state.get_or_init(|| {
            let device = self
                .output_device
                .lock()
                .map(|d| d.clone())
                .unwrap_or_default();
            match self.backend.open_output(&device) {
                Ok(output) => {
                    let context = Arc::new(AudioContext::new(output, self.speaker_volume));
                    if self.run_clock {
                        if tokio::runtime::Handle::try_current().is_ok() {
                            context.start_clock();
                        } else {
                            warn!("no tokio runtime, render clock not started");
                        }
                    }
                    info!(device = %device, "audio context initialized");
                    ContextState::Ready(context)
                }
                Err(e) => {
                    error!(error = %e, "audio context unavailable, pipeline disabled");
                    ContextState::Disabled(e.to_string())
                }
            }
        });

        match state {
            ContextState::Ready(context) => Some(context.clone()),
            ContextState::Disabled(_) => None,
        }
    }

    /// The context if it has been created successfully
    pub fn get(&self) -> Option<Arc<AudioContext>> {
        match self.state.get()? {
            ContextState::Ready(context) => Some(context.clone()),
            ContextState::Disabled(_) => None,
        }
    }

    /// Whether initialization has been attempted and failed
    pub fn is_disabled(&self) -> bool {
        matches!(self.state.get(), Some(ContextState::Disabled(_)))
    }

    /// Switch the output device
    ///
    /// On failure the current output stays in place. Before the context
    /// exists only the preferred device is remembered.
    pub fn set_output_device(&self, device: &str) -> PipelineResult<()> {
        match self.state.get() {
            Some(ContextState::Ready(context)) => {
                let output = self.backend.open_output(device)?;
                context.replace_output(output);
            }
            Some(ContextState::Disabled(reason)) => {
                return Err(PipelineError::ContextUnavailable(reason.clone()));
            }
            None => {}
        }
        if let Ok(mut current) = self.output_device.lock() {
            *current = device.to_string();
        }
        debug!(device, "output device set");
        Ok(())
    }

    pub fn output_device(&self) -> String {
        self.output_device
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    /// Stop the clock and release the output; used on application shutdown
    pub fn shutdown(&self) {
        if let Some(context) = self.get() {
            context.shutdown();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
