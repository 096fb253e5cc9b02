//! cpal implementation of the audio backend
//!
//! Provides device enumeration, microphone and system-audio capture, and
//! speaker playback. cpal's `Stream` is not `Send`, so every stream lives on a
//! dedicated OS thread that owns it until the track (or output) is closed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, Thread};
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Host, Sample, SampleFormat, Stream, StreamConfig};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use parley_common::audio::{SAMPLE_RATE, SAMPLES_PER_QUANTUM};

use super::backend::{
    AudioBackend, AudioDevice, DEVICE_OPEN_TIMEOUT, OutputSink, SYSTEM_DEFAULT_DEVICE_NAME,
    wait_for_device_thread,
};
use super::track::{MediaStream, MediaTrack};
use crate::error::{PipelineError, PipelineResult};

// =============================================================================
// Constants
// =============================================================================

/// Maximum playback buffer size in quanta (prevents latency buildup)
const MAX_PLAYBACK_BUFFER_QUANTA: usize = 20;

/// How long a stream thread sleeps between stop-flag checks
const STREAM_THREAD_PARK: Duration = Duration::from_millis(100);

/// Sample formats we can convert from/to
const SUPPORTED_FORMATS: [SampleFormat; 3] = [SampleFormat::F32, SampleFormat::I16, SampleFormat::U16];

// =============================================================================
// Device Enumeration
// =============================================================================

/// Get the default audio host for the platform
fn get_host() -> Host {
    cpal::default_host()
}

fn device_name(device: &Device) -> Option<String> {
    device.description().ok().map(|desc| desc.name().to_string())
}

fn collect_devices(devices: impl Iterator<Item = Device>) -> Vec<AudioDevice> {
    let mut list = vec![AudioDevice::system_default()];
    for device in devices {
        if let Some(name) = device_name(&device)
            && !list.iter().any(|d| d.name == name)
        {
            list.push(AudioDevice::new(name, false));
        }
    }
    list
}

fn is_default_name(name: &str) -> bool {
    name.is_empty() || name == SYSTEM_DEFAULT_DEVICE_NAME
}

/// Find an input device by name, or return the default
fn find_input_device(name: &str) -> Option<Device> {
    let host = get_host();
    if is_default_name(name) {
        return host.default_input_device();
    }
    host.input_devices()
        .ok()?
        .find(|d| device_name(d).is_some_and(|n| n == name))
        .or_else(|| host.default_input_device())
}

/// Find an output device by name, or return the default
fn find_output_device(name: &str) -> Option<Device> {
    let host = get_host();
    if is_default_name(name) {
        return host.default_output_device();
    }
    host.output_devices()
        .ok()?
        .find(|d| device_name(d).is_some_and(|n| n == name))
        .or_else(|| host.default_output_device())
}

/// Find a source carrying system audio
///
/// On Windows this is the default output device, opened in loopback mode by
/// WASAPI. Elsewhere it is a monitor input (PulseAudio/PipeWire naming).
fn find_system_audio_device() -> Option<Device> {
    let host = get_host();
    if cfg!(target_os = "windows") {
        return host.default_output_device();
    }
    host.input_devices().ok()?.find(|d| {
        device_name(d).is_some_and(|n| n.to_lowercase().contains("monitor"))
    })
}

// =============================================================================
// Stream Configuration
// =============================================================================

/// Pick a 48kHz mono config, falling back to stereo (downmixed/upmixed)
fn pick_config(device: &Device, input: bool) -> PipelineResult<(u16, SampleFormat)> {
    let configs: Vec<_> = if input {
        device.supported_input_configs()?.collect()
    } else {
        device.supported_output_configs()?.collect()
    };

    let find = |channels: u16| {
        configs.iter().find(|c| {
            c.channels() == channels
                && c.min_sample_rate() <= SAMPLE_RATE
                && c.max_sample_rate() >= SAMPLE_RATE
                && SUPPORTED_FORMATS.contains(&c.sample_format())
        })
    };

    if let Some(cfg) = find(1).or_else(|| find(2)) {
        return Ok((cfg.channels(), cfg.sample_format()));
    }

    let rates: Vec<String> = configs
        .iter()
        .map(|c| {
            if c.min_sample_rate() == c.max_sample_rate() {
                format!("{}Hz", c.min_sample_rate())
            } else {
                format!("{}-{}Hz", c.min_sample_rate(), c.max_sample_rate())
            }
        })
        .collect();
    Err(PipelineError::Device(format!(
        "Device doesn't support 48kHz. Device supports: {}",
        if rates.is_empty() {
            "unknown".to_string()
        } else {
            rates.join(", ")
        }
    )))
}

/// Loopback capture uses the output device's own mix format
#[cfg(target_os = "windows")]
fn loopback_config(device: &Device) -> PipelineResult<(u16, SampleFormat)> {
    let cfg = device
        .default_output_config()
        .map_err(|e| PipelineError::Device(e.to_string()))?;
    if cfg.sample_rate() != SAMPLE_RATE {
        return Err(PipelineError::Device(format!(
            "System audio runs at {}Hz, 48kHz required",
            cfg.sample_rate()
        )));
    }
    Ok((cfg.channels(), cfg.sample_format()))
}

fn stream_config(channels: u16) -> StreamConfig {
    StreamConfig {
        channels,
        sample_rate: SAMPLE_RATE,
        buffer_size: cpal::BufferSize::Default,
    }
}

// =============================================================================
// Capture
// =============================================================================

/// Build an input stream that downmixes to mono and writes into `track`
fn build_capture_stream<T>(
    device: &Device,
    channels: u16,
    track: MediaTrack,
) -> PipelineResult<Stream>
where
    T: Sample + cpal::SizedSample,
    f32: FromSample<T>,
{
    let config = stream_config(channels);
    let label = track.label().to_string();
    let channels = channels as usize;
    let stream = device.build_input_stream(
        &config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let mono: Vec<f32> = data
                .chunks_exact(channels)
                .map(|frame| {
                    frame.iter().map(|s| f32::from_sample(*s)).sum::<f32>() / channels as f32
                })
                .collect();
            track.write(&mono);
        },
        move |err| warn!(track = %label, error = %err, "audio capture error"),
        None,
    )?;
    Ok(stream)
}

fn build_capture_for_format(
    device: &Device,
    channels: u16,
    format: SampleFormat,
    track: MediaTrack,
) -> PipelineResult<Stream> {
    match format {
        SampleFormat::F32 => build_capture_stream::<f32>(device, channels, track),
        SampleFormat::I16 => build_capture_stream::<i16>(device, channels, track),
        SampleFormat::U16 => build_capture_stream::<u16>(device, channels, track),
        other => Err(PipelineError::Device(format!(
            "Unsupported sample format: {:?}",
            other
        ))),
    }
}

/// Keep `stream` alive on this thread until `stop` is set
fn hold_stream(stream: Stream, stop: &AtomicBool) {
    while !stop.load(Ordering::SeqCst) {
        thread::park_timeout(STREAM_THREAD_PARK);
    }
    drop(stream);
}

/// Open a capture stream on a dedicated thread and wrap it in a track
///
/// The track's release hook stops the thread, which drops the stream and
/// frees the device.
async fn spawn_capture(
    label: &'static str,
    open: impl FnOnce() -> PipelineResult<(Device, u16, SampleFormat)> + Send + 'static,
) -> PipelineResult<MediaStream> {
    let stop = Arc::new(AtomicBool::new(false));
    let (ready_tx, ready_rx) = oneshot::channel::<PipelineResult<Thread>>();

    let thread_stop = stop.clone();
    let (track_tx, track_rx) = std_mpsc::channel::<MediaTrack>();
    thread::spawn(move || {
        let Ok(track) = track_rx.recv() else {
            return;
        };
        let stream = open().and_then(|(device, channels, format)| {
            let stream = build_capture_for_format(&device, channels, format, track)?;
            stream.play()?;
            Ok(stream)
        });
        match stream {
            Ok(stream) => {
                let _ = ready_tx.send(Ok(thread::current()));
                hold_stream(stream, &thread_stop);
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
            }
        }
    });

    let release_stop = stop.clone();
    let thread_handle: Arc<Mutex<Option<Thread>>> = Arc::new(Mutex::new(None));
    let release_handle = thread_handle.clone();
    let track = MediaTrack::with_release(label, move || {
        release_stop.store(true, Ordering::SeqCst);
        if let Ok(mut handle) = release_handle.lock()
            && let Some(thread) = handle.take()
        {
            thread.unpark();
        }
    });

    track_tx
        .send(track.clone())
        .map_err(|_| PipelineError::Device("Capture thread exited".to_string()))?;

    let thread = ready_rx
        .await
        .map_err(|_| PipelineError::Device("Capture thread exited".to_string()))??;
    if let Ok(mut handle) = thread_handle.lock() {
        *handle = Some(thread);
    }

    debug!(label, "capture started");
    Ok(MediaStream::single(track))
}

// =============================================================================
// Playback
// =============================================================================

/// Build an output stream that upmixes the mono queue to every channel
fn build_playback_stream<T>(
    device: &Device,
    channels: u16,
    queue: Arc<Mutex<VecDeque<f32>>>,
    error_tx: std_mpsc::Sender<String>,
) -> PipelineResult<Stream>
where
    T: Sample + cpal::SizedSample + FromSample<f32>,
{
    let config = stream_config(channels);
    let channels = channels as usize;
    let stream = device.build_output_stream(
        &config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let mut queue = queue.lock().ok();
            for frame in data.chunks_exact_mut(channels) {
                let sample = queue
                    .as_mut()
                    .and_then(|q| q.pop_front())
                    .unwrap_or(0.0);
                let value = T::from_sample(sample);
                for slot in frame.iter_mut() {
                    *slot = value;
                }
            }
        },
        move |err| {
            let _ = error_tx.send(format!("Playback error: {}", err));
        },
        None,
    )?;
    Ok(stream)
}

/// Speaker output backed by a cpal stream on its own thread
pub struct CpalOutput {
    queue: Arc<Mutex<VecDeque<f32>>>,
    stop: Arc<AtomicBool>,
    thread: Thread,
    error_rx: Mutex<std_mpsc::Receiver<String>>,
}

impl CpalOutput {
    fn open(device_name: &str) -> PipelineResult<Self> {
        let queue = Arc::new(Mutex::new(VecDeque::with_capacity(
            SAMPLES_PER_QUANTUM * MAX_PLAYBACK_BUFFER_QUANTA,
        )));
        let stop = Arc::new(AtomicBool::new(false));
        let (error_tx, error_rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = std_mpsc::channel::<PipelineResult<Thread>>();

        let name = device_name.to_string();
        let thread_queue = queue.clone();
        let thread_stop = stop.clone();
        thread::spawn(move || {
            let stream = find_output_device(&name)
                .ok_or_else(|| PipelineError::Device("Output device not found".to_string()))
                .and_then(|device| {
                    let (channels, format) = pick_config(&device, false)?;
                    let stream = match format {
                        SampleFormat::F32 => {
                            build_playback_stream::<f32>(&device, channels, thread_queue, error_tx)
                        }
                        SampleFormat::I16 => {
                            build_playback_stream::<i16>(&device, channels, thread_queue, error_tx)
                        }
                        SampleFormat::U16 => {
                            build_playback_stream::<u16>(&device, channels, thread_queue, error_tx)
                        }
                        other => Err(PipelineError::Device(format!(
                            "Unsupported sample format: {:?}",
                            other
                        ))),
                    }?;
                    stream.play()?;
                    Ok(stream)
                });
            match stream {
                // Nobody is waiting once the open timed out
                Ok(stream) => {
                    if ready_tx.send(Ok(thread::current())).is_ok() {
                        hold_stream(stream, &thread_stop);
                    }
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            }
        });

        let thread = wait_for_device_thread(&ready_rx, DEVICE_OPEN_TIMEOUT)?;

        Ok(Self {
            queue,
            stop,
            thread,
            error_rx: Mutex::new(error_rx),
        })
    }
}

impl OutputSink for CpalOutput {
    fn write(&self, samples: &[f32]) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.extend(samples.iter().copied());
            let max = SAMPLES_PER_QUANTUM * MAX_PLAYBACK_BUFFER_QUANTA;
            if queue.len() > max {
                let excess = queue.len() - max;
                queue.drain(..excess);
            }
        }
    }

    fn check_error(&self) -> Option<String> {
        self.error_rx.lock().ok()?.try_recv().ok()
    }

    fn close(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.thread.unpark();
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// Backend
// =============================================================================

/// Audio backend over the platform's default cpal host
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

#[async_trait]
impl AudioBackend for CpalBackend {
    async fn capture_microphone(&self, device: &str) -> PipelineResult<MediaStream> {
        let name = device.to_string();
        spawn_capture("microphone", move || {
            let device = find_input_device(&name)
                .ok_or_else(|| PipelineError::Device("Input device not found".to_string()))?;
            let (channels, format) = pick_config(&device, true)?;
            Ok((device, channels, format))
        })
        .await
    }

    async fn capture_system_audio(&self) -> PipelineResult<MediaStream> {
        spawn_capture("system-audio", || {
            let device = find_system_audio_device().ok_or_else(|| {
                PipelineError::Device("No system audio source available".to_string())
            })?;
            #[cfg(target_os = "windows")]
            let (channels, format) = loopback_config(&device)?;
            #[cfg(not(target_os = "windows"))]
            let (channels, format) = pick_config(&device, true)?;
            Ok((device, channels, format))
        })
        .await
    }

    fn open_output(&self, device: &str) -> PipelineResult<Box<dyn OutputSink>> {
        Ok(Box::new(CpalOutput::open(device)?))
    }

    fn list_input_devices(&self) -> Vec<AudioDevice> {
        match get_host().input_devices() {
            Ok(devices) => collect_devices(devices),
            Err(_) => vec![AudioDevice::system_default()],
        }
    }

    fn list_output_devices(&self) -> Vec<AudioDevice> {
        match get_host().output_devices() {
            Ok(devices) => collect_devices(devices),
            Err(_) => vec![AudioDevice::system_default()],
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
