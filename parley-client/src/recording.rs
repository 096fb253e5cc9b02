//! Session recording
//!
//! The recording bus is created lazily on the shared context. Starting a
//! recording wires it up and installs a [`ChunkRecorder`] that buffers one
//! chunk per rendered quantum. Stopping detaches every input, encodes the
//! chunks as a single WAV file and hands it to an [`ArtifactSink`].

use std::fs::{self, OpenOptions};
use std::io::{Cursor, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};
use hound::{SampleFormat, WavSpec, WavWriter};
use tracing::{debug, info};

use parley_common::audio::{CHANNELS, SAMPLE_RATE};

use crate::config::RecordFormat;
use crate::constants::RECORDING_FILE_PREFIX;
use crate::error::{PipelineError, PipelineResult};
use crate::graph::{AudioContextManager, CaptureChain, NodeId};
use crate::media::TrackSink;

/// Timestamp pattern of artifact names (file-system safe ISO 8601, with millis)
const ARTIFACT_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S-%3f";

/// Upper bound on `-N` suffixes tried when a file name is taken
const MAX_NAME_SUFFIX: u32 = 1000;

// =============================================================================
// Recorder
// =============================================================================

/// Buffers rendered recording quanta
#[derive(Default)]
pub struct ChunkRecorder {
    chunks: Mutex<Vec<Vec<f32>>>,
}

impl ChunkRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Take every buffered chunk, concatenated
    fn drain(&self) -> Vec<f32> {
        self.chunks
            .lock()
            .map(|mut c| std::mem::take(&mut *c).concat())
            .unwrap_or_default()
    }
}

impl TrackSink for ChunkRecorder {
    fn accept(&self, samples: &[f32]) {
        if let Ok(mut chunks) = self.chunks.lock() {
            chunks.push(samples.to_vec());
        }
    }
}

/// An active recording
pub struct RecordingSession {
    pub format: RecordFormat,
    pub mime_type: &'static str,
    pub started_at: DateTime<Local>,
    recorder: Arc<ChunkRecorder>,
}

impl RecordingSession {
    fn new(format: RecordFormat) -> Self {
        Self {
            format,
            mime_type: format.mime_type(),
            started_at: Local::now(),
            recorder: Arc::new(ChunkRecorder::new()),
        }
    }

    /// Buffered chunks so far
    pub fn chunk_count(&self) -> usize {
        self.recorder.chunk_count()
    }

    /// Artifact file name, e.g. `session-2024-05-01T12-30-00-250.wav`
    pub fn artifact_name(&self) -> String {
        format!(
            "{}-{}.{}",
            RECORDING_FILE_PREFIX,
            self.started_at.format(ARTIFACT_TIMESTAMP_FORMAT),
            self.format.extension()
        )
    }
}

/// A finalized recording
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingArtifact {
    pub name: String,
    pub mime_type: &'static str,
    pub path: PathBuf,
}

// =============================================================================
// Delivery
// =============================================================================

/// Where finished recordings go
pub trait ArtifactSink: Send + Sync {
    /// Store `bytes` under `name`, returning where it ended up
    fn deliver(&self, name: &str, bytes: &[u8]) -> PipelineResult<PathBuf>;
}

/// Writes artifacts into a directory (the user's downloads by default)
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// The platform download directory, falling back to home, then temp
    pub fn downloads() -> Self {
        let dir = dirs::download_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(std::env::temp_dir);
        Self { dir }
    }
}

impl ArtifactSink for DirectorySink {
    /// Existing files are never overwritten; a taken name gets a `-N` suffix
    fn deliver(&self, name: &str, bytes: &[u8]) -> PipelineResult<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        for attempt in 0..MAX_NAME_SUFFIX {
            let path = self.dir.join(numbered_name(name, attempt));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(bytes)?;
                    return Ok(path);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(PipelineError::Recording(format!(
            "no free file name for {} in {}",
            name,
            self.dir.display()
        )))
    }
}

/// `name` for the first attempt, `stem-N.ext` afterwards
fn numbered_name(name: &str, attempt: u32) -> String {
    if attempt == 0 {
        return name.to_string();
    }
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    match path.extension() {
        Some(ext) => format!("{}-{}.{}", stem, attempt, ext.to_string_lossy()),
        None => format!("{}-{}", stem, attempt),
    }
}

/// Encode mono samples as a WAV file in memory
pub fn encode_wav(samples: &[f32], format: RecordFormat) -> PipelineResult<Vec<u8>> {
    let spec = match format {
        RecordFormat::Wav => WavSpec {
            channels: CHANNELS,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        },
        RecordFormat::WavFloat => WavSpec {
            channels: CHANNELS,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        },
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            match format {
                RecordFormat::Wav => {
                    let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                    writer.write_sample(value)?;
                }
                RecordFormat::WavFloat => writer.write_sample(sample)?,
            }
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

// =============================================================================
// Controller
// =============================================================================

/// Starts and finalizes recordings against the shared context
pub struct RecordingController {
    contexts: Arc<AudioContextManager>,
    sink: Box<dyn ArtifactSink>,
    session: Option<RecordingSession>,
}

impl RecordingController {
    pub fn new(contexts: Arc<AudioContextManager>, sink: Box<dyn ArtifactSink>) -> Self {
        Self {
            contexts,
            sink,
            session: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&RecordingSession> {
        self.session.as_ref()
    }

    /// Start recording
    ///
    /// With mix mode active the microphone and system-audio chains feed the
    /// recording bus; otherwise the microphone chain and the master bus do.
    /// Returns `Ok(false)` if a recording is already running.
    ///
    /// # Arguments
    /// * `mic` - Current microphone chain, if any
    /// * `mix` - System-audio chain when mix mode is active
    /// * `format` - Artifact format
    pub fn start(
        &mut self,
        mic: Option<&Arc<CaptureChain>>,
        mix: Option<&Arc<CaptureChain>>,
        format: RecordFormat,
    ) -> PipelineResult<bool> {
        if self.session.is_some() {
            return Ok(false);
        }
        let context = self.contexts.ensure_initialized().ok_or_else(|| {
            PipelineError::ContextUnavailable("recording not started".to_string())
        })?;

        // Rewire from scratch
        let bus = context.recording_bus();
        context.master().remove_tap(bus.id());
        bus.disconnect_all();

        if let Some(mic) = mic {
            mic.connect(&bus);
        }
        match mix {
            Some(mix) => mix.connect(&bus),
            None => context.master().add_tap(&bus),
        }

        let session = RecordingSession::new(format);
        context.set_recorder(Some(session.recorder.clone()));
        info!(
            mime_type = session.mime_type,
            mix = mix.is_some(),
            "recording started"
        );
        self.session = Some(session);
        Ok(true)
    }

    /// Stop recording and deliver the artifact
    ///
    /// Every recording-bus input is disconnected before encoding, so the
    /// routing is released even if delivery fails. Returns `Ok(None)` when
    /// no recording is running.
    ///
    /// # Arguments
    /// * `chains` - Chains that may still feed the recording bus
    pub fn stop(&mut self, chains: &[&Arc<CaptureChain>]) -> PipelineResult<Option<RecordingArtifact>> {
        let Some(session) = self.session.take() else {
            return Ok(None);
        };

        if let Some(context) = self.contexts.get() {
            context.set_recorder(None);
            if let Some(bus) = context.existing_recording_bus() {
                for chain in chains {
                    chain.disconnect(bus.id());
                }
                context.master().remove_tap(bus.id());
                bus.disconnect_all();
            }
        }

        let samples = session.recorder.drain();
        debug!(samples = samples.len(), "finalizing recording");
        let bytes = encode_wav(&samples, session.format)?;
        let name = session.artifact_name();
        let path = self.sink.deliver(&name, &bytes)?;

        info!(name, path = %path.display(), "recording saved");
        Ok(Some(RecordingArtifact {
            name,
            mime_type: session.mime_type,
            path,
        }))
    }

    /// Nodes currently feeding the recording bus
    pub fn recording_inputs(&self) -> Vec<NodeId> {
        self.contexts
            .get()
            .and_then(|c| c.existing_recording_bus())
            .map(|bus| bus.inputs())
            .unwrap_or_default()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaStream, MediaTrack};
    use crate::testing::FakeBackend;
    use parley_common::audio::SAMPLES_PER_QUANTUM;

    #[derive(Default, Clone)]
    struct MemorySink {
        delivered: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    }

    impl ArtifactSink for MemorySink {
        fn deliver(&self, name: &str, bytes: &[u8]) -> PipelineResult<PathBuf> {
            self.delivered
                .lock()
                .unwrap()
                .push((name.to_string(), bytes.to_vec()));
            Ok(PathBuf::from(name))
        }
    }

    fn setup() -> (RecordingController, Arc<AudioContextManager>, MemorySink) {
        let backend = Arc::new(FakeBackend::new());
        let contexts = Arc::new(AudioContextManager::new(backend, "", 100, false));
        let sink = MemorySink::default();
        (
            RecordingController::new(contexts.clone(), Box::new(sink.clone())),
            contexts,
            sink,
        )
    }

    fn chain(label: &str) -> (Arc<CaptureChain>, MediaTrack) {
        let track = MediaTrack::new(label);
        (CaptureChain::build(MediaStream::single(track.clone()), 1.0), track)
    }

    #[test]
    fn test_routing_without_mix() {
        let (mut controller, contexts, _sink) = setup();
        let (mic, _track) = chain("mic");

        assert!(controller.start(Some(&mic), None, RecordFormat::Wav).unwrap());
        let context = contexts.get().unwrap();
        let bus = context.existing_recording_bus().unwrap();

        let mut inputs = controller.recording_inputs();
        inputs.sort();
        let mut expected = vec![mic.id(), context.master().id()];
        expected.sort();
        assert_eq!(inputs, expected);
        assert!(context.master().has_tap(bus.id()));
    }

    #[test]
    fn test_routing_with_mix() {
        let (mut controller, contexts, _sink) = setup();
        let (mic, _mic_track) = chain("mic");
        let (mix, _mix_track) = chain("system");

        controller
            .start(Some(&mic), Some(&mix), RecordFormat::Wav)
            .unwrap();
        let context = contexts.get().unwrap();
        let bus = context.existing_recording_bus().unwrap();

        assert!(bus.has_input(mic.id()));
        assert!(bus.has_input(mix.id()));
        assert!(!bus.has_input(context.master().id()));
        assert!(!context.master().has_tap(bus.id()));
    }

    #[test]
    fn test_stop_delivers_one_artifact_and_detaches() {
        let (mut controller, contexts, sink) = setup();
        let (mic, track) = chain("mic");
        controller.start(Some(&mic), None, RecordFormat::Wav).unwrap();

        let context = contexts.get().unwrap();
        track.write(&[0.25; SAMPLES_PER_QUANTUM]);
        context.render_quantum();
        context.render_quantum();
        assert_eq!(controller.session().unwrap().chunk_count(), 2);

        let artifact = controller.stop(&[&mic]).unwrap().unwrap();
        assert!(artifact.name.starts_with("session-"));
        assert!(artifact.name.ends_with(".wav"));
        assert_eq!(artifact.mime_type, "audio/wav");
        assert!(!controller.is_active());
        assert!(controller.recording_inputs().is_empty());
        assert!(!mic.is_connected_to(context.existing_recording_bus().unwrap().id()));

        let delivered = sink.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        let reader = hound::WavReader::new(Cursor::new(delivered[0].1.clone())).unwrap();
        assert_eq!(reader.spec().sample_rate, SAMPLE_RATE);
        assert_eq!(reader.len() as usize, SAMPLES_PER_QUANTUM * 2);
    }

    #[test]
    fn test_start_and_stop_are_idempotent() {
        let (mut controller, _contexts, sink) = setup();
        let (mic, _track) = chain("mic");

        assert!(controller.stop(&[]).unwrap().is_none());
        assert!(controller.start(Some(&mic), None, RecordFormat::Wav).unwrap());
        assert!(!controller.start(Some(&mic), None, RecordFormat::Wav).unwrap());

        controller.stop(&[&mic]).unwrap();
        assert!(controller.stop(&[&mic]).unwrap().is_none());
        assert_eq!(sink.delivered.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_float_encoding() {
        let bytes = encode_wav(&[0.5, -0.5], RecordFormat::WavFloat).unwrap();
        let mut reader = hound::WavReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.spec().sample_format, SampleFormat::Float);
        let samples: Vec<f32> = reader.samples::<f32>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![0.5, -0.5]);
    }

    #[test]
    fn test_directory_sink_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(dir.path().join("recordings"));
        let path = sink.deliver("session-x.wav", b"RIFF").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"RIFF");
    }

    #[test]
    fn test_directory_sink_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(dir.path().to_path_buf());

        let first = sink.deliver("session-x.wav", b"one").unwrap();
        let second = sink.deliver("session-x.wav", b"two").unwrap();
        let third = sink.deliver("session-x.wav", b"three").unwrap();

        assert_eq!(second.file_name().unwrap(), "session-x-1.wav");
        assert_eq!(third.file_name().unwrap(), "session-x-2.wav");
        assert_eq!(fs::read(&first).unwrap(), b"one");
        assert_eq!(fs::read(&second).unwrap(), b"two");
    }

    #[test]
    fn test_artifact_name_has_millisecond_precision() {
        let session = RecordingSession::new(RecordFormat::Wav);
        let name = session.artifact_name();
        // session-YYYY-MM-DDTHH-MM-SS-mmm.wav
        let stamp = name
            .strip_prefix("session-")
            .and_then(|n| n.strip_suffix(".wav"))
            .unwrap();
        assert_eq!(stamp.len(), "2024-05-01T12-30-00-250".len());
        assert!(stamp.rsplit('-').next().unwrap().chars().all(|c| c.is_ascii_digit()));
    }
}
