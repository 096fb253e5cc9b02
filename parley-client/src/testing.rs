//! In-process fakes for the audio backend, signaling and media engine

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use parley_common::protocol::{
    Capabilities, ConsumerInfo, DtlsParameters, ExistingProducer, MediaKind, RtpParameters,
    SignalingRequest, SignalingResponse, TransportDirection, TransportInfo,
};

use crate::error::{PipelineError, PipelineResult};
use crate::graph::SpeakingDetector;
use crate::media::{AudioBackend, AudioDevice, MediaStream, MediaTrack, OutputSink};
use crate::session::engine::{
    Consumer, MediaDevice, Producer, RecvTransport, SendTransport, TransportListener,
};
use crate::signaling::Signaling;

/// Detector whose level events go nowhere
pub fn test_detector() -> SpeakingDetector {
    let (tx, _rx) = mpsc::unbounded_channel();
    SpeakingDetector::new(tx)
}

fn fake_capabilities() -> Capabilities {
    Capabilities(json!({"codecs": [{"mimeType": "audio/opus", "clockRate": 48000}]}))
}

// =============================================================================
// Audio Backend
// =============================================================================

#[derive(Default)]
pub struct FakeBackend {
    fail_output: AtomicBool,
    fail_microphone: AtomicBool,
    fail_system_audio: AtomicBool,
    outputs_opened: AtomicUsize,
    outputs_closed: Arc<AtomicUsize>,
    live_captures: Arc<AtomicUsize>,
    captures_started: AtomicUsize,
    played: Arc<Mutex<Vec<f32>>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_output(&self, fail: bool) {
        self.fail_output.store(fail, Ordering::SeqCst);
    }

    pub fn fail_microphone(&self, fail: bool) {
        self.fail_microphone.store(fail, Ordering::SeqCst);
    }

    pub fn fail_system_audio(&self, fail: bool) {
        self.fail_system_audio.store(fail, Ordering::SeqCst);
    }

    pub fn outputs_opened(&self) -> usize {
        self.outputs_opened.load(Ordering::SeqCst)
    }

    pub fn outputs_closed(&self) -> usize {
        self.outputs_closed.load(Ordering::SeqCst)
    }

    /// Captures whose track has not been stopped
    pub fn live_captures(&self) -> usize {
        self.live_captures.load(Ordering::SeqCst)
    }

    pub fn captures_started(&self) -> usize {
        self.captures_started.load(Ordering::SeqCst)
    }

    /// Everything written to any output so far
    pub fn played(&self) -> Vec<f32> {
        self.played.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn capture(&self, label: &str) -> MediaStream {
        self.captures_started.fetch_add(1, Ordering::SeqCst);
        self.live_captures.fetch_add(1, Ordering::SeqCst);
        let live = self.live_captures.clone();
        MediaStream::single(MediaTrack::with_release(label, move || {
            live.fetch_sub(1, Ordering::SeqCst);
        }))
    }
}

#[async_trait]
impl AudioBackend for FakeBackend {
    async fn capture_microphone(&self, device: &str) -> PipelineResult<MediaStream> {
        if self.fail_microphone.load(Ordering::SeqCst) {
            return Err(PipelineError::Device("Permission denied".to_string()));
        }
        Ok(self.capture(&format!("mic:{}", device)))
    }

    async fn capture_system_audio(&self) -> PipelineResult<MediaStream> {
        if self.fail_system_audio.load(Ordering::SeqCst) {
            return Err(PipelineError::Device("No loopback device".to_string()));
        }
        Ok(self.capture("system"))
    }

    fn open_output(&self, device: &str) -> PipelineResult<Box<dyn OutputSink>> {
        if self.fail_output.load(Ordering::SeqCst) {
            return Err(PipelineError::Device(format!("cannot open {:?}", device)));
        }
        self.outputs_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeOutput {
            played: self.played.clone(),
            closed_count: self.outputs_closed.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn list_input_devices(&self) -> Vec<AudioDevice> {
        vec![AudioDevice::system_default()]
    }

    fn list_output_devices(&self) -> Vec<AudioDevice> {
        vec![AudioDevice::system_default()]
    }
}

pub struct FakeOutput {
    played: Arc<Mutex<Vec<f32>>>,
    closed_count: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl OutputSink for FakeOutput {
    fn write(&self, samples: &[f32]) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(mut played) = self.played.lock() {
            played.extend_from_slice(samples);
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.closed_count.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// =============================================================================
// Signaling
// =============================================================================

#[derive(Default)]
struct SignalingState {
    requests: Vec<SignalingRequest>,
    failures: HashSet<String>,
    /// (channel id, producer id, peer user id)
    producers: Vec<(String, String, String)>,
    next_id: usize,
}

/// Scripted media server
///
/// Failures are keyed by request name (`"CreateProducer"`) or by name and
/// detail (`"CreateTransport:send"`, `"CreateConsumer:<producer id>"`).
#[derive(Default)]
pub struct FakeSignaling {
    state: Mutex<SignalingState>,
}

impl FakeSignaling {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, key: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.failures.insert(key.to_string());
        }
    }

    /// Register a producer already live in `channel_id`
    pub fn add_producer(&self, channel_id: &str, producer_id: &str, peer_user_id: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.producers.push((
                channel_id.to_string(),
                producer_id.to_string(),
                peer_user_id.to_string(),
            ));
        }
    }

    pub fn requests(&self) -> Vec<SignalingRequest> {
        self.state
            .lock()
            .map(|s| s.requests.clone())
            .unwrap_or_default()
    }

    /// Number of requests with the given name
    pub fn count(&self, name: &str) -> usize {
        self.requests().iter().filter(|r| r.name() == name).count()
    }
}

#[async_trait]
impl Signaling for FakeSignaling {
    async fn request(&self, request: SignalingRequest) -> PipelineResult<SignalingResponse> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| PipelineError::TransportClosed)?;
        state.requests.push(request.clone());
        state.next_id += 1;
        let n = state.next_id;

        let detail = match &request {
            SignalingRequest::CreateTransport { direction, .. } => direction.to_string(),
            SignalingRequest::ConnectTransport { transport_id, .. } => transport_id.clone(),
            SignalingRequest::CreateProducer { transport_id, .. } => transport_id.clone(),
            SignalingRequest::CreateConsumer { producer_id, .. } => producer_id.clone(),
        };
        let name = request.name();
        if state.failures.contains(name) || state.failures.contains(&format!("{}:{}", name, detail)) {
            return Ok(SignalingResponse::Error {
                message: format!("{} rejected", name),
            });
        }

        let response = match request {
            SignalingRequest::CreateTransport {
                direction,
                channel_id,
            } => {
                let existing_producers = match direction {
                    TransportDirection::Recv => state
                        .producers
                        .iter()
                        .filter(|(channel, _, _)| *channel == channel_id)
                        .map(|(_, producer_id, peer_user_id)| ExistingProducer {
                            producer_id: producer_id.clone(),
                            peer_user_id: peer_user_id.clone(),
                        })
                        .collect(),
                    TransportDirection::Send => Vec::new(),
                };
                SignalingResponse::TransportCreated {
                    transport: TransportInfo {
                        id: format!("{}-{}", direction, n),
                        server_capabilities: fake_capabilities(),
                        existing_producers,
                        parameters: json!({"iceParameters": {}}),
                    },
                }
            }
            SignalingRequest::ConnectTransport { .. } => SignalingResponse::TransportConnected,
            SignalingRequest::CreateProducer { .. } => SignalingResponse::ProducerCreated {
                id: format!("producer-{}", n),
            },
            SignalingRequest::CreateConsumer {
                producer_id,
                channel_id,
                ..
            } => {
                let peer_user_id = state
                    .producers
                    .iter()
                    .find(|(channel, id, _)| *channel == channel_id && *id == producer_id)
                    .map(|(_, _, peer)| peer.clone())
                    .unwrap_or_else(|| "unknown".to_string());
                SignalingResponse::ConsumerCreated {
                    consumer: ConsumerInfo {
                        id: format!("consumer-{}", n),
                        kind: MediaKind::Audio,
                        producer_id,
                        rtp_parameters: RtpParameters::default(),
                        peer_user_id,
                    },
                }
            }
        };
        Ok(response)
    }
}

// =============================================================================
// Media Engine
// =============================================================================

/// Counters shared by a fake device and everything it creates
#[derive(Default)]
pub struct EngineStats {
    live_send: AtomicUsize,
    live_recv: AtomicUsize,
    live_producers: AtomicUsize,
    producers_created: AtomicUsize,
    /// Producer lifecycle in order: `true` = created, `false` = closed
    producer_log: Mutex<Vec<bool>>,
    /// Receive side in order: `connect:<transport>` and `consume:<consumer>`
    recv_log: Mutex<Vec<String>>,
}

impl EngineStats {
    fn log_recv(&self, entry: String) {
        if let Ok(mut log) = self.recv_log.lock() {
            log.push(entry);
        }
    }

    fn log_producer(&self, created: bool) {
        if created {
            self.live_producers.fetch_add(1, Ordering::SeqCst);
            self.producers_created.fetch_add(1, Ordering::SeqCst);
        } else {
            self.live_producers.fetch_sub(1, Ordering::SeqCst);
        }
        if let Ok(mut log) = self.producer_log.lock() {
            log.push(created);
        }
    }
}

#[derive(Default)]
pub struct FakeDevice {
    loaded: AtomicBool,
    loads: AtomicUsize,
    stats: Arc<EngineStats>,
    recv_listener: Mutex<Option<Arc<dyn TransportListener>>>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn live_send_transports(&self) -> usize {
        self.stats.live_send.load(Ordering::SeqCst)
    }

    pub fn live_recv_transports(&self) -> usize {
        self.stats.live_recv.load(Ordering::SeqCst)
    }

    pub fn live_producers(&self) -> usize {
        self.stats.live_producers.load(Ordering::SeqCst)
    }

    pub fn producers_created(&self) -> usize {
        self.stats.producers_created.load(Ordering::SeqCst)
    }

    pub fn recv_log(&self) -> Vec<String> {
        self.stats
            .recv_log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    /// Listener handed to the most recent receive transport
    pub fn recv_listener(&self) -> Option<Arc<dyn TransportListener>> {
        self.recv_listener.lock().ok().and_then(|l| l.clone())
    }

    /// Whether every producer was closed before the next one was created
    pub fn producer_log_is_sequential(&self) -> bool {
        let Ok(log) = self.stats.producer_log.lock() else {
            return false;
        };
        let mut live = 0usize;
        for created in log.iter() {
            if *created {
                live += 1;
                if live > 1 {
                    return false;
                }
            } else {
                live = live.saturating_sub(1);
            }
        }
        true
    }
}

#[async_trait]
impl MediaDevice for FakeDevice {
    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    async fn load(&self, _server_capabilities: &Capabilities) -> PipelineResult<()> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn rtp_capabilities(&self) -> Capabilities {
        fake_capabilities()
    }

    async fn create_send_transport(
        &self,
        info: &TransportInfo,
        listener: Arc<dyn TransportListener>,
    ) -> PipelineResult<Box<dyn SendTransport>> {
        Ok(Box::new(FakeSendTransport::new(
            &info.id,
            listener,
            self.stats.clone(),
        )))
    }

    async fn create_recv_transport(
        &self,
        info: &TransportInfo,
        listener: Arc<dyn TransportListener>,
    ) -> PipelineResult<Box<dyn RecvTransport>> {
        if let Ok(mut current) = self.recv_listener.lock() {
            *current = Some(listener.clone());
        }
        Ok(Box::new(FakeRecvTransport::new(
            &info.id,
            listener,
            self.stats.clone(),
        )))
    }
}

/// Listener for transports created outside a session
#[derive(Default)]
struct LocalListener {
    next_id: AtomicUsize,
}

#[async_trait]
impl TransportListener for LocalListener {
    async fn on_connect(&self, _dtls_parameters: DtlsParameters) -> PipelineResult<()> {
        Ok(())
    }

    async fn on_produce(&self, _kind: MediaKind, _rtp_parameters: RtpParameters) -> PipelineResult<String> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(format!("producer-{}", n))
    }
}

pub struct FakeSendTransport {
    id: String,
    listener: Arc<dyn TransportListener>,
    stats: Arc<EngineStats>,
    connected: AtomicBool,
    closed: AtomicBool,
    fail_replace_track: Arc<AtomicBool>,
    producers: Mutex<Vec<Arc<ProducerState>>>,
}

impl FakeSendTransport {
    fn new(id: &str, listener: Arc<dyn TransportListener>, stats: Arc<EngineStats>) -> Self {
        stats.live_send.fetch_add(1, Ordering::SeqCst);
        Self {
            id: id.to_string(),
            listener,
            stats,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            fail_replace_track: Arc::new(AtomicBool::new(false)),
            producers: Mutex::new(Vec::new()),
        }
    }

    /// Transport with its own counters and a listener that always succeeds
    pub fn standalone() -> Self {
        Self::new(
            "send-0",
            Arc::new(LocalListener::default()),
            Arc::new(EngineStats::default()),
        )
    }

    /// Make `replace_track` fail on every producer of this transport
    pub fn fail_replace_track(&self, fail: bool) {
        self.fail_replace_track.store(fail, Ordering::SeqCst);
    }

    pub fn live_producers(&self) -> usize {
        self.stats.live_producers.load(Ordering::SeqCst)
    }

    pub fn producers_created(&self) -> usize {
        self.stats.producers_created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SendTransport for FakeSendTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn produce(&self, track: MediaTrack) -> PipelineResult<Box<dyn Producer>> {
        if self.is_closed() {
            return Err(PipelineError::TransportClosed);
        }
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.listener
                .on_connect(DtlsParameters(json!({"role": "client"})))
                .await?;
        }
        let id = self
            .listener
            .on_produce(MediaKind::Audio, RtpParameters::default())
            .await?;

        let state = Arc::new(ProducerState {
            id,
            track: Mutex::new(track),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            fail_replace_track: self.fail_replace_track.clone(),
            stats: self.stats.clone(),
        });
        self.stats.log_producer(true);
        if let Ok(mut producers) = self.producers.lock() {
            producers.push(state.clone());
        }
        Ok(Box::new(FakeProducer { state }))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stats.live_send.fetch_sub(1, Ordering::SeqCst);
        if let Ok(mut producers) = self.producers.lock() {
            for producer in producers.drain(..) {
                producer.close();
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct ProducerState {
    id: String,
    track: Mutex<MediaTrack>,
    paused: AtomicBool,
    closed: AtomicBool,
    fail_replace_track: Arc<AtomicBool>,
    stats: Arc<EngineStats>,
}

impl ProducerState {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.stats.log_producer(false);
        }
    }
}

pub struct FakeProducer {
    state: Arc<ProducerState>,
}

#[async_trait]
impl Producer for FakeProducer {
    fn id(&self) -> &str {
        &self.state.id
    }

    fn is_paused(&self) -> bool {
        self.state.paused.load(Ordering::SeqCst)
    }

    fn pause(&self) {
        self.state.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.state.paused.store(false, Ordering::SeqCst);
    }

    async fn replace_track(&self, track: MediaTrack) -> PipelineResult<()> {
        if self.is_closed() {
            return Err(PipelineError::TransportClosed);
        }
        if self.state.fail_replace_track.load(Ordering::SeqCst) {
            return Err(PipelineError::Signaling("replaceTrack rejected".to_string()));
        }
        if let Ok(mut current) = self.state.track.lock() {
            *current = track;
        }
        Ok(())
    }

    fn close(&self) {
        self.state.close();
    }

    fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }
}

pub struct FakeRecvTransport {
    id: String,
    listener: Arc<dyn TransportListener>,
    stats: Arc<EngineStats>,
    connected: AtomicBool,
    closed: AtomicBool,
    tracks: Mutex<Vec<MediaTrack>>,
}

impl FakeRecvTransport {
    fn new(id: &str, listener: Arc<dyn TransportListener>, stats: Arc<EngineStats>) -> Self {
        stats.live_recv.fetch_add(1, Ordering::SeqCst);
        Self {
            id: id.to_string(),
            listener,
            stats,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            tracks: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl RecvTransport for FakeRecvTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn consume(&self, info: &ConsumerInfo) -> PipelineResult<Consumer> {
        if self.is_closed() {
            return Err(PipelineError::TransportClosed);
        }
        if !self.connected.load(Ordering::SeqCst) {
            self.listener
                .on_connect(DtlsParameters(json!({"role": "client"})))
                .await?;
            self.connected.store(true, Ordering::SeqCst);
            self.stats.log_recv(format!("connect:{}", self.id));
        }
        let track = MediaTrack::new(format!("consumer:{}", info.peer_user_id));
        if let Ok(mut tracks) = self.tracks.lock() {
            tracks.push(track.clone());
        }
        self.stats.log_recv(format!("consume:{}", info.id));
        Ok(Consumer::new(info, track))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stats.live_recv.fetch_sub(1, Ordering::SeqCst);
        if let Ok(mut tracks) = self.tracks.lock() {
            for track in tracks.drain(..) {
                track.stop();
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
