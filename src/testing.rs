//! Fixtures and fakes shared by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};

use crate::adapters::webm_muxer::WebmMuxer;
use crate::domain::container::ebml;
use crate::domain::{
    CaptureRequest, DeviceDescriptor, DomainError, Encoding, MediaBlob, ProgressEvent,
    SampleBuffer,
};
use crate::ports::{
    AudioDecoder, CaptureBackend, CaptureSignal, CaptureStream, EngineHandle, OpenFailure,
    TranscriptionEngine,
};

/// A streaming-style WebM: header with a 0.0 Duration placeholder, then one
/// cluster per payload, 250 ms apart.
pub(crate) fn webm_stream(clusters: &[&[u8]]) -> Vec<u8> {
    let mut out = WebmMuxer::new(48_000, 1).header();
    for (i, payload) in clusters.iter().enumerate() {
        out.extend(WebmMuxer::raw_cluster(i as u64 * 250, payload));
    }
    out
}

/// A WebM header padded with a Void element to exactly `len` bytes, the way a
/// recorder's first chunk carries the header plus some leading audio.
pub(crate) fn webm_header_chunk(len: usize) -> Vec<u8> {
    let mut out = WebmMuxer::new(48_000, 1).header();
    assert!(len >= out.len() + 2, "chunk too small for the header");
    let padding = len - out.len();
    ebml::write_void(&mut out, padding);
    out
}

pub(crate) fn device(id: &str, label: &str) -> DeviceDescriptor {
    DeviceDescriptor {
        id: id.to_string(),
        label: label.to_string(),
        available: true,
        is_default: false,
    }
}

// --- Capture -----------------------------------------------------------------

#[derive(Default)]
struct StreamShared {
    sink: Mutex<Option<mpsc::UnboundedSender<CaptureSignal>>>,
    on_stop: Mutex<Vec<Vec<u8>>>,
    encoding: Mutex<Option<Encoding>>,
    stop_requests: AtomicUsize,
}

/// Test-side control over one opened fake stream.
#[derive(Clone)]
pub(crate) struct StreamControl {
    shared: Arc<StreamShared>,
}

impl StreamControl {
    /// Deliver a chunk as if the recorder emitted it.
    pub(crate) fn deliver(&self, bytes: Vec<u8>) {
        if let Some(sink) = self.shared.sink.lock().as_ref() {
            let _ = sink.send(CaptureSignal::Chunk(bytes));
        }
    }

    /// Queue a chunk that only arrives after a stop request.
    pub(crate) fn deliver_on_stop(&self, bytes: Vec<u8>) {
        self.shared.on_stop.lock().push(bytes);
    }

    /// Report a device failure mid-recording.
    pub(crate) fn fail(&self, message: &str) {
        if let Some(sink) = self.shared.sink.lock().as_ref() {
            let _ = sink.send(CaptureSignal::Error(message.to_string()));
        }
    }

    pub(crate) fn encoding(&self) -> Option<Encoding> {
        self.shared.encoding.lock().clone()
    }

    pub(crate) fn stop_requests(&self) -> usize {
        self.shared.stop_requests.load(Ordering::SeqCst)
    }
}

struct FakeStream {
    label: String,
    shared: Arc<StreamShared>,
    releases: Arc<AtomicUsize>,
}

impl CaptureStream for FakeStream {
    fn label(&self) -> &str {
        &self.label
    }

    fn start(
        &mut self,
        encoding: &Encoding,
        sink: mpsc::UnboundedSender<CaptureSignal>,
    ) -> Result<(), DomainError> {
        *self.shared.encoding.lock() = Some(encoding.clone());
        *self.shared.sink.lock() = Some(sink);
        Ok(())
    }

    fn request_stop(&mut self) {
        self.shared.stop_requests.fetch_add(1, Ordering::SeqCst);
        let Some(sink) = self.shared.sink.lock().clone() else {
            return;
        };
        let late: Vec<Vec<u8>> = self.shared.on_stop.lock().drain(..).collect();
        // Flushed data shows up asynchronously, after the stop call returns.
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            for bytes in late {
                let _ = sink.send(CaptureSignal::Chunk(bytes));
            }
            let _ = sink.send(CaptureSignal::Drained);
        });
    }

    fn release(&mut self) {
        self.shared.sink.lock().take();
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Scriptable capture backend.
///
/// `open` pops scripted results in order and succeeds once the script is
/// exhausted. Every attempt is recorded.
pub(crate) struct FakeCaptureBackend {
    devices: Mutex<Result<Vec<DeviceDescriptor>, String>>,
    open_script: Mutex<VecDeque<Result<(), OpenFailure>>>,
    attempts: Mutex<Vec<CaptureRequest>>,
    supported: Vec<String>,
    streams: Mutex<Vec<StreamControl>>,
    releases: Arc<AtomicUsize>,
}

impl FakeCaptureBackend {
    /// One built-in microphone, WebM/PCM recording.
    pub(crate) fn new() -> Self {
        Self::with_devices(vec![DeviceDescriptor {
            is_default: true,
            ..device("builtin", "Built-in Microphone")
        }])
    }

    pub(crate) fn with_devices(devices: Vec<DeviceDescriptor>) -> Self {
        Self {
            devices: Mutex::new(Ok(devices)),
            open_script: Mutex::new(VecDeque::new()),
            attempts: Mutex::new(Vec::new()),
            supported: vec!["audio/webm;codecs=pcm".to_string(), "audio/webm".to_string()],
            streams: Mutex::new(Vec::new()),
            releases: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn supporting(mut self, encodings: &[&str]) -> Self {
        self.supported = encodings.iter().map(|e| e.to_string()).collect();
        self
    }

    pub(crate) fn deny_enumeration(&self, message: &str) {
        *self.devices.lock() = Err(message.to_string());
    }

    pub(crate) fn set_devices(&self, devices: Vec<DeviceDescriptor>) {
        *self.devices.lock() = Ok(devices);
    }

    pub(crate) fn script_open(&self, results: impl IntoIterator<Item = Result<(), OpenFailure>>) {
        self.open_script.lock().extend(results);
    }

    pub(crate) fn attempts(&self) -> Vec<CaptureRequest> {
        self.attempts.lock().clone()
    }

    pub(crate) fn last_stream(&self) -> StreamControl {
        self.streams
            .lock()
            .last()
            .cloned()
            .expect("no stream has been opened")
    }

    pub(crate) fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureBackend for FakeCaptureBackend {
    async fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, DomainError> {
        self.devices
            .lock()
            .clone()
            .map_err(DomainError::DeviceEnumeration)
    }

    async fn open(&self, request: &CaptureRequest) -> Result<Box<dyn CaptureStream>, OpenFailure> {
        self.attempts.lock().push(request.clone());
        if let Some(result) = self.open_script.lock().pop_front() {
            result?;
        }

        let shared = Arc::new(StreamShared::default());
        self.streams.lock().push(StreamControl {
            shared: Arc::clone(&shared),
        });
        Ok(Box::new(FakeStream {
            label: request
                .device_id
                .clone()
                .unwrap_or_else(|| "Default Microphone".to_string()),
            shared,
            releases: Arc::clone(&self.releases),
        }))
    }

    fn is_supported(&self, encoding: &str) -> bool {
        self.supported.iter().any(|s| s == encoding)
    }
}

// --- Decoding ----------------------------------------------------------------

/// Decoder that turns every four payload bytes into one silent 16 kHz frame.
pub(crate) struct FakeDecoder;

#[async_trait]
impl AudioDecoder for FakeDecoder {
    async fn decode(&self, blob: &MediaBlob) -> Result<SampleBuffer, DomainError> {
        if blob.is_empty() {
            return Err(DomainError::decode("empty payload"));
        }
        SampleBuffer::mono(16_000, vec![0.0; blob.len() / 4])
    }

    fn target_sample_rate(&self) -> u32 {
        16_000
    }
}

// --- Transcription -----------------------------------------------------------

/// Scriptable engine. A gated engine holds every result until
/// [`FakeEngine::open_gate`] is called.
pub(crate) struct FakeEngine {
    reply: Result<String, String>,
    progress: Mutex<Vec<ProgressEvent>>,
    gate: Option<Semaphore>,
    submits: AtomicUsize,
    cancels: AtomicUsize,
    received_frames: Mutex<Vec<usize>>,
}

impl FakeEngine {
    pub(crate) fn replying(text: &str) -> Self {
        Self::build(Ok(text.to_string()), false)
    }

    pub(crate) fn failing(message: &str) -> Self {
        Self::build(Err(message.to_string()), false)
    }

    pub(crate) fn gated(text: &str) -> Self {
        Self::build(Ok(text.to_string()), true)
    }

    fn build(reply: Result<String, String>, gated: bool) -> Self {
        Self {
            reply,
            progress: Mutex::new(Vec::new()),
            gate: gated.then(|| Semaphore::new(0)),
            submits: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
            received_frames: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_progress(self, events: Vec<ProgressEvent>) -> Self {
        *self.progress.lock() = events;
        self
    }

    pub(crate) fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    pub(crate) fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub(crate) fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub(crate) fn received_frames(&self) -> Vec<usize> {
        self.received_frames.lock().clone()
    }
}

#[async_trait]
impl TranscriptionEngine for FakeEngine {
    async fn submit_job(&self, samples: SampleBuffer) -> Result<EngineHandle, DomainError> {
        let n = self.submits.fetch_add(1, Ordering::SeqCst) + 1;
        self.received_frames.lock().push(samples.frame_count());
        Ok(EngineHandle(format!("fake-{}", n)))
    }

    async fn poll_progress(&self, _handle: &EngineHandle) -> Vec<ProgressEvent> {
        std::mem::take(&mut *self.progress.lock())
    }

    async fn result(&self, _handle: &EngineHandle) -> Result<String, DomainError> {
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        self.reply.clone().map_err(DomainError::TranscriptionEngine)
    }

    async fn cancel(&self, _handle: &EngineHandle) -> bool {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn name(&self) -> &str {
        "fake"
    }
}
