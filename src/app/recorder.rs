use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::app::device_resolver::DeviceResolver;
use crate::domain::{
    negotiate_encoding, AtomicRecordingState, CaptureErrorKind, CaptureRequest, DomainError,
    Encoding, MediaBlob, RecorderEvent, RecordingState,
};
use crate::ports::{CaptureBackend, CaptureSignal, CaptureStream};

const EVENT_CAPACITY: usize = 64;

/// Exclusive hold on an opened input device.
///
/// Releasing is idempotent; the device and the recorder's busy flag are freed
/// on the first call and on drop.
struct DeviceLease {
    stream: Option<Box<dyn CaptureStream>>,
    busy: Arc<AtomicBool>,
}

impl DeviceLease {
    fn request_stop(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            stream.request_stop();
        }
    }

    fn release(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.release();
            self.busy.store(false, Ordering::SeqCst);
            debug!(device = %stream.label(), "Input device released");
        }
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.release();
    }
}

/// Bytes gathered by a session's collector task, in arrival order.
#[derive(Default)]
struct Collected {
    payload: Zeroizing<Vec<u8>>,
    chunks: usize,
}

/// One recording, from device open to finalized blob.
///
/// Dropping a session without stopping it releases the device.
pub struct RecordingSession {
    id: u64,
    encoding: Encoding,
    device_label: String,
    started_at: Instant,
    state: Arc<AtomicRecordingState>,
    lease: Arc<Mutex<DeviceLease>>,
    failure: Arc<Mutex<Option<String>>>,
    collector: Option<JoinHandle<Collected>>,
    events: broadcast::Sender<RecorderEvent>,
}

impl RecordingSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> RecordingState {
        self.state.load()
    }

    pub fn encoding(&self) -> &Encoding {
        &self.encoding
    }

    pub fn device_label(&self) -> &str {
        &self.device_label
    }

    /// Time since the session started.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn transition(&self, from: RecordingState, to: RecordingState) -> bool {
        transition(&self.state, &self.events, self.id, from, to)
    }

    /// Free the device and report a mid-recording failure, once.
    fn take_failure(&mut self) -> Result<Option<MediaBlob>, DomainError> {
        self.lease.lock().release();
        if let Some(collector) = self.collector.take() {
            collector.abort();
        }
        match self.failure.lock().take() {
            Some(message) => Err(DomainError::capture(CaptureErrorKind::Unknown, message)),
            None => Ok(None),
        }
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        if let Some(collector) = self.collector.take() {
            collector.abort();
        }
        self.lease.lock().release();
    }
}

fn transition(
    state: &AtomicRecordingState,
    events: &broadcast::Sender<RecorderEvent>,
    session: u64,
    from: RecordingState,
    to: RecordingState,
) -> bool {
    if !state.advance(from, to) {
        return false;
    }
    announce(events, session, from, to);
    true
}

fn announce(
    events: &broadcast::Sender<RecorderEvent>,
    session: u64,
    from: RecordingState,
    to: RecordingState,
) {
    debug!(session, from = ?from, to = ?to, "Recording state changed");
    let _ = events.send(RecorderEvent::StateChanged { session, from, to });
}

/// Records from one microphone at a time and hands back finalized blobs.
pub struct StreamRecorder {
    resolver: Arc<DeviceResolver>,
    busy: Arc<AtomicBool>,
    events: broadcast::Sender<RecorderEvent>,
    next_session: AtomicU64,
}

impl StreamRecorder {
    pub fn new(resolver: Arc<DeviceResolver>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            resolver,
            busy: Arc::new(AtomicBool::new(false)),
            events,
            next_session: AtomicU64::new(0),
        }
    }

    pub fn resolver(&self) -> &Arc<DeviceResolver> {
        &self.resolver
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecorderEvent> {
        self.events.subscribe()
    }

    /// Whether a session currently holds the microphone.
    pub fn is_recording(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Start recording with an explicit request.
    pub async fn start(&self, request: CaptureRequest) -> Result<RecordingSession, DomainError> {
        self.claim()?;
        self.resolver.refresh().await;
        self.begin(request).await
    }

    /// Start recording from `preferred` if it is currently available, or from
    /// any input otherwise.
    pub async fn start_with_preferred(
        &self,
        preferred: Option<&str>,
    ) -> Result<RecordingSession, DomainError> {
        self.claim()?;
        self.resolver.refresh().await;
        let request = self.resolver.build_capture_request(preferred);
        self.begin(request).await
    }

    fn claim(&self) -> Result<(), DomainError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Start requested while a recording holds the microphone");
            return Err(DomainError::AlreadyRecording);
        }
        Ok(())
    }

    async fn begin(&self, request: CaptureRequest) -> Result<RecordingSession, DomainError> {
        let acquisition = match self.resolver.open_with_fallback(&request).await {
            Ok(acquisition) => acquisition,
            Err(e) => {
                self.busy.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        // From here on the lease owns the busy flag.
        let mut lease = DeviceLease {
            stream: Some(acquisition.stream),
            busy: Arc::clone(&self.busy),
        };

        let backend: &Arc<dyn CaptureBackend> = self.resolver.backend();
        let encoding = negotiate_encoding(|mime| backend.is_supported(mime)).ok_or_else(|| {
            DomainError::capture(
                CaptureErrorKind::Unknown,
                "no supported recording format on this platform",
            )
        })?;

        let (sink, signals) = mpsc::unbounded_channel();
        let device_label = match lease.stream.as_mut() {
            Some(stream) => {
                stream.start(&encoding, sink)?;
                stream.label().to_string()
            }
            None => return Err(DomainError::NotRecording),
        };

        let id = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        let state = Arc::new(AtomicRecordingState::new(RecordingState::Idle));
        let lease = Arc::new(Mutex::new(lease));
        let failure = Arc::new(Mutex::new(None));

        let mut session = RecordingSession {
            id,
            encoding,
            device_label,
            started_at: Instant::now(),
            state: Arc::clone(&state),
            lease: Arc::clone(&lease),
            failure: Arc::clone(&failure),
            collector: None,
            events: self.events.clone(),
        };
        session.transition(RecordingState::Idle, RecordingState::Recording);

        if let Some(requested) = acquisition.fell_back_from {
            let _ = self.events.send(RecorderEvent::DeviceFallback { requested });
        }

        session.collector = Some(tokio::spawn(collect(
            id,
            signals,
            state,
            lease,
            failure,
            self.events.clone(),
        )));

        info!(
            session = id,
            encoding = %session.encoding,
            device = %session.device_label,
            "Recording started"
        );
        Ok(session)
    }

    /// Stop recording and finalize the blob.
    ///
    /// Waits for the capture primitive to drain, so chunks emitted after the
    /// stop request are included. Returns `None` if the session already
    /// finished. A device failure seen while recording is reported here once.
    pub async fn stop(
        &self,
        session: &mut RecordingSession,
    ) -> Result<Option<MediaBlob>, DomainError> {
        match session.state() {
            RecordingState::Recording => {}
            RecordingState::Failed => return session.take_failure(),
            RecordingState::Stopped | RecordingState::Stopping => return Ok(None),
            RecordingState::Idle => {
                return Err(DomainError::InvalidStateTransition {
                    from: RecordingState::Idle,
                    to: RecordingState::Stopping,
                })
            }
        }

        let elapsed_ms = session.elapsed().as_millis() as u64;
        if !session.transition(RecordingState::Recording, RecordingState::Stopping) {
            // The collector failed the session in between.
            return session.take_failure();
        }

        session.lease.lock().request_stop();
        let joined = match session.collector.take() {
            Some(collector) => collector.await,
            None => Ok(Collected::default()),
        };
        session.lease.lock().release();
        let collected = match joined {
            Ok(collected) => collected,
            Err(e) => {
                error!(session = session.id, error = %e, "Chunk collector stopped unexpectedly");
                session.transition(RecordingState::Stopping, RecordingState::Failed);
                return Err(DomainError::capture(
                    CaptureErrorKind::Unknown,
                    format!("chunk collector stopped unexpectedly: {}", e),
                ));
            }
        };

        if !session.transition(RecordingState::Stopping, RecordingState::Stopped) {
            return session.take_failure();
        }

        let Collected { mut payload, chunks } = collected;
        let blob = MediaBlob::new(
            std::mem::take(&mut *payload),
            session.encoding.clone(),
            elapsed_ms,
        );
        info!(
            session = session.id,
            chunks,
            bytes = blob.len(),
            elapsed_ms,
            "Recording stopped"
        );
        Ok(Some(blob))
    }

    /// Stop and throw the recording away.
    pub async fn discard(&self, session: &mut RecordingSession) {
        match self.stop(session).await {
            Ok(Some(blob)) => debug!(session = session.id, bytes = blob.len(), "Recording discarded"),
            Ok(None) => {}
            Err(e) => debug!(session = session.id, error = %e, "Discarded a failed recording"),
        }
    }
}

/// Append chunks until the primitive reports it has drained.
async fn collect(
    session: u64,
    mut signals: mpsc::UnboundedReceiver<CaptureSignal>,
    state: Arc<AtomicRecordingState>,
    lease: Arc<Mutex<DeviceLease>>,
    failure: Arc<Mutex<Option<String>>>,
    events: broadcast::Sender<RecorderEvent>,
) -> Collected {
    let mut collected = Collected::default();

    while let Some(signal) = signals.recv().await {
        match signal {
            CaptureSignal::Chunk(mut bytes) => {
                if bytes.is_empty() {
                    continue;
                }
                if !state.load().accepts_chunks() {
                    warn!(session, len = bytes.len(), "Dropping chunk outside a live session");
                    bytes.zeroize();
                    continue;
                }
                let index = collected.chunks;
                let len = bytes.len();
                collected.payload.extend_from_slice(&bytes);
                collected.chunks += 1;
                bytes.zeroize();
                let _ = events.send(RecorderEvent::ChunkReceived {
                    session,
                    index,
                    len,
                });
            }
            CaptureSignal::Drained => break,
            CaptureSignal::Error(message) => {
                error!(session, error = %message, "Input device failed during recording");
                if let Some(from) = state.fail() {
                    announce(&events, session, from, RecordingState::Failed);
                }
                let _ = events.send(RecorderEvent::Warning {
                    message: format!("Recording stopped: {}", message),
                });
                *failure.lock() = Some(message);
                lease.lock().release();
                break;
            }
        }
    }

    collected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::symphonia_decoder::SymphoniaDecoder;
    use crate::domain::container::{read_duration_ms, ContainerDurationRepair, RepairOutcome};
    use crate::ports::{AudioDecoder, OpenFailure};
    use crate::testing::{device, webm_header_chunk, FakeCaptureBackend};

    fn recorder(backend: &Arc<FakeCaptureBackend>) -> StreamRecorder {
        let backend: Arc<dyn CaptureBackend> = Arc::clone(backend) as Arc<dyn CaptureBackend>;
        StreamRecorder::new(Arc::new(DeviceResolver::new(backend)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_chunks_then_stop_is_repaired_to_elapsed_time() {
        let backend = Arc::new(FakeCaptureBackend::new());
        let recorder = recorder(&backend);

        let mut session = recorder.start(CaptureRequest::any()).await.unwrap();
        let stream = backend.last_stream();
        stream.deliver(webm_header_chunk(4096));
        stream.deliver(vec![0x11; 2048]);
        stream.deliver(vec![0x22; 1024]);
        tokio::time::advance(Duration::from_millis(1500)).await;

        let mut blob = recorder.stop(&mut session).await.unwrap().unwrap();
        assert_eq!(blob.len(), 7168);
        assert_eq!(blob.measured_duration_ms(), 1500);

        let outcome = ContainerDurationRepair::default()
            .repair(&mut blob, 1500)
            .unwrap();
        assert!(matches!(outcome, RepairOutcome::Patched { .. }));
        assert_eq!(blob.duration_ms(), Some(1500));
        assert_eq!(read_duration_ms(blob.bytes()).unwrap(), Some(1500));
        assert_eq!(blob.len(), 7168);
    }

    #[tokio::test(start_paused = true)]
    async fn test_instant_stop_yields_empty_blob() {
        let backend = Arc::new(FakeCaptureBackend::new());
        let recorder = recorder(&backend);

        let mut session = recorder.start(CaptureRequest::any()).await.unwrap();
        let mut blob = recorder.stop(&mut session).await.unwrap().unwrap();
        assert!(blob.is_empty());
        assert_eq!(blob.measured_duration_ms(), 0);

        let outcome = ContainerDurationRepair::default().repair(&mut blob, 0).unwrap();
        assert_eq!(outcome, RepairOutcome::EmptyPayload);
        assert_eq!(blob.duration_ms(), Some(0));

        let err = SymphoniaDecoder::new(16_000).decode(&blob).await.unwrap_err();
        assert!(matches!(err, DomainError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_payload_is_chunks_in_arrival_order() {
        let backend = Arc::new(FakeCaptureBackend::new());
        let recorder = recorder(&backend);

        let mut session = recorder.start(CaptureRequest::any()).await.unwrap();
        let stream = backend.last_stream();
        stream.deliver(vec![1, 2, 3]);
        stream.deliver(Vec::new());
        stream.deliver(vec![4]);
        stream.deliver_on_stop(vec![5, 6]);

        let blob = recorder.stop(&mut session).await.unwrap().unwrap();
        assert_eq!(blob.bytes(), &[1, 2, 3, 4, 5, 6]);
        assert_eq!(stream.stop_requests(), 1);
        assert_eq!(session.state(), RecordingState::Stopped);
    }

    #[tokio::test]
    async fn test_negotiates_first_supported_encoding() {
        let backend = Arc::new(
            FakeCaptureBackend::new().supporting(&["audio/mp4", "audio/ogg;codecs=opus"]),
        );
        let recorder = recorder(&backend);

        let session = recorder.start(CaptureRequest::any()).await.unwrap();
        assert_eq!(session.encoding().as_str(), "audio/ogg;codecs=opus");
        assert_eq!(
            backend.last_stream().encoding().unwrap().as_str(),
            "audio/ogg;codecs=opus"
        );
    }

    #[tokio::test]
    async fn test_no_supported_encoding_releases_device() {
        let backend = Arc::new(FakeCaptureBackend::new().supporting(&[]));
        let recorder = recorder(&backend);

        let err = recorder.start(CaptureRequest::any()).await.err().unwrap();
        assert_eq!(err.capture_kind(), Some(CaptureErrorKind::Unknown));
        assert_eq!(backend.releases(), 1);
        assert!(!recorder.is_recording());
    }

    #[tokio::test]
    async fn test_second_start_fails_fast() {
        let backend = Arc::new(FakeCaptureBackend::new());
        let recorder = recorder(&backend);

        let mut session = recorder.start(CaptureRequest::any()).await.unwrap();
        let err = recorder.start(CaptureRequest::any()).await.err().unwrap();
        assert!(matches!(err, DomainError::AlreadyRecording));
        assert_eq!(backend.attempts().len(), 1);

        recorder.stop(&mut session).await.unwrap();
        assert!(recorder.start(CaptureRequest::any()).await.is_ok());
    }

    #[tokio::test]
    async fn test_lost_collector_fails_session_and_frees_device() {
        let backend = Arc::new(FakeCaptureBackend::new());
        let recorder = recorder(&backend);

        let mut session = recorder.start(CaptureRequest::any()).await.unwrap();
        backend.last_stream().deliver(vec![9; 16]);
        session.collector.as_ref().unwrap().abort();

        let err = recorder.stop(&mut session).await.unwrap_err();
        assert_eq!(err.capture_kind(), Some(CaptureErrorKind::Unknown));
        assert_eq!(session.state(), RecordingState::Failed);
        assert_eq!(backend.releases(), 1);
        assert!(!recorder.is_recording());

        assert!(recorder.stop(&mut session).await.unwrap().is_none());
        assert!(recorder.start(CaptureRequest::any()).await.is_ok());
    }

    #[tokio::test]
    async fn test_device_released_exactly_once() {
        let backend = Arc::new(FakeCaptureBackend::new());
        let recorder = recorder(&backend);

        let mut session = recorder.start(CaptureRequest::any()).await.unwrap();
        assert!(recorder.is_recording());
        recorder.stop(&mut session).await.unwrap();
        assert_eq!(backend.releases(), 1);
        assert!(!recorder.is_recording());

        assert!(recorder.stop(&mut session).await.unwrap().is_none());
        drop(session);
        assert_eq!(backend.releases(), 1);
    }

    #[tokio::test]
    async fn test_dropping_session_releases_device() {
        let backend = Arc::new(FakeCaptureBackend::new());
        let recorder = recorder(&backend);

        let session = recorder.start(CaptureRequest::any()).await.unwrap();
        drop(session);
        assert_eq!(backend.releases(), 1);
        assert!(!recorder.is_recording());
    }

    #[tokio::test]
    async fn test_failed_open_frees_the_recorder() {
        let backend = Arc::new(FakeCaptureBackend::new());
        backend.script_open([Err(OpenFailure::PermissionDenied)]);
        let recorder = recorder(&backend);

        let err = recorder.start(CaptureRequest::any()).await.err().unwrap();
        assert_eq!(err.capture_kind(), Some(CaptureErrorKind::PermissionDenied));
        assert!(!recorder.is_recording());
        assert!(recorder.start(CaptureRequest::any()).await.is_ok());
    }

    #[tokio::test]
    async fn test_no_devices_and_not_found_is_no_microphone() {
        let backend = Arc::new(FakeCaptureBackend::with_devices(Vec::new()));
        backend.script_open([Err(OpenFailure::NotFound), Err(OpenFailure::NotFound)]);
        let recorder = recorder(&backend);

        let err = recorder
            .start(CaptureRequest::for_device("usb-mic"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.capture_kind(), Some(CaptureErrorKind::NoMicrophone));
        assert_eq!(backend.attempts().len(), 2);
        assert!(!recorder.is_recording());
    }

    #[tokio::test]
    async fn test_device_error_fails_session_and_reports_once() {
        let backend = Arc::new(FakeCaptureBackend::new());
        let recorder = recorder(&backend);

        let mut session = recorder.start(CaptureRequest::any()).await.unwrap();
        let stream = backend.last_stream();
        stream.deliver(vec![1, 2, 3]);
        stream.fail("device unplugged");

        while session.state() != RecordingState::Failed {
            tokio::task::yield_now().await;
        }
        assert_eq!(backend.releases(), 1);
        assert!(!recorder.is_recording());

        let err = recorder.stop(&mut session).await.unwrap_err();
        assert_eq!(err.capture_kind(), Some(CaptureErrorKind::Unknown));
        assert!(recorder.stop(&mut session).await.unwrap().is_none());
        assert_eq!(backend.releases(), 1);
    }

    #[tokio::test]
    async fn test_preferred_device_fallback_is_announced() {
        let backend = Arc::new(FakeCaptureBackend::with_devices(vec![device(
            "usb", "USB Mic",
        )]));
        backend.script_open([Err(OpenFailure::NotFound)]);
        let recorder = recorder(&backend);
        let mut events = recorder.subscribe();

        let session = recorder.start_with_preferred(Some("usb")).await.unwrap();
        assert_eq!(session.device_label(), "Default Microphone");

        let attempts = backend.attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].device_id.as_deref(), Some("usb"));
        assert!(attempts[1].device_id.is_none());

        let mut saw_fallback = false;
        while let Ok(event) = events.try_recv() {
            if let RecorderEvent::DeviceFallback { requested } = event {
                assert_eq!(requested, "usb");
                saw_fallback = true;
            }
        }
        assert!(saw_fallback);
    }

    #[tokio::test]
    async fn test_state_events_follow_lifecycle() {
        let backend = Arc::new(FakeCaptureBackend::new());
        let recorder = recorder(&backend);
        let mut events = recorder.subscribe();

        let mut session = recorder.start(CaptureRequest::any()).await.unwrap();
        recorder.discard(&mut session).await;

        let mut transitions = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let RecorderEvent::StateChanged { from, to, .. } = event {
                transitions.push((from, to));
            }
        }
        assert_eq!(
            transitions,
            vec![
                (RecordingState::Idle, RecordingState::Recording),
                (RecordingState::Recording, RecordingState::Stopping),
                (RecordingState::Stopping, RecordingState::Stopped),
            ]
        );
    }
}
