use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::app::coordinator::TranscriptionCoordinator;
use crate::app::device_resolver::DeviceResolver;
use crate::app::recorder::{RecordingSession, StreamRecorder};
use crate::domain::container::ContainerDurationRepair;
use crate::domain::{
    AppConfig, CoordinatorState, DeviceDescriptor, DomainError, JobId, JobOutcome, MediaBlob,
    NoteDraft, RecorderEvent, SampleBuffer, TranscriptEvent,
};
use crate::ports::{AudioDecoder, CaptureBackend, ConfigStore, TranscriptionEngine};

type TranscriptListener = Arc<dyn Fn(&TranscriptEvent) + Send + Sync>;

/// A finished recording and the transcription job it started.
#[derive(Debug)]
pub struct CompletedRecording {
    pub blob: MediaBlob,
    pub job_id: JobId,
}

/// A decoded recording that was not submitted because another dictation was
/// still being transcribed. Hand it to [`VoiceNoteController::resubmit`] once
/// the coordinator is idle.
#[derive(Debug)]
pub struct PendingTranscription {
    pub blob: MediaBlob,
    samples: SampleBuffer,
}

impl PendingTranscription {
    pub fn samples(&self) -> &SampleBuffer {
        &self.samples
    }
}

#[derive(Error, Debug)]
pub enum StopError {
    /// The recording is intact in `pending`.
    #[error("Transcription job {active_job} is still active")]
    Busy {
        active_job: JobId,
        pending: PendingTranscription,
    },

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl StopError {
    pub fn into_pending(self) -> Option<PendingTranscription> {
        match self {
            StopError::Busy { pending, .. } => Some(pending),
            StopError::Domain(_) => None,
        }
    }
}

impl From<StopError> for DomainError {
    fn from(err: StopError) -> Self {
        match err {
            StopError::Busy { active_job, .. } => DomainError::Busy { active_job },
            StopError::Domain(e) => e,
        }
    }
}

struct Pipeline {
    recorder: StreamRecorder,
    repair: ContainerDurationRepair,
    decoder: Arc<dyn AudioDecoder>,
    coordinator: TranscriptionCoordinator,
    note: Mutex<NoteDraft>,
    listeners: RwLock<Vec<TranscriptListener>>,
    config: RwLock<AppConfig>,
    config_store: Option<Arc<dyn ConfigStore>>,
}

impl Pipeline {
    fn submit(
        self: &Arc<Self>,
        blob: MediaBlob,
        samples: SampleBuffer,
    ) -> Result<CompletedRecording, StopError> {
        let job = match self.coordinator.submit(samples) {
            Ok(job) => job,
            Err(busy) => {
                let active_job = busy.active_job();
                warn!(active = %active_job, bytes = blob.len(), "Transcription busy, recording kept for resubmission");
                return Err(StopError::Busy {
                    active_job,
                    pending: PendingTranscription {
                        blob,
                        samples: busy.into_samples(),
                    },
                });
            }
        };
        let job_id = job.id();

        let delivery = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = job.outcome().await;
            delivery.deliver(job_id, outcome);
        });

        info!(job = %job_id, bytes = blob.len(), "Voice note submitted for transcription");
        Ok(CompletedRecording { blob, job_id })
    }

    fn deliver(&self, job_id: JobId, outcome: JobOutcome) {
        let event = match outcome {
            JobOutcome::Succeeded(text) => {
                let text = text.trim().to_string();
                let note = self.note.lock().append(&text).to_string();
                info!(job = %job_id, chars = text.len(), "Dictation appended to note");
                TranscriptEvent::Ready { job_id, text, note }
            }
            JobOutcome::Failed(e) => {
                warn!(job = %job_id, error = %e, "Transcription failed");
                TranscriptEvent::Failed {
                    job_id,
                    message: e.to_string(),
                }
            }
            JobOutcome::Cancelled => TranscriptEvent::Cancelled { job_id },
        };

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener(&event);
        }
    }
}

/// Voice-note entry point for a clinical form.
///
/// Wires recorder, duration repair, decoder and transcription together and
/// keeps the note text the form shows.
#[derive(Clone)]
pub struct VoiceNoteController {
    pipeline: Arc<Pipeline>,
}

impl VoiceNoteController {
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        decoder: Arc<dyn AudioDecoder>,
        engine: Arc<dyn TranscriptionEngine>,
        config: AppConfig,
    ) -> Self {
        Self::build(backend, decoder, engine, config, None)
    }

    /// Load settings from `store` and persist device preference changes to it.
    pub fn with_config_store(
        backend: Arc<dyn CaptureBackend>,
        decoder: Arc<dyn AudioDecoder>,
        engine: Arc<dyn TranscriptionEngine>,
        store: Arc<dyn ConfigStore>,
    ) -> Result<Self, DomainError> {
        let config = store.load()?;
        Ok(Self::build(backend, decoder, engine, config, Some(store)))
    }

    fn build(
        backend: Arc<dyn CaptureBackend>,
        decoder: Arc<dyn AudioDecoder>,
        engine: Arc<dyn TranscriptionEngine>,
        config: AppConfig,
        config_store: Option<Arc<dyn ConfigStore>>,
    ) -> Self {
        let resolver = Arc::new(DeviceResolver::new(backend));
        let coordinator = TranscriptionCoordinator::new(
            engine,
            Duration::from_millis(config.transcription.progress_poll_interval_ms),
        );
        let note = NoteDraft::new("", config.transcription.note_separator.clone());

        info!(
            engine = %coordinator.engine_name(),
            sample_rate = decoder.target_sample_rate(),
            "VoiceNoteController initialized"
        );

        Self {
            pipeline: Arc::new(Pipeline {
                recorder: StreamRecorder::new(resolver),
                repair: ContainerDurationRepair::default(),
                decoder,
                coordinator,
                note: Mutex::new(note),
                listeners: RwLock::new(Vec::new()),
                config: RwLock::new(config),
                config_store,
            }),
        }
    }

    pub fn config(&self) -> AppConfig {
        self.pipeline.config.read().clone()
    }

    pub async fn list_input_devices(&self) -> Result<Vec<DeviceDescriptor>, DomainError> {
        self.pipeline.recorder.resolver().list_input_devices().await
    }

    /// Remember the device to record from. Saved if a config store is attached.
    pub fn set_preferred_device(&self, device_id: Option<String>) -> Result<(), DomainError> {
        let mut config = self.pipeline.config.read().clone();
        config.recording.preferred_device = device_id;
        if let Some(store) = &self.pipeline.config_store {
            store.save(&config)?;
        }
        *self.pipeline.config.write() = config;
        debug!("Preferred input device updated");
        Ok(())
    }

    /// Start recording a voice note from the preferred device.
    pub async fn record_voice_note(&self) -> Result<VoiceNoteHandle, DomainError> {
        let preferred = self.pipeline.config.read().recording.preferred_device.clone();
        let session = self
            .pipeline
            .recorder
            .start_with_preferred(preferred.as_deref())
            .await?;
        Ok(VoiceNoteHandle {
            pipeline: Arc::clone(&self.pipeline),
            session,
        })
    }

    /// Called for every finished dictation pass, whatever its outcome.
    pub fn on_transcript(&self, listener: impl Fn(&TranscriptEvent) + Send + Sync + 'static) {
        self.pipeline.listeners.write().push(Arc::new(listener));
    }

    /// Called with `(text, note)` when a pass is transcribed.
    pub fn on_transcript_ready(&self, listener: impl Fn(&str, &str) + Send + Sync + 'static) {
        self.on_transcript(move |event| {
            if let TranscriptEvent::Ready { text, note, .. } = event {
                listener(text, note);
            }
        });
    }

    pub fn note_text(&self) -> String {
        self.pipeline.note.lock().text().to_string()
    }

    /// Replace the note after a manual edit.
    pub fn set_note_text(&self, text: impl Into<String>) {
        self.pipeline.note.lock().set_text(text);
    }

    /// Cancel the pending transcription, if any.
    pub fn cancel_transcription(&self) -> bool {
        match self.pipeline.coordinator.active_job() {
            Some(id) => self.pipeline.coordinator.cancel(id),
            None => false,
        }
    }

    /// Submit a recording that an earlier stop could not hand over.
    pub fn resubmit(
        &self,
        pending: PendingTranscription,
    ) -> Result<CompletedRecording, StopError> {
        self.pipeline.submit(pending.blob, pending.samples)
    }

    pub fn transcription_state(&self) -> CoordinatorState {
        self.pipeline.coordinator.state()
    }

    pub fn is_recording(&self) -> bool {
        self.pipeline.recorder.is_recording()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecorderEvent> {
        self.pipeline.recorder.subscribe()
    }
}

/// A voice note being recorded.
pub struct VoiceNoteHandle {
    pipeline: Arc<Pipeline>,
    session: RecordingSession,
}

impl VoiceNoteHandle {
    pub fn session(&self) -> &RecordingSession {
        &self.session
    }

    /// Stop recording and hand the audio to transcription.
    ///
    /// Duration repair problems are logged and do not stop the pipeline. The
    /// transcript arrives later through the controller's listeners. If another
    /// dictation is still being transcribed the recording comes back in
    /// [`StopError::Busy`].
    pub async fn stop(mut self) -> Result<CompletedRecording, StopError> {
        let pipeline = Arc::clone(&self.pipeline);
        let mut blob = pipeline
            .recorder
            .stop(&mut self.session)
            .await?
            .ok_or(DomainError::NotRecording)?;

        let measured = blob.measured_duration_ms();
        match pipeline.repair.repair(&mut blob, measured) {
            Ok(outcome) => debug!(outcome = ?outcome, "Container duration checked"),
            Err(e) => warn!(error = %e, "Duration repair failed, continuing with unpatched recording"),
        }

        let samples = pipeline.decoder.decode(&blob).await?;
        pipeline.submit(blob, samples)
    }

    /// Throw the recording away without transcribing it.
    pub async fn cancel(mut self) {
        let pipeline = Arc::clone(&self.pipeline);
        pipeline.recorder.discard(&mut self.session).await;
        info!(session = self.session.id(), "Voice note cancelled");
    }
}
