use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::domain::{
    CoordinatorState, DomainError, JobId, JobOutcome, JobState, ProgressEvent, SampleBuffer,
};
use crate::ports::{EngineHandle, TranscriptionEngine};

/// Returned when a job is submitted while another is still active.
///
/// Carries the rejected samples back untouched.
#[derive(Error, Debug)]
#[error("Transcription job {active_job} is still active")]
pub struct BusyError {
    active_job: JobId,
    samples: SampleBuffer,
}

impl BusyError {
    pub fn active_job(&self) -> JobId {
        self.active_job
    }

    pub fn into_samples(self) -> SampleBuffer {
        self.samples
    }
}

impl From<BusyError> for DomainError {
    fn from(err: BusyError) -> Self {
        DomainError::Busy {
            active_job: err.active_job,
        }
    }
}

/// Caller's handle on a submitted job.
#[derive(Debug)]
pub struct TranscriptionJob {
    id: JobId,
    outcome: oneshot::Receiver<JobOutcome>,
}

impl TranscriptionJob {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Wait for the job's terminal outcome.
    pub async fn outcome(self) -> JobOutcome {
        self.outcome.await.unwrap_or(JobOutcome::Cancelled)
    }
}

struct ActiveJob {
    id: JobId,
    state: JobState,
    samples: Option<SampleBuffer>,
    cancel: Option<oneshot::Sender<()>>,
    outcome: Option<oneshot::Sender<JobOutcome>>,
    progress: Option<mpsc::UnboundedReceiver<ProgressEvent>>,
}

struct Shared {
    engine: Arc<dyn TranscriptionEngine>,
    active: Mutex<Option<ActiveJob>>,
    next_id: AtomicU64,
    poll_interval: Duration,
}

impl Shared {
    /// Remove `id` if it is still the active job, handing back its outcome
    /// sender. Whoever removes the job delivers its outcome.
    fn retire(&self, id: JobId) -> Option<ActiveJob> {
        let mut active = self.active.lock();
        match active.as_ref() {
            Some(job) if job.id == id => active.take(),
            _ => None,
        }
    }

    fn finish(&self, id: JobId, outcome: JobOutcome) {
        match self.retire(id).and_then(|mut job| job.outcome.take()) {
            Some(sender) => {
                info!(job = %id, state = ?outcome.state(), "Transcription finished");
                let _ = sender.send(outcome);
            }
            None => debug!(job = %id, "Discarding result of a cancelled job"),
        }
    }
}

/// Runs at most one transcription job at a time against an engine.
///
/// Submitting while a job is queued or running is rejected rather than
/// queued, so a stale dictation never overwrites a newer one.
pub struct TranscriptionCoordinator {
    shared: Arc<Shared>,
}

impl TranscriptionCoordinator {
    pub fn new(engine: Arc<dyn TranscriptionEngine>, poll_interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                engine,
                active: Mutex::new(None),
                next_id: AtomicU64::new(0),
                poll_interval: poll_interval.max(Duration::from_millis(1)),
            }),
        }
    }

    /// Queue `samples` for transcription. Must be called within a tokio runtime.
    pub fn submit(&self, samples: SampleBuffer) -> Result<TranscriptionJob, BusyError> {
        let mut active = self.shared.active.lock();
        if let Some(job) = active.as_ref() {
            warn!(active_job = %job.id, "Rejecting submit while a job is active");
            return Err(BusyError {
                active_job: job.id,
                samples,
            });
        }

        let id = JobId::new(self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();

        debug!(
            job = %id,
            frames = samples.frame_count(),
            sample_rate = samples.sample_rate(),
            "Transcription queued"
        );
        *active = Some(ActiveJob {
            id,
            state: JobState::Queued,
            samples: Some(samples),
            cancel: Some(cancel_tx),
            outcome: Some(outcome_tx),
            progress: Some(progress_rx),
        });
        drop(active);

        tokio::spawn(drive(Arc::clone(&self.shared), id, cancel_rx, progress_tx));
        Ok(TranscriptionJob {
            id,
            outcome: outcome_rx,
        })
    }

    /// Progress stream for `id`. Available once per job; ends with the job.
    pub fn on_progress(&self, id: JobId) -> Option<mpsc::UnboundedReceiver<ProgressEvent>> {
        self.shared
            .active
            .lock()
            .as_mut()
            .filter(|job| job.id == id)
            .and_then(|job| job.progress.take())
    }

    /// Cancel `id`. The coordinator is idle when this returns true.
    ///
    /// A queued job never reaches the engine. A running job is interrupted
    /// best-effort and whatever it produces later is dropped.
    pub fn cancel(&self, id: JobId) -> bool {
        let Some(mut job) = self.shared.retire(id) else {
            return false;
        };

        if let Some(signal) = job.cancel.take() {
            let _ = signal.send(());
        }
        if let Some(sender) = job.outcome.take() {
            let _ = sender.send(JobOutcome::Cancelled);
        }
        info!(job = %id, from = ?job.state, "Transcription cancelled");
        true
    }

    pub fn state(&self) -> CoordinatorState {
        match self.shared.active.lock().as_ref() {
            None => CoordinatorState::Idle,
            Some(job) if job.state == JobState::Queued => CoordinatorState::Queued(job.id),
            Some(job) => CoordinatorState::Running(job.id),
        }
    }

    pub fn active_job(&self) -> Option<JobId> {
        self.shared.active.lock().as_ref().map(|job| job.id)
    }

    pub fn engine_name(&self) -> String {
        self.shared.engine.name().to_string()
    }
}

async fn drive(
    shared: Arc<Shared>,
    id: JobId,
    mut cancel: oneshot::Receiver<()>,
    progress: mpsc::UnboundedSender<ProgressEvent>,
) {
    let samples = {
        let mut active = shared.active.lock();
        match active.as_mut() {
            Some(job) if job.id == id => {
                job.state = JobState::Running;
                job.samples.take()
            }
            _ => None,
        }
    };
    let Some(samples) = samples else {
        debug!(job = %id, "Job cancelled before it started");
        return;
    };

    let engine = Arc::clone(&shared.engine);
    debug!(job = %id, engine = engine.name(), "Transcription running");

    let handle = match engine.submit_job(samples).await {
        Ok(handle) => handle,
        Err(e) => {
            shared.finish(id, JobOutcome::Failed(e));
            return;
        }
    };
    if !matches!(cancel.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
        interrupt(engine.as_ref(), id, &handle).await;
        return;
    }

    let mut ticker = tokio::time::interval(shared.poll_interval);
    let result = engine.result(&handle);
    tokio::pin!(result);

    let outcome = loop {
        tokio::select! {
            biased;
            _ = &mut cancel => {
                interrupt(engine.as_ref(), id, &handle).await;
                return;
            }
            result = &mut result => {
                break match result {
                    Ok(text) => JobOutcome::Succeeded(text),
                    Err(e) => JobOutcome::Failed(e),
                };
            }
            _ = ticker.tick() => {
                for event in engine.poll_progress(&handle).await {
                    let _ = progress.send(event);
                }
            }
        }
    };

    for event in engine.poll_progress(&handle).await {
        let _ = progress.send(event);
    }
    shared.finish(id, outcome);
}

async fn interrupt(engine: &dyn TranscriptionEngine, id: JobId, handle: &EngineHandle) {
    let stopped = engine.cancel(handle).await;
    debug!(job = %id, stopped, "Engine asked to cancel");
}
