use async_trait::async_trait;

use crate::domain::{DomainError, ProgressEvent, SampleBuffer};

/// Engine-side identifier of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EngineHandle(pub String);

/// Port for the external speech-to-text engine.
///
/// The pipeline only relies on this submit / poll / result shape; model
/// loading and inference are the engine's business.
#[async_trait]
pub trait TranscriptionEngine: Send + Sync {
    /// Start transcribing `samples`. The engine owns the buffer from here on.
    async fn submit_job(&self, samples: SampleBuffer) -> Result<EngineHandle, DomainError>;

    /// Progress events reported since the last poll.
    async fn poll_progress(&self, handle: &EngineHandle) -> Vec<ProgressEvent>;

    /// Wait for the job to finish.
    async fn result(&self, handle: &EngineHandle) -> Result<String, DomainError>;

    /// Best-effort interruption. Returns false if the engine cannot stop the
    /// job early; the caller discards its result either way.
    async fn cancel(&self, handle: &EngineHandle) -> bool;

    /// Backend name for display and logs.
    fn name(&self) -> &str;
}
