use serde::{Deserialize, Serialize};

use crate::domain::DomainError;

/// Identifier of one transcription attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(u64);

impl JobId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Lifecycle of a transcription job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }
}

/// What a coordinator is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "job")]
pub enum CoordinatorState {
    Idle,
    Queued(JobId),
    Running(JobId),
}

impl CoordinatorState {
    pub fn is_idle(&self) -> bool {
        matches!(self, CoordinatorState::Idle)
    }
}

/// Loading or inference progress reported by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Resource being worked on, e.g. "model-weights".
    pub resource: String,
    /// Completion ratio, 0.0-1.0.
    pub ratio: f32,
}

impl ProgressEvent {
    pub fn new(resource: impl Into<String>, ratio: f32) -> Self {
        Self {
            resource: resource.into(),
            ratio: ratio.clamp(0.0, 1.0),
        }
    }
}

/// Terminal result of a job. Exactly one is delivered per job.
#[derive(Debug)]
pub enum JobOutcome {
    Succeeded(String),
    Failed(DomainError),
    Cancelled,
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Succeeded(_) => JobState::Succeeded,
            JobOutcome::Failed(_) => JobState::Failed,
            JobOutcome::Cancelled => JobState::Cancelled,
        }
    }
}

/// Notification sent to form listeners when a dictation pass finishes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum TranscriptEvent {
    Ready {
        job_id: JobId,
        /// Text from this pass only.
        text: String,
        /// Full note after appending this pass.
        note: String,
    },
    Failed {
        job_id: JobId,
        message: String,
    },
    Cancelled {
        job_id: JobId,
    },
}

/// Free-text note built up from successive dictation passes.
#[derive(Debug, Clone, Default)]
pub struct NoteDraft {
    text: String,
    separator: String,
}

impl NoteDraft {
    pub fn new(initial: impl Into<String>, separator: impl Into<String>) -> Self {
        Self {
            text: initial.into(),
            separator: separator.into(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Replace the note, e.g. after the user edited it by hand.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }

    /// Append a dictation pass. Blank passes leave the note untouched.
    pub fn append(&mut self, pass: &str) -> &str {
        let pass = pass.trim();
        if pass.is_empty() {
            return &self.text;
        }
        if !self.text.trim().is_empty() {
            self.text.push_str(&self.separator);
        } else {
            self.text.clear();
        }
        self.text.push_str(pass);
        &self.text
    }
}
