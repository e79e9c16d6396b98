use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::recording::RecordingState;
use crate::domain::transcription::JobId;

/// Why a microphone could not be opened.
///
/// Each kind maps to different user-facing guidance, so callers match on the
/// variant rather than on the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureErrorKind {
    /// No input device exists and an unconstrained open also failed.
    NoMicrophone,
    /// The user or platform refused microphone access.
    PermissionDenied,
    /// Another application (or another session) holds the device.
    DeviceBusy,
    /// The platform only grants capture from a secure context.
    InsecureContext,
    Unknown,
}

impl std::fmt::Display for CaptureErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CaptureErrorKind::NoMicrophone => "no microphone",
            CaptureErrorKind::PermissionDenied => "permission denied",
            CaptureErrorKind::DeviceBusy => "device busy",
            CaptureErrorKind::InsecureContext => "insecure context",
            CaptureErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Domain-level errors for the dictation pipeline.
#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Capture failed ({kind}): {message}")]
    Capture {
        kind: CaptureErrorKind,
        message: String,
    },

    #[error("Device enumeration failed: {0}")]
    DeviceEnumeration(String),

    #[error("Already recording")]
    AlreadyRecording,

    #[error("Not currently recording")]
    NotRecording,

    #[error("Invalid recording state transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        from: RecordingState,
        to: RecordingState,
    },

    #[error("No duration patcher for container encoding {encoding}")]
    UnsupportedContainer { encoding: String },

    #[error("Malformed container: {0}")]
    MalformedContainer(String),

    #[error("Decode failed: {reason}")]
    Decode { reason: String },

    #[error("Transcription job {active_job} is still active")]
    Busy { active_job: JobId },

    #[error("Transcription engine error: {0}")]
    TranscriptionEngine(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl DomainError {
    pub fn capture(kind: CaptureErrorKind, message: impl Into<String>) -> Self {
        DomainError::Capture {
            kind,
            message: message.into(),
        }
    }

    pub fn decode(reason: impl Into<String>) -> Self {
        DomainError::Decode {
            reason: reason.into(),
        }
    }

    /// Capture kind, if this is a capture failure.
    pub fn capture_kind(&self) -> Option<CaptureErrorKind> {
        match self {
            DomainError::Capture { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DomainError {
    fn from(err: std::io::Error) -> Self {
        DomainError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for DomainError {
    fn from(err: toml::de::Error) -> Self {
        DomainError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for DomainError {
    fn from(err: toml::ser::Error) -> Self {
        DomainError::Serialization(err.to_string())
    }
}
