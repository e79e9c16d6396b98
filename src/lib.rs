#![forbid(unsafe_code)]

//! Voice-note capture and transcription for clinical forms.
//!
//! A [`VoiceNoteController`] records from the microphone, repairs the
//! container duration streaming recorders leave unset, decodes to PCM and runs
//! one transcription job at a time, appending each pass to the note.

pub mod adapters;
pub mod app;
pub mod domain;
pub mod infrastructure;
pub mod ports;

#[cfg(test)]
mod testing;

pub use app::{
    BusyError, CompletedRecording, DeviceResolver, PendingTranscription, RecordingSession,
    StopError, StreamRecorder, TranscriptionCoordinator, TranscriptionJob, VoiceNoteController,
    VoiceNoteHandle,
};
pub use domain::container::{ContainerDurationRepair, RepairOutcome};
pub use domain::{
    AppConfig, CaptureErrorKind, CaptureRequest, DeviceDescriptor, DomainError, Encoding, JobId,
    JobOutcome, MediaBlob, SampleBuffer, TranscriptEvent,
};
