pub mod config;
pub mod container;
pub mod device;
pub mod error;
pub mod recording;
pub mod samples;
pub mod transcription;

pub use config::AppConfig;
pub use device::{CaptureRequest, DeviceDescriptor};
pub use error::{CaptureErrorKind, DomainError};
pub use recording::{
    negotiate_encoding, AtomicRecordingState, ContainerFamily, Encoding, MediaBlob,
    RecorderEvent, RecordingState, ENCODING_PREFERENCES,
};
pub use samples::SampleBuffer;
pub use transcription::{
    CoordinatorState, JobId, JobOutcome, JobState, NoteDraft, ProgressEvent, TranscriptEvent,
};
