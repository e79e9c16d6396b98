pub mod controller;
pub mod coordinator;
pub mod device_resolver;
pub mod recorder;

pub use controller::{
    CompletedRecording, PendingTranscription, StopError, VoiceNoteController, VoiceNoteHandle,
};
pub use coordinator::{BusyError, TranscriptionCoordinator, TranscriptionJob};
pub use device_resolver::{Acquisition, DeviceResolver};
pub use recorder::{RecordingSession, StreamRecorder};
