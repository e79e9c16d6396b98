pub mod capture;
pub mod config;
pub mod decoder;
pub mod engine;

pub use capture::{CaptureBackend, CaptureSignal, CaptureStream, OpenFailure};
pub use config::ConfigStore;
pub use decoder::AudioDecoder;
pub use engine::{EngineHandle, TranscriptionEngine};
