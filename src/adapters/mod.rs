pub mod config_store;
pub mod cpal_capture;
pub mod symphonia_decoder;
pub mod webm_muxer;
#[cfg(feature = "whisper")]
pub mod whisper_cpp;

pub use config_store::TomlConfigStore;
pub use cpal_capture::CpalCaptureBackend;
pub use symphonia_decoder::SymphoniaDecoder;
pub use webm_muxer::WebmMuxer;
#[cfg(feature = "whisper")]
pub use whisper_cpp::WhisperCppEngine;
