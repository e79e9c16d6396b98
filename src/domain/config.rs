use serde::{Deserialize, Serialize};

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Enable file logging with rotation.
    pub file_logging: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_logging: true,
        }
    }
}

/// Capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Device id to try first. Any input is used if it cannot be opened.
    pub preferred_device: Option<String>,
    /// How often the capture backend emits a chunk, in milliseconds.
    pub timeslice_ms: u64,
    /// Capacity of the capture ring buffer in seconds of audio. The ring is
    /// drained every timeslice, so this only has to absorb scheduling stalls.
    pub buffer_duration_secs: u32,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            preferred_device: None,
            timeslice_ms: 250,
            buffer_duration_secs: 10,
        }
    }
}

/// Decoding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodingConfig {
    /// Every decoded buffer is resampled to this rate.
    pub target_sample_rate: u32,
}

impl Default for DecodingConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: 16_000, // 16kHz for Whisper
        }
    }
}

/// Transcription configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    /// Path to the local model file, if a local engine is used.
    pub model_path: Option<String>,
    /// Language code (e.g., "en", "fr", "auto").
    pub language: String,
    /// Number of threads to use (0 = auto).
    pub threads: u32,
    /// How often engine progress is polled while a job runs.
    pub progress_poll_interval_ms: u64,
    /// Inserted between successive dictation passes in a note.
    pub note_separator: String,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            language: "auto".to_string(),
            threads: 0,
            progress_poll_interval_ms: 100,
            note_separator: " ".to_string(),
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub recording: RecordingConfig,
    pub decoding: DecodingConfig,
    pub transcription: TranscriptionConfig,
}

impl AppConfig {
    /// Create a new AppConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::new();
        assert_eq!(config.decoding.target_sample_rate, 16_000);
        assert_eq!(config.recording.timeslice_ms, 250);
        assert_eq!(config.transcription.note_separator, " ");
        assert!(config.recording.preferred_device.is_none());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [recording]
            preferred_device = "usb-headset"

            [transcription]
            language = "en"
            "#,
        )
        .unwrap();

        assert_eq!(config.recording.preferred_device.as_deref(), Some("usb-headset"));
        assert_eq!(config.recording.timeslice_ms, 250);
        assert_eq!(config.transcription.language, "en");
        assert_eq!(config.transcription.progress_poll_interval_ms, 100);
        assert_eq!(config.logging.level, "info");
    }
}
