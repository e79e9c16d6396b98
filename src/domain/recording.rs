use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use zeroize::Zeroize;

/// Recording session state machine.
///
/// State transitions:
/// - Idle -> Recording (start)
/// - Recording -> Stopping (stop requested, capture primitive draining)
/// - Stopping -> Stopped (drained, blob finalized)
/// - Idle/Recording/Stopping -> Failed (device error)
///
/// Stopped and Failed are terminal. A new session is needed to record again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RecordingState {
    Idle = 0,
    Recording = 1,
    Stopping = 2,
    Stopped = 3,
    Failed = 4,
}

impl RecordingState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordingState::Stopped | RecordingState::Failed)
    }

    /// Chunks may still arrive while recording or while the primitive drains.
    #[must_use]
    pub fn accepts_chunks(&self) -> bool {
        matches!(self, RecordingState::Recording | RecordingState::Stopping)
    }

    /// Edges of the session lifecycle. Anything not listed is rejected.
    #[must_use]
    pub fn can_transition_to(&self, next: RecordingState) -> bool {
        use RecordingState::*;
        matches!(
            (*self, next),
            (Idle, Recording)
                | (Recording, Stopping)
                | (Stopping, Stopped)
                | (Idle | Recording | Stopping, Failed)
        )
    }
}

impl From<u8> for RecordingState {
    fn from(value: u8) -> Self {
        match value {
            0 => RecordingState::Idle,
            1 => RecordingState::Recording,
            2 => RecordingState::Stopping,
            3 => RecordingState::Stopped,
            _ => RecordingState::Failed,
        }
    }
}

impl From<RecordingState> for u8 {
    fn from(state: RecordingState) -> Self {
        state as u8
    }
}

/// Lifecycle state shared by a session and its collector task.
///
/// Only edges allowed by [`RecordingState::can_transition_to`] are applied,
/// so whichever side moves first wins and the other sees the new state.
#[derive(Debug)]
pub struct AtomicRecordingState(AtomicU8);

impl AtomicRecordingState {
    pub fn new(state: RecordingState) -> Self {
        Self(AtomicU8::new(state.into()))
    }

    pub fn load(&self) -> RecordingState {
        self.0.load(Ordering::Acquire).into()
    }

    /// Move `from -> to`. False if the edge is not allowed or the state is no
    /// longer `from`.
    pub fn advance(&self, from: RecordingState, to: RecordingState) -> bool {
        from.can_transition_to(to)
            && self
                .0
                .compare_exchange(from.into(), to.into(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Fail from whatever live state the session is in. Returns the state it
    /// left, or `None` if it had already finished.
    pub fn fail(&self) -> Option<RecordingState> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let state = RecordingState::from(current);
                (!state.is_terminal()).then_some(RecordingState::Failed.into())
            })
            .ok()
            .map(RecordingState::from)
    }
}

impl Default for AtomicRecordingState {
    fn default() -> Self {
        Self::new(RecordingState::Idle)
    }
}

/// Events emitted by the recorder for UI subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum RecorderEvent {
    StateChanged {
        session: u64,
        from: RecordingState,
        to: RecordingState,
    },
    ChunkReceived {
        session: u64,
        index: usize,
        len: usize,
    },
    /// The preferred device could not be opened; any input was used instead.
    DeviceFallback {
        requested: String,
    },
    Warning {
        message: String,
    },
}

/// Container/codec identifiers tried in order when a recording starts.
/// The first one the backend supports wins.
pub const ENCODING_PREFERENCES: &[&str] = &[
    "audio/webm;codecs=opus",
    "audio/webm;codecs=pcm",
    "audio/webm",
    "audio/ogg;codecs=opus",
    "audio/mp4",
    "audio/wav",
];

/// Pick the first supported encoding from [`ENCODING_PREFERENCES`].
pub fn negotiate_encoding(is_supported: impl Fn(&str) -> bool) -> Option<Encoding> {
    ENCODING_PREFERENCES
        .iter()
        .copied()
        .find(|candidate| is_supported(candidate))
        .map(Encoding::new)
}

/// Container families, grouped by how they record duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerFamily {
    /// WebM and Matroska (EBML Segment/Info/Duration).
    Matroska,
    Ogg,
    /// MP4/ISO-BMFF (mvhd duration).
    Mp4,
    Wav,
    Other,
}

impl ContainerFamily {
    /// Whether the container carries a top-level duration field.
    pub fn declares_duration(&self) -> bool {
        matches!(self, ContainerFamily::Matroska | ContainerFamily::Mp4)
    }
}

/// A MIME/encoding identifier such as `audio/webm;codecs=opus`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Encoding(String);

impl Encoding {
    pub fn new(mime: impl Into<String>) -> Self {
        Self(mime.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `type/subtype` part, lowercased, without parameters.
    pub fn essence(&self) -> String {
        self.0
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
    }

    /// The `codecs` parameter, if present.
    pub fn codecs(&self) -> Option<&str> {
        self.0.split(';').skip(1).find_map(|param| {
            let (key, value) = param.split_once('=')?;
            if key.trim().eq_ignore_ascii_case("codecs") {
                Some(value.trim().trim_matches('"'))
            } else {
                None
            }
        })
    }

    pub fn family(&self) -> ContainerFamily {
        match self.essence().as_str() {
            "audio/webm" | "video/webm" | "audio/x-matroska" | "video/x-matroska" => {
                ContainerFamily::Matroska
            }
            "audio/ogg" | "application/ogg" => ContainerFamily::Ogg,
            "audio/mp4" | "video/mp4" => ContainerFamily::Mp4,
            "audio/wav" | "audio/wave" | "audio/x-wav" => ContainerFamily::Wav,
            _ => ContainerFamily::Other,
        }
    }

    /// File extension hint for demuxer probing.
    pub fn extension(&self) -> &'static str {
        match self.family() {
            ContainerFamily::Matroska => "webm",
            ContainerFamily::Ogg => "ogg",
            ContainerFamily::Mp4 => "mp4",
            ContainerFamily::Wav => "wav",
            ContainerFamily::Other => "bin",
        }
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Finalized recording bytes, zeroed on drop.
///
/// `measured_duration_ms` is the wall-clock time between start and stop and is
/// the ground truth. `declared_duration_ms` is what the container header says,
/// which streaming recorders leave unset until repaired.
#[derive(Debug, Zeroize)]
#[zeroize(drop)]
pub struct MediaBlob {
    bytes: Vec<u8>,
    #[zeroize(skip)]
    encoding: Encoding,
    measured_duration_ms: u64,
    declared_duration_ms: Option<u64>,
}

impl MediaBlob {
    pub fn new(bytes: Vec<u8>, encoding: Encoding, measured_duration_ms: u64) -> Self {
        Self {
            bytes,
            encoding,
            measured_duration_ms,
            declared_duration_ms: None,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn encoding(&self) -> &Encoding {
        &self.encoding
    }

    pub fn measured_duration_ms(&self) -> u64 {
        self.measured_duration_ms
    }

    /// Duration the container declares, once known.
    pub fn duration_ms(&self) -> Option<u64> {
        self.declared_duration_ms
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub(crate) fn set_declared_duration_ms(&mut self, duration_ms: Option<u64>) {
        self.declared_duration_ms = duration_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_state_roundtrip() {
        for state in [
            RecordingState::Idle,
            RecordingState::Recording,
            RecordingState::Stopping,
            RecordingState::Stopped,
            RecordingState::Failed,
        ] {
            let value: u8 = state.into();
            let recovered: RecordingState = value.into();
            assert_eq!(state, recovered);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!RecordingState::Idle.is_terminal());
        assert!(!RecordingState::Recording.is_terminal());
        assert!(!RecordingState::Stopping.is_terminal());
        assert!(RecordingState::Stopped.is_terminal());
        assert!(RecordingState::Failed.is_terminal());
    }

    #[test]
    fn test_lifecycle_edges() {
        use RecordingState::*;
        assert!(Idle.can_transition_to(Recording));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Recording.can_transition_to(Failed));
        assert!(!Idle.can_transition_to(Stopped));
        assert!(!Stopped.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Recording));
        assert!(!Recording.can_transition_to(Recording));
    }

    #[test]
    fn test_atomic_state_applies_allowed_edges_only() {
        let atomic = AtomicRecordingState::default();
        assert!(!atomic.advance(RecordingState::Idle, RecordingState::Stopped));
        assert_eq!(atomic.load(), RecordingState::Idle);

        assert!(atomic.advance(RecordingState::Idle, RecordingState::Recording));
        assert!(atomic.advance(RecordingState::Recording, RecordingState::Stopping));
        // Stale `from`
        assert!(!atomic.advance(RecordingState::Recording, RecordingState::Stopping));
        assert_eq!(atomic.load(), RecordingState::Stopping);
    }

    #[test]
    fn test_fail_only_from_live_states() {
        let atomic = AtomicRecordingState::new(RecordingState::Stopping);
        assert_eq!(atomic.fail(), Some(RecordingState::Stopping));
        assert_eq!(atomic.load(), RecordingState::Failed);
        assert_eq!(atomic.fail(), None);

        let stopped = AtomicRecordingState::new(RecordingState::Stopped);
        assert_eq!(stopped.fail(), None);
        assert_eq!(stopped.load(), RecordingState::Stopped);
    }

    #[test]
    fn test_negotiation_first_match_wins() {
        let chosen = negotiate_encoding(|mime| mime.starts_with("audio/webm"));
        assert_eq!(chosen, Some(Encoding::new("audio/webm;codecs=opus")));

        let chosen = negotiate_encoding(|mime| mime == "audio/wav" || mime == "audio/mp4");
        assert_eq!(chosen, Some(Encoding::new("audio/mp4")));

        assert_eq!(negotiate_encoding(|_| false), None);
    }

    #[test]
    fn test_encoding_parsing() {
        let encoding = Encoding::new("Audio/WebM; codecs=\"opus\"");
        assert_eq!(encoding.essence(), "audio/webm");
        assert_eq!(encoding.codecs(), Some("opus"));
        assert_eq!(encoding.family(), ContainerFamily::Matroska);
        assert_eq!(encoding.extension(), "webm");

        assert_eq!(Encoding::new("audio/mp4").codecs(), None);
        assert_eq!(Encoding::new("audio/ogg;codecs=opus").family(), ContainerFamily::Ogg);
        assert!(ContainerFamily::Mp4.declares_duration());
        assert!(!ContainerFamily::Wav.declares_duration());
    }

    #[test]
    fn test_media_blob_accessors() {
        let blob = MediaBlob::new(vec![1, 2, 3], Encoding::new("audio/wav"), 1500);
        assert_eq!(blob.len(), 3);
        assert_eq!(blob.measured_duration_ms(), 1500);
        assert_eq!(blob.duration_ms(), None);
        assert!(!blob.is_empty());
    }
}
