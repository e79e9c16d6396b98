//! Container duration repair.
//!
//! Patchers are registered per encoding essence (`audio/webm`, ...) so new
//! container types plug in without touching the recorder or decoder.

pub mod ebml;
pub mod matroska;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::domain::{DomainError, Encoding, MediaBlob};

pub use matroska::{read_duration_ms, MatroskaDurationPatcher};

/// What a repair did to a blob.
#[derive(Debug, Clone, PartialEq)]
pub enum RepairOutcome {
    /// The container has no duration field to fix.
    NotApplicable,
    /// Zero-length recording; there is no header to patch.
    EmptyPayload,
    /// The duration field was rewritten.
    Patched { previous_ms: Option<f64> },
    /// The declared duration was already usable and was left alone.
    AlreadyValid { duration_ms: u64 },
    /// The duration could not be written; the audio is still playable.
    DurationUnset { reason: String },
}

/// Rewrites a container's duration field in place.
pub trait DurationPatcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Patch `bytes` so the container declares `duration_ms`.
    ///
    /// Must only touch the bytes of the duration value itself.
    fn patch(&self, bytes: &mut [u8], duration_ms: u64) -> Result<RepairOutcome, DomainError>;
}

/// Fixes the duration metadata that streaming recorders leave unset.
pub struct ContainerDurationRepair {
    patchers: HashMap<String, Arc<dyn DurationPatcher>>,
}

impl Default for ContainerDurationRepair {
    fn default() -> Self {
        let mut repair = Self::empty();
        let matroska: Arc<dyn DurationPatcher> = Arc::new(MatroskaDurationPatcher);
        for essence in ["audio/webm", "video/webm", "audio/x-matroska", "video/x-matroska"] {
            repair.register(essence, Arc::clone(&matroska));
        }
        repair
    }
}

impl ContainerDurationRepair {
    /// A repairer with no patchers registered.
    pub fn empty() -> Self {
        Self {
            patchers: HashMap::new(),
        }
    }

    /// Register a patcher for an encoding essence such as `audio/webm`.
    pub fn register(&mut self, essence: &str, patcher: Arc<dyn DurationPatcher>) {
        self.patchers.insert(essence.to_ascii_lowercase(), patcher);
    }

    pub fn supports(&self, encoding: &Encoding) -> bool {
        self.patchers.contains_key(&encoding.essence())
    }

    /// Make the blob declare `measured_duration_ms`.
    ///
    /// Encodings whose container has no duration field pass through untouched.
    /// Fails with [`DomainError::UnsupportedContainer`] when the container has a
    /// duration field but no patcher is registered for it, and with
    /// [`DomainError::MalformedContainer`] when the header cannot be parsed.
    /// Callers treat both as warnings and keep using the unpatched blob.
    pub fn repair(
        &self,
        blob: &mut MediaBlob,
        measured_duration_ms: u64,
    ) -> Result<RepairOutcome, DomainError> {
        let encoding = blob.encoding().clone();
        let Some(patcher) = self.patchers.get(&encoding.essence()) else {
            if encoding.family().declares_duration() {
                return Err(DomainError::UnsupportedContainer {
                    encoding: encoding.to_string(),
                });
            }
            debug!(encoding = %encoding, "Container has no duration field, passing through");
            return Ok(RepairOutcome::NotApplicable);
        };

        if blob.is_empty() {
            debug!(encoding = %encoding, "Empty recording, nothing to patch");
            blob.set_declared_duration_ms(Some(measured_duration_ms));
            return Ok(RepairOutcome::EmptyPayload);
        }

        let outcome = patcher.patch(blob.bytes_mut(), measured_duration_ms)?;
        match &outcome {
            RepairOutcome::Patched { .. } => {
                blob.set_declared_duration_ms(Some(measured_duration_ms));
            }
            RepairOutcome::AlreadyValid { duration_ms } => {
                blob.set_declared_duration_ms(Some(*duration_ms));
            }
            RepairOutcome::DurationUnset { reason } => {
                warn!(
                    patcher = patcher.name(),
                    reason = %reason,
                    "Duration left unset, recording is still playable"
                );
                blob.set_declared_duration_ms(None);
            }
            RepairOutcome::NotApplicable | RepairOutcome::EmptyPayload => {}
        }
        Ok(outcome)
    }
}
