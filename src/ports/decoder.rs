use async_trait::async_trait;

use crate::domain::{DomainError, MediaBlob, SampleBuffer};

/// Port for turning finalized recordings into PCM.
#[async_trait]
pub trait AudioDecoder: Send + Sync {
    /// Decode a blob to samples at [`AudioDecoder::target_sample_rate`].
    ///
    /// Identical bytes always decode to identical samples. Malformed, truncated
    /// or empty payloads fail with `DomainError::Decode`.
    async fn decode(&self, blob: &MediaBlob) -> Result<SampleBuffer, DomainError>;

    /// Rate every decoded buffer is resampled to.
    fn target_sample_rate(&self) -> u32;
}
