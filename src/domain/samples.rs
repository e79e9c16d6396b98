use zeroize::Zeroize;

use crate::domain::DomainError;

/// Decoded PCM audio, one f32 sequence per channel, securely zeroed on drop.
///
/// Derived from exactly one [`MediaBlob`](crate::domain::MediaBlob) and moved,
/// never copied, into the transcription job that consumes it.
#[derive(Debug, Zeroize)]
#[zeroize(drop)]
pub struct SampleBuffer {
    /// Sample rate in Hz.
    sample_rate: u32,
    /// Per-channel frames in [-1.0, 1.0].
    channels: Vec<Vec<f32>>,
}

impl SampleBuffer {
    /// Build a buffer from per-channel frames.
    ///
    /// Every channel must have the same frame count.
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> Result<Self, DomainError> {
        if sample_rate == 0 {
            return Err(DomainError::decode("sample rate must be non-zero"));
        }
        if let Some(first) = channels.first() {
            let frames = first.len();
            if channels.iter().any(|channel| channel.len() != frames) {
                return Err(DomainError::decode("channels have different frame counts"));
            }
        }
        Ok(Self {
            sample_rate,
            channels,
        })
    }

    /// Single-channel buffer.
    pub fn mono(sample_rate: u32, samples: Vec<f32>) -> Result<Self, DomainError> {
        Self::new(sample_rate, vec![samples])
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn frame_count(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.frame_count() == 0
    }

    /// Get the duration in seconds.
    pub fn duration_secs(&self) -> f32 {
        self.frame_count() as f32 / self.sample_rate as f32
    }

    /// Average all channels into one.
    pub fn to_mono(&self) -> Vec<f32> {
        match self.channels.len() {
            0 => Vec::new(),
            1 => self.channels[0].clone(),
            count => (0..self.frame_count())
                .map(|i| self.channels.iter().map(|c| c[i]).sum::<f32>() / count as f32)
                .collect(),
        }
    }
}
