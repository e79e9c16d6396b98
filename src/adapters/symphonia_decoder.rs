use std::io::{Cursor, ErrorKind};

use async_trait::async_trait;
use symphonia::core::audio::SampleBuffer as InterleavedBuffer;
use symphonia::core::codecs::{CodecParameters, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

use crate::domain::{DomainError, MediaBlob, SampleBuffer};
use crate::ports::AudioDecoder;

/// Decoder backed by symphonia's demuxers and codecs.
///
/// Output is always resampled to the configured target rate so downstream
/// engines see one rate regardless of what the recorder produced.
pub struct SymphoniaDecoder {
    target_sample_rate: u32,
}

impl SymphoniaDecoder {
    pub fn new(target_sample_rate: u32) -> Self {
        Self { target_sample_rate }
    }

    fn decode_bytes(
        bytes: Vec<u8>,
        extension: &str,
        mime: &str,
        target_sample_rate: u32,
    ) -> Result<SampleBuffer, DomainError> {
        if bytes.is_empty() {
            return Err(DomainError::decode("empty payload"));
        }

        let source = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());
        let mut hint = Hint::new();
        hint.with_extension(extension);
        hint.mime_type(mime);

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                source,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| DomainError::decode(format!("unrecognized container: {}", e)))?;
        let mut format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| DomainError::decode("no audio track"))?;
        let track_id = track.id;
        let mut codec_params = track.codec_params.clone();

        let mut packets = Vec::new();
        loop {
            match format.next_packet() {
                Ok(packet) if packet.track_id() == track_id => packets.push(packet),
                Ok(_) => {}
                Err(SymphoniaError::IoError(e)) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(SymphoniaError::ResetRequired) => break,
                Err(e) => return Err(DomainError::decode(format!("demux failed: {}", e))),
            }
        }

        // Matroska PCM tracks do not declare a packet size, and the PCM decoder
        // sizes its buffer from it.
        if codec_params.max_frames_per_packet.is_none() {
            let largest = packets.iter().map(|p| p.buf().len()).max().unwrap_or(0);
            let frames = (largest / bytes_per_frame(&codec_params)).max(1);
            codec_params.with_max_frames_per_packet(frames as u64);
        }

        let mut decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| DomainError::decode(format!("unsupported codec: {}", e)))?;

        let mut source_rate = codec_params.sample_rate;
        let mut channels = codec_params.channels.map(|c| c.count());
        let mut interleaved: Vec<f32> = Vec::new();

        for packet in &packets {
            match decoder.decode(packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    source_rate = Some(spec.rate);
                    channels = Some(spec.channels.count());

                    let mut buffer = InterleavedBuffer::<f32>::new(decoded.capacity() as u64, spec);
                    buffer.copy_interleaved_ref(decoded);
                    interleaved.extend_from_slice(buffer.samples());
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    warn!(error = %e, "Skipping corrupt packet");
                }
                Err(e) => return Err(DomainError::decode(format!("decode failed: {}", e))),
            }
        }

        let source_rate = source_rate.ok_or_else(|| DomainError::decode("unknown sample rate"))?;
        let channels = channels
            .filter(|&count| count > 0)
            .ok_or_else(|| DomainError::decode("unknown channel layout"))?;

        let per_channel: Vec<Vec<f32>> = deinterleave(&interleaved, channels)
            .iter()
            .map(|channel| resample(channel, source_rate, target_sample_rate))
            .collect();

        debug!(
            source_rate,
            target_sample_rate,
            channels,
            frames = per_channel.first().map_or(0, Vec::len),
            "Decoded recording"
        );
        SampleBuffer::new(target_sample_rate, per_channel)
    }
}

#[async_trait]
impl AudioDecoder for SymphoniaDecoder {
    async fn decode(&self, blob: &MediaBlob) -> Result<SampleBuffer, DomainError> {
        if blob.is_empty() {
            return Err(DomainError::decode("empty payload"));
        }

        let bytes = blob.bytes().to_vec();
        let extension = blob.encoding().extension();
        let mime = blob.encoding().essence();
        let target = self.target_sample_rate;

        // Demuxing and decoding are CPU-bound
        tokio::task::spawn_blocking(move || Self::decode_bytes(bytes, extension, &mime, target))
            .await
            .map_err(|e| DomainError::decode(format!("decode task failed: {}", e)))?
    }

    fn target_sample_rate(&self) -> u32 {
        self.target_sample_rate
    }
}

/// Smallest byte size one frame can have for these parameters.
fn bytes_per_frame(params: &CodecParameters) -> usize {
    let sample_bytes = params
        .bits_per_coded_sample
        .or(params.bits_per_sample)
        .map_or(1, |bits| (bits as usize).div_ceil(8));
    let channels = params.channels.map_or(1, |c| c.count());
    (sample_bytes * channels).max(1)
}

/// Split interleaved frames into one vector per channel. A trailing partial
/// frame is dropped.
fn deinterleave(interleaved: &[f32], channels: usize) -> Vec<Vec<f32>> {
    let frames = interleaved.len() / channels;
    let mut out = vec![Vec::with_capacity(frames); channels];
    for frame in interleaved.chunks_exact(channels) {
        for (channel, &sample) in out.iter_mut().zip(frame) {
            channel.push(sample);
        }
    }
    out
}

/// Linear-interpolation resampler.
fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio).ceil() as usize;

    (0..output_len)
        .map(|i| {
            let src_pos = i as f64 * ratio;
            let src_idx = src_pos.floor() as usize;
            let frac = src_pos.fract() as f32;
            match (samples.get(src_idx), samples.get(src_idx + 1)) {
                (Some(&s0), Some(&s1)) => s0 + (s1 - s0) * frac,
                (Some(&s0), None) => s0,
                _ => 0.0,
            }
        })
        .collect()
}
