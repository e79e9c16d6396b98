use crate::domain::container::ebml::{self, *};

const APP_NAME: &str = concat!("clinic-dictation/", env!("CARGO_PKG_VERSION"));

/// Streaming WebM writer for raw float PCM.
///
/// Mirrors what browser recorders emit: the Segment has unknown size and the
/// Info Duration is a 0.0 placeholder, because the header is written before
/// the recording length is known. Each call to [`WebmMuxer::cluster`] produces
/// a self-contained Cluster that can be shipped as one chunk.
#[derive(Debug, Clone)]
pub struct WebmMuxer {
    sample_rate: u32,
    channels: u16,
    frames_written: u64,
}

impl WebmMuxer {
    pub const CODEC_ID: &'static str = "A_PCM/FLOAT/IEEE";

    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            channels: channels.max(1),
            frames_written: 0,
        }
    }

    /// EBML header, Segment start, Info and Tracks.
    pub fn header(&self) -> Vec<u8> {
        let mut header_body = Vec::new();
        write_uint(&mut header_body, EBML_VERSION, 1);
        write_uint(&mut header_body, EBML_READ_VERSION, 1);
        write_uint(&mut header_body, EBML_MAX_ID_LENGTH, 4);
        write_uint(&mut header_body, EBML_MAX_SIZE_LENGTH, 8);
        write_string(&mut header_body, DOC_TYPE, "webm");
        write_uint(&mut header_body, DOC_TYPE_VERSION, 4);
        write_uint(&mut header_body, DOC_TYPE_READ_VERSION, 2);

        let mut info = Vec::new();
        write_uint(&mut info, TIMECODE_SCALE, DEFAULT_TIMECODE_SCALE);
        write_float(&mut info, DURATION, 0.0);
        write_string(&mut info, MUXING_APP, APP_NAME);
        write_string(&mut info, WRITING_APP, APP_NAME);

        let mut audio = Vec::new();
        write_float(&mut audio, SAMPLING_FREQUENCY, self.sample_rate as f64);
        write_uint(&mut audio, CHANNELS, self.channels as u64);
        write_uint(&mut audio, BIT_DEPTH, 32);

        let mut entry = Vec::new();
        write_uint(&mut entry, TRACK_NUMBER, 1);
        write_uint(&mut entry, TRACK_UID, 1);
        write_uint(&mut entry, TRACK_TYPE, 2); // audio
        write_string(&mut entry, CODEC_ID, Self::CODEC_ID);
        write_master(&mut entry, AUDIO, &audio);

        let mut tracks = Vec::new();
        write_master(&mut tracks, TRACK_ENTRY, &entry);

        let mut out = Vec::new();
        write_master(&mut out, EBML_HEADER, &header_body);
        ebml::write_id(&mut out, SEGMENT);
        write_unknown_size(&mut out);
        write_master(&mut out, INFO, &info);
        write_master(&mut out, TRACKS, &tracks);
        out
    }

    /// One Cluster holding interleaved samples, timestamped after everything
    /// written so far.
    pub fn cluster(&mut self, interleaved: &[f32]) -> Vec<u8> {
        let timecode_ms = self.frames_written * 1000 / self.sample_rate as u64;
        self.frames_written += (interleaved.len() / self.channels as usize) as u64;

        let payload: Vec<u8> = interleaved
            .iter()
            .flat_map(|sample| sample.to_le_bytes())
            .collect();
        Self::raw_cluster(timecode_ms, &payload)
    }

    /// Cluster with a single keyframe SimpleBlock on track 1.
    pub fn raw_cluster(timecode_ms: u64, frame: &[u8]) -> Vec<u8> {
        let mut block = Vec::with_capacity(frame.len() + 4);
        block.push(0x81); // track number 1 as a vint
        block.extend_from_slice(&0i16.to_be_bytes()); // relative timecode
        block.push(0x80); // keyframe
        block.extend_from_slice(frame);

        let mut body = Vec::with_capacity(block.len() + 16);
        write_uint(&mut body, TIMECODE, timecode_ms);
        write_master(&mut body, SIMPLE_BLOCK, &block);

        let mut out = Vec::with_capacity(body.len() + 12);
        write_master(&mut out, CLUSTER, &body);
        out
    }

    /// Frames written so far, per channel.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::container::matroska::{locate_duration, DurationLocation};
    use crate::domain::container::read_duration_ms;

    #[test]
    fn test_header_has_placeholder_duration() {
        let header = WebmMuxer::new(48_000, 2).header();
        let DurationLocation::Present(field) = locate_duration(&header).unwrap() else {
            panic!("muxer must write a Duration placeholder");
        };
        assert_eq!(field.width, 8);
        assert_eq!(field.timecode_scale, DEFAULT_TIMECODE_SCALE);
        assert_eq!(read_duration_ms(&header).unwrap(), Some(0));
    }

    #[test]
    fn test_cluster_timecodes_advance() {
        let mut muxer = WebmMuxer::new(1_000, 2);
        let first = muxer.cluster(&[0.0; 500]); // 250 frames
        let second = muxer.cluster(&[0.0; 500]);
        assert_eq!(muxer.frames_written(), 500);

        let header = ebml::read_element_header(&first, 0).unwrap();
        assert_eq!(header.id, CLUSTER);
        assert_eq!(header.end(0), Some(first.len()));

        // Cluster/Timecode is the first child
        let timecode = ebml::read_element_header(&second, header.header_len).unwrap();
        assert_eq!(timecode.id, TIMECODE);
        let start = header.header_len + timecode.header_len;
        let value = ebml::read_uint(&second[start..start + timecode.size.unwrap() as usize]).unwrap();
        assert_eq!(value, 250);
    }

    #[test]
    fn test_samples_are_little_endian_floats() {
        let cluster = WebmMuxer::raw_cluster(0, &0.5f32.to_le_bytes());
        assert!(cluster.ends_with(&0.5f32.to_le_bytes()));
    }
}
