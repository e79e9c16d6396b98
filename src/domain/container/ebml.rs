//! EBML variable-length integers and element framing, as used by Matroska/WebM.
//!
//! Element IDs keep their length-marker bits (`0x1A45DFA3` is written as those
//! four bytes). Data sizes strip the marker; a size whose value bits are all
//! ones means "unknown", which streaming muxers use for Segment and Cluster.

use crate::domain::DomainError;

pub const EBML_HEADER: u32 = 0x1A45_DFA3;
pub const EBML_VERSION: u32 = 0x4286;
pub const EBML_READ_VERSION: u32 = 0x42F7;
pub const EBML_MAX_ID_LENGTH: u32 = 0x42F2;
pub const EBML_MAX_SIZE_LENGTH: u32 = 0x42F3;
pub const DOC_TYPE: u32 = 0x4282;
pub const DOC_TYPE_VERSION: u32 = 0x4287;
pub const DOC_TYPE_READ_VERSION: u32 = 0x4285;

pub const SEGMENT: u32 = 0x1853_8067;
pub const SEEK_HEAD: u32 = 0x114D_9B74;
pub const INFO: u32 = 0x1549_A966;
pub const TIMECODE_SCALE: u32 = 0x2A_D7B1;
pub const DURATION: u32 = 0x4489;
pub const MUXING_APP: u32 = 0x4D80;
pub const WRITING_APP: u32 = 0x5741;
pub const TRACKS: u32 = 0x1654_AE6B;
pub const TRACK_ENTRY: u32 = 0xAE;
pub const TRACK_NUMBER: u32 = 0xD7;
pub const TRACK_UID: u32 = 0x73C5;
pub const TRACK_TYPE: u32 = 0x83;
pub const CODEC_ID: u32 = 0x86;
pub const AUDIO: u32 = 0xE1;
pub const SAMPLING_FREQUENCY: u32 = 0xB5;
pub const CHANNELS: u32 = 0x9F;
pub const BIT_DEPTH: u32 = 0x6264;
pub const CLUSTER: u32 = 0x1F43_B675;
pub const TIMECODE: u32 = 0xE7;
pub const SIMPLE_BLOCK: u32 = 0xA3;
pub const VOID: u32 = 0xEC;

/// Default TimecodeScale: one tick per millisecond.
pub const DEFAULT_TIMECODE_SCALE: u64 = 1_000_000;

/// Framing of one element: its ID, data size and where the data starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementHeader {
    pub id: u32,
    /// `None` when the size is the reserved "unknown" value.
    pub size: Option<u64>,
    /// Bytes taken by the ID and size fields.
    pub header_len: usize,
}

impl ElementHeader {
    /// Offset one past the element's data, when the size is known.
    pub fn end(&self, start: usize) -> Option<usize> {
        let size = usize::try_from(self.size?).ok()?;
        start.checked_add(self.header_len)?.checked_add(size)
    }
}

fn vint_len(first: u8, max: usize) -> Option<usize> {
    let len = first.leading_zeros() as usize + 1;
    (first != 0 && len <= max).then_some(len)
}

/// Read an element ID at `pos`, marker bits included.
pub fn read_id(buf: &[u8], pos: usize) -> Result<(u32, usize), DomainError> {
    let first = *buf
        .get(pos)
        .ok_or_else(|| malformed(pos, "element ID past end of stream"))?;
    let len = vint_len(first, 4).ok_or_else(|| malformed(pos, "invalid element ID"))?;
    let bytes = buf
        .get(pos..pos + len)
        .ok_or_else(|| malformed(pos, "truncated element ID"))?;
    let id = bytes.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32);
    Ok((id, len))
}

/// Read a data size at `pos`. Returns `None` for the unknown-size marker.
pub fn read_size(buf: &[u8], pos: usize) -> Result<(Option<u64>, usize), DomainError> {
    let first = *buf
        .get(pos)
        .ok_or_else(|| malformed(pos, "element size past end of stream"))?;
    let len = vint_len(first, 8).ok_or_else(|| malformed(pos, "invalid element size"))?;
    let bytes = buf
        .get(pos..pos + len)
        .ok_or_else(|| malformed(pos, "truncated element size"))?;

    let mask = if len == 8 { 0 } else { 0xFFu8 >> len };
    let value = bytes[1..]
        .iter()
        .fold((first & mask) as u64, |acc, &b| (acc << 8) | b as u64);
    let unknown = (1u64 << (7 * len)) - 1;
    Ok(((value != unknown).then_some(value), len))
}

/// Read the ID and size of the element starting at `pos`.
pub fn read_element_header(buf: &[u8], pos: usize) -> Result<ElementHeader, DomainError> {
    let (id, id_len) = read_id(buf, pos)?;
    let (size, size_len) = read_size(buf, pos + id_len)?;
    Ok(ElementHeader {
        id,
        size,
        header_len: id_len + size_len,
    })
}

/// Big-endian unsigned integer payload (0-8 bytes).
pub fn read_uint(data: &[u8]) -> Result<u64, DomainError> {
    if data.len() > 8 {
        return Err(DomainError::MalformedContainer(format!(
            "unsigned integer element is {} bytes wide",
            data.len()
        )));
    }
    Ok(data.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64))
}

/// Float payload (0, 4 or 8 bytes). A zero-width float is 0.0.
pub fn read_float(data: &[u8]) -> Result<f64, DomainError> {
    match data.len() {
        0 => Ok(0.0),
        4 => {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(data);
            Ok(f32::from_be_bytes(raw) as f64)
        }
        8 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(data);
            Ok(f64::from_be_bytes(raw))
        }
        width => Err(DomainError::MalformedContainer(format!(
            "float element is {} bytes wide",
            width
        ))),
    }
}

/// Encode a float in an existing 4- or 8-byte slot.
pub fn encode_float(value: f64, width: usize) -> Option<Vec<u8>> {
    match width {
        4 => Some((value as f32).to_be_bytes().to_vec()),
        8 => Some(value.to_be_bytes().to_vec()),
        _ => None,
    }
}

fn malformed(pos: usize, what: &str) -> DomainError {
    DomainError::MalformedContainer(format!("{} at offset {}", what, pos))
}

pub fn write_id(out: &mut Vec<u8>, id: u32) {
    let len = match id {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    };
    out.extend_from_slice(&id.to_be_bytes()[4 - len..]);
}

/// Write `size` using exactly `len` bytes.
pub fn write_size_with_len(out: &mut Vec<u8>, size: u64, len: usize) {
    debug_assert!((1..=8).contains(&len));
    let marked = size | (1u64 << (7 * len));
    out.extend_from_slice(&marked.to_be_bytes()[8 - len..]);
}

/// Write `size` in the shortest encoding that is not the unknown marker.
pub fn write_size(out: &mut Vec<u8>, size: u64) {
    let len = (1..=8)
        .find(|&len| size < (1u64 << (7 * len)) - 1)
        .unwrap_or(8);
    write_size_with_len(out, size, len);
}

/// Write the 8-byte unknown-size marker.
pub fn write_unknown_size(out: &mut Vec<u8>) {
    out.extend_from_slice(&[0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
}

pub fn write_master(out: &mut Vec<u8>, id: u32, body: &[u8]) {
    write_id(out, id);
    write_size(out, body.len() as u64);
    out.extend_from_slice(body);
}

pub fn write_uint(out: &mut Vec<u8>, id: u32, value: u64) {
    let bytes = value.to_be_bytes();
    let skip = (value.leading_zeros() / 8).min(7) as usize;
    write_master(out, id, &bytes[skip..]);
}

pub fn write_float(out: &mut Vec<u8>, id: u32, value: f64) {
    write_master(out, id, &value.to_be_bytes());
}

pub fn write_string(out: &mut Vec<u8>, id: u32, value: &str) {
    write_master(out, id, value.as_bytes());
}

/// Write a Void element occupying exactly `total_len` bytes (at least 2).
pub fn write_void(out: &mut Vec<u8>, total_len: usize) {
    assert!(total_len >= 2, "a Void element needs at least two bytes");
    write_id(out, VOID);
    if total_len - 2 < 127 {
        write_size_with_len(out, (total_len - 2) as u64, 1);
        out.resize(out.len() + total_len - 2, 0);
    } else {
        write_size_with_len(out, (total_len - 9) as u64, 8);
        out.resize(out.len() + total_len - 9, 0);
    }
}
