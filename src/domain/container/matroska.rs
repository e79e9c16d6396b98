//! Duration patching for Matroska/WebM.
//!
//! Streaming recorders write the header before they know how long the
//! recording will be, so `Segment/Info/Duration` is either missing or a
//! placeholder. The patch rewrites the float in place; every other byte,
//! audio payload included, is left untouched.

use tracing::debug;

use super::ebml::{self, ElementHeader};
use super::{DurationPatcher, RepairOutcome};
use crate::domain::DomainError;

/// Where the Duration float lives inside the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationField {
    /// Offset of the float's first data byte.
    pub offset: usize,
    /// 4 or 8.
    pub width: usize,
    /// Nanoseconds per tick (Info/TimecodeScale).
    pub timecode_scale: u64,
}

impl DurationField {
    fn read_ticks(&self, bytes: &[u8]) -> Result<f64, DomainError> {
        ebml::read_float(&bytes[self.offset..self.offset + self.width])
    }

    fn ticks_to_ms(&self, ticks: f64) -> f64 {
        ticks * self.timecode_scale as f64 / 1_000_000.0
    }

    fn ms_to_ticks(&self, ms: u64) -> f64 {
        ms as f64 * 1_000_000.0 / self.timecode_scale as f64
    }
}

/// Result of scanning a stream for its Duration element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationLocation {
    Present(DurationField),
    /// No Duration element before the first Cluster.
    Absent,
    /// A Duration element whose width leaves no room for an in-place rewrite.
    Unpatchable { width: usize },
}

/// Find `Segment/Info/Duration`.
///
/// Only the elements in front of the first Cluster are examined; Info must
/// precede media data in a conforming stream.
pub fn locate_duration(bytes: &[u8]) -> Result<DurationLocation, DomainError> {
    let ebml_header = ebml::read_element_header(bytes, 0)?;
    if ebml_header.id != ebml::EBML_HEADER {
        return Err(DomainError::MalformedContainer(format!(
            "stream starts with element {:#x}, not an EBML header",
            ebml_header.id
        )));
    }
    let segment_pos = ebml_header.end(0).ok_or_else(|| {
        DomainError::MalformedContainer("EBML header has unknown size".to_string())
    })?;

    let segment = ebml::read_element_header(bytes, segment_pos)?;
    if segment.id != ebml::SEGMENT {
        return Err(DomainError::MalformedContainer(format!(
            "expected Segment after EBML header, found {:#x}",
            segment.id
        )));
    }
    let segment_end = segment
        .end(segment_pos)
        .map_or(bytes.len(), |end| end.min(bytes.len()));

    let mut pos = segment_pos + segment.header_len;
    while pos < segment_end {
        let child = match ebml::read_element_header(bytes, pos) {
            Ok(child) => child,
            // A truncated trailing element cannot hide an earlier Info.
            Err(_) => break,
        };
        match child.id {
            ebml::INFO => return locate_in_info(bytes, pos, child),
            ebml::CLUSTER => break,
            _ => match child.end(pos) {
                Some(end) => pos = end,
                None => break,
            },
        }
    }
    Ok(DurationLocation::Absent)
}

fn locate_in_info(
    bytes: &[u8],
    info_pos: usize,
    info: ElementHeader,
) -> Result<DurationLocation, DomainError> {
    let end = info
        .end(info_pos)
        .ok_or_else(|| DomainError::MalformedContainer("Info has unknown size".to_string()))?;
    if end > bytes.len() {
        return Err(DomainError::MalformedContainer("Info is truncated".to_string()));
    }

    let mut timecode_scale = ebml::DEFAULT_TIMECODE_SCALE;
    let mut duration = None;
    let mut pos = info_pos + info.header_len;
    while pos < end {
        let child = ebml::read_element_header(bytes, pos)?;
        let data = pos + child.header_len;
        let data_end = child
            .end(pos)
            .filter(|&child_end| child_end <= end)
            .ok_or_else(|| {
                DomainError::MalformedContainer(format!("Info child {:#x} overruns Info", child.id))
            })?;
        match child.id {
            ebml::TIMECODE_SCALE => {
                timecode_scale = ebml::read_uint(&bytes[data..data_end])?;
                if timecode_scale == 0 {
                    return Err(DomainError::MalformedContainer(
                        "TimecodeScale is zero".to_string(),
                    ));
                }
            }
            ebml::DURATION => duration = Some((data, data_end - data)),
            _ => {}
        }
        pos = data_end;
    }

    Ok(match duration {
        None => DurationLocation::Absent,
        Some((offset, width @ (4 | 8))) => DurationLocation::Present(DurationField {
            offset,
            width,
            timecode_scale,
        }),
        Some((_, width)) => DurationLocation::Unpatchable { width },
    })
}

/// Declared duration in whole milliseconds, if the stream has a usable one.
pub fn read_duration_ms(bytes: &[u8]) -> Result<Option<u64>, DomainError> {
    match locate_duration(bytes)? {
        DurationLocation::Present(field) => {
            let ms = field.ticks_to_ms(field.read_ticks(bytes)?);
            Ok((ms.is_finite() && ms >= 0.0).then(|| ms.round() as u64))
        }
        _ => Ok(None),
    }
}

/// A declared duration is trusted unless it is non-positive, not a number, or
/// far beyond what was measured.
fn is_plausible(declared_ms: f64, measured_ms: u64) -> bool {
    declared_ms.is_finite()
        && declared_ms > 0.0
        && declared_ms <= measured_ms as f64 * 2.0 + 1_000.0
}

/// Rewrites `Segment/Info/Duration` in place.
#[derive(Debug, Default, Clone, Copy)]
pub struct MatroskaDurationPatcher;

impl DurationPatcher for MatroskaDurationPatcher {
    fn name(&self) -> &'static str {
        "matroska"
    }

    fn patch(&self, bytes: &mut [u8], duration_ms: u64) -> Result<RepairOutcome, DomainError> {
        let field = match locate_duration(bytes)? {
            DurationLocation::Present(field) => field,
            DurationLocation::Absent => {
                return Ok(RepairOutcome::DurationUnset {
                    reason: "no Duration element in Segment Info".to_string(),
                })
            }
            DurationLocation::Unpatchable { width } => {
                return Ok(RepairOutcome::DurationUnset {
                    reason: format!("Duration element is {} bytes wide", width),
                })
            }
        };

        let current_ms = field.ticks_to_ms(field.read_ticks(bytes)?);
        if is_plausible(current_ms, duration_ms) {
            return Ok(RepairOutcome::AlreadyValid {
                duration_ms: current_ms.round() as u64,
            });
        }

        let encoded = ebml::encode_float(field.ms_to_ticks(duration_ms), field.width)
            .ok_or_else(|| DomainError::MalformedContainer("bad Duration width".to_string()))?;
        let slot = &mut bytes[field.offset..field.offset + field.width];
        if slot[..] == encoded[..] {
            return Ok(RepairOutcome::AlreadyValid { duration_ms });
        }
        slot.copy_from_slice(&encoded);

        debug!(
            offset = field.offset,
            width = field.width,
            previous_ms = current_ms,
            duration_ms,
            "Patched Matroska duration"
        );
        Ok(RepairOutcome::Patched {
            previous_ms: current_ms.is_finite().then_some(current_ms),
        })
    }
}
