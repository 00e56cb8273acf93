//! WAL segment naming, ordering, and ideal look-ahead queue sizing (§3).

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

/// Byte length of a segment's 24 hex-digit identifier: 8 timeline + 8 log + 8 segment number.
pub const SEGMENT_NAME_LEN: usize = 24;

static SEGMENT_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new("^[0-9A-Fa-f]{24}$").unwrap());

/// `TTTTTTTTLLLLLLLLSSSSSSSS` in hex. History files and partial/backup-label
/// WAL files are not segments and never parse into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WalSegment {
    timeline: u32,
    log: u32,
    segment: u32,
}

impl WalSegment {
    pub fn parse(name: &str) -> Option<Self> {
        if name.len() != SEGMENT_NAME_LEN || !SEGMENT_NAME_RE.is_match(name) {
            return None;
        }
        let timeline = u32::from_str_radix(&name[0..8], 16).ok()?;
        let log = u32::from_str_radix(&name[8..16], 16).ok()?;
        let segment = u32::from_str_radix(&name[16..24], 16).ok()?;
        Some(WalSegment { timeline, log, segment })
    }

    pub fn timeline(&self) -> u32 {
        self.timeline
    }

    /// Segment number advanced by one, wrapping the log number forward at
    /// the per-log segment count implied by `segments_per_log` (the number
    /// of segments that fit in one 32-bit logical log, derived from the
    /// control file's segment size: `0x100000000 / segment_size`).
    pub fn next(&self, segments_per_log: u32) -> WalSegment {
        let mut segment = self.segment + 1;
        let mut log = self.log;
        if segment >= segments_per_log {
            segment = 0;
            log = log.wrapping_add(1);
        }
        WalSegment {
            timeline: self.timeline,
            log,
            segment,
        }
    }

    /// The directory component `<SEG[0:16]>` archives shard segments under (§4.F).
    pub fn archive_subdir(&self) -> String {
        format!("{:08X}{:08X}", self.timeline, self.log)
    }
}

impl fmt::Display for WalSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}{:08X}{:08X}", self.timeline, self.log, self.segment)
    }
}

/// The ordered sequence of segments beginning at a given one, used to
/// compute the ideal look-ahead queue (§3 SegmentNeighborhood).
pub struct SegmentNeighborhood {
    next: WalSegment,
    segments_per_log: u32,
}

impl SegmentNeighborhood {
    pub fn starting_at(start: WalSegment, segments_per_log: u32) -> Self {
        SegmentNeighborhood {
            next: start,
            segments_per_log,
        }
    }
}

impl Iterator for SegmentNeighborhood {
    type Item = WalSegment;

    fn next(&mut self) -> Option<WalSegment> {
        let current = self.next;
        self.next = current.next(self.segments_per_log);
        Some(current)
    }
}

/// `max(2, floor(queue_max / segment_size))` consecutive segments starting
/// at `start` (§3 IdealQueue; boundary behavior: `queueMax < 2 * segmentSize`
/// rounds up to 2).
pub fn ideal_queue(start: WalSegment, queue_max_bytes: u64, segment_size: u32, segments_per_log: u32) -> Vec<WalSegment> {
    let len = (queue_max_bytes / segment_size as u64).max(2) as usize;
    SegmentNeighborhood::starting_at(start, segments_per_log).take(len).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_displays_round_trip() {
        let name = "0000000100000002000000FF";
        let seg = WalSegment::parse(name).unwrap();
        assert_eq!(seg.to_string(), name);
    }

    #[test]
    fn rejects_non_segment_names() {
        assert!(WalSegment::parse("00000001.history").is_none());
        assert!(WalSegment::parse("too-short").is_none());
    }

    #[test]
    fn neighborhood_wraps_segment_number_into_log() {
        let seg = WalSegment::parse("000000010000000000000FFE").unwrap();
        let segments_per_log = 0x100000000u64 / (16 * 1024 * 1024);
        let mut it = SegmentNeighborhood::starting_at(seg, segments_per_log as u32);
        let first = it.next().unwrap();
        assert_eq!(first, seg);
    }

    #[test]
    fn ideal_queue_rounds_up_to_two_below_boundary() {
        let seg = WalSegment::parse("000000010000000000000001").unwrap();
        let segment_size = 16 * 1024 * 1024u32;
        let q = ideal_queue(seg, segment_size as u64, segment_size, 0x100000000u64 as u32 / segment_size);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn ideal_queue_scales_with_queue_max() {
        let seg = WalSegment::parse("000000010000000000000001").unwrap();
        let segment_size = 16 * 1024 * 1024u32;
        let q = ideal_queue(seg, segment_size as u64 * 5, segment_size, 0x100000000u64 as u32 / segment_size);
        assert_eq!(q.len(), 5);
    }
}
