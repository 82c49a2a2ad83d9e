//! Part and segment planning.

use crate::types::{Part, Segment};
use crate::{MAX_PART_COUNT, MIN_PART_SIZE};

/// Chooses the part size for an object of `total_size` bytes.
///
/// An object smaller than `preferred` becomes a single part. Otherwise the
/// preferred size is doubled until it is at least [`MIN_PART_SIZE`] and no
/// more than [`MAX_PART_COUNT`] parts are needed.
pub fn determine_part_size(total_size: u64, preferred: u64) -> u64 {
    let preferred = preferred.max(1);
    if total_size < preferred {
        return total_size.max(1);
    }

    let mut size = preferred;
    while size.saturating_mul(MAX_PART_COUNT) < total_size || size < MIN_PART_SIZE {
        size = size.saturating_mul(2);
    }
    size
}

/// Honors a caller-chosen part size, raised to [`MIN_PART_SIZE`] (or the
/// whole object, when smaller) and grown only as far as needed to stay
/// within [`MAX_PART_COUNT`] parts.
pub fn fit_part_size(total_size: u64, requested: u64) -> u64 {
    let floor = MIN_PART_SIZE.min(total_size).max(1);
    let mut size = requested.max(floor);
    while part_count(total_size, size) > MAX_PART_COUNT {
        size = size.saturating_mul(2);
    }
    size
}

/// Number of parts needed to cover `total_size` bytes.
pub fn part_count(total_size: u64, part_size: u64) -> u64 {
    total_size.div_ceil(part_size.max(1))
}

/// Splits `[0, total_size)` into parts of `part_size` bytes; the last part
/// may be shorter.
///
/// Part `k` covers `[(k-1) * part_size, min(k * part_size, total_size))`.
pub fn plan_parts(total_size: u64, part_size: u64) -> Vec<Part> {
    let part_size = part_size.max(1);
    (1..=part_count(total_size, part_size))
        .map(|k| Part {
            part_number: k as u32,
            start: (k - 1) * part_size,
            end: (k * part_size).min(total_size),
        })
        .collect()
}

/// Splits `[0, total_size - 1]` into inclusive segments of `part_size` bytes.
pub fn plan_segments(total_size: u64, part_size: u64) -> Vec<Segment> {
    let part_size = part_size.max(1);
    (0..part_count(total_size, part_size))
        .map(|i| Segment {
            index: i as u32,
            start: i * part_size,
            end: ((i + 1) * part_size).min(total_size) - 1,
        })
        .collect()
}
