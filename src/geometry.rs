//! Bounds, alignment and overlap checks shared by both table formats.
//!
//! Everything here is unit-agnostic: the GPT engine works in blocks with an
//! alignment of one, the MBR engine works in bytes aligned to the block
//! size. Sibling lists never include the partition being edited.

/// A half-open range `[start, start + size)`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct Extent {
    /// First unit.
    pub start: u64,
    /// Number of units.
    pub size: u64,
}

impl Extent {
    /// Creates an extent.
    pub fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }

    /// One past the last unit (saturating).
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.size)
    }

    /// Whether the two extents share at least one unit.
    pub fn overlaps(&self, other: &Extent) -> bool {
        self.size > 0 && other.size > 0 && self.start < other.end() && other.start < self.end()
    }

    /// Whether `offset` lies inside the extent.
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.end()
    }
}

/// Rounds down to a multiple of `align`.
pub fn align_down(v: u64, align: u64) -> u64 {
    v / align * align
}

/// Rounds up to a multiple of `align`, `None` on overflow.
pub fn align_up(v: u64, align: u64) -> Option<u64> {
    v.checked_add(align - 1).map(|v| v / align * align)
}

/// Non-empty, starts at or after `min_start` and ends inside `limit`.
pub fn check_location(extent: &Extent, min_start: u64, limit: u64) -> bool {
    extent.size > 0
        && extent.start >= min_start
        && extent.start.checked_add(extent.size).map_or(false, |end| end <= limit)
}

/// Whether `extent` overlaps any of `siblings`.
pub fn overlaps_any(extent: &Extent, siblings: &[Extent]) -> bool {
    siblings.iter().any(|s| extent.overlaps(s))
}

/// Whether `offset` lies inside any of `extents`.
pub fn is_inside_any(offset: u64, extents: &[Extent]) -> bool {
    extents.iter().any(|e| e.contains(offset))
}

fn sorted(siblings: &[Extent]) -> Vec<Extent> {
    let mut v: Vec<Extent> = siblings.iter().copied().filter(|s| s.size > 0).collect();
    v.sort_unstable();
    v
}

/// Closest sibling starting at or before `start`.
fn previous_sibling(siblings: &[Extent], start: u64) -> Option<Extent> {
    siblings.iter().rev().find(|s| s.start <= start).copied()
}

/// Closest sibling starting at or after `start`.
fn next_sibling(siblings: &[Extent], start: u64) -> Option<Extent> {
    siblings.iter().find(|s| s.start >= start).copied()
}

/// Fits a new extent into `bounds` without touching any sibling.
///
/// The start is rounded up and the size down to `align`. Only the request
/// shrinks, never a sibling. Returns `None` when nothing is left.
pub fn fit_new(request: Extent, bounds: Extent, siblings: &[Extent], align: u64) -> Option<Extent> {
    let siblings = sorted(siblings);

    let mut start = align_up(request.start.max(bounds.start), align)?;
    if start >= bounds.end() {
        return None;
    }
    let mut end = request
        .start
        .max(bounds.start)
        .saturating_add(request.size)
        .min(bounds.end());

    if let Some(prev) = previous_sibling(&siblings, start) {
        if prev.end() > start {
            start = align_up(prev.end(), align)?;
        }
    }
    if let Some(next) = next_sibling(&siblings, start) {
        if next.start < end {
            end = next.start;
        }
    }

    if end <= start {
        return None;
    }
    let size = align_down(end - start, align);
    if size == 0 {
        return None;
    }
    Some(Extent::new(start, size))
}

/// Adjusts a requested size for an existing extent.
///
/// Shrinking is always allowed; growing stops at the end of `bounds` and at
/// the next sibling. The result is aligned down.
pub fn fit_resize(
    extent: Extent,
    new_size: u64,
    bounds: Extent,
    siblings: &[Extent],
    align: u64,
) -> u64 {
    if new_size <= extent.size {
        return align_down(new_size, align);
    }
    let siblings = sorted(siblings);

    let mut end = extent.start.saturating_add(new_size).min(bounds.end());
    if let Some(next) = siblings.iter().find(|s| s.start >= extent.end()) {
        end = end.min(next.start);
    }
    align_down(end.saturating_sub(extent.start), align)
}

/// Adjusts a requested start for moving an existing extent.
///
/// The extent keeps its size; it is clamped into `bounds` and cannot jump
/// over a neighbour.
pub fn fit_move(
    extent: Extent,
    new_start: u64,
    bounds: Extent,
    siblings: &[Extent],
    align: u64,
) -> Option<u64> {
    if extent.size > bounds.size {
        return None;
    }
    let siblings = sorted(siblings);

    let mut start = new_start
        .max(bounds.start)
        .min(bounds.end() - extent.size);
    start = align_down(start, align).max(align_up(bounds.start, align)?);

    if start < extent.start {
        // moving left: stop at the end of the previous sibling
        if let Some(prev) = previous_sibling(&siblings, extent.start) {
            if prev.end() > start {
                start = align_up(prev.end(), align)?;
            }
        }
    } else if let Some(next) = next_sibling(&siblings, extent.end()) {
        // moving right: stop at the start of the next sibling
        if next.start < start.saturating_add(extent.size) {
            start = align_down(next.start.checked_sub(extent.size)?, align);
        }
    }

    let moved = Extent::new(start, extent.size);
    if moved.end() > bounds.end() || overlaps_any(&moved, &siblings) {
        return None;
    }
    Some(start)
}

/// Outcome of the overlap pass for one extent.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Resolution {
    /// Untouched.
    Keep,
    /// Shrunk to the given size, its non-overlapping prefix.
    Shrink(u64),
    /// Nothing would remain.
    Drop,
}

/// Resolves overlaps between extents sorted by start.
///
/// Each extent overlapping its successor is cut back to the successor's
/// start, or dropped when that leaves nothing. Afterwards no two kept
/// extents overlap.
pub fn resolve_overlaps(by_start: &[Extent]) -> Vec<Resolution> {
    let mut out = vec![Resolution::Keep; by_start.len()];
    for i in 0..by_start.len().saturating_sub(1) {
        let (cur, next) = (by_start[i], by_start[i + 1]);
        if cur.end() > next.start {
            let remaining = next.start - cur.start;
            out[i] = if remaining == 0 {
                Resolution::Drop
            } else {
                Resolution::Shrink(remaining)
            };
        }
    }
    out
}

/// Gaps inside `bounds` that no sibling covers, start aligned up and size
/// aligned down to `align`. Gaps too small to hold one unit are left out.
pub fn free_spaces(bounds: Extent, siblings: &[Extent], align: u64) -> Vec<Extent> {
    let mut gaps = Vec::new();
    let mut cursor = bounds.start;
    for s in sorted(siblings) {
        if s.start > cursor {
            gaps.push((cursor, s.start.min(bounds.end())));
        }
        cursor = cursor.max(s.end());
    }
    gaps.push((cursor, bounds.end()));

    gaps.into_iter()
        .filter_map(|(from, to)| {
            let start = align_up(from, align)?;
            if to <= start {
                return None;
            }
            let size = align_down(to - start, align);
            if size == 0 {
                return None;
            }
            Some(Extent::new(start, size))
        })
        .collect()
}
