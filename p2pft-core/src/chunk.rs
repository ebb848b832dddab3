//! Chunk arithmetic: chunk counts, per-chunk lengths, request ranges, fragment names, missing runs.
//!
//! Chunk indices are 1-based throughout: a file of `total` chunks has indices `1..=total`.

use std::ops::RangeInclusive;

/// Extension of on-disk fragment files.
pub const FRAGMENT_EXT: &str = "p2pft";

/// `ceil(size / chunk_size)`.
pub fn total_chunks(size: u64, chunk_size: usize) -> u32 {
    checked_total_chunks(size, chunk_size).unwrap_or(u32::MAX)
}

/// Chunk count for `size`, or `None` when it does not fit the 32-bit index space.
pub fn checked_total_chunks(size: u64, chunk_size: usize) -> Option<u32> {
    let chunk_size = chunk_size.max(1) as u64;
    u32::try_from(size.div_ceil(chunk_size)).ok()
}

/// Payload length of chunk `index` (1-based). Zero when out of range.
pub fn chunk_len(size: u64, chunk_size: usize, index: u32) -> usize {
    let total = total_chunks(size, chunk_size);
    if index == 0 || index > total {
        return 0;
    }
    let start = chunk_offset(index, chunk_size);
    (size - start).min(chunk_size as u64) as usize
}

/// Byte offset of chunk `index` (1-based) within the file.
pub fn chunk_offset(index: u32, chunk_size: usize) -> u64 {
    u64::from(index.saturating_sub(1)) * chunk_size as u64
}

/// A run of absent chunks: `[start, start + count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MissingRange {
    pub start: u32,
    pub count: u32,
}

impl MissingRange {
    pub fn new(start: u32, count: u32) -> Self {
        Self { start, count }
    }

    /// Every chunk of a file.
    pub fn whole(total: u32) -> Self {
        Self {
            start: 1,
            count: total,
        }
    }

    pub fn indices(&self) -> std::ops::Range<u32> {
        self.start..self.start.saturating_add(self.count)
    }
}

/// Clamp a requested `(start, count)` to the chunks that exist.
///
/// `start == 0` means "from the first chunk"; `count == 0` means "to the last chunk".
/// Returns an empty range when `start` lies past the end.
pub fn clamp_range(start: u32, count: u32, total: u32) -> RangeInclusive<u32> {
    let first = start.max(1);
    if total == 0 || first > total {
        return 1..=0;
    }
    let last = if count == 0 {
        total
    } else {
        first.saturating_add(count - 1).min(total)
    };
    first..=last
}

/// Parsed fragment file name: `{file_id}.pt.{index}.of.{total}.p2pft`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentName {
    pub file_id: u32,
    pub index: u32,
    pub total: u32,
}

impl FragmentName {
    pub fn new(file_id: u32, index: u32, total: u32) -> Self {
        Self {
            file_id,
            index,
            total,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let mut parts = name.split('.');
        let file_id = parts.next()?.parse().ok()?;
        if parts.next()? != "pt" {
            return None;
        }
        let index = parts.next()?.parse().ok()?;
        if parts.next()? != "of" {
            return None;
        }
        let total = parts.next()?.parse().ok()?;
        if parts.next()? != FRAGMENT_EXT || parts.next().is_some() {
            return None;
        }
        Some(Self {
            file_id,
            index,
            total,
        })
    }
}

impl std::fmt::Display for FragmentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.pt.{}.of.{}.{}",
            self.file_id, self.index, self.total, FRAGMENT_EXT
        )
    }
}

/// Maximal runs of absent chunks, ascending. `present[i]` describes chunk `i + 1`.
pub fn missing_ranges(present: &[bool]) -> Vec<MissingRange> {
    let mut out = Vec::new();
    let mut run: Option<MissingRange> = None;
    for (i, &have) in present.iter().enumerate() {
        if have {
            out.extend(run.take());
            continue;
        }
        match run.as_mut() {
            Some(r) => r.count += 1,
            None => run = Some(MissingRange::new(i as u32 + 1, 1)),
        }
    }
    out.extend(run);
    out
}

/// Flatten ranges into the `[start, count, start, count, ...]` form carried on a `FileItem`.
pub fn flatten_ranges(ranges: &[MissingRange]) -> Vec<u32> {
    ranges.iter().flat_map(|r| [r.start, r.count]).collect()
}

/// Read a flat `[start, count, ...]` sequence two at a time. A dangling odd entry is ignored.
pub fn pair_ranges(flat: &[u32]) -> Vec<MissingRange> {
    flat.chunks_exact(2)
        .map(|p| MissingRange::new(p[0], p[1]))
        .collect()
}
