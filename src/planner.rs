use crate::error::ProxyError;
use crate::range::{parse_range_header, ByteRange};

/// Backend fetch strategy for one requested byte interval.
///
/// Chunks are always fetched at multiples of `chunk_size`; the requested
/// interval is recovered by trimming `first_cut` bytes off the front of the
/// first chunk and keeping only `last_cut` bytes of the last one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BytePlan {
    pub chunk_size: u64,
    /// Chunk-aligned offset of the first fetch.
    pub offset: u64,
    /// Bytes to skip at the start of the first chunk.
    pub first_cut: u64,
    /// Bytes to keep from the last chunk (exclusive end).
    pub last_cut: u64,
    pub part_count: u64,
}

impl BytePlan {
    pub fn for_range(range: ByteRange, chunk_size: u64) -> Self {
        let first_chunk = range.start / chunk_size;
        let last_chunk = range.end_inclusive / chunk_size;
        let offset = first_chunk * chunk_size;
        Self {
            chunk_size,
            offset,
            first_cut: range.start - offset,
            last_cut: range.end_inclusive % chunk_size + 1,
            part_count: last_chunk - first_chunk + 1,
        }
    }

    /// Total bytes a complete stream of this plan produces.
    pub fn byte_len(&self) -> u64 {
        if self.part_count == 1 {
            return self.last_cut - self.first_cut;
        }
        (self.chunk_size - self.first_cut)
            + (self.part_count - 2) * self.chunk_size
            + self.last_cut
    }

    /// The `[start, end)` slice a complete chunk for `part` (1-based)
    /// contributes to the output.
    pub fn part_bounds(&self, part: u64) -> (u64, u64) {
        let start = if part == 1 { self.first_cut } else { 0 };
        let end = if part == self.part_count {
            self.last_cut
        } else {
            self.chunk_size
        };
        (start, end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeStatus {
    /// No Range header; answered with 200.
    Full,
    /// A satisfiable Range header; answered with 206.
    Partial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangePlan {
    pub status: RangeStatus,
    pub range: ByteRange,
    pub plan: BytePlan,
}

impl RangePlan {
    pub fn content_length(&self) -> u64 {
        self.range.len()
    }
}

/// Turn an optional Range header into a fetch plan for a non-empty object.
pub fn plan_request(
    range_header: Option<&str>,
    file_size: u64,
    chunk_size: u64,
) -> Result<RangePlan, ProxyError> {
    let parsed = parse_range_header(range_header, file_size)?;
    if file_size == 0 {
        return Err(ProxyError::RangeNotSatisfiable { size: 0 });
    }
    let (status, range) = match parsed {
        Some(r) => (RangeStatus::Partial, r),
        None => (RangeStatus::Full, ByteRange::full(file_size)),
    };
    Ok(RangePlan {
        status,
        range,
        plan: BytePlan::for_range(range, chunk_size),
    })
}
