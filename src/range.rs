use crate::error::ProxyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end_inclusive: u64,
}

impl ByteRange {
    /// The whole object. Callers must not pass a zero size.
    pub fn full(total_size: u64) -> Self {
        Self {
            start: 0,
            end_inclusive: total_size - 1,
        }
    }

    pub fn len(&self) -> u64 {
        self.end_inclusive - self.start + 1
    }
}

/// Parse a `bytes=<start>-[<end>]` Range header value against a known object
/// size. The start is mandatory and the end must lie inside the object; suffix
/// forms and multi-range lists are rejected with RangeNotSatisfiable.
pub fn parse_range_header(
    header: Option<&str>,
    total_size: u64,
) -> Result<Option<ByteRange>, ProxyError> {
    let Some(value) = header else {
        return Ok(None);
    };
    let unsatisfiable = ProxyError::RangeNotSatisfiable { size: total_size };
    if total_size == 0 {
        return Err(unsatisfiable);
    }
    let Some(spec) = value.trim().strip_prefix("bytes=") else {
        return Err(unsatisfiable);
    };
    if spec.contains(',') {
        return Err(unsatisfiable);
    }
    let Some((left, right)) = spec.split_once('-') else {
        return Err(unsatisfiable);
    };
    let left = left.trim();
    let right = right.trim();

    // u64 parsing also turns away "-5" style negatives and "bytes=-N".
    let Ok(start) = left.parse::<u64>() else {
        return Err(unsatisfiable);
    };
    let end_inclusive = if right.is_empty() {
        total_size - 1
    } else {
        match right.parse::<u64>() {
            Ok(end) => end,
            Err(_) => return Err(unsatisfiable),
        }
    };
    if end_inclusive >= total_size || start > end_inclusive {
        return Err(unsatisfiable);
    }

    Ok(Some(ByteRange {
        start,
        end_inclusive,
    }))
}
