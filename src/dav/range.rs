//! HTTP Range header parsing for single byte ranges.
//!
//! Accepted forms: `bytes=a-b`, `bytes=a-`, `bytes=-N`. Multipart ranges
//! are not served; they parse as unsatisfiable so the caller answers 416.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    /// Inclusive end, already clamped to the file size.
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    Malformed,
    Unsatisfiable,
}

pub fn parse_range(header: &str, file_size: u64) -> Result<ByteRange, RangeError> {
    let value = header
        .strip_prefix("bytes=")
        .ok_or(RangeError::Malformed)?
        .trim();
    if value.is_empty() || value.contains(',') {
        return Err(RangeError::Unsatisfiable);
    }

    let (start, end) = if let Some(suffix) = value.strip_prefix('-') {
        // bytes=-N: the final N bytes.
        let n: u64 = suffix.parse().map_err(|_| RangeError::Malformed)?;
        if n == 0 || file_size == 0 {
            return Err(RangeError::Unsatisfiable);
        }
        (file_size.saturating_sub(n), file_size - 1)
    } else if let Some(prefix) = value.strip_suffix('-') {
        // bytes=a-: from a to the end.
        let start: u64 = prefix.parse().map_err(|_| RangeError::Malformed)?;
        if file_size == 0 {
            return Err(RangeError::Unsatisfiable);
        }
        (start, file_size - 1)
    } else {
        let (a, b) = value.split_once('-').ok_or(RangeError::Malformed)?;
        let start: u64 = a.parse().map_err(|_| RangeError::Malformed)?;
        let end: u64 = b.parse().map_err(|_| RangeError::Malformed)?;
        if end < start {
            return Err(RangeError::Malformed);
        }
        (start, end.min(file_size.saturating_sub(1)))
    };

    if start >= file_size || end < start {
        return Err(RangeError::Unsatisfiable);
    }
    Ok(ByteRange { start, end })
}
