use shellgate_common::ShellgateError;

/// Inclusive byte range resolved against an artifact of `size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size)
    }
}

/// Parses a `Range: bytes=...` header value against `size`. Supports
/// `a-b`, `a-` and the suffix form `-k`; anything out of bounds or
/// malformed is not satisfiable.
pub fn parse_range(header: &str, size: u64) -> Result<ByteRange, ShellgateError> {
    let value = header
        .strip_prefix("bytes=")
        .ok_or(ShellgateError::RangeInvalid)?;
    // A single range only; multipart ranges are not supported.
    if value.contains(',') {
        return Err(ShellgateError::RangeInvalid);
    }
    let (start_str, end_str) = value.split_once('-').ok_or(ShellgateError::RangeInvalid)?;

    if size == 0 {
        return Err(ShellgateError::RangeInvalid);
    }

    if start_str.is_empty() {
        // Suffix form: last k bytes.
        let k: u64 = end_str.parse().map_err(|_| ShellgateError::RangeInvalid)?;
        if k == 0 {
            return Err(ShellgateError::RangeInvalid);
        }
        let len = k.min(size);
        return Ok(ByteRange {
            start: size - len,
            end: size - 1,
        });
    }

    let start: u64 = start_str.parse().map_err(|_| ShellgateError::RangeInvalid)?;
    if start >= size {
        return Err(ShellgateError::RangeInvalid);
    }
    let end = if end_str.is_empty() {
        size - 1
    } else {
        let end: u64 = end_str.parse().map_err(|_| ShellgateError::RangeInvalid)?;
        if end < start {
            return Err(ShellgateError::RangeInvalid);
        }
        end.min(size - 1)
    };
    Ok(ByteRange { start, end })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_range() {
        let range = parse_range("bytes=0-9", 100).unwrap();
        assert_eq!(range, ByteRange { start: 0, end: 9 });
        assert_eq!(range.len(), 10);
        assert_eq!(range.content_range(100), "bytes 0-9/100");
    }

    #[test]
    fn open_ended_range() {
        let range = parse_range("bytes=50-", 100).unwrap();
        assert_eq!(range, ByteRange { start: 50, end: 99 });
    }

    #[test]
    fn suffix_range_takes_last_k_bytes() {
        let range = parse_range("bytes=-10", 100).unwrap();
        assert_eq!(range, ByteRange { start: 90, end: 99 });
        // k larger than the file clamps to the whole file.
        let range = parse_range("bytes=-500", 100).unwrap();
        assert_eq!(range, ByteRange { start: 0, end: 99 });
    }

    #[test]
    fn end_clamps_to_size() {
        let range = parse_range("bytes=10-5000", 100).unwrap();
        assert_eq!(range, ByteRange { start: 10, end: 99 });
    }

    #[test]
    fn out_of_range_start_is_unsatisfiable() {
        assert!(parse_range("bytes=100-", 100).is_err());
        assert!(parse_range("bytes=200-300", 100).is_err());
    }

    #[test]
    fn malformed_ranges_are_unsatisfiable() {
        assert!(parse_range("bytes=", 100).is_err());
        assert!(parse_range("bytes=a-b", 100).is_err());
        assert!(parse_range("bytes=5-2", 100).is_err());
        assert!(parse_range("items=0-5", 100).is_err());
        assert!(parse_range("bytes=0-5,10-20", 100).is_err());
    }

    #[test]
    fn empty_file_has_no_satisfiable_range() {
        assert!(parse_range("bytes=0-", 0).is_err());
        assert!(parse_range("bytes=-5", 0).is_err());
    }
}
