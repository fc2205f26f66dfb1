//! Range Parser (C1): decodes a client `Range` header against a known
//! total size, and applies the small-request prefetch expansion policy.
//!
//! Grammar (first range only; a header listing multiple ranges uses only
//! the first one, per spec §4.1):
//!   `bytes=S-E`, `bytes=S-`, `bytes=-N`.

const MIN_CHUNK: u64 = 5 * 1024 * 1024;
const OPTIMAL_CHUNK: u64 = 10 * 1024 * 1024;
const EXPANSION_CEILING: u64 = 20 * 1024 * 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RangeParseError {
    #[error("missing 'bytes=' prefix")]
    MissingUnit,
    #[error("malformed numeric range")]
    InvalidNumber,
    #[error("start beyond end of resource")]
    StartBeyondTotal,
}

/// A resolved, possibly-expanded byte range.
///
/// `start`/`end` are the range the engine will actually fetch/serve from
/// cache; `original_end` (when `expanded` is set) is the byte the client
/// asked for — the engine must never deliver bytes past it (spec §4.6.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedRange {
    pub start: u64,
    pub end: u64,
    pub original_end: u64,
    pub expanded: bool,
}

impl ParsedRange {
    /// Number of bytes the client is owed, regardless of expansion.
    pub fn client_len(&self) -> u64 {
        self.original_end - self.start + 1
    }

    /// Number of bytes the engine may fetch from upstream/cache.
    pub fn fetch_len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Parse the literal `Range` header value against `total` and apply the
/// prefetch expansion policy from spec §4.1. `total` must be > 0; callers
/// are expected to have already turned `total == 0` into
/// `RangeUnsatisfiable` before calling this (spec §4.6.1 step 1).
pub fn parse_and_expand(header: &str, total: u64) -> Result<ParsedRange, RangeParseError> {
    let (start, end) = parse_raw(header, total)?;
    if start >= total {
        return Err(RangeParseError::StartBeyondTotal);
    }
    let end = end.min(total - 1);

    Ok(expand(start, end, total))
}

/// Parse only, without expansion — used by tests that want the literal
/// client-requested interval.
fn parse_raw(header: &str, total: u64) -> Result<(u64, u64), RangeParseError> {
    let rest = header.strip_prefix("bytes=").ok_or(RangeParseError::MissingUnit)?;
    // Only the first range in a (possibly multi-range) header is honored.
    let first = rest.split(',').next().unwrap_or("");
    let (start_str, end_str) = first.split_once('-').ok_or(RangeParseError::InvalidNumber)?;

    if start_str.is_empty() {
        // Suffix range: bytes=-N
        let n: u64 = end_str.parse().map_err(|_| RangeParseError::InvalidNumber)?;
        let start = total.saturating_sub(n);
        Ok((start, total.saturating_sub(1)))
    } else if end_str.is_empty() {
        // Open range: bytes=S-
        let start: u64 = start_str.parse().map_err(|_| RangeParseError::InvalidNumber)?;
        Ok((start, total.saturating_sub(1)))
    } else {
        let start: u64 = start_str.parse().map_err(|_| RangeParseError::InvalidNumber)?;
        let end: u64 = end_str.parse().map_err(|_| RangeParseError::InvalidNumber)?;
        if end < start {
            return Err(RangeParseError::InvalidNumber);
        }
        Ok((start, end))
    }
}

fn expand(start: u64, end: u64, total: u64) -> ParsedRange {
    let req = end - start + 1;
    let max_end = total - 1;

    if req < MIN_CHUNK {
        let new_end = (start + OPTIMAL_CHUNK - 1).min(max_end);
        ParsedRange {
            start,
            end: new_end,
            original_end: end,
            expanded: new_end > end,
        }
    } else if req < EXPANSION_CEILING {
        let grown = ((req as f64) * 1.5).max(OPTIMAL_CHUNK as f64) as u64;
        let new_end = (start + grown - 1).min(max_end);
        if new_end > end {
            ParsedRange {
                start,
                end: new_end,
                original_end: end,
                expanded: true,
            }
        } else {
            ParsedRange {
                start,
                end,
                original_end: end,
                expanded: false,
            }
        }
    } else {
        ParsedRange {
            start,
            end,
            original_end: end,
            expanded: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOTAL: u64 = 10 * 1024 * 1024; // 10 MiB

    #[test]
    fn single_byte_range() {
        let r = parse_raw("bytes=0-0", TOTAL).unwrap();
        assert_eq!(r, (0, 0));
    }

    #[test]
    fn suffix_range_returns_last_byte() {
        let r = parse_raw("bytes=-1", TOTAL).unwrap();
        assert_eq!(r, (TOTAL - 1, TOTAL - 1));
    }

    #[test]
    fn open_range_from_last_byte() {
        let r = parse_raw(&format!("bytes={}-", TOTAL - 1), TOTAL).unwrap();
        assert_eq!(r, (TOTAL - 1, TOTAL - 1));
    }

    #[test]
    fn end_beyond_total_is_clamped_by_parse_and_expand() {
        let parsed = parse_and_expand("bytes=0-999999999", TOTAL).unwrap();
        assert_eq!(parsed.original_end, TOTAL - 1);
    }

    #[test]
    fn start_beyond_total_is_unsatisfiable() {
        let err = parse_and_expand(&format!("bytes={}-{}", TOTAL, TOTAL + 10), TOTAL).unwrap_err();
        assert_eq!(err, RangeParseError::StartBeyondTotal);
    }

    #[test]
    fn missing_bytes_prefix_is_malformed() {
        let err = parse_raw("items=0-1", TOTAL).unwrap_err();
        assert_eq!(err, RangeParseError::MissingUnit);
    }

    #[test]
    fn garbage_numbers_are_malformed() {
        let err = parse_raw("bytes=a-b", TOTAL).unwrap_err();
        assert_eq!(err, RangeParseError::InvalidNumber);
    }

    #[test]
    fn small_request_expands_to_optimal_chunk() {
        let parsed = parse_and_expand("bytes=0-1023", TOTAL).unwrap();
        assert!(parsed.expanded);
        assert_eq!(parsed.original_end, 1023);
        assert_eq!(parsed.end, OPTIMAL_CHUNK - 1);
        assert_eq!(parsed.client_len(), 1024);
    }

    #[test]
    fn small_request_expansion_clamped_to_total() {
        // Near the end of the file there isn't room for a full OPTIMAL_CHUNK.
        let start = TOTAL - 100;
        let parsed = parse_and_expand(&format!("bytes={start}-{}", TOTAL - 1), TOTAL).unwrap();
        assert_eq!(parsed.end, TOTAL - 1);
        assert!(!parsed.expanded || parsed.end == TOTAL - 1);
    }

    #[test]
    fn mid_size_request_grows_by_1_5x() {
        // 8 MiB request: MIN_CHUNK <= req < 20 MiB, so expands to max(1.5*req, OPTIMAL_CHUNK).
        let req: u64 = 8 * 1024 * 1024;
        let parsed = parse_and_expand(&format!("bytes=0-{}", req - 1), TOTAL).unwrap();
        let expected_len = ((req as f64) * 1.5) as u64;
        assert_eq!(parsed.fetch_len(), expected_len.min(TOTAL));
        assert!(parsed.expanded);
    }

    #[test]
    fn large_request_passes_through_unchanged() {
        let req: u64 = 20 * 1024 * 1024;
        let total = 40 * 1024 * 1024;
        let parsed = parse_and_expand(&format!("bytes=0-{}", req - 1), total).unwrap();
        assert!(!parsed.expanded);
        assert_eq!(parsed.end, req - 1);
    }

    #[test]
    fn multi_range_header_only_honors_first() {
        let parsed = parse_and_expand("bytes=0-0,100-200", TOTAL).unwrap();
        assert_eq!(parsed.original_end, 0);
    }
}
