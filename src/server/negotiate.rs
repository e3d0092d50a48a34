//! `Range` request header handling.

use crate::core::model::ByteRange;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    #[error("malformed range header")]
    Malformed,

    #[error("range not satisfiable")]
    Unsatisfiable,
}

/// Parses a single `bytes=` range against a resource of `length` bytes.
///
/// `bytes=<begin>-[<end>]` and the suffix form `bytes=-<n>` are accepted. An
/// end past the resource is clamped to its last byte.
pub fn parse_range(header: &str, length: u64) -> Result<ByteRange, RangeError> {
    let header = header.trim();
    let spec = header
        .get(..6)
        .filter(|unit| unit.eq_ignore_ascii_case("bytes="))
        .map(|_| &header[6..])
        .ok_or(RangeError::Malformed)?;
    if spec.contains(',') {
        return Err(RangeError::Malformed);
    }
    let (begin, end) = spec.split_once('-').ok_or(RangeError::Malformed)?;
    let (begin, end) = (begin.trim(), end.trim());

    if begin.is_empty() {
        let suffix = parse_number(end)?;
        if suffix == 0 || length == 0 {
            return Err(RangeError::Unsatisfiable);
        }
        return Ok(ByteRange { begin: length.saturating_sub(suffix), end: length - 1 });
    }

    let begin = parse_number(begin)?;
    let end = if end.is_empty() { None } else { Some(parse_number(end)?) };

    if begin >= length {
        return Err(RangeError::Unsatisfiable);
    }
    let last = length - 1;
    ByteRange::new(begin, end.map_or(last, |end| end.min(last))).ok_or(RangeError::Unsatisfiable)
}

fn parse_number(s: &str) -> Result<u64, RangeError> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RangeError::Malformed);
    }
    s.parse().map_err(|_| RangeError::Malformed)
}

/// What to answer for a request, given its `Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    /// 200. `None` for an empty resource.
    Full(Option<ByteRange>),
    /// 206.
    Partial(ByteRange),
    /// 416.
    Unsatisfiable,
}

pub fn negotiate(range_header: Option<&str>, length: u64) -> Negotiation {
    match range_header {
        None => Negotiation::Full(ByteRange::whole(length)),
        Some(h) => match parse_range(h, length) {
            Ok(r) => Negotiation::Partial(r),
            Err(_) => Negotiation::Unsatisfiable,
        },
    }
}

pub fn content_range(range: ByteRange, length: u64) -> String {
    format!("bytes {}-{}/{}", range.begin, range.end, length)
}

pub fn unsatisfied_range(length: u64) -> String {
    format!("*/{}", length)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(begin: u64, end: u64) -> ByteRange {
        ByteRange { begin, end }
    }

    #[test]
    fn parses_closed_and_open_ranges() {
        assert_eq!(parse_range("bytes=12-34", 35), Ok(r(12, 34)));
        assert_eq!(parse_range("bytes=12-34", 100), Ok(r(12, 34)));
        assert_eq!(parse_range("bytes=12-", 35), Ok(r(12, 34)));
        assert_eq!(parse_range("bytes=0-0", 1), Ok(r(0, 0)));
        assert_eq!(parse_range(" Bytes=5- ", 16), Ok(r(5, 15)));
    }

    #[test]
    fn clamps_end_to_resource() {
        assert_eq!(parse_range("bytes=10-99", 16), Ok(r(10, 15)));
    }

    #[test]
    fn parses_suffix_ranges() {
        assert_eq!(parse_range("bytes=-4", 16), Ok(r(12, 15)));
        assert_eq!(parse_range("bytes=-100", 16), Ok(r(0, 15)));
        assert_eq!(parse_range("bytes=-0", 16), Err(RangeError::Unsatisfiable));
    }

    #[test]
    fn rejects_unsatisfiable() {
        assert_eq!(parse_range("bytes=20-30", 16), Err(RangeError::Unsatisfiable));
        assert_eq!(parse_range("bytes=16-", 16), Err(RangeError::Unsatisfiable));
        assert_eq!(parse_range("bytes=9-3", 16), Err(RangeError::Unsatisfiable));
        assert_eq!(parse_range("bytes=0-", 0), Err(RangeError::Unsatisfiable));
    }

    #[test]
    fn rejects_malformed() {
        for h in ["", "bytes=", "bytes=-", "items=0-1", "bytes=a-b", "bytes=1", "bytes=+1-2", "bytes=0-1,4-5"] {
            assert_eq!(parse_range(h, 16), Err(RangeError::Malformed), "{h:?}");
        }
    }

    #[test]
    fn negotiates_status() {
        assert_eq!(negotiate(None, 16), Negotiation::Full(Some(r(0, 15))));
        assert_eq!(negotiate(None, 0), Negotiation::Full(None));
        assert_eq!(negotiate(Some("bytes=5-"), 16), Negotiation::Partial(r(5, 15)));
        assert_eq!(negotiate(Some("bytes=20-30"), 16), Negotiation::Unsatisfiable);
        assert_eq!(negotiate(Some("garbage"), 16), Negotiation::Unsatisfiable);
    }

    #[test]
    fn formats_content_range() {
        assert_eq!(content_range(r(5, 15), 16), "bytes 5-15/16");
        assert_eq!(unsatisfied_range(16), "*/16");
    }
}
