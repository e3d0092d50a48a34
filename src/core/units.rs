#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SizeParseError {
    #[error("empty size")]
    Empty,

    #[error("invalid size: {0}")]
    Invalid(String),

    #[error("size must be at least one byte: {0}")]
    Zero(String),

    #[error("size too large: {0}")]
    Overflow(String),
}

/// Parses sizes like `4M`, `512k`, `1G` or `1024` into a byte count.
pub fn parse_size(raw: &str) -> Result<u64, SizeParseError> {
    let s = raw.trim();
    let last = s.chars().last().ok_or(SizeParseError::Empty)?;

    let (digits, unit) = match last.to_ascii_uppercase() {
        'B' => (&s[..s.len() - 1], 1u64),
        'K' => (&s[..s.len() - 1], 1024),
        'M' => (&s[..s.len() - 1], 1024 * 1024),
        'G' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };

    let n: u64 = digits
        .trim()
        .parse()
        .map_err(|_| SizeParseError::Invalid(raw.to_string()))?;
    if n == 0 {
        return Err(SizeParseError::Zero(raw.to_string()));
    }
    n.checked_mul(unit)
        .ok_or_else(|| SizeParseError::Overflow(raw.to_string()))
}
