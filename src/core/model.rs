use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

pub type RequestId = Uuid;

/// Inclusive byte range, `begin <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub begin: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(begin: u64, end: u64) -> Option<Self> {
        if begin <= end {
            Some(Self { begin, end })
        } else {
            None
        }
    }

    /// Whole resource of `len` bytes. `None` for an empty resource.
    pub fn whole(len: u64) -> Option<Self> {
        len.checked_sub(1).map(|end| Self { begin: 0, end })
    }

    pub fn size(&self) -> u64 {
        self.end - self.begin + 1
    }

    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.begin, self.end)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.begin, self.end)
    }
}

/// Which downstream request headers are passed on to upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForwardPolicy {
    #[default]
    None,
    Allowlist,
}

impl ForwardPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "allowlist" => Some(Self::Allowlist),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Browser {
    Chrome,
    Chromium,
    Firefox,
}

impl Browser {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "chrome" => Some(Self::Chrome),
            "chromium" => Some(Self::Chromium),
            "firefox" => Some(Self::Firefox),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Chrome => "chrome",
            Self::Chromium => "chromium",
            Self::Firefox => "firefox",
        }
    }
}

/// Upstream resource before probing: where to go and what to send.
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    pub url: String,
    pub headers: HashMap<String, String>,
}

/// Upstream resource after a successful probe. Fixed for one downstream request.
#[derive(Debug, Clone)]
pub struct ResourceDescriptor {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub content_length: u64,
    pub content_type: Option<String>,
    pub supports_ranges: bool,
}

/// What a HEAD probe reports about the upstream resource.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub final_url: String,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub supports_ranges: bool,
}
