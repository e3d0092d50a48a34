//! Test doubles shared by the unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use crate::core::model::{Browser, ByteRange, ProbeResult, ResourceDescriptor, ResourceRequest};
use crate::core::retry::FetchError;
use crate::plugins::registry::{ByteStream, CookieSource, Upstream, UpstreamContext};

pub fn sample_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 37 + 11) as u8).collect()
}

/// Serves a byte buffer as if it were a range-capable HTTP origin.
pub struct MemoryUpstream {
    data: Bytes,
    pub url: String,
    pub redirect_to: Option<String>,
    pub accept_ranges: bool,
    pub content_type: Option<String>,
    pub report_length: bool,
    chunk: usize,
    jitter: bool,
    hang: bool,
    truncate_first: Option<usize>,
    truncated: AtomicBool,
    fail_at: Option<(u64, FetchError)>,
    probe_error: Option<FetchError>,
    requested: Mutex<Vec<ByteRange>>,
    pub probe_headers: Mutex<Vec<HashMap<String, String>>>,
    pub probed_urls: Mutex<Vec<String>>,
    pub opened_urls: Mutex<Vec<String>>,
    pub probes: AtomicUsize,
    pub opens: AtomicUsize,
    pub active: Arc<AtomicUsize>,
    pub cancelled: Arc<AtomicUsize>,
}

impl MemoryUpstream {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            url: "http://origin.test/video.mp4".to_string(),
            redirect_to: None,
            accept_ranges: true,
            content_type: Some("video/mp4".to_string()),
            report_length: true,
            chunk: 3,
            jitter: false,
            hang: false,
            truncate_first: None,
            truncated: AtomicBool::new(false),
            fail_at: None,
            probe_error: None,
            requested: Mutex::new(vec![]),
            probe_headers: Mutex::new(vec![]),
            probed_urls: Mutex::new(vec![]),
            opened_urls: Mutex::new(vec![]),
            probes: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
            active: Arc::new(AtomicUsize::new(0)),
            cancelled: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Delays each response by a few milliseconds depending on the range, so
    /// pieces complete out of order.
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Range requests never answer.
    pub fn hang(mut self) -> Self {
        self.hang = true;
        self
    }

    /// The first range response ends after `n` bytes.
    pub fn truncate_first_response(mut self, n: usize) -> Self {
        self.truncate_first = Some(n);
        self
    }

    /// Every range request covering `offset` fails with `err`.
    pub fn fail_at(mut self, offset: u64, err: FetchError) -> Self {
        self.fail_at = Some((offset, err));
        self
    }

    pub fn failing_probe(mut self, err: FetchError) -> Self {
        self.probe_error = Some(err);
        self
    }

    pub fn without_ranges(mut self) -> Self {
        self.accept_ranges = false;
        self
    }

    pub fn redirecting_to(mut self, url: &str) -> Self {
        self.redirect_to = Some(url.to_string());
        self
    }

    pub fn descriptor(&self) -> ResourceDescriptor {
        ResourceDescriptor {
            url: self.url.clone(),
            headers: HashMap::new(),
            content_length: self.data.len() as u64,
            content_type: self.content_type.clone(),
            supports_ranges: self.accept_ranges,
        }
    }

    pub fn requested(&self) -> Vec<ByteRange> {
        self.requested.lock().unwrap().clone()
    }
}

struct ActiveGuard {
    active: Arc<AtomicUsize>,
    cancelled: Arc<AtomicUsize>,
    completed: bool,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        if !self.completed {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Upstream for MemoryUpstream {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn probe(&self, res: &ResourceRequest, _ctx: &UpstreamContext) -> Result<ProbeResult, FetchError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.probe_headers.lock().unwrap().push(res.headers.clone());
        self.probed_urls.lock().unwrap().push(res.url.clone());
        if let Some(e) = &self.probe_error {
            return Err(e.clone());
        }
        Ok(ProbeResult {
            final_url: self.redirect_to.clone().unwrap_or_else(|| res.url.clone()),
            content_length: self.report_length.then_some(self.data.len() as u64),
            content_type: self.content_type.clone(),
            supports_ranges: self.accept_ranges,
        })
    }

    async fn open_range(
        &self,
        res: &ResourceDescriptor,
        _ctx: &UpstreamContext,
        range: ByteRange,
    ) -> Result<ByteStream, FetchError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.opened_urls.lock().unwrap().push(res.url.clone());
        self.requested.lock().unwrap().push(range);

        self.active.fetch_add(1, Ordering::SeqCst);
        let mut guard = ActiveGuard {
            active: self.active.clone(),
            cancelled: self.cancelled.clone(),
            completed: false,
        };

        if self.hang {
            std::future::pending::<()>().await;
        }
        if self.jitter {
            tokio::time::sleep(Duration::from_millis((range.begin * 7 + range.end * 3) % 5)).await;
        }
        guard.completed = true;

        if let Some((offset, err)) = &self.fail_at {
            if range.begin <= *offset && *offset <= range.end {
                return Err(err.clone());
            }
        }

        let mut body = self.data.slice(range.begin as usize..=range.end as usize);
        if let Some(n) = self.truncate_first {
            if !self.truncated.swap(true, Ordering::SeqCst) {
                body = body.slice(..n.min(body.len()));
            }
        }

        let chunks: Vec<Result<Bytes, FetchError>> = body
            .chunks(self.chunk)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }
}

/// Hands out a fixed cookie jar per browser and records what was asked.
#[derive(Default)]
pub struct StaticCookies {
    pub jar: HashMap<String, String>,
    pub asked: Mutex<Vec<(Option<Browser>, String)>>,
}

#[async_trait]
impl CookieSource for StaticCookies {
    async fn cookies_for(&self, browser: Option<Browser>, url: &Url) -> HashMap<String, String> {
        self.asked
            .lock()
            .unwrap()
            .push((browser, url.host_str().unwrap_or_default().to_string()));
        match browser {
            Some(_) => self.jar.clone(),
            None => HashMap::new(),
        }
    }
}
