use async_trait::async_trait;
use futures::stream::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_TYPE, RANGE, USER_AGENT};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::core::model::{ByteRange, ProbeResult, ResourceDescriptor, ResourceRequest};
use crate::core::retry::FetchError;
use crate::plugins::registry::{ByteStream, Upstream, UpstreamContext};

pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        Ok(Self { client })
    }

    fn build_headers(headers: &HashMap<String, String>, ctx: &UpstreamContext) -> Result<HeaderMap, FetchError> {
        let mut h = HeaderMap::new();
        h.insert(
            USER_AGENT,
            HeaderValue::from_str(&ctx.user_agent)
                .map_err(|_| FetchError::InvalidRequest(format!("user agent {:?}", ctx.user_agent)))?,
        );
        for (k, v) in headers {
            let name = HeaderName::from_bytes(k.as_bytes())
                .map_err(|_| FetchError::InvalidRequest(format!("header name {k:?}")))?;
            let value = HeaderValue::from_str(v)
                .map_err(|_| FetchError::InvalidRequest(format!("value of header {k}")))?;
            h.insert(name, value);
        }
        Ok(h)
    }

    fn timeout(ctx: &UpstreamContext) -> Duration {
        Duration::from_secs(ctx.timeout_secs.max(1))
    }

    fn accept_ranges_hint(resp: &reqwest::Response) -> bool {
        resp.headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_ascii_lowercase().contains("bytes"))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn probe(&self, res: &ResourceRequest, ctx: &UpstreamContext) -> Result<ProbeResult, FetchError> {
        let headers = Self::build_headers(&res.headers, ctx)?;

        let head = self
            .client
            .head(&res.url)
            .headers(headers)
            .timeout(Self::timeout(ctx))
            .send()
            .await?;

        let status = head.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(FetchError::Status(status));
        }

        // Response::content_length() reflects the (empty) HEAD body, not the header.
        let content_length = head
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok());

        let content_type = head
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let probe = ProbeResult {
            final_url: head.url().to_string(),
            content_length,
            content_type,
            supports_ranges: Self::accept_ranges_hint(&head),
        };
        debug!(
            status = %status,
            final_url = %probe.final_url,
            length = ?probe.content_length,
            ranges = probe.supports_ranges,
            "probed upstream"
        );
        Ok(probe)
    }

    async fn open_range(
        &self,
        res: &ResourceDescriptor,
        ctx: &UpstreamContext,
        range: ByteRange,
    ) -> Result<ByteStream, FetchError> {
        let headers = Self::build_headers(&res.headers, ctx)?;

        let resp = self
            .client
            .get(&res.url)
            .headers(headers)
            .header(RANGE, range.header_value())
            .timeout(Self::timeout(ctx))
            .send()
            .await?;

        match resp.status() {
            StatusCode::PARTIAL_CONTENT => Ok(resp.bytes_stream().map_err(FetchError::from).boxed()),
            s if s.is_client_error() || s.is_server_error() => Err(FetchError::Status(s)),
            s => Err(FetchError::NotPartial(s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::retry::ErrorClass;
    use crate::server::negotiate::{negotiate, Negotiation};
    use crate::testing::sample_bytes;
    use axum::extract::State;
    use axum::http::{HeaderMap as AxumHeaders, Method};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::Router;
    use std::sync::Arc;

    /// Minimal range-capable origin, enough to drive the real client.
    async fn origin(State(data): State<Arc<Vec<u8>>>, method: Method, headers: AxumHeaders) -> Response {
        let len = data.len() as u64;
        let range = headers.get(RANGE).and_then(|v| v.to_str().ok());
        let mut resp = match negotiate(range, len) {
            Negotiation::Partial(r) => {
                let body = data[r.begin as usize..=r.end as usize].to_vec();
                let mut resp = (StatusCode::PARTIAL_CONTENT, body).into_response();
                resp.headers_mut().insert(
                    reqwest::header::CONTENT_RANGE,
                    HeaderValue::from_str(&format!("bytes {}-{}/{}", r.begin, r.end, len)).unwrap(),
                );
                resp
            }
            Negotiation::Full(_) => (StatusCode::OK, data.to_vec()).into_response(),
            Negotiation::Unsatisfiable => StatusCode::RANGE_NOT_SATISFIABLE.into_response(),
        };
        resp.headers_mut().insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        resp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("video/mp4"));
        if method == Method::HEAD {
            resp.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from(len));
        }
        resp
    }

    async fn no_ranges() -> &'static str {
        "whole body"
    }

    async fn spawn_origin(data: Vec<u8>) -> String {
        let app = Router::new()
            .route("/video.mp4", get(origin))
            .route("/plain", get(no_ranges))
            .route("/moved", get(|| async { axum::response::Redirect::temporary("/video.mp4") }))
            .with_state(Arc::new(data));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn descriptor(url: String, len: u64) -> ResourceDescriptor {
        ResourceDescriptor {
            url,
            headers: HashMap::new(),
            content_length: len,
            content_type: None,
            supports_ranges: true,
        }
    }

    #[tokio::test]
    async fn probe_follows_redirects_and_reads_headers() {
        let base = spawn_origin(sample_bytes(16)).await;
        let upstream = HttpUpstream::new().unwrap();
        let req = ResourceRequest { url: format!("{base}/moved"), headers: HashMap::new() };

        let probe = upstream.probe(&req, &UpstreamContext::default()).await.unwrap();
        assert_eq!(probe.final_url, format!("{base}/video.mp4"));
        assert_eq!(probe.content_length, Some(16));
        assert_eq!(probe.content_type.as_deref(), Some("video/mp4"));
        assert!(probe.supports_ranges);
    }

    #[tokio::test]
    async fn probe_reports_missing_route_as_client_error() {
        let base = spawn_origin(sample_bytes(16)).await;
        let upstream = HttpUpstream::new().unwrap();
        let req = ResourceRequest { url: format!("{base}/missing"), headers: HashMap::new() };

        let err = upstream.probe(&req, &UpstreamContext::default()).await.unwrap_err();
        assert_eq!(err, FetchError::Status(StatusCode::NOT_FOUND));
        assert_eq!(err.class(), ErrorClass::Fatal);
    }

    #[tokio::test]
    async fn open_range_streams_exact_bytes() {
        let data = sample_bytes(16);
        let base = spawn_origin(data.clone()).await;
        let upstream = HttpUpstream::new().unwrap();
        let res = descriptor(format!("{base}/video.mp4"), 16);

        let body = upstream
            .open_range(&res, &UpstreamContext::default(), ByteRange { begin: 3, end: 9 })
            .await
            .unwrap();
        let chunks: Vec<_> = body.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), &data[3..=9]);
    }

    #[tokio::test]
    async fn open_range_rejects_full_responses() {
        let base = spawn_origin(sample_bytes(16)).await;
        let upstream = HttpUpstream::new().unwrap();
        let res = descriptor(format!("{base}/plain"), 10);

        let err = upstream
            .open_range(&res, &UpstreamContext::default(), ByteRange { begin: 0, end: 1 })
            .await
            .err()
            .unwrap();
        assert_eq!(err, FetchError::NotPartial(StatusCode::OK));
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[test]
    fn rejects_invalid_headers() {
        let mut headers = HashMap::new();
        headers.insert("bad header".to_string(), "x".to_string());
        let err = HttpUpstream::build_headers(&headers, &UpstreamContext::default()).unwrap_err();
        assert!(matches!(err, FetchError::InvalidRequest(_)));
    }
}
