use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header::{
    HeaderName, ACCEPT_LANGUAGE, ACCEPT_RANGES, AUTHORIZATION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, COOKIE,
    RANGE, REFERER, USER_AGENT,
};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{AppendHeaders, IntoResponse, Response};
use futures::TryStreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

use crate::core::funnel::{Funnel, FunnelConfig, FunnelSource};
use crate::core::model::{Browser, ForwardPolicy, ResourceDescriptor, ResourceRequest};
use crate::core::retry::FetchError;
use crate::core::units::parse_size;
use crate::server::negotiate::{content_range, negotiate, unsatisfied_range, Negotiation};
use crate::server::state::{AppState, Settings};

/// Downstream headers passed upstream under [`ForwardPolicy::Allowlist`].
const FORWARDED: [HeaderName; 5] = [USER_AGENT, COOKIE, REFERER, ACCEPT_LANGUAGE, AUTHORIZATION];

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone)]
pub(crate) struct RequestOptions {
    pub url: String,
    pub funnel: FunnelConfig,
    pub cookies_from: Option<Browser>,
    pub use_original_url: bool,
}

impl RequestOptions {
    fn from_settings(settings: &Settings, url: String) -> Self {
        Self {
            url,
            funnel: settings.funnel,
            cookies_from: settings.cookies_from,
            use_original_url: settings.use_original_url,
        }
    }
}

/// `GET /` streams the URL given on the command line.
pub(crate) async fn root(State(state): State<AppState>, method: Method, headers: HeaderMap) -> Response {
    let Some(url) = state.settings.url.clone() else {
        return no_url();
    };
    let opts = RequestOptions::from_settings(&state.settings, url);
    make_response(&state, &method, &headers, opts).await
}

/// `GET /<url>`: everything after the first slash, query included, is the
/// upstream URL.
pub(crate) async fn embedded(State(state): State<AppState>, method: Method, headers: HeaderMap, uri: Uri) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    let target = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let target = target.strip_prefix('/').unwrap_or(target);
    if !(target.starts_with("http://") || target.starts_with("https://")) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let opts = RequestOptions::from_settings(&state.settings, target.to_string());
    make_response(&state, &method, &headers, opts).await
}

/// `GET /api?url=..&block_size=..&piece_size=..&cookies_from=..&use_original_url=..`
pub(crate) async fn api(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    match api_options(&state.settings, &query) {
        Ok(opts) => make_response(&state, &method, &headers, opts).await,
        Err(resp) => resp,
    }
}

fn api_options(settings: &Settings, query: &HashMap<String, String>) -> Result<RequestOptions, Response> {
    let url = query
        .get("url")
        .filter(|u| !u.is_empty())
        .cloned()
        .or_else(|| settings.url.clone())
        .ok_or_else(no_url)?;
    let mut opts = RequestOptions::from_settings(settings, url);

    if let Some(v) = query.get("block_size") {
        opts.funnel.block_size = parse_size(v).map_err(|e| bad_request(format!("block_size: {e}")))?;
    }
    if let Some(v) = query.get("piece_size") {
        opts.funnel.piece_size = parse_size(v).map_err(|e| bad_request(format!("piece_size: {e}")))?;
    }
    opts.funnel.validate().map_err(bad_request)?;

    if let Some(v) = query.get("cookies_from") {
        opts.cookies_from = if v.is_empty() {
            None
        } else {
            Some(Browser::parse(v).ok_or_else(|| bad_request(format!("unsupported browser: {v}")))?)
        };
    }
    if let Some(v) = query.get("use_original_url") {
        opts.use_original_url =
            parse_flag(v).ok_or_else(|| bad_request(format!("use_original_url: not a boolean: {v}")))?;
    }
    Ok(opts)
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "" | "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn no_url() -> Response {
    (StatusCode::UNPROCESSABLE_ENTITY, "No URL").into_response()
}

fn bad_request(msg: String) -> Response {
    (StatusCode::BAD_REQUEST, msg).into_response()
}

pub(crate) async fn make_response(
    state: &AppState,
    method: &Method,
    headers: &HeaderMap,
    opts: RequestOptions,
) -> Response {
    let request_id = Uuid::new_v4();
    let span = info_span!("request", id = %request_id, method = %method);
    respond(state, method, headers, opts, request_id).instrument(span).await
}

async fn respond(
    state: &AppState,
    method: &Method,
    headers: &HeaderMap,
    opts: RequestOptions,
    request_id: Uuid,
) -> Response {
    let range_header = headers.get(RANGE).map(|v| v.to_str().unwrap_or_default());
    info!(url = %opts.url, range = ?range_header, "incoming request");

    let resource = match resolve(state, headers, &opts).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let length = resource.content_length;

    let (status, range) = match negotiate(range_header, length) {
        Negotiation::Unsatisfiable => {
            info!(length, "range not satisfiable");
            return (
                StatusCode::RANGE_NOT_SATISFIABLE,
                [(CONTENT_RANGE, unsatisfied_range(length))],
            )
                .into_response();
        }
        Negotiation::Full(range) => (StatusCode::OK, range),
        Negotiation::Partial(range) => (StatusCode::PARTIAL_CONTENT, Some(range)),
    };

    let mut out = vec![
        (CONTENT_LENGTH, range.map_or(0, |r| r.size()).to_string()),
        (
            CONTENT_TYPE,
            resource.content_type.clone().unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
        ),
        (ACCEPT_RANGES, "bytes".to_string()),
    ];
    if let (StatusCode::PARTIAL_CONTENT, Some(r)) = (status, range) {
        out.push((CONTENT_RANGE, content_range(r, length)));
    }

    let body = match range {
        Some(range) if *method != Method::HEAD => {
            let source = FunnelSource {
                request_id,
                upstream: state.upstream.clone(),
                ctx: state.settings.upstream_ctx.clone(),
                resource: Arc::new(resource),
                retry: state.settings.retry,
                events: state.events.clone(),
            };
            info!(status = %status, range = %range, "streaming");
            let stream = Funnel::open(source, range, opts.funnel)
                .into_stream()
                .inspect_err(|e| error!(error = %e, "upstream failed after the response started, aborting"));
            Body::from_stream(stream)
        }
        _ => Body::empty(),
    };

    (status, AppendHeaders(out), body).into_response()
}

/// Probes upstream and settles which URL and headers the pieces will use.
async fn resolve(state: &AppState, headers: &HeaderMap, opts: &RequestOptions) -> Result<ResourceDescriptor, Response> {
    let url = Url::parse(&opts.url).map_err(|e| bad_request(format!("invalid url {}: {e}", opts.url)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(bad_request(format!("unsupported url scheme: {}", url.scheme())));
    }

    let mut upstream_headers = state.settings.headers.clone();
    if state.settings.forward == ForwardPolicy::Allowlist {
        for name in FORWARDED.iter() {
            if let Some(v) = headers.get(name).and_then(|v| v.to_str().ok()) {
                upstream_headers.insert(name.as_str().to_string(), v.to_string());
            }
        }
    }
    let base_cookie = upstream_headers.get(COOKIE.as_str()).cloned();
    let jar = state.cookies.cookies_for(opts.cookies_from, &url).await;
    apply_cookies(&mut upstream_headers, base_cookie.as_deref(), jar);

    let request = ResourceRequest { url: opts.url.clone(), headers: upstream_headers };
    let ctx = &state.settings.upstream_ctx;
    let probe = match state.settings.retry.run("probe", || state.upstream.probe(&request, ctx)).await {
        Ok(p) => p,
        Err(FetchError::Status(s)) => {
            warn!(status = %s, "upstream rejected the probe");
            return Err((s, format!("upstream returned {s}")).into_response());
        }
        Err(e) => {
            error!(error = %e, "upstream probe failed");
            return Err((StatusCode::BAD_GATEWAY, e.to_string()).into_response());
        }
    };

    if !probe.supports_ranges {
        let msg = FetchError::RangeNotSupported.to_string();
        warn!("{}", msg);
        return Err((StatusCode::NOT_IMPLEMENTED, msg).into_response());
    }
    let Some(content_length) = probe.content_length else {
        let msg = FetchError::MissingLength.to_string();
        warn!("{}", msg);
        return Err((StatusCode::BAD_GATEWAY, msg).into_response());
    };

    let mut resource = ResourceDescriptor {
        url: request.url,
        headers: request.headers,
        content_length,
        content_type: probe.content_type,
        supports_ranges: probe.supports_ranges,
    };

    if !opts.use_original_url && probe.final_url != resource.url {
        info!(final_url = %probe.final_url, "using redirected url");
        if let Ok(final_url) = Url::parse(&probe.final_url) {
            if opts.cookies_from.is_some() && final_url.host_str() != url.host_str() {
                let jar = state.cookies.cookies_for(opts.cookies_from, &final_url).await;
                apply_cookies(&mut resource.headers, base_cookie.as_deref(), jar);
            }
        }
        resource.url = probe.final_url;
    }
    Ok(resource)
}

/// Sets the upstream `cookie` header to `base` plus the browser jar.
fn apply_cookies(headers: &mut HashMap<String, String>, base: Option<&str>, jar: HashMap<String, String>) {
    let mut pairs: Vec<_> = jar.into_iter().collect();
    pairs.sort();
    let jar = pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("; ");

    let value = match (base, jar.is_empty()) {
        (None, true) => {
            headers.remove(COOKIE.as_str());
            return;
        }
        (None, false) => jar,
        (Some(b), true) => b.to_string(),
        (Some(b), false) => format!("{b}; {jar}"),
    };
    headers.insert(COOKIE.as_str().to_string(), value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags() {
        assert_eq!(parse_flag("true"), Some(true));
        assert_eq!(parse_flag(""), Some(true));
        assert_eq!(parse_flag("Off"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn api_overrides_defaults() {
        let settings = Settings { url: Some("http://a.test/v".to_string()), ..Settings::default() };
        let mut query = HashMap::new();
        query.insert("block_size".to_string(), "8K".to_string());
        query.insert("piece_size".to_string(), "2k".to_string());
        query.insert("cookies_from".to_string(), "firefox".to_string());
        query.insert("use_original_url".to_string(), "1".to_string());

        let opts = api_options(&settings, &query).unwrap();
        assert_eq!(opts.url, "http://a.test/v");
        assert_eq!(opts.funnel, FunnelConfig { block_size: 8192, piece_size: 2048 });
        assert_eq!(opts.cookies_from, Some(Browser::Firefox));
        assert!(opts.use_original_url);
    }

    #[test]
    fn api_rejects_bad_values() {
        let settings = Settings::default();
        let mut query = HashMap::new();
        assert_eq!(
            api_options(&settings, &query).unwrap_err().status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );

        query.insert("url".to_string(), "http://a.test/v".to_string());
        query.insert("block_size".to_string(), "lots".to_string());
        assert_eq!(api_options(&settings, &query).unwrap_err().status(), StatusCode::BAD_REQUEST);

        query.insert("block_size".to_string(), "2G".to_string());
        assert_eq!(api_options(&settings, &query).unwrap_err().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn merges_cookies() {
        let mut headers = HashMap::new();
        let mut jar = HashMap::new();
        jar.insert("b".to_string(), "2".to_string());
        jar.insert("a".to_string(), "1".to_string());

        apply_cookies(&mut headers, Some("x=9"), jar.clone());
        assert_eq!(headers.get("cookie").map(String::as_str), Some("x=9; a=1; b=2"));

        apply_cookies(&mut headers, None, jar);
        assert_eq!(headers.get("cookie").map(String::as_str), Some("a=1; b=2"));

        apply_cookies(&mut headers, None, HashMap::new());
        assert!(!headers.contains_key("cookie"));
    }
}
