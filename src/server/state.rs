use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::core::events::FunnelEvent;
use crate::core::funnel::FunnelConfig;
use crate::core::model::{Browser, ForwardPolicy};
use crate::core::retry::RetryPolicy;
use crate::plugins::registry::{CookieSource, Upstream, UpstreamContext};

/// Defaults for every request; `/api` may override some per request.
#[derive(Debug, Clone)]
pub struct Settings {
    pub url: Option<String>,
    pub funnel: FunnelConfig,
    pub retry: RetryPolicy,
    pub upstream_ctx: UpstreamContext,
    /// Extra upstream headers, lower-case names.
    pub headers: HashMap<String, String>,
    pub forward: ForwardPolicy,
    pub use_original_url: bool,
    pub cookies_from: Option<Browser>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            url: None,
            funnel: FunnelConfig::default(),
            retry: RetryPolicy::default(),
            upstream_ctx: UpstreamContext::default(),
            headers: HashMap::new(),
            forward: ForwardPolicy::None,
            use_original_url: false,
            cookies_from: None,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub upstream: Arc<dyn Upstream>,
    pub cookies: Arc<dyn CookieSource>,
    pub events: Option<broadcast::Sender<FunnelEvent>>,
}
