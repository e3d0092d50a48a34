use async_trait::async_trait;
use bytes::Bytes;
use clap::{ArgMatches, Command};
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

use crate::core::model::{Browser, ByteRange, ForwardPolicy, ProbeResult, ResourceDescriptor, ResourceRequest};
use crate::core::retry::FetchError;

pub type ByteStream = BoxStream<'static, Result<Bytes, FetchError>>;

#[derive(Debug, Clone)]
pub struct UpstreamContext {
    pub user_agent: String,
    pub timeout_secs: u64,
}

impl Default for UpstreamContext {
    fn default() -> Self {
        Self {
            user_agent: concat!("video-funnel/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout_secs: 60,
        }
    }
}

/// Where pieces come from.
#[async_trait]
pub trait Upstream: Send + Sync {
    fn name(&self) -> &'static str;

    /// HEAD the resource, following redirects.
    async fn probe(&self, res: &ResourceRequest, ctx: &UpstreamContext) -> Result<ProbeResult, FetchError>;

    /// Opens a ranged GET. Anything but a 206 is an error.
    async fn open_range(
        &self,
        res: &ResourceDescriptor,
        ctx: &UpstreamContext,
        range: ByteRange,
    ) -> Result<ByteStream, FetchError>;
}

/// Supplies cookies for upstream requests. No browser means no cookies.
#[async_trait]
pub trait CookieSource: Send + Sync {
    async fn cookies_for(&self, browser: Option<Browser>, url: &Url) -> HashMap<String, String>;
}

#[derive(Debug, Clone)]
pub struct ServeCliConfig {
    pub headers: HashMap<String, String>,
    pub upstream_ctx: UpstreamContext,
    pub max_tries: u32,
    pub forward: ForwardPolicy,
    pub use_original_url: bool,
    pub cookies_from: Option<Browser>,
}

impl Default for ServeCliConfig {
    fn default() -> Self {
        Self {
            headers: HashMap::new(),
            upstream_ctx: UpstreamContext::default(),
            max_tries: 10,
            forward: ForwardPolicy::None,
            use_original_url: false,
            cookies_from: None,
        }
    }
}

pub trait CliPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn augment_command(&self, cmd: Command) -> Command;
    fn apply_matches(&self, matches: &ArgMatches, cfg: &mut ServeCliConfig) -> anyhow::Result<()>;
}

pub struct PluginRegistry {
    upstream: Arc<dyn Upstream>,
    cookies: Arc<dyn CookieSource>,
    cli_plugins: Vec<Box<dyn CliPlugin>>,
}

impl PluginRegistry {
    pub fn with_defaults() -> anyhow::Result<Self> {
        let mut reg = Self {
            upstream: Arc::new(crate::plugins::http::driver::HttpUpstream::new()?),
            cookies: Arc::new(crate::plugins::cookies::browser::BrowserCookies::new()),
            cli_plugins: vec![],
        };

        reg.cli_plugins.push(Box::new(crate::plugins::http::cli::HttpCliPlugin::new()));
        reg.cli_plugins.push(Box::new(crate::plugins::cookies::cli::CookiesCliPlugin::new()));
        Ok(reg)
    }

    pub fn augment_command(&self, cmd: Command) -> Command {
        self.cli_plugins
            .iter()
            .fold(cmd, |c, p| p.augment_command(c))
    }

    pub fn apply_matches(&self, matches: &ArgMatches, cfg: &mut ServeCliConfig) -> anyhow::Result<()> {
        for p in &self.cli_plugins {
            p.apply_matches(matches, cfg)
                .map_err(|e| e.context(format!("{} options", p.name())))?;
        }
        Ok(())
    }

    pub fn upstream(&self) -> Arc<dyn Upstream> {
        self.upstream.clone()
    }

    pub fn cookies(&self) -> Arc<dyn CookieSource> {
        self.cookies.clone()
    }
}
