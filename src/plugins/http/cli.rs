use crate::core::model::ForwardPolicy;
use crate::plugins::registry::{CliPlugin, ServeCliConfig};
use clap::{Arg, ArgAction, ArgMatches, Command};

pub struct HttpCliPlugin;

impl HttpCliPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl CliPlugin for HttpCliPlugin {
    fn name(&self) -> &'static str {
        "http"
    }

    fn augment_command(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("http_header")
                .long("header")
                .help_heading("HTTP")
                .help("Extra upstream HTTP header (repeatable), e.g. --header 'Referer: https://example.com/'")
                .action(ArgAction::Append)
                .num_args(1),
        )
        .arg(
            Arg::new("http_user_agent")
                .long("user-agent")
                .help_heading("HTTP")
                .help("User-Agent sent upstream")
                .num_args(1),
        )
        .arg(
            Arg::new("http_timeout_secs")
                .long("timeout-secs")
                .help_heading("HTTP")
                .help("Timeout of one upstream request in seconds")
                .default_value("60")
                .num_args(1),
        )
        .arg(
            Arg::new("http_max_tries")
                .long("max-tries")
                .help_heading("HTTP")
                .help("Retries of a failing upstream request (timeouts are not counted)")
                .default_value("10")
                .num_args(1),
        )
        .arg(
            Arg::new("http_forward_headers")
                .long("forward-headers")
                .help_heading("HTTP")
                .help("Downstream headers passed upstream: none, or allowlist (User-Agent, Cookie, Referer, Accept-Language, Authorization)")
                .value_parser(["none", "allowlist"])
                .default_value("none")
                .num_args(1),
        )
        .arg(
            Arg::new("http_use_original_url")
                .long("use-original-url")
                .short('g')
                .help_heading("HTTP")
                .help("Always use the original URL (no optimization for 3XX response code)")
                .action(ArgAction::SetTrue),
        )
    }

    fn apply_matches(&self, matches: &ArgMatches, cfg: &mut ServeCliConfig) -> anyhow::Result<()> {
        if let Some(ua) = matches.get_one::<String>("http_user_agent") {
            cfg.upstream_ctx.user_agent = ua.clone();
        }
        if let Some(s) = matches.get_one::<String>("http_timeout_secs") {
            cfg.upstream_ctx.timeout_secs = s.parse()?;
            if cfg.upstream_ctx.timeout_secs == 0 {
                anyhow::bail!("--timeout-secs must be at least 1");
            }
        }
        if let Some(s) = matches.get_one::<String>("http_max_tries") {
            cfg.max_tries = s.parse()?;
        }
        if let Some(s) = matches.get_one::<String>("http_forward_headers") {
            cfg.forward = ForwardPolicy::parse(s)
                .ok_or_else(|| anyhow::anyhow!("invalid --forward-headers: {}", s))?;
        }
        cfg.use_original_url = matches.get_flag("http_use_original_url");

        if let Some(values) = matches.get_many::<String>("http_header") {
            for h in values {
                let (k, v) = h
                    .split_once(':')
                    .ok_or_else(|| anyhow::anyhow!("invalid header format: {}", h))?;
                let name = reqwest::header::HeaderName::from_bytes(k.trim().as_bytes())
                    .map_err(|_| anyhow::anyhow!("invalid header name: {}", k.trim()))?;
                reqwest::header::HeaderValue::from_str(v.trim())
                    .map_err(|_| anyhow::anyhow!("invalid value for header {}", name))?;
                cfg.headers.insert(name.as_str().to_string(), v.trim().to_string());
            }
        }

        Ok(())
    }
}
