mod core;
mod plugins;
mod server;

#[cfg(test)]
mod testing;

use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::core::events::FunnelEvent;
use crate::core::funnel::FunnelConfig;
use crate::core::retry::RetryPolicy;
use crate::core::units::parse_size;
use crate::plugins::registry::{PluginRegistry, ServeCliConfig};
use crate::server::state::{AppState, Settings};

fn build_cli(registry: &PluginRegistry) -> Command {
    let cmd = Command::new("vf")
        .about("Streaming reverse proxy that fetches each range as many parallel sub-ranges")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("url")
                .long("url")
                .short('u')
                .help("Upstream URL served at /")
                .num_args(1),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .help("Address to listen on")
                .default_value("0.0.0.0")
                .num_args(1),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .help("Port to listen on")
                .default_value("8080")
                .value_parser(clap::value_parser!(u16))
                .num_args(1),
        )
        .arg(
            Arg::new("block_size")
                .long("block-size")
                .short('b')
                .help("Bytes delivered downstream per step (e.g. 4M)")
                .default_value("4M")
                .num_args(1),
        )
        .arg(
            Arg::new("piece_size")
                .long("piece-size")
                .short('p')
                .help("Bytes fetched per upstream request (e.g. 1M)")
                .default_value("1M")
                .num_args(1),
        )
        .arg(
            Arg::new("progress")
                .long("progress")
                .help("Show per-block progress bars")
                .action(ArgAction::SetTrue),
        );

    registry.augment_command(cmd)
}

fn funnel_config(m: &ArgMatches) -> anyhow::Result<FunnelConfig> {
    let size = |id: &str| -> anyhow::Result<u64> {
        let raw = m.get_one::<String>(id).map(String::as_str).unwrap_or_default();
        parse_size(raw).with_context(|| format!("--{}", id.replace('_', "-")))
    };
    let cfg = FunnelConfig { block_size: size("block_size")?, piece_size: size("piece_size")? };
    cfg.validate().map_err(anyhow::Error::msg)?;
    Ok(cfg)
}

fn build_settings(m: &ArgMatches, registry: &PluginRegistry) -> anyhow::Result<Settings> {
    let mut cfg = ServeCliConfig::default();
    registry.apply_matches(m, &mut cfg)?;

    Ok(Settings {
        url: m.get_one::<String>("url").cloned(),
        funnel: funnel_config(m)?,
        retry: RetryPolicy::new(cfg.max_tries),
        upstream_ctx: cfg.upstream_ctx,
        headers: cfg.headers,
        forward: cfg.forward,
        use_original_url: cfg.use_original_url,
        cookies_from: cfg.cookies_from,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let registry = PluginRegistry::with_defaults()?;
    let matches = build_cli(&registry).get_matches();
    let settings = build_settings(&matches, &registry)?;

    let host: IpAddr = matches
        .get_one::<String>("host")
        .map(String::as_str)
        .unwrap_or("0.0.0.0")
        .parse()
        .context("--host")?;
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let addr = SocketAddr::new(host, port);

    let events = matches.get_flag("progress").then(|| {
        let (tx, rx) = broadcast::channel(1024);
        tokio::spawn(progress_ui(rx));
        tx
    });

    info!(
        url = settings.url.as_deref().unwrap_or("-"),
        block_size = settings.funnel.block_size,
        piece_size = settings.funnel.piece_size,
        max_tries = settings.retry.max_tries,
        "starting"
    );
    let upstream = registry.upstream();
    info!(upstream = upstream.name(), "upstream driver ready");

    let state = AppState {
        settings: Arc::new(settings),
        upstream,
        cookies: registry.cookies(),
        events,
    };
    server::run(addr, state).await
}

/// Renders one bar per in-flight block until the channel closes.
async fn progress_ui(mut rx: broadcast::Receiver<FunnelEvent>) {
    let mp = MultiProgress::new();
    let sty_bar = ProgressStyle::with_template(
        "{prefix} {bar:40.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec}) {wide_msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar());

    let mut bars: HashMap<(Uuid, u64), ProgressBar> = HashMap::new();
    let mut fetched: HashMap<Uuid, u64> = HashMap::new();

    loop {
        let evt = match rx.recv().await {
            Ok(e) => e,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                let _ = mp.println(format!("[progress] skipped {n} events"));
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match evt {
            FunnelEvent::BlockStarted { request_id, index, range } => {
                let pb = mp.add(ProgressBar::new(range.size()));
                pb.set_style(sty_bar.clone());
                pb.set_prefix(format!("[{}#{}]", short_id(&request_id), index));
                pb.set_message(range.to_string());
                bars.insert((request_id, index), pb);
            }
            FunnelEvent::PieceProgress { request_id, index, bytes } => {
                *fetched.entry(request_id).or_default() += bytes;
                if let Some(pb) = bars.get(&(request_id, index)) {
                    pb.inc(bytes);
                }
            }
            FunnelEvent::BlockDone { request_id, index } => {
                if let Some(pb) = bars.remove(&(request_id, index)) {
                    pb.finish_and_clear();
                }
            }
            FunnelEvent::Finished { request_id, ok } => {
                bars.retain(|(id, _), pb| {
                    if *id == request_id {
                        pb.abandon();
                        false
                    } else {
                        true
                    }
                });
                let total = fetched.remove(&request_id).unwrap_or(0);
                let status = if ok { "done" } else { "stopped" };
                let _ = mp.println(format!("[{}] {} after {}", short_id(&request_id), status, fmt_bytes(total)));
            }
        }
    }
}

fn short_id(id: &Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

fn fmt_bytes(n: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;
    let f = n as f64;
    if f >= GB {
        format!("{:.2}GiB", f / GB)
    } else if f >= MB {
        format!("{:.2}MiB", f / MB)
    } else if f >= KB {
        format!("{:.2}KiB", f / KB)
    } else {
        format!("{}B", n)
    }
}
