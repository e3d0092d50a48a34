use crate::core::model::Browser;
use crate::plugins::registry::{CliPlugin, ServeCliConfig};
use clap::{Arg, ArgMatches, Command};

pub struct CookiesCliPlugin;

impl CookiesCliPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl CliPlugin for CookiesCliPlugin {
    fn name(&self) -> &'static str {
        "cookies"
    }

    fn augment_command(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("cookies_from")
                .long("cookies-from")
                .short('c')
                .help_heading("Cookies")
                .help("Load upstream cookies from a local browser profile")
                .value_parser(["chrome", "chromium", "firefox"])
                .num_args(1),
        )
    }

    fn apply_matches(&self, matches: &ArgMatches, cfg: &mut ServeCliConfig) -> anyhow::Result<()> {
        if let Some(v) = matches.get_one::<String>("cookies_from") {
            cfg.cookies_from = Some(
                Browser::parse(v).ok_or_else(|| anyhow::anyhow!("unsupported browser: {}", v))?,
            );
        }
        Ok(())
    }
}
