mod args;
mod cmd_apply;
mod cmd_daemon;

use anyhow::Context;
use args::{Cli, Commands};
use clap::Parser;
use guestlink::config::Settings;
use guestlink::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let overrides = cli.overrides();
    let mut settings = Settings::load(&overrides).context("Failed to load configuration")?;

    // A dry run is only useful if its plan is visible.
    if let Commands::Apply { noop: true, .. } = cli.command {
        if !matches!(logging::level_directive(&settings.loglevel), "debug" | "trace") {
            settings.loglevel = "info".to_string();
        }
    }
    logging::init(&settings.loglevel, &settings.loghandler)?;

    match cli.command {
        Commands::Apply {
            force,
            noop,
            actions,
        } => cmd_apply::cmd_apply(&settings, force, noop, actions).await?,
        Commands::Daemon { action, opts } => {
            cmd_daemon::cmd_daemon(action, &cli.global, &opts, overrides, settings).await?
        }
    }

    Ok(())
}
