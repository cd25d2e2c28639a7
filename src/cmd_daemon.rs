use crate::args::{forwarded_args, DaemonAction, DaemonOpts, GlobalOpts};
use anyhow::{bail, Context, Result};
use guestlink::config::{Overrides, Settings};
use guestlink::daemon::control::{self, DaemonStatus};
use guestlink::daemon::DaemonServer;
use std::time::Duration;
use tracing::warn;

const START_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn cmd_daemon(
    action: DaemonAction,
    global: &GlobalOpts,
    opts: &DaemonOpts,
    overrides: Overrides,
    settings: Settings,
) -> Result<()> {
    match action {
        DaemonAction::Run => cmd_daemon_run(overrides, settings).await,
        DaemonAction::Start => cmd_daemon_start(global, opts, &settings).await,
        DaemonAction::Stop => cmd_daemon_stop(&settings).await,
        DaemonAction::Restart => {
            cmd_daemon_stop(&settings).await?;
            cmd_daemon_start(global, opts, &settings).await
        }
        DaemonAction::Reload => cmd_daemon_reload(&settings),
        DaemonAction::Status => cmd_daemon_status(&settings),
    }
}

async fn cmd_daemon_run(overrides: Overrides, settings: Settings) -> Result<()> {
    let pidfile = settings.pidfile.clone();
    DaemonServer::new(overrides, settings)
        .run()
        .await
        .with_context(|| format!("Daemon failed (pidfile {})", pidfile.display()))
}

async fn cmd_daemon_start(global: &GlobalOpts, opts: &DaemonOpts, settings: &Settings) -> Result<()> {
    if let DaemonStatus::Running(pid) = control::status(&settings.pidfile) {
        println!("Daemon already running (PID {})", pid);
        return Ok(());
    }

    let mut args = vec!["daemon".to_string(), "run".to_string()];
    args.extend(forwarded_args(global, opts));
    control::spawn_detached(&args).context("Failed to spawn daemon")?;

    match control::wait_for_pidfile(&settings.pidfile, START_TIMEOUT).await {
        Some(pid) => {
            println!("Daemon started (PID {})", pid);
            Ok(())
        }
        None => bail!(
            "Daemon did not write {} within {}s",
            settings.pidfile.display(),
            START_TIMEOUT.as_secs()
        ),
    }
}

async fn cmd_daemon_stop(settings: &Settings) -> Result<()> {
    let Some(pid) = control::signal_daemon(&settings.pidfile, libc::SIGTERM)
        .context("Failed to signal daemon")?
    else {
        warn!(pidfile = %settings.pidfile.display(), "Daemon is not running");
        return Ok(());
    };

    println!("Stopping daemon (PID {})...", pid);
    if control::wait_for_exit(pid, STOP_TIMEOUT).await {
        println!("Daemon stopped");
        Ok(())
    } else {
        bail!("Daemon (PID {}) still running after {}s", pid, STOP_TIMEOUT.as_secs())
    }
}

fn cmd_daemon_reload(settings: &Settings) -> Result<()> {
    match control::signal_daemon(&settings.pidfile, libc::SIGHUP).context("Failed to signal daemon")? {
        Some(pid) => println!("Reload requested (PID {})", pid),
        None => warn!(pidfile = %settings.pidfile.display(), "Daemon is not running"),
    }
    Ok(())
}

fn cmd_daemon_status(settings: &Settings) -> Result<()> {
    match control::status(&settings.pidfile) {
        DaemonStatus::Running(pid) => {
            println!("running (PID {})", pid);
            println!("  Pidfile: {}", settings.pidfile.display());
            println!("  Transport: {}", settings.transport_kind());
        }
        DaemonStatus::Stale(pid) => {
            warn!(pid, "Pidfile names a process that is gone");
            println!("stopped (stale pidfile {})", settings.pidfile.display());
        }
        DaemonStatus::Stopped => {
            warn!(pidfile = %settings.pidfile.display(), "Daemon is not running");
            println!("stopped");
        }
    }
    Ok(())
}
