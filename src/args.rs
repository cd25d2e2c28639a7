use clap::{Args, Parser, Subcommand, ValueEnum};
use guestlink::config::{Overrides, TransportKind};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "guestlink")]
#[command(version)]
#[command(about = "Guest agent applying hypervisor-provided configuration", long_about = None)]
pub(crate) struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Clone, Default)]
pub(crate) struct GlobalOpts {
    /// Log level (debug, info, warning, error, critical)
    #[arg(short, long, global = true)]
    pub loglevel: Option<String>,

    /// Configuration file (default: /etc/guestlink.toml, or GUESTLINK_CONFIG)
    #[arg(short, long, global = true)]
    pub configuration: Option<PathBuf>,

    /// Staging cache directory
    #[arg(long, global = true)]
    pub cache: Option<PathBuf>,

    /// Log destination: "-" or "stderr", "syslog", or a file path
    #[arg(long, global = true)]
    pub loghandler: Option<String>,

    /// Comma separated capabilities the agent may apply
    #[arg(short, long, global = true)]
    pub functions: Option<String>,

    /// Keep a .bak copy of every replaced file
    #[arg(short, long, global = true)]
    pub backup: bool,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Write staged configuration to the filesystem
    Apply {
        /// Apply actions even when they are outside --functions
        #[arg(long)]
        force: bool,

        /// Show what would be written without writing it
        #[arg(short, long)]
        noop: bool,

        /// Capabilities to apply (default: every allowed capability)
        actions: Vec<String>,
    },

    /// Control the background agent
    Daemon {
        #[arg(value_enum)]
        action: DaemonAction,

        #[command(flatten)]
        opts: DaemonOpts,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DaemonAction {
    /// Start the daemon in the background
    Start,
    /// Stop a running daemon
    Stop,
    /// Stop, then start again
    Restart,
    /// Ask a running daemon to re-read its configuration
    Reload,
    /// Report whether the daemon is running
    Status,
    /// Run the daemon in the foreground
    Run,
}

#[derive(Args, Clone, Default)]
pub(crate) struct DaemonOpts {
    /// Pidfile holding the daemon lock
    #[arg(short, long)]
    pub pidfile: Option<PathBuf>,

    /// Control channel: auto, bus or socket
    #[arg(short, long)]
    pub transport: Option<TransportKind>,

    /// Path of the local control socket
    #[arg(short, long)]
    pub socket: Option<PathBuf>,
}

impl Cli {
    pub fn overrides(&self) -> Overrides {
        let mut overrides = Overrides {
            configuration: self.global.configuration.clone(),
            cache: self.global.cache.clone(),
            functions: self.global.functions.clone(),
            backup: self.global.backup,
            loglevel: self.global.loglevel.clone(),
            loghandler: self.global.loghandler.clone(),
            ..Default::default()
        };
        if let Commands::Daemon { opts, .. } = &self.command {
            overrides.pidfile = opts.pidfile.clone();
            overrides.transport = opts.transport;
            overrides.socket = opts.socket.clone();
        }
        overrides
    }
}

/// Arguments that make a detached child see the same options as this process.
pub(crate) fn forwarded_args(global: &GlobalOpts, opts: &DaemonOpts) -> Vec<String> {
    let mut args = Vec::new();
    let mut push = |flag: &str, value: Option<String>| {
        if let Some(value) = value {
            args.push(flag.to_string());
            args.push(value);
        }
    };
    push("--loglevel", global.loglevel.clone());
    push(
        "--configuration",
        global.configuration.as_ref().map(|p| p.display().to_string()),
    );
    push("--cache", global.cache.as_ref().map(|p| p.display().to_string()));
    push("--loghandler", global.loghandler.clone());
    push("--functions", global.functions.clone());
    push("--pidfile", opts.pidfile.as_ref().map(|p| p.display().to_string()));
    push("--transport", opts.transport.map(|t| t.to_string()));
    push("--socket", opts.socket.as_ref().map(|p| p.display().to_string()));
    if global.backup {
        args.push("--backup".to_string());
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_apply() {
        let cli = Cli::try_parse_from([
            "guestlink",
            "--functions",
            "network,hosts",
            "apply",
            "--noop",
            "network",
        ])
        .unwrap();
        match &cli.command {
            Commands::Apply {
                force,
                noop,
                actions,
            } => {
                assert!(!force);
                assert!(noop);
                assert_eq!(actions, &vec!["network".to_string()]);
            }
            _ => panic!("expected apply"),
        }
        assert_eq!(cli.overrides().functions.as_deref(), Some("network,hosts"));
    }

    #[test]
    fn test_parse_daemon_options() {
        let cli = Cli::try_parse_from([
            "guestlink",
            "daemon",
            "run",
            "--transport",
            "socket",
            "--pidfile",
            "/tmp/g.pid",
            "--backup",
        ])
        .unwrap();
        let overrides = cli.overrides();
        assert_eq!(overrides.transport, Some(TransportKind::Socket));
        assert_eq!(overrides.pidfile, Some(PathBuf::from("/tmp/g.pid")));
        assert!(overrides.backup);

        let Commands::Daemon { action, opts } = &cli.command else {
            panic!("expected daemon");
        };
        assert_eq!(*action, DaemonAction::Run);
        let args = forwarded_args(&cli.global, opts);
        assert!(args.windows(2).any(|w| w[0] == "--transport" && w[1] == "socket"));
        assert!(args.contains(&"--backup".to_string()));
    }
}
