use crate::clienv;
use crate::error::{AgentError, Result};
use crate::record::{default_functions, parse_functions, CapabilitySet};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/guestlink.toml";
pub const DEFAULT_CACHE_DIR: &str = "/var/cache/guestlink";
pub const DEFAULT_PIDFILE: &str = "/var/run/guestlink.pid";
pub const SOCKET_NAME: &str = "guestlink.sock";
pub const XEN_CAPABILITIES: &str = "/proc/xen/capabilities";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Auto,
    Bus,
    Socket,
}

impl TransportKind {
    /// Settle `auto` by probing for the hypervisor bus.
    pub fn resolve(self, capabilities: &Path) -> TransportKind {
        match self {
            TransportKind::Auto if fs::read(capabilities).is_ok() => TransportKind::Bus,
            TransportKind::Auto => TransportKind::Socket,
            other => other,
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(TransportKind::Auto),
            "bus" | "xen" => Ok(TransportKind::Bus),
            "socket" => Ok(TransportKind::Socket),
            other => Err(format!("unknown transport '{}' (expected auto, bus or socket)", other)),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Auto => "auto",
            TransportKind::Bus => "bus",
            TransportKind::Socket => "socket",
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub main: MainSection,
    pub daemon: DaemonSection,
    pub bus: BusSection,
    pub update: UpdateSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MainSection {
    pub cache: Option<PathBuf>,
    /// Comma separated allow-list
    pub functions: Option<String>,
    pub backup: Option<bool>,
    pub loglevel: Option<String>,
    pub loghandler: Option<String>,
    pub handler_dirs: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    pub pidfile: Option<PathBuf>,
    pub transport: Option<TransportKind>,
    pub socket: Option<PathBuf>,
    pub sysfs_net: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BusSection {
    pub receive_prefix: String,
    pub send_prefix: String,
    pub data_prefix: String,
    pub password_retry_ms: u64,
    pub password_retries: u32,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            receive_prefix: "data/host".into(),
            send_prefix: "data/guest".into(),
            data_prefix: "vm-data".into(),
            password_retry_ms: 100,
            password_retries: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpdateSection {
    /// Program followed by its arguments
    pub command: Vec<String>,
}

impl Default for UpdateSection {
    fn default() -> Self {
        Self {
            command: vec![
                "emerge".into(),
                "--oneshot".into(),
                "app-emulation/guestlink".into(),
            ],
        }
    }
}

impl ConfigFile {
    /// A missing file is not an error; it yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading configuration file");

        if !path.exists() {
            tracing::debug!(path = %path.display(), "Configuration file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Ok(toml::from_str(&content)?)
    }
}

/// Values supplied on the command line; each one beats the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub configuration: Option<PathBuf>,
    pub cache: Option<PathBuf>,
    pub functions: Option<String>,
    pub backup: bool,
    pub loglevel: Option<String>,
    pub loghandler: Option<String>,
    pub pidfile: Option<PathBuf>,
    pub transport: Option<TransportKind>,
    pub socket: Option<PathBuf>,
}

/// Fully resolved configuration. Built once, swapped whole on reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub configuration: PathBuf,
    pub cache: PathBuf,
    pub functions: CapabilitySet,
    pub backup: bool,
    pub loglevel: String,
    pub loghandler: String,
    pub handler_dirs: Vec<PathBuf>,
    pub pidfile: PathBuf,
    pub transport: TransportKind,
    pub socket: PathBuf,
    pub sysfs_net: PathBuf,
    pub bus: BusSection,
    pub update_command: Vec<String>,
}

impl Settings {
    /// Read the configuration file named by the overrides (or the default
    /// location) and fold the overrides on top.
    pub fn load(overrides: &Overrides) -> Result<Self> {
        let configuration = overrides
            .configuration
            .clone()
            .or_else(clienv::config_path)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        let file = ConfigFile::load(&configuration)?;
        Ok(Self::resolve(configuration, file, overrides))
    }

    pub fn resolve(configuration: PathBuf, file: ConfigFile, overrides: &Overrides) -> Self {
        let cache = overrides
            .cache
            .clone()
            .or_else(clienv::cache_dir)
            .or(file.main.cache)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR));

        let functions = overrides
            .functions
            .as_deref()
            .or(file.main.functions.as_deref())
            .map(parse_functions)
            .unwrap_or_else(default_functions);

        let socket = overrides
            .socket
            .clone()
            .or(file.daemon.socket)
            .unwrap_or_else(|| cache.join(SOCKET_NAME));

        Self {
            configuration,
            functions,
            backup: overrides.backup || file.main.backup.unwrap_or(false),
            loglevel: overrides
                .loglevel
                .clone()
                .or(file.main.loglevel)
                .unwrap_or_else(|| "info".into()),
            loghandler: overrides
                .loghandler
                .clone()
                .or(file.main.loghandler)
                .unwrap_or_else(|| "syslog".into()),
            handler_dirs: file.main.handler_dirs,
            pidfile: overrides
                .pidfile
                .clone()
                .or_else(clienv::pidfile_path)
                .or(file.daemon.pidfile)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PIDFILE)),
            transport: overrides
                .transport
                .or(file.daemon.transport)
                .unwrap_or_default(),
            socket,
            sysfs_net: file
                .daemon
                .sysfs_net
                .unwrap_or_else(|| PathBuf::from(crate::translator::SYS_CLASS_NET)),
            bus: file.bus,
            update_command: file.update.command,
            cache,
        }
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.resolve(Path::new(XEN_CAPABILITIES))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let settings = Settings::resolve(
            PathBuf::from("/nonexistent"),
            ConfigFile::default(),
            &Overrides {
                cache: Some(PathBuf::from("/tmp/gl-cache")),
                pidfile: Some(PathBuf::from("/tmp/gl.pid")),
                ..Default::default()
            },
        );
        assert_eq!(settings.functions, default_functions());
        assert_eq!(settings.socket, PathBuf::from("/tmp/gl-cache/guestlink.sock"));
        assert_eq!(settings.transport, TransportKind::Auto);
        assert_eq!(settings.bus.receive_prefix, "data/host");
        assert_eq!(settings.bus.password_retries, 300);
        assert!(!settings.backup);
    }

    #[test]
    fn test_file_values_and_cli_precedence() {
        let file: ConfigFile = toml::from_str(
            r#"
            [main]
            functions = "network,hosts"
            backup = true
            loglevel = "debug"
            handler_dirs = ["/opt/handlers"]

            [daemon]
            transport = "socket"
            socket = "/run/gl.sock"

            [bus]
            password_retry_ms = 5

            [update]
            command = ["true"]
            "#,
        )
        .unwrap();

        let settings = Settings::resolve(
            PathBuf::from("/etc/guestlink.toml"),
            file,
            &Overrides {
                cache: Some(PathBuf::from("/tmp/c")),
                pidfile: Some(PathBuf::from("/tmp/p")),
                loglevel: Some("error".into()),
                ..Default::default()
            },
        );

        assert_eq!(settings.functions, parse_functions("network,hosts"));
        assert!(settings.backup);
        assert_eq!(settings.loglevel, "error");
        assert_eq!(settings.transport, TransportKind::Socket);
        assert_eq!(settings.socket, PathBuf::from("/run/gl.sock"));
        assert_eq!(settings.handler_dirs, vec![PathBuf::from("/opt/handlers")]);
        assert_eq!(settings.bus.password_retry_ms, 5);
        assert_eq!(settings.bus.send_prefix, "data/guest");
        assert_eq!(settings.update_command, vec!["true".to_string()]);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guestlink.toml");
        fs::write(&path, "[main\ncache = ").unwrap();
        assert!(matches!(
            ConfigFile::load(&path),
            Err(AgentError::ConfigParse(_))
        ));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let file = ConfigFile::load(Path::new("/nonexistent/guestlink.toml")).unwrap();
        assert!(file.main.cache.is_none());
        assert_eq!(file.bus, BusSection::default());
    }

    #[test]
    fn test_transport_auto_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let caps = dir.path().join("capabilities");
        assert_eq!(TransportKind::Auto.resolve(&caps), TransportKind::Socket);
        fs::write(&caps, "control_d\n").unwrap();
        assert_eq!(TransportKind::Auto.resolve(&caps), TransportKind::Bus);
        assert_eq!(TransportKind::Socket.resolve(&caps), TransportKind::Socket);
        assert_eq!("xen".parse::<TransportKind>().unwrap(), TransportKind::Bus);
    }
}
