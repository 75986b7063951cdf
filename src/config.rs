//! Command line and config file handling.
//!
//! Precedence: command line (or `LANSHARE_*` environment), then the TOML
//! file named by `--config`, then built-in defaults.

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::relay::{RelayConfig, DEFAULT_HISTORY, DEFAULT_REQUEST_TIMEOUT, DEFAULT_STALL_TIMEOUT};
use crate::server::{ServerConfig, DEFAULT_MESSAGE_LIMIT};

pub const DEFAULT_ADDR: &str = "[::]";
pub const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, Default, Parser)]
#[command(name = "lanshare", version, about = "Share text, images and files across your LAN")]
pub struct Cli {
    /// Chat history count, mind the memory usage [default: 999]
    #[arg(long, env = "LANSHARE_HISTORY")]
    pub history: Option<usize>,

    /// Byte size limit per message; send large files as files [default: 16 MiB]
    #[arg(long, env = "LANSHARE_LIMIT")]
    pub limit: Option<usize>,

    /// Listen on address [default: [::]]
    #[arg(long, env = "LANSHARE_ADDR")]
    pub addr: Option<String>,

    /// Listen on port [default: 8080]
    #[arg(long, short, env = "LANSHARE_PORT")]
    pub port: Option<u16>,

    /// Seconds a download waits for its owner to start uploading [default: 5]
    #[arg(long, env = "LANSHARE_REQUEST_TIMEOUT", value_name = "SECS")]
    pub request_timeout: Option<u64>,

    /// Seconds a slow downloader may hold up an upload [default: 10]
    #[arg(long, env = "LANSHARE_STALL_TIMEOUT", value_name = "SECS")]
    pub stall_timeout: Option<u64>,

    /// TOML file supplying any of the settings above
    #[arg(long, short, env = "LANSHARE_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,
}

/// Contents of a `--config` file. Keys match the long flag names.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileConfig {
    pub history: Option<usize>,
    pub limit: Option<usize>,
    pub addr: Option<String>,
    pub port: Option<u16>,
    pub request_timeout: Option<u64>,
    pub stall_timeout: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("invalid config file {}", path.display()))
    }
}

/// Fully resolved runtime settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub relay: RelayConfig,
    pub server: ServerConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            relay: RelayConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Settings {
    /// Resolve from the command line, reading its config file if one is named.
    pub fn load(cli: &Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(cli, &file)
    }

    pub fn resolve(cli: &Cli, file: &FileConfig) -> Result<Self> {
        let limit = cli.limit.or(file.limit).unwrap_or(DEFAULT_MESSAGE_LIMIT);
        if limit == 0 {
            bail!("--limit must be greater than zero");
        }

        let seconds = |flag: Option<u64>, stored: Option<u64>, default: Duration| {
            flag.or(stored).map_or(default, Duration::from_secs)
        };
        let request_timeout = seconds(cli.request_timeout, file.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        if request_timeout.is_zero() {
            bail!("--request-timeout must be at least one second");
        }

        let addr = cli
            .addr
            .as_deref()
            .or(file.addr.as_deref())
            .unwrap_or(DEFAULT_ADDR);
        let port = cli.port.or(file.port).unwrap_or(DEFAULT_PORT);

        Ok(Self {
            relay: RelayConfig {
                max_history: cli.history.or(file.history).unwrap_or(DEFAULT_HISTORY),
                request_timeout,
                stall_timeout: seconds(cli.stall_timeout, file.stall_timeout, DEFAULT_STALL_TIMEOUT),
            },
            server: ServerConfig {
                bind: bind_address(addr, port),
                max_message_size: limit,
            },
        })
    }
}

/// Join host and port, bracketing bare IPv6 literals.
pub fn bind_address(addr: &str, port: u16) -> String {
    if addr.contains(':') && !addr.starts_with('[') {
        format!("[{addr}]:{port}")
    } else {
        format!("{addr}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let settings = Settings::resolve(&Cli::default(), &FileConfig::default()).unwrap();

        assert_eq!(settings.relay.max_history, 999);
        assert_eq!(settings.relay.request_timeout, Duration::from_secs(5));
        assert_eq!(settings.relay.stall_timeout, Duration::from_secs(10));
        assert_eq!(settings.server.bind, "[::]:8080");
        assert_eq!(settings.server.max_message_size, 16 * 1024 * 1024);
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from([
            "lanshare",
            "--history",
            "0",
            "--limit",
            "1024",
            "--addr",
            "127.0.0.1",
            "-p",
            "9000",
        ])
        .unwrap();
        let settings = Settings::resolve(&cli, &FileConfig::default()).unwrap();

        assert_eq!(settings.relay.max_history, 0);
        assert_eq!(settings.server.bind, "127.0.0.1:9000");
        assert_eq!(settings.server.max_message_size, 1024);
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "history = 10\nport = 7000\nrequest-timeout = 30").unwrap();

        let cli = Cli {
            port: Some(7001),
            config: Some(file.path().to_path_buf()),
            ..Cli::default()
        };
        let settings = Settings::load(&cli).unwrap();

        assert_eq!(settings.relay.max_history, 10);
        assert_eq!(settings.relay.request_timeout, Duration::from_secs(30));
        assert_eq!(settings.server.bind, "[::]:7001");
    }

    #[test]
    fn test_file_rejects_unknown_keys() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "histroy = 10").unwrap();

        assert!(FileConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_zero_limit_rejected() {
        let cli = Cli {
            limit: Some(0),
            ..Cli::default()
        };
        assert!(Settings::resolve(&cli, &FileConfig::default()).is_err());
    }

    #[test]
    fn test_bind_address() {
        assert_eq!(bind_address("::", 80), "[::]:80");
        assert_eq!(bind_address("[::1]", 80), "[::1]:80");
        assert_eq!(bind_address("0.0.0.0", 80), "0.0.0.0:80");
        assert_eq!(bind_address("localhost", 80), "localhost:80");
    }
}
