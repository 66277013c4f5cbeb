//! Downloader configuration.
//!
//! Stored as TOML:
//! - Linux: `~/.config/xdcc-get/config.toml`
//! - Windows: `%APPDATA%/xdcc-get/config.toml`

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use xdcc_engine::{Destination, EngineConfig};

/// Downloader configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// IRC server host.
    #[serde(default = "default_host")]
    pub host: String,

    /// IRC server port.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_nick")]
    pub nick: String,

    /// Append a random number to the nick.
    #[serde(default = "default_true")]
    pub randomize_nick: bool,

    /// Channels to join before requesting packets (with or without `#`).
    #[serde(default)]
    pub channels: Vec<String>,

    /// Download directory; empty streams the file to stdout.
    #[serde(default = "default_download_dir")]
    pub download_dir: String,

    #[serde(default = "default_passive_ports")]
    pub passive_ports: Vec<u16>,

    /// Address advertised for passive transfers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ip: Option<Ipv4Addr>,

    /// Only accept offers from the bot that was asked.
    #[serde(default = "default_true")]
    pub bot_name_match: bool,

    #[serde(default)]
    pub retries: u32,

    /// Seconds to wait in channels before the first request.
    #[serde(default)]
    pub join_wait_secs: u64,
}

fn default_host() -> String {
    "irc.rizon.net".into()
}

fn default_port() -> u16 {
    6667
}

fn default_nick() -> String {
    "xdccget".into()
}

fn default_true() -> bool {
    true
}

fn default_download_dir() -> String {
    "~/Downloads".into()
}

fn default_passive_ports() -> Vec<u16> {
    vec![5001]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            nick: default_nick(),
            randomize_nick: true,
            channels: Vec::new(),
            download_dir: default_download_dir(),
            passive_ports: default_passive_ports(),
            external_ip: None,
            bot_name_match: true,
            retries: 0,
            join_wait_secs: 0,
        }
    }
}

impl Config {
    /// Loads `path`, or the default location when `None`.
    ///
    /// A missing default file is created with default values.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = path {
            return Self::read(path);
        }

        let path = config_path()?;
        if path.exists() {
            Self::read(&path)
        } else {
            let config = Config::default();
            config.save_to(&path)?;
            Ok(config)
        }
    }

    fn read(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Writes the configuration to `path`, owner-readable only on Unix.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Nick to register with.
    pub fn effective_nick(&self) -> String {
        if self.randomize_nick {
            randomize_nick(&self.nick)
        } else {
            self.nick.clone()
        }
    }

    /// Channel names with a leading `#`.
    pub fn channel_names(&self) -> Vec<String> {
        self.channels
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .map(|c| {
                if c.starts_with('#') {
                    c.to_string()
                } else {
                    format!("#{c}")
                }
            })
            .collect()
    }

    /// Engine settings derived from this file. Not yet validated.
    pub fn engine_config(&self) -> EngineConfig {
        let destination = match self.download_dir.trim() {
            "" => Destination::Stream,
            dir => Destination::Directory(expand_home(dir)),
        };
        EngineConfig {
            destination,
            passive_ports: self.passive_ports.clone(),
            bot_name_match: self.bot_name_match,
            retries: self.retries,
            external_ip: self.external_ip,
            ..EngineConfig::default()
        }
    }
}

/// First six characters of `nick` plus a number in `1..=999`.
pub fn randomize_nick(nick: &str) -> String {
    use rand::Rng;

    let base: String = nick.chars().take(6).collect();
    let suffix = rand::thread_rng().gen_range(1..=999);
    format!("{base}{suffix}")
}

fn expand_home(dir: &str) -> PathBuf {
    match dir.strip_prefix("~/") {
        Some(rest) => home_dir().join(rest),
        None if dir == "~" => home_dir(),
        None => PathBuf::from(dir),
    }
}

fn home_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    let var = "USERPROFILE";
    #[cfg(not(target_os = "windows"))]
    let var = "HOME";
    std::env::var_os(var)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns the platform-specific configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("xdcc-get").join("config.toml"))
    }

    #[cfg(not(target_os = "windows"))]
    {
        Ok(home_dir()
            .join(".config")
            .join("xdcc-get")
            .join("config.toml"))
    }
}
