use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory containing the nginx access logs to monitor
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// File banned IPs are appended to, in nginx `deny` syntax
    #[serde(default = "default_banned_file")]
    pub banned_file: PathBuf,

    /// Whitelist file of IPs that must never be banned
    #[serde(default = "default_whitelist_file")]
    pub whitelist_file: PathBuf,

    /// Interval in seconds between banned-count checks and nginx reloads
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,

    /// Parse logs from the beginning instead of only new activity
    #[serde(default)]
    pub parse_all: bool,

    /// Delay in seconds before ban notifications are enabled, suppressing
    /// the alert storm from the initial backfill
    #[serde(default = "default_notify_warmup")]
    pub notify_warmup_secs: u64,

    #[serde(default)]
    pub telegram: TelegramConfig,

    /// Custom labels appended to every ban log line and notification
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramConfig {
    /// Bot token for notifications (empty disables delivery)
    #[serde(default)]
    pub token: String,

    /// Chat ID notifications are sent to
    #[serde(default)]
    pub chat_id: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            banned_file: default_banned_file(),
            whitelist_file: default_whitelist_file(),
            reload_interval_secs: default_reload_interval(),
            parse_all: false,
            notify_warmup_secs: default_notify_warmup(),
            telegram: TelegramConfig::default(),
            labels: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load config from default locations or create default
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/scanban/config.toml"),
            dirs_next::config_dir()
                .map(|p| p.join("scanban/config.toml"))
                .unwrap_or_default(),
            PathBuf::from("config.toml"),
        ];

        for path in &paths {
            if path.exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs)
    }

    pub fn notify_warmup(&self) -> Duration {
        Duration::from_secs(self.notify_warmup_secs)
    }
}

// Default value functions
fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/nginx/")
}

fn default_banned_file() -> PathBuf {
    PathBuf::from("/etc/nginx/conf.d/scanban.conf")
}

fn default_whitelist_file() -> PathBuf {
    PathBuf::from("/etc/nginx/ip-whitelist")
}

fn default_reload_interval() -> u64 {
    10
}

fn default_notify_warmup() -> u64 {
    60
}
