//! Foliopulse configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{FolioError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FolioConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub mail: MailConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
}

impl FolioConfig {
    /// Load config from the default path (~/.foliopulse/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| FolioError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| FolioError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| FolioError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Foliopulse home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".foliopulse")
    }
}

/// SQLite store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "~/.foliopulse/foliopulse.db".into()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

impl StoreConfig {
    /// Resolve `~` in the configured path against the home directory.
    pub fn resolved_path(&self) -> PathBuf {
        if let Some(rest) = self.path.strip_prefix("~/") {
            dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(rest)
        } else {
            PathBuf::from(&self.path)
        }
    }
}

/// HTTP gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared secret expected in the X-Cron-Secret header on the sweep
    /// trigger. Empty disables the trigger entirely.
    #[serde(default)]
    pub cron_secret: String,
    /// Dev mode registers a GET fallback on the sweep trigger for local
    /// poking. Production must stay POST-only.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8790
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cron_secret: String::new(),
            dev_mode: false,
        }
    }
}

/// Outbound SMTP configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
    #[serde(default)]
    pub from_email: String,
    /// Explicit dry-run switch: messages are logged and counted as sent
    /// without touching the network. Replaces any implicit
    /// "no provider key configured" behavior.
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,
}

fn default_smtp_host() -> String {
    "smtp.gmail.com".into()
}
fn default_smtp_port() -> u16 {
    587
}
fn default_from_name() -> String {
    "Foliopulse".into()
}
fn default_batch_size() -> usize {
    100
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff() -> u64 {
    2
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            smtp_host: default_smtp_host(),
            smtp_port: default_smtp_port(),
            username: String::new(),
            password: String::new(),
            from_name: default_from_name(),
            from_email: String::new(),
            dry_run: false,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_backoff_secs: default_retry_backoff(),
        }
    }
}

/// Background sweep loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
    /// Disable the in-process timer when an external cron hits the
    /// trigger endpoint instead.
    #[serde(default = "bool_true")]
    pub enabled: bool,
}

fn default_sweep_interval() -> u64 {
    300
}
fn bool_true() -> bool {
    true
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self { interval_secs: default_sweep_interval(), enabled: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_empty_toml() {
        let cfg: FolioConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.gateway.port, 8790);
        assert_eq!(cfg.mail.batch_size, 100);
        assert!(!cfg.mail.dry_run);
        assert!(cfg.sweep.enabled);
    }

    #[test]
    fn partial_override() {
        let cfg: FolioConfig = toml::from_str(
            "[mail]\ndry_run = true\nbatch_size = 25\n\n[gateway]\ncron_secret = \"s3cret\"\n",
        )
        .unwrap();
        assert!(cfg.mail.dry_run);
        assert_eq!(cfg.mail.batch_size, 25);
        assert_eq!(cfg.gateway.cron_secret, "s3cret");
        // untouched sections keep defaults
        assert_eq!(cfg.mail.smtp_port, 587);
    }
}
