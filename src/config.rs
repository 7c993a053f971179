use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const SETTINGS_FILE: &str = "settings.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_url: String,
    pub log_level: String,
    pub worker: WorkerConfig,
    pub oauth: OAuthConfig,
    pub vault: VaultConfig,
    pub calendar: CalendarConfig,
    pub mail: MailConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub interval_secs: u64,
    /// Deadline for one cycle. Clamped below the interval.
    pub cycle_timeout_secs: u64,
    /// Upper bound on concurrently processed accounts; unbounded when unset.
    pub max_concurrent_accounts: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub token_url: String,
    pub expiry_margin_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct VaultConfig {
    /// Base64-encoded 32-byte key. Falls back to the OS keyring when unset.
    pub key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarConfig {
    pub calendar_id: String,
    pub page_size: i32,
    /// Tag written into created reminders so they are never treated as triggers.
    pub reminder_marker: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    pub full_sync_window_days: i64,
    pub max_messages: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite:gpilot.db?mode=rwc".to_string(),
            log_level: "info".to_string(),
            worker: WorkerConfig::default(),
            oauth: OAuthConfig::default(),
            vault: VaultConfig::default(),
            calendar: CalendarConfig::default(),
            mail: MailConfig::default(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 120,
            cycle_timeout_secs: 100,
            max_concurrent_accounts: None,
        }
    }
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            expiry_margin_secs: 60,
        }
    }
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            calendar_id: "primary".to_string(),
            page_size: 250,
            reminder_marker: "[gpilot-automation]".to_string(),
        }
    }
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            full_sync_window_days: 1,
            max_messages: 50,
        }
    }
}

impl Config {
    /// Reads `settings.toml` from the working directory, or defaults when it is absent.
    pub fn load() -> Result<Self> {
        Self::load_from(SETTINGS_FILE)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config
            .log_level()
            .with_context(|| format!("Invalid settings in {}", path.display()))?;
        Ok(config)
    }

    pub fn log_level(&self) -> Result<tracing::Level> {
        self.log_level.trim().parse().map_err(|_| {
            anyhow::anyhow!(
                "Unknown log_level {:?}; expected trace, debug, info, warn or error",
                self.log_level
            )
        })
    }
}

impl WorkerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn cycle_timeout(&self) -> Duration {
        let interval = self.interval();
        let timeout = Duration::from_secs(self.cycle_timeout_secs.max(1));
        if timeout < interval {
            timeout
        } else {
            // keep a margin so a normal cycle always finishes before the next tick
            interval.mul_f64(0.8)
        }
    }
}

impl OAuthConfig {
    /// Client credentials from the settings file, then `GOOGLE_CLIENT_ID` / `GOOGLE_CLIENT_SECRET`.
    pub fn client_credentials(&self) -> Result<(String, String)> {
        let from_env = |key: &str| {
            std::env::var(key)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let client_id = self
            .client_id
            .clone()
            .filter(|v| !v.is_empty())
            .or_else(|| from_env("GOOGLE_CLIENT_ID"));
        let client_secret = self
            .client_secret
            .clone()
            .filter(|v| !v.is_empty())
            .or_else(|| from_env("GOOGLE_CLIENT_SECRET"));

        match (client_id, client_secret) {
            (Some(id), Some(secret)) => Ok((id, secret)),
            _ => anyhow::bail!(
                "OAuth client credentials are missing; set [oauth] client_id/client_secret or GOOGLE_CLIENT_ID/GOOGLE_CLIENT_SECRET"
            ),
        }
    }

    pub fn expiry_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.expiry_margin_secs.max(0))
    }
}
