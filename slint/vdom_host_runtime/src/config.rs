use crate::error::ConfigError;
use serde::Deserialize;
use std::time::Duration;

pub const CONFIG_PATH_VAR: &str = "VDOM_HOST_CONFIG";
pub const CLIENT_ID_VAR: &str = "VDOM_CLIENT_ID";
pub const SYNC_INTERVAL_VAR: &str = "VDOM_SYNC_INTERVAL_MS";
pub const ROUND_TIMEOUT_VAR: &str = "VDOM_ROUND_TIMEOUT_MS";
pub const OUTBOUND_QUEUE_CAP_VAR: &str = "VDOM_OUTBOUND_QUEUE_CAP";
pub const DIAGNOSTIC_LOG_CAP_VAR: &str = "VDOM_DIAGNOSTIC_LOG_CAP";

const DEFAULT_CLIENT_ID: &str = "C1";
const DEFAULT_SYNC_INTERVAL_MS: u64 = 1_000;
const DEFAULT_ROUND_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_OUTBOUND_QUEUE_CAP: usize = 256;
const DEFAULT_DIAGNOSTIC_LOG_CAP: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub client_id: String,
    pub sync_interval_ms: u64,
    /// Zero disables the round timeout.
    pub round_timeout_ms: u64,
    pub outbound_queue_cap: usize,
    pub diagnostic_log_cap: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            sync_interval_ms: DEFAULT_SYNC_INTERVAL_MS,
            round_timeout_ms: DEFAULT_ROUND_TIMEOUT_MS,
            outbound_queue_cap: DEFAULT_OUTBOUND_QUEUE_CAP,
            diagnostic_log_cap: DEFAULT_DIAGNOSTIC_LOG_CAP,
        }
    }
}

impl HostConfig {
    /// Reads the optional JSON file named by `VDOM_HOST_CONFIG`, then applies
    /// environment overrides on top.
    pub fn load() -> Result<Self, ConfigError> {
        let base = match std::env::var(CONFIG_PATH_VAR) {
            Ok(path) if !path.is_empty() => Self::from_file(&path)?,
            _ => Self::default(),
        };

        base.with_overrides(|var| std::env::var(var).ok())
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;

        Self::from_json(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        if let Some(client_id) = lookup(CLIENT_ID_VAR).filter(|raw| !raw.is_empty()) {
            self.client_id = client_id;
        }

        if let Some(raw) = lookup(SYNC_INTERVAL_VAR) {
            self.sync_interval_ms = parse_var(SYNC_INTERVAL_VAR, &raw, |value: &u64| *value > 0)?;
        }

        if let Some(raw) = lookup(ROUND_TIMEOUT_VAR) {
            self.round_timeout_ms = parse_var(ROUND_TIMEOUT_VAR, &raw, |_: &u64| true)?;
        }

        if let Some(raw) = lookup(OUTBOUND_QUEUE_CAP_VAR) {
            self.outbound_queue_cap =
                parse_var(OUTBOUND_QUEUE_CAP_VAR, &raw, |value: &usize| *value > 0)?;
        }

        if let Some(raw) = lookup(DIAGNOSTIC_LOG_CAP_VAR) {
            self.diagnostic_log_cap =
                parse_var(DIAGNOSTIC_LOG_CAP_VAR, &raw, |value: &usize| *value > 0)?;
        }

        Ok(self)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn round_timeout(&self) -> Option<Duration> {
        (self.round_timeout_ms > 0).then(|| Duration::from_millis(self.round_timeout_ms))
    }

    /// The distinguished handle id that resolves to the panel's own root element.
    pub fn root_ref_id(&self) -> String {
        format!("{}:root", self.client_id)
    }
}

fn parse_var<T, P>(var: &'static str, raw: &str, valid: P) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    P: Fn(&T) -> bool,
{
    raw.trim()
        .parse::<T>()
        .ok()
        .filter(|value| valid(value))
        .ok_or_else(|| ConfigError::InvalidVar {
            var,
            value: raw.to_string(),
        })
}
