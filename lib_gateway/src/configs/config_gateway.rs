use std::path::Path;
use std::time::Duration;
use std::{env, fs};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::whitelist::Whitelist;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error occurred: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Environment variable {name} has an invalid value: {value}")]
    InvalidEnv { name: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ThresholdSettings {
    pub enabled: bool,
    /// State changes per second tolerated before a second counts as overloaded.
    pub value: u64,
    /// Consecutive overloaded seconds before the breaker trips.
    pub repeat_seconds: u32,
}

impl Default for ThresholdSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            value: 200,
            repeat_seconds: 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RemoteSettings {
    pub ratings_url: Option<String>,
    pub licenses_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewaySettings {
    pub auth: bool,
    pub default_user: String,
    /// The transport cannot close a connection on its own initiative.
    pub no_disconnect: bool,
    /// Seconds of inactivity after which a legacy session is considered expired.
    pub ttl: u64,
    pub whitelist: Option<Whitelist>,
    pub events_threshold: ThresholdSettings,
    pub adapter_name: String,
    pub version: String,
    pub remote: RemoteSettings,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            auth: false,
            default_user: "admin".to_string(),
            no_disconnect: false,
            ttl: 3600,
            whitelist: None,
            events_threshold: ThresholdSettings::default(),
            adapter_name: "admin".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            remote: RemoteSettings::default(),
        }
    }
}

impl GatewaySettings {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }

    /// Overrides fields from `GATEWAY_*` environment variables.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|name| env::var(name).ok())
    }

    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("GATEWAY_AUTH") {
            self.auth = parse_env("GATEWAY_AUTH", &v)?;
        }
        if let Some(v) = lookup("GATEWAY_DEFAULT_USER") {
            self.default_user = v;
        }
        if let Some(v) = lookup("GATEWAY_TTL") {
            self.ttl = parse_env("GATEWAY_TTL", &v)?;
        }
        if let Some(v) = lookup("GATEWAY_NO_DISCONNECT") {
            self.no_disconnect = parse_env("GATEWAY_NO_DISCONNECT", &v)?;
        }
        if let Some(v) = lookup("GATEWAY_THRESHOLD_VALUE") {
            self.events_threshold.value = parse_env("GATEWAY_THRESHOLD_VALUE", &v)?;
        }
        if let Some(v) = lookup("GATEWAY_THRESHOLD_REPEAT") {
            self.events_threshold.repeat_seconds = parse_env("GATEWAY_THRESHOLD_REPEAT", &v)?;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        name: name.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_fill_missing_fields() {
        let settings: GatewaySettings = serde_json::from_str(r#"{"auth": true, "ttl": 60}"#).unwrap();
        assert!(settings.auth);
        assert_eq!(settings.ttl, 60);
        assert_eq!(settings.default_user, "admin");
        assert_eq!(settings.events_threshold, ThresholdSettings::default());
    }

    #[test]
    fn whitelist_parses_from_camel_case() {
        let settings: GatewaySettings = serde_json::from_str(
            r#"{"whitelist": {"default": {"user": "guest", "state": {"write": false}}},
                "eventsThreshold": {"value": 50, "repeatSeconds": 2}}"#,
        )
        .unwrap();
        let wl = settings.whitelist.unwrap();
        assert_eq!(wl["default"].user, "guest");
        assert_eq!(settings.events_threshold.value, 50);
        assert_eq!(settings.events_threshold.repeat_seconds, 2);
        assert!(settings.events_threshold.enabled);
    }

    #[test]
    fn env_overrides_and_rejects_garbage() {
        let vars: HashMap<&str, &str> = [("GATEWAY_AUTH", "true"), ("GATEWAY_TTL", "120")].into();
        let mut settings = GatewaySettings::default();
        settings
            .apply_env_from(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert!(settings.auth);
        assert_eq!(settings.session_ttl(), Duration::from_secs(120));

        let err = settings
            .apply_env_from(|k| (k == "GATEWAY_THRESHOLD_VALUE").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }
}
