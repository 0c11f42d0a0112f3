use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use lib_gateway::backend::Seed;
use lib_gateway::GatewaySettings;
use serde::{Deserialize, Serialize};

const DEFAULT_CONFIG_FILE: &str = "server_gateway.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Command/event gateway over WebSocket", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "GATEWAY_PORT", help = "Port to listen on for client connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "GATEWAY_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "GATEWAY_SETTINGS_PATH", help = "Path to the JSON gateway settings (auth, ttl, whitelist, thresholds).")]
    pub settings_path: Option<PathBuf>,

    #[clap(long, env = "GATEWAY_SEED_PATH", help = "Path to a JSON file of objects, states and sessions for the in-memory backend.")]
    pub seed_path: Option<PathBuf>,

    #[clap(long, env = "GATEWAY_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "GATEWAY_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "GATEWAY_ADMIN", help = "Serve the administrative command set.")]
    pub admin: Option<bool>,
}

impl Config {
    /// `other` wins wherever it has a value.
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            settings_path: other.settings_path.or(self.settings_path),
            seed_path: other.seed_path.or(self.seed_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            admin: other.admin.or(self.admin),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(8081),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            admin: Some(true),
            ..Default::default()
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(8081)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn admin(&self) -> bool {
        self.admin.unwrap_or(true)
    }

    /// Settings file (if any) with `GATEWAY_*` overrides applied.
    pub fn gateway_settings(&self) -> anyhow::Result<GatewaySettings> {
        let mut settings = match &self.settings_path {
            Some(path) => GatewaySettings::from_file(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => GatewaySettings::default(),
        };
        settings.apply_env()?;
        Ok(settings)
    }

    pub fn seed(&self) -> anyhow::Result<Seed> {
        match &self.seed_path {
            Some(path) => read_json(path),
            None => Ok(Seed::default()),
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Defaults, then the JSON config file, then environment and CLI.
///
/// A missing config file is fine; an unreadable or malformed one is an error.
pub fn load_config() -> anyhow::Result<Config> {
    let cli = Config::parse();
    let path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut config = Config::defaults();
    if path.exists() {
        let file_config: Config = read_json(&path)?;
        config = config.merge(file_config);
    }
    Ok(config.merge(cli))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_layers_win_only_where_set() {
        let file = Config {
            port: Some(9000),
            log_level: Some("debug".into()),
            ..Default::default()
        };
        let cli = Config {
            port: Some(9100),
            ..Default::default()
        };
        let merged = Config::defaults().merge(file).merge(cli);
        assert_eq!(merged.port(), 9100);
        assert_eq!(merged.log_level(), "debug");
        assert!(merged.admin());
    }

    #[test]
    fn config_file_uses_camel_case() {
        let parsed: Config = serde_json::from_str(r#"{"seedPath": "seed.json", "admin": false}"#).unwrap();
        assert_eq!(parsed.seed_path, Some(PathBuf::from("seed.json")));
        assert!(!parsed.admin());
    }
}
