//! Configuration I/O - Loading and saving configuration
//!
//! Handles reading configuration from files and environment variables.

use std::path::Path;
use std::time::Duration;

use humantime_serde::re::humantime;

use super::types::Config;
use crate::error::{Error, Result};

/// Load configuration with layered precedence:
/// 1. Config file if it exists, otherwise defaults
/// 2. Environment variable overrides (includes .env)
pub fn load_config() -> Result<Config> {
    let config_path = super::paths::config_path();

    let mut config = if config_path.exists() {
        load_config_from_path(&config_path)?
    } else {
        Config::default()
    };

    // Apply environment variable overrides (highest precedence)
    apply_env_overrides(&mut config);

    Ok(config)
}

/// Load configuration from a specific path
pub fn load_config_from_path(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;

    // Detect format by extension
    let config: Config = if path.extension().map_or(false, |ext| ext == "toml") {
        toml::from_str(&content).map_err(|e| Error::Config(format!("Invalid TOML config: {}", e)))?
    } else if path.extension().map_or(false, |ext| ext == "json" || ext == "json5") {
        json5::from_str(&content).map_err(|e| Error::Config(format!("Invalid JSON config: {}", e)))?
    } else {
        // Try TOML first, then JSON5
        toml::from_str(&content)
            .or_else(|_| json5::from_str(&content).map_err(|e| Error::Config(e.to_string())))
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?
    };

    Ok(config)
}

/// Apply environment variable overrides to an existing config.
///
/// This loads `.env` file and overlays any set environment variables onto
/// the config. Env vars have the highest precedence: defaults < file < env.
pub fn apply_env_overrides(config: &mut Config) {
    // Load .env file if it exists
    dotenvy::dotenv().ok();

    apply_overrides_from(config, |key| std::env::var(key).ok());
}

/// Apply overrides read through `lookup`
pub(crate) fn apply_overrides_from<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    // Sandbox overrides
    if let Some(template) = lookup("HONEYPOOL_TEMPLATE") {
        config.sandbox.template = template;
    }
    if let Some(prefix) = lookup("HONEYPOOL_NAME_PREFIX") {
        config.sandbox.name_prefix = prefix;
    }
    if let Some(d) = lookup("HONEYPOOL_FREEZE_AFTER").and_then(|v| parse_duration(&v)) {
        config.sandbox.idle.freeze_after = d;
    }
    if let Some(d) = lookup("HONEYPOOL_STOP_AFTER").and_then(|v| parse_duration(&v)) {
        config.sandbox.idle.stop_after = d;
    }
    if let Some(d) = lookup("HONEYPOOL_POLL_INTERVAL").and_then(|v| parse_duration(&v)) {
        config.sandbox.idle.poll_interval = d;
    }
    if let Some(filter) = lookup("HONEYPOOL_TRAFFIC_FILTER") {
        config.sandbox.traffic_filter = Some(filter);
    }

    // Docker overrides
    if let Some(socket) = lookup("DOCKER_HOST") {
        config.docker.socket = Some(socket);
    }
    if let Some(network) = lookup("DOCKER_NETWORK") {
        config.docker.network = network;
    }

    // Listener overrides
    if let Some(listen) = lookup("HONEYPOOL_LISTEN") {
        config.listener.addresses = listen
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }

    // Logging overrides
    if let Some(format) = lookup("HONEYPOOL_LOG_FORMAT") {
        if let Ok(format) = format.parse() {
            config.log.format = format;
        }
    }
}

fn parse_duration(value: &str) -> Option<Duration> {
    humantime::parse_duration(value.trim()).ok()
}

/// Save configuration to a file
pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    let content = if path.extension().map_or(false, |ext| ext == "json") {
        serde_json::to_string_pretty(config)?
    } else {
        toml::to_string_pretty(config).map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogFormat;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.sandbox.template = "alpine".to_string();
        config.sandbox.idle.freeze_after = Duration::from_secs(120);
        save_config(&config, &path).unwrap();

        let loaded = load_config_from_path(&path).unwrap();
        assert_eq!(loaded.sandbox.template, "alpine");
        assert_eq!(loaded.sandbox.idle.freeze_after, Duration::from_secs(120));
    }

    #[test]
    fn test_save_json_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.sandbox.settle.connect_timeout = Duration::from_millis(750);
        save_config(&config, &path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"connect_timeout\": \"750ms\""));
        let loaded = load_config_from_path(&path).unwrap();
        assert_eq!(loaded.sandbox.settle.connect_timeout, Duration::from_millis(750));
    }

    #[test]
    fn test_load_json5_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json5");
        std::fs::write(
            &path,
            r#"{
                // trailing commas and comments are fine
                sandbox: { template: "debian", idle: { stop_after: "2h" } },
                listener: { addresses: ["127.0.0.1:2323"] },
            }"#,
        )
        .unwrap();

        let loaded = load_config_from_path(&path).unwrap();
        assert_eq!(loaded.sandbox.template, "debian");
        assert_eq!(loaded.sandbox.idle.stop_after, Duration::from_secs(7200));
        assert_eq!(loaded.sandbox.idle.freeze_after, Duration::from_secs(900));
        assert_eq!(loaded.listener.addresses, vec!["127.0.0.1:2323".to_string()]);
    }

    #[test]
    fn test_load_invalid_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "sandbox = [").unwrap();
        assert!(matches!(load_config_from_path(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("HONEYPOOL_TEMPLATE", "alpine"),
            ("HONEYPOOL_FREEZE_AFTER", "1m"),
            ("HONEYPOOL_STOP_AFTER", "not a duration"),
            ("HONEYPOOL_LISTEN", "0.0.0.0:22, 0.0.0.0:23,"),
            ("HONEYPOOL_LOG_FORMAT", "json"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        apply_overrides_from(&mut config, |key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.sandbox.template, "alpine");
        assert_eq!(config.sandbox.idle.freeze_after, Duration::from_secs(60));
        // unparsable values leave the previous setting alone
        assert_eq!(config.sandbox.idle.stop_after, Duration::from_secs(1800));
        assert_eq!(
            config.listener.addresses,
            vec!["0.0.0.0:22".to_string(), "0.0.0.0:23".to_string()]
        );
        assert_eq!(config.log.format, LogFormat::Json);
    }
}
