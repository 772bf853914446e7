//! Configuration management for Skylight GW
//!
//! Handles loading, validating and printing the YAML configuration file.

use crate::error::RelayError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;
use tokio::fs;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub upstreams: Vec<UpstreamConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<DisplayConfig>,
}

/// Downstream WebSocket/HTTP listener
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// One upstream state source
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Root name this source's state is merged under
    pub name: String,
    pub uri: String,
    /// Prefix of the `objects.subscribe` / `objects.query` methods
    #[serde(default = "default_namespace")]
    pub method_namespace: String,
    /// Object spec sent with the subscribe request
    pub objects: Value,
    /// Also send a one-shot query after subscribing
    #[serde(default = "default_true")]
    pub seed_query: bool,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

/// Display-mode consumer driving the LED engine
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DisplayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Upstream root whose printer state drives the mode
    #[serde(default = "default_display_source")]
    pub source: String,
    /// Local root for display fields
    #[serde(default = "default_display_root")]
    pub root: String,
    #[serde(default = "default_led_count")]
    pub led_count: u32,
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            source: default_display_source(),
            root: default_display_root(),
            led_count: default_led_count(),
            update_interval_ms: default_update_interval_ms(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            upstreams: vec![UpstreamConfig {
                name: default_display_source(),
                uri: "ws://localhost:7125/websocket".to_string(),
                method_namespace: default_namespace(),
                objects: json!({
                    "print_stats": null,
                    "display_status": ["progress"],
                    "idle_timeout": ["state"],
                    "extruder": ["temperature", "target"],
                    "pause_resume": ["is_paused"]
                }),
                seed_query: true,
                retry_interval_ms: default_retry_interval_ms(),
            }],
            display: Some(DisplayConfig::default()),
        }
    }
}

impl UpstreamConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl DisplayConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }
}

impl AppConfig {
    /// Load configuration from file with validation
    pub async fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: AppConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML config: {}", path))?;

        config.validate()?;

        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config to YAML")
    }

    /// Validate configuration for correctness and consistency
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("server.port cannot be 0");
        }

        if self.upstreams.is_empty() {
            anyhow::bail!("At least one upstream must be defined");
        }

        let mut names = HashSet::new();
        for (idx, upstream) in self.upstreams.iter().enumerate() {
            validate_root_name(&upstream.name)
                .with_context(|| format!("Invalid name for upstream {}", idx))?;
            if !names.insert(upstream.name.as_str()) {
                anyhow::bail!("Duplicate upstream name '{}'", upstream.name);
            }
            if !(upstream.uri.starts_with("ws://") || upstream.uri.starts_with("wss://")) {
                anyhow::bail!(
                    "Upstream '{}' uri must start with ws:// or wss:// (got '{}')",
                    upstream.name,
                    upstream.uri
                );
            }
            if upstream.method_namespace.is_empty() {
                anyhow::bail!("Upstream '{}' method_namespace cannot be empty", upstream.name);
            }
            match &upstream.objects {
                Value::Object(objects) if !objects.is_empty() => {}
                _ => anyhow::bail!(
                    "Upstream '{}' objects must be a non-empty mapping",
                    upstream.name
                ),
            }
            if upstream.retry_interval_ms == 0 {
                anyhow::bail!("Upstream '{}' retry_interval_ms cannot be 0", upstream.name);
            }
        }

        if let Some(display) = &self.display {
            validate_root_name(&display.root).context("Invalid display root")?;
            if names.contains(display.root.as_str()) {
                anyhow::bail!(
                    "Display root '{}' collides with an upstream name",
                    display.root
                );
            }
            if display.enabled && !names.contains(display.source.as_str()) {
                anyhow::bail!("Display source '{}' is not a configured upstream", display.source);
            }
            if display.update_interval_ms == 0 {
                anyhow::bail!("display.update_interval_ms cannot be 0");
            }
        }

        Ok(())
    }
}

/// Root names become the first path segment
fn validate_root_name(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(RelayError::Config("name cannot be empty".to_string()));
    }
    if name.contains('.') || name == crate::state::WILDCARD {
        return Err(RelayError::Config(format!(
            "'{}' is not a valid path segment",
            name
        )));
    }
    Ok(())
}

fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 7120 }
fn default_namespace() -> String { "printer".to_string() }
fn default_true() -> bool { true }
fn default_retry_interval_ms() -> u64 { 5000 }
fn default_display_source() -> String { "moonraker".to_string() }
fn default_display_root() -> String { "skylight".to_string() }
fn default_led_count() -> u32 { 30 }
fn default_update_interval_ms() -> u64 { 5000 }

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.server.port, 7120);
        assert_eq!(config.upstreams[0].retry_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_default_yaml_parses_back() {
        let yaml = AppConfig::default().to_yaml().unwrap();
        let parsed: AppConfig = serde_yaml::from_str(&yaml).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.upstreams[0].objects, AppConfig::default().upstreams[0].objects);
    }

    #[tokio::test]
    async fn test_load_applies_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
upstreams:
  - name: printer
    uri: ws://10.0.0.5:7125/websocket
    objects:
      extruder: [temperature, target]
      print_stats: ~
"#
        )
        .unwrap();

        let config = AppConfig::load(file.path().to_str().unwrap()).await.unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        let upstream = &config.upstreams[0];
        assert_eq!(upstream.method_namespace, "printer");
        assert!(upstream.seed_query);
        assert_eq!(upstream.retry_interval_ms, 5000);
        assert_eq!(upstream.objects["extruder"], json!(["temperature", "target"]));
        assert!(upstream.objects["print_stats"].is_null());
        assert!(config.display.is_none());
    }

    #[tokio::test]
    async fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.yaml");
        assert!(AppConfig::load(path.to_str().unwrap()).await.is_err());
    }

    #[test]
    fn test_validation_rejects_bad_configs() {
        let mut config = AppConfig::default();
        config.upstreams[0].name = "a.b".into();
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::Config(_))
        ));

        let mut config = AppConfig::default();
        config.upstreams.push(config.upstreams[0].clone());
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.upstreams[0].uri = "http://localhost".into();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.upstreams[0].retry_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.upstreams[0].objects = json!({});
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        if let Some(display) = config.display.as_mut() {
            display.root = "moonraker".into();
        }
        assert!(config.validate().is_err());
    }
}
