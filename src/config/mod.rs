use crate::distribution::ExportFormat;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Complete Stratus configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StratusConfig {
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub distribution: DistributionConfig,
}

/// Window aggregation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WindowConfig {
    /// Window length, windows are aligned to the Unix epoch
    #[serde(default = "default_size_seconds")]
    pub size_seconds: u64,
    /// Delay after a boundary before the window is flushed
    #[serde(default = "default_grace_seconds")]
    pub grace_seconds: u64,
    /// How long flushed records stay queryable
    #[serde(default = "default_retention_minutes")]
    pub retention_minutes: u64,
    /// Upper bound on retained records
    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

fn default_size_seconds() -> u64 {
    300
}

fn default_grace_seconds() -> u64 {
    30
}

fn default_retention_minutes() -> u64 {
    60
}

fn default_max_records() -> usize {
    100_000
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            size_seconds: default_size_seconds(),
            grace_seconds: default_grace_seconds(),
            retention_minutes: default_retention_minutes(),
            max_records: default_max_records(),
        }
    }
}

impl WindowConfig {
    pub fn size(&self) -> Duration {
        Duration::from_secs(self.size_seconds)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_seconds)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_minutes.saturating_mul(60))
    }
}

/// Distribution configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DistributionConfig {
    #[serde(default)]
    pub format: ExportFormat,
    /// Per-destination write timeout
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
}

fn default_write_timeout_ms() -> u64 {
    10_000
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            format: ExportFormat::default(),
            write_timeout_ms: default_write_timeout_ms(),
            destinations: Vec::new(),
        }
    }
}

impl DistributionConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// One `[[distribution.destinations]]` entry
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DestinationConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: DestinationKind,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DestinationKind {
    /// Files in a local directory
    Local { directory: PathBuf },
}

impl StratusConfig {
    /// Override window settings from the environment, ignoring unparsable values.
    ///
    /// STRATUS_WINDOW_SECONDS, STRATUS_GRACE_SECONDS, STRATUS_RETENTION_MINUTES
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let read = |key: &str, target: &mut u64| {
            if let Some(v) = lookup(key) {
                match v.trim().parse::<u64>() {
                    Ok(n) => *target = n,
                    Err(_) => warn!(key, value = %v, "Ignoring invalid environment override"),
                }
            }
        };

        read("STRATUS_WINDOW_SECONDS", &mut self.window.size_seconds);
        read("STRATUS_GRACE_SECONDS", &mut self.window.grace_seconds);
        read("STRATUS_RETENTION_MINUTES", &mut self.window.retention_minutes);
    }

    /// Reject settings the aggregator cannot honour
    pub fn validate(&self) -> Result<()> {
        let window = &self.window;

        if window.size_seconds == 0 {
            bail!("window.size_seconds must be greater than zero");
        }
        if window.grace_seconds >= window.size_seconds {
            bail!(
                "window.grace_seconds ({}) must be shorter than window.size_seconds ({})",
                window.grace_seconds,
                window.size_seconds
            );
        }
        if window.retention() < window.size() {
            bail!(
                "window.retention_minutes ({}) must cover at least one window of {}s",
                window.retention_minutes,
                window.size_seconds
            );
        }
        if window.max_records == 0 {
            bail!("window.max_records must be greater than zero");
        }
        if self.distribution.write_timeout_ms == 0 {
            bail!("distribution.write_timeout_ms must be greater than zero");
        }

        let mut names: Vec<&str> = self
            .distribution
            .destinations
            .iter()
            .map(|d| d.name.as_str())
            .collect();
        if names.iter().any(|n| n.is_empty()) {
            bail!("distribution destination names must not be empty");
        }
        names.sort_unstable();
        if let Some(pair) = names.windows(2).find(|pair| pair[0] == pair[1]) {
            bail!("duplicate distribution destination '{}'", pair[0]);
        }

        Ok(())
    }
}

/// Load configuration from TOML file
pub fn load_config(path: impl AsRef<Path>) -> Result<StratusConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: StratusConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = StratusConfig::default();
        assert_eq!(config.window.size_seconds, 300);
        assert_eq!(config.window.grace_seconds, 30);
        assert_eq!(config.window.retention_minutes, 60);
        assert_eq!(config.window.max_records, 100_000);
        assert_eq!(config.distribution.format, ExportFormat::JsonLines);
        assert_eq!(config.distribution.write_timeout(), Duration::from_secs(10));
        assert!(config.distribution.destinations.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [window]
            size_seconds = 60
            grace_seconds = 5
            retention_minutes = 30
            max_records = 500

            [distribution]
            format = "json_lines_gz"
            write_timeout_ms = 2500

            [[distribution.destinations]]
            name = "archive"
            type = "local"
            directory = "/var/lib/stratus/archive"

            [[distribution.destinations]]
            name = "share"
            type = "local"
            directory = "/mnt/share"
        "#;

        let config: StratusConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.window.size(), Duration::from_secs(60));
        assert_eq!(config.window.grace(), Duration::from_secs(5));
        assert_eq!(config.window.retention(), Duration::from_secs(1800));
        assert_eq!(config.window.max_records, 500);
        assert_eq!(config.distribution.format, ExportFormat::JsonLinesGz);
        assert_eq!(config.distribution.write_timeout_ms, 2500);
        assert_eq!(
            config.distribution.destinations[0],
            DestinationConfig {
                name: "archive".to_string(),
                kind: DestinationKind::Local {
                    directory: PathBuf::from("/var/lib/stratus/archive"),
                },
            }
        );
        assert_eq!(config.distribution.destinations[1].name, "share");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config() {
        let toml = r#"
            [window]
            size_seconds = 600
        "#;

        let config: StratusConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.window.size_seconds, 600);
        assert_eq!(config.window.grace_seconds, 30); // Default
        assert_eq!(config.distribution.write_timeout_ms, 10_000); // Default
    }

    #[test]
    fn test_unknown_destination_type_rejected() {
        let toml = r#"
            [[distribution.destinations]]
            name = "offsite"
            type = "carrier_pigeon"
        "#;

        assert!(toml::from_str::<StratusConfig>(toml).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_windows() {
        let mut config = StratusConfig::default();
        config.window.size_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = StratusConfig::default();
        config.window.grace_seconds = 300;
        assert!(config.validate().is_err());

        let mut config = StratusConfig::default();
        config.window.size_seconds = 7200;
        config.window.grace_seconds = 60;
        config.window.retention_minutes = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_destinations() {
        let mut config = StratusConfig::default();
        for _ in 0..2 {
            config.distribution.destinations.push(DestinationConfig {
                name: "archive".to_string(),
                kind: DestinationKind::Local {
                    directory: PathBuf::from("/tmp/a"),
                },
            });
        }

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("archive"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("STRATUS_WINDOW_SECONDS", "120"),
            ("STRATUS_GRACE_SECONDS", "not-a-number"),
            ("STRATUS_RETENTION_MINUTES", " 15 "),
        ]
        .into_iter()
        .collect();

        let mut config = StratusConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.window.size_seconds, 120);
        assert_eq!(config.window.grace_seconds, 30);
        assert_eq!(config.window.retention_minutes, 15);
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stratus.toml");
        std::fs::write(&path, "[window]\nsize_seconds = 900\n").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.window.size_seconds, 900);

        let err = load_config(dir.path().join("missing.toml")).unwrap_err();
        assert!(err.to_string().contains("missing.toml"));
    }
}
