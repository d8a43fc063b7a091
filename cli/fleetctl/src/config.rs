//! Fleet configuration.
//!
//! One TOML file with a section per service:
//!
//! ```toml
//! log_level = "info"
//! world = "config/world.toml"
//!
//! [memory]
//! refresh_interval_ms = 1000
//! set_aside_gb = { home = 8 }
//!
//! [launch]
//! retry_limit = 3
//!
//! [batch]
//! spacing_ms = 80
//! ```
//!
//! Missing keys take their defaults; `FLEET_*` variables override the file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fleet_batcher::BatchConfig;
use fleet_launcher::LaunchConfig;
use fleet_memory_service::MemoryConfig;
use serde::{Deserialize, Serialize};

/// Config file read from the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "fleet.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: String,

    /// World file; the built-in demo world is used when unset.
    pub world: Option<PathBuf>,

    pub memory: MemoryConfig,
    pub launch: LaunchConfig,
    pub batch: BatchConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
            world: None,
            memory: MemoryConfig::default(),
            launch: LaunchConfig::default(),
            batch: BatchConfig::default(),
        }
    }
}

impl FleetConfig {
    /// Loads `path`, or `fleet.toml` if present, or defaults. Environment
    /// overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        Ok(config.with_env_overrides())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(level) = lookup("FLEET_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(world) = lookup("FLEET_WORLD") {
            self.world = Some(PathBuf::from(world));
        }
        self.memory = self.memory.with_overrides(&lookup);
        self.launch = self.launch.with_overrides(&lookup);
        self.batch = self.batch.with_overrides(&lookup);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_load_sections_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            log_level = "debug"
            world = "worlds/small.toml"

            [memory]
            reap_interval_ms = 250
            set_aside_gb = {{ home = 2.5 }}

            [launch]
            retry_limit = 1

            [batch]
            spacing_ms = 40
            hack_fraction = 0.05
            "#
        )
        .unwrap();

        let config = FleetConfig::from_file(file.path()).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.world, Some(PathBuf::from("worlds/small.toml")));
        assert_eq!(config.memory.reap_interval_ms, 250);
        assert_eq!(config.memory.refresh_interval_ms, 1_000);
        assert_eq!(config.memory.set_aside_gb.get("home"), Some(&2.5));
        assert_eq!(config.launch.retry_limit, 1);
        assert_eq!(config.batch.spacing_ms, 40);
        assert_eq!(config.batch.heartbeat_grace_ms, 500);
    }

    #[test]
    fn test_empty_file_is_default() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(FleetConfig::from_file(file.path()).unwrap(), FleetConfig::default());
    }

    #[test]
    fn test_missing_or_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FleetConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));

        let bad = dir.path().join("bad.toml");
        fs::write(&bad, "[memory]\nrefresh_interval_ms = \"soon\"").unwrap();
        let err = FleetConfig::from_file(&bad).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn test_env_overrides_reach_every_section() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("FLEET_LOG_LEVEL", "trace"),
            ("FLEET_MEMORY_REFRESH_MS", "10"),
            ("FLEET_LAUNCH_RETRY_LIMIT", "9"),
            ("FLEET_BATCH_SPACING_MS", "20"),
        ]);
        let config = FleetConfig::default().with_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.log_level, "trace");
        assert_eq!(config.memory.refresh_interval_ms, 10);
        assert_eq!(config.launch.retry_limit, 9);
        assert_eq!(config.batch.spacing_ms, 20);
        assert_eq!(config.world, None);
    }
}
