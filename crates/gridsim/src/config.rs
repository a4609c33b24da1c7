//! Runtime Configuration
//!
//! Layered: built-in defaults, then `gridsim.toml`, then `GRIDSIM_*`
//! environment variables (`__` separates nested keys), then CLI flags.

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::engine::EngineSettings;
use crate::relay::RelaySettings;

pub const DEFAULT_CONFIG_FILE: &str = "gridsim.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Figment(#[from] figment::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridsimConfig {
    pub engine: EngineSettings,
    pub relay: RelaySettings,
    /// Project directory
    pub project: PathBuf,
}

impl Default for GridsimConfig {
    fn default() -> Self {
        Self {
            engine: EngineSettings::default(),
            relay: RelaySettings::default(),
            project: PathBuf::from("."),
        }
    }
}

impl GridsimConfig {
    /// Every layer except the CLI
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(GridsimConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("GRIDSIM_").split("__"))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Ok(Self::figment(path).extract()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = GridsimConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.engine, EngineSettings::default());
        assert_eq!(config.relay.request_timeout_ms, 5_000);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(
            &path,
            "project = \"sites/feeder\"\n[engine]\nstatement_budget = 50\n[relay]\nallow_default_listeners = true\nreset_on_connect = true\n",
        )
        .unwrap();

        let config = GridsimConfig::load(&path).unwrap();
        assert_eq!(config.project, PathBuf::from("sites/feeder"));
        assert_eq!(config.engine.statement_budget, 50);
        assert_eq!(config.engine.tick_period_ms, 100);
        assert!(config.relay.allow_default_listeners);
        assert!(config.relay.reset_on_connect);
    }

    #[test]
    fn test_bad_type_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, "[engine]\ntick_period_ms = \"fast\"\n").unwrap();
        assert!(GridsimConfig::load(&path).is_err());
    }
}
