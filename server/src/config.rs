//! Configuration management for the orchestrator.
//!
//! Handles loading, validation, and reloading of `OrchestratorConfig` from
//! a `server.toml` file, plus applying command-line overrides.

use std::path::PathBuf;

use anyhow::{Context, Result};
use shared::config::OrchestratorConfig;
use tracing::{debug, info};

const CONFIG_FILE: &str = "server.toml";

/// Owns the lifecycle of the orchestrator's configuration: initial load,
/// validation, reload, and CLI-override persistence.
pub struct ConfigManager {
    pub config_path: PathBuf,
    pub config: Option<OrchestratorConfig>,
}

impl ConfigManager {
    pub fn new(config_path: PathBuf) -> Result<Self> {
        let config_path = if config_path.is_dir() {
            config_path.join(CONFIG_FILE)
        } else {
            config_path
        };

        let mut manager = Self {
            config_path,
            config: None,
        };
        manager.load_config()?;
        Ok(manager)
    }

    pub fn load_config(&mut self) -> Result<()> {
        info!(
            "loading orchestrator configuration from {}",
            self.config_path.display()
        );

        let config: OrchestratorConfig = if self.config_path.exists() {
            let content = std::fs::read_to_string(&self.config_path)
                .with_context(|| format!("failed to read {}", self.config_path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("failed to parse {}", self.config_path.display()))?
        } else {
            debug!(
                "no config file at {}, using defaults",
                self.config_path.display()
            );
            OrchestratorConfig::default()
        };

        config
            .validate()
            .with_context(|| format!("invalid configuration in {}", self.config_path.display()))?;

        self.config = Some(config);
        info!("configuration loaded successfully");
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.config.is_some()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        self.config
            .as_ref()
            .expect("configuration must be loaded before use")
    }

    /// Applies CLI overrides and persists them back to `server.toml` if
    /// anything changed. Returns whether any value was changed.
    pub fn override_and_persist_config(
        &mut self,
        listen_address: Option<String>,
        max_concurrent_tasks: Option<usize>,
        graceful_shutdown_timeout_seconds: Option<u64>,
    ) -> Result<bool> {
        if self.config.is_none() {
            self.load_config()?;
        }
        let mut config = self.config.clone().expect("configuration must be loaded");
        let mut changed = false;

        if let Some(addr) = listen_address {
            if config.listen_address != addr {
                info!(
                    "overriding listen_address: {} -> {}",
                    config.listen_address, addr
                );
                config.listen_address = addr;
                changed = true;
            }
        }
        if let Some(n) = max_concurrent_tasks {
            if config.max_concurrent_tasks != n {
                info!(
                    "overriding max_concurrent_tasks: {} -> {}",
                    config.max_concurrent_tasks, n
                );
                config.max_concurrent_tasks = n;
                changed = true;
            }
        }
        if let Some(secs) = graceful_shutdown_timeout_seconds {
            if config.graceful_shutdown_timeout_seconds != secs {
                config.graceful_shutdown_timeout_seconds = secs;
                changed = true;
            }
        }

        if changed {
            config
                .validate()
                .context("invalid configuration after applying command-line overrides")?;
            let toml_text =
                toml::to_string_pretty(&config).context("failed to serialize configuration")?;
            std::fs::write(&self.config_path, toml_text)
                .with_context(|| format!("failed to write {}", self.config_path.display()))?;
            self.config = Some(config);
            info!("configuration updated and persisted to disk");
        }

        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn loads_defaults_when_file_absent() {
        let dir = tempdir().unwrap();
        let manager = ConfigManager::new(dir.path().join("server.toml")).unwrap();
        assert!(manager.is_loaded());
    }

    #[test]
    fn override_persists_to_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("server.toml");
        let mut manager = ConfigManager::new(path.clone()).unwrap();
        let changed = manager
            .override_and_persist_config(Some("127.0.0.1:9000".to_string()), None, None)
            .unwrap();
        assert!(changed);
        assert_eq!(manager.config().listen_address, "127.0.0.1:9000");
        let reloaded = ConfigManager::new(path).unwrap();
        assert_eq!(reloaded.config().listen_address, "127.0.0.1:9000");
    }
}
