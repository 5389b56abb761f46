//! Configuration file loaders
//!
//! JSON files under the config directory, loaded on demand and cached for
//! the life of the process. Load failures are fatal at startup and map to
//! exit code 2.

use deploy_control::DeployConfig;
use incident_desk::{DeskConfig, Playbook, PlaybookCondition};
use parking_lot::RwLock;
use remote_exec::PoolConfig;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration load failure
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File absent
    #[error("Config file missing: {path}")]
    Missing {
        /// Expected path
        path: String,
    },

    /// File present but unusable
    #[error("Config file invalid: {path}: {reason}")]
    Invalid {
        /// Offending path
        path: String,
        /// What was wrong
        reason: String,
    },
}

/// `monitoring-sources.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringSources {
    /// Prometheus base URL, when scraping is wired
    #[serde(default)]
    pub prometheus: Option<String>,
    /// Log files watched by the anomaly tagger
    #[serde(default)]
    pub logs: LogSources,
    /// Healthcheck endpoints polled by the monitor
    #[serde(default)]
    pub healthchecks: Vec<String>,
}

/// Watched log paths
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogSources {
    /// Absolute paths
    #[serde(default)]
    pub paths: Vec<String>,
}

/// One metric's alert thresholds (`alert-thresholds.json` values)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThresholdPair {
    /// Warning level
    pub warning: f64,
    /// Critical level, must exceed warning
    pub critical: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct PlaybookSpec {
    condition: PlaybookCondition,
    actions: Vec<String>,
}

/// Cached loader over the config directory
pub struct ConfigStore {
    dir: PathBuf,
    cache: RwLock<HashMap<String, Value>>,
}

impl ConfigStore {
    /// Create a loader rooted at the given directory
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn raw(&self, name: &str) -> Result<Value, ConfigError> {
        if let Some(value) = self.cache.read().get(name) {
            return Ok(value.clone());
        }
        let path = self.dir.join(name);
        let text = std::fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::Missing {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Invalid {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                }
            }
        })?;
        let value: Value =
            serde_json::from_str(&text).map_err(|e| ConfigError::Invalid {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        self.cache
            .write()
            .insert(name.to_string(), value.clone());
        Ok(value)
    }

    fn parse<T: DeserializeOwned>(&self, name: &str, value: Value) -> Result<T, ConfigError> {
        serde_json::from_value(value).map_err(|e| ConfigError::Invalid {
            path: self.dir.join(name).display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Load `monitoring-sources.json`
    pub fn monitoring_sources(&self) -> Result<MonitoringSources, ConfigError> {
        let value = self.raw("monitoring-sources.json")?;
        self.parse("monitoring-sources.json", value)
    }

    /// Load and validate `alert-thresholds.json`
    pub fn alert_thresholds(&self) -> Result<HashMap<String, ThresholdPair>, ConfigError> {
        let name = "alert-thresholds.json";
        let value = self.raw(name)?;
        let thresholds: HashMap<String, ThresholdPair> = self.parse(name, value)?;
        for (metric, pair) in &thresholds {
            if pair.critical <= pair.warning {
                return Err(ConfigError::Invalid {
                    path: self.dir.join(name).display().to_string(),
                    reason: format!(
                        "{metric}: critical ({}) must exceed warning ({})",
                        pair.critical, pair.warning
                    ),
                });
            }
        }
        Ok(thresholds)
    }

    /// Load `autoheal-playbooks.json`
    pub fn playbooks(&self) -> Result<Vec<Playbook>, ConfigError> {
        let name = "autoheal-playbooks.json";
        let value = self.raw(name)?;
        let specs: HashMap<String, PlaybookSpec> = self.parse(name, value)?;
        let mut playbooks: Vec<Playbook> = specs
            .into_iter()
            .map(|(id, spec)| Playbook {
                id,
                condition: spec.condition,
                actions: spec.actions,
            })
            .collect();
        playbooks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(playbooks)
    }

    /// Load `jsm-config.json`
    pub fn desk_config(&self) -> Result<DeskConfig, ConfigError> {
        let value = self.raw("jsm-config.json")?;
        self.parse("jsm-config.json", value)
    }

    /// Load `deploy-config.json`
    pub fn deploy_config(&self) -> Result<DeployConfig, ConfigError> {
        let value = self.raw("deploy-config.json")?;
        self.parse("deploy-config.json", value)
    }

    /// Pool settings from `deploy-config.json`'s `pool` section
    pub fn pool_config(&self) -> Result<PoolConfig, ConfigError> {
        let value = self.raw("deploy-config.json")?;
        match value.get("pool") {
            Some(section) => self.parse("deploy-config.json", section.clone()),
            None => Ok(PoolConfig::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(files: &[(&str, &str)]) -> (tempfile::TempDir, ConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            std::fs::write(dir.path().join(name), content).unwrap();
        }
        let store = ConfigStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn test_missing_file_is_distinct_from_invalid() {
        let (_dir, store) = store_with(&[]);
        assert!(matches!(
            store.monitoring_sources().unwrap_err(),
            ConfigError::Missing { .. }
        ));

        let (_dir, store) = store_with(&[("monitoring-sources.json", "{not json")]);
        assert!(matches!(
            store.monitoring_sources().unwrap_err(),
            ConfigError::Invalid { .. }
        ));
    }

    #[test]
    fn test_thresholds_require_critical_above_warning() {
        let (_dir, store) = store_with(&[(
            "alert-thresholds.json",
            r#"{"cpu": {"warning": 80, "critical": 95}}"#,
        )]);
        let thresholds = store.alert_thresholds().unwrap();
        assert_eq!(thresholds["cpu"].critical, 95.0);

        let (_dir, store) = store_with(&[(
            "alert-thresholds.json",
            r#"{"cpu": {"warning": 95, "critical": 80}}"#,
        )]);
        assert!(matches!(
            store.alert_thresholds().unwrap_err(),
            ConfigError::Invalid { .. }
        ));
    }

    #[test]
    fn test_playbooks_load_with_ids_from_keys() {
        let (_dir, store) = store_with(&[(
            "autoheal-playbooks.json",
            r#"{
                "disk-pressure": {
                    "condition": {"metric": "disk", "min_level": "warning"},
                    "actions": ["journalctl --vacuum-size=200M"]
                }
            }"#,
        )]);
        let playbooks = store.playbooks().unwrap();
        assert_eq!(playbooks.len(), 1);
        assert_eq!(playbooks[0].id, "disk-pressure");
        assert_eq!(playbooks[0].actions.len(), 1);
    }

    #[test]
    fn test_deploy_config_with_pool_section() {
        let (_dir, store) = store_with(&[(
            "deploy-config.json",
            r#"{
                "production_hosts": [
                    {"hostname": "web-01", "user": "deploy"},
                    {"hostname": "web-02", "user": "deploy"}
                ],
                "pool": {"max_connections": 4, "idle_timeout_ms": 5000}
            }"#,
        )]);
        let deploy = store.deploy_config().unwrap();
        assert_eq!(deploy.production_hosts.len(), 2);
        assert_eq!(deploy.stages.len(), 3, "default staircase applies");

        let pool = store.pool_config().unwrap();
        assert_eq!(pool.max_connections, 4);
        assert_eq!(pool.idle_timeout_ms, 5000);
    }

    #[test]
    fn test_loads_are_cached() {
        let (dir, store) = store_with(&[(
            "alert-thresholds.json",
            r#"{"cpu": {"warning": 80, "critical": 95}}"#,
        )]);
        store.alert_thresholds().unwrap();
        // Deleting the file after the first load does not matter.
        std::fs::remove_file(dir.path().join("alert-thresholds.json")).unwrap();
        assert!(store.alert_thresholds().is_ok());
    }
}
