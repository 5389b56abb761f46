//! Deployment configuration

use ops_core::Host;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One stage of the rollout staircase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Stage name
    pub name: String,
    /// Fleet percentage the stage covers
    pub percentage: u8,
    /// Explicit target list; when absent, a percentage slice of the
    /// production fleet is used
    #[serde(default)]
    pub targets: Option<Vec<Host>>,
}

impl StageConfig {
    /// The default canary staircase
    #[must_use]
    pub fn default_staircase() -> Vec<Self> {
        vec![
            Self {
                name: "canary-10".to_string(),
                percentage: 10,
                targets: None,
            },
            Self {
                name: "canary-50".to_string(),
                percentage: 50,
                targets: None,
            },
            Self {
                name: "production-100".to_string(),
                percentage: 100,
                targets: None,
            },
        ]
    }
}

/// Metric thresholds gating stage promotion
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MetricThresholds {
    /// Maximum error rate, percent
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate: f64,
    /// Maximum mean response time, milliseconds
    #[serde(default = "default_max_response_time_ms")]
    pub max_response_time_ms: f64,
    /// Maximum CPU utilization, percent
    #[serde(default = "default_max_cpu")]
    pub max_cpu: f64,
    /// Maximum memory utilization, percent
    #[serde(default = "default_max_memory")]
    pub max_memory: f64,
}

fn default_max_error_rate() -> f64 {
    1.0
}
fn default_max_response_time_ms() -> f64 {
    500.0
}
fn default_max_cpu() -> f64 {
    80.0
}
fn default_max_memory() -> f64 {
    85.0
}

impl Default for MetricThresholds {
    fn default() -> Self {
        Self {
            max_error_rate: default_max_error_rate(),
            max_response_time_ms: default_max_response_time_ms(),
            max_cpu: default_max_cpu(),
            max_memory: default_max_memory(),
        }
    }
}

/// Deployment controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Rollout staircase, in promotion order
    #[serde(default = "StageConfig::default_staircase")]
    pub stages: Vec<StageConfig>,

    /// Full production fleet, sliced for percentage stages
    #[serde(default)]
    pub production_hosts: Vec<Host>,

    /// Health command; exit 0 means healthy
    #[serde(default = "default_health_command")]
    pub health_command: String,

    /// Health check attempts per stage
    #[serde(default = "default_health_attempts")]
    pub health_attempts: u32,

    /// Linear backoff base between health attempts
    #[serde(default = "default_health_backoff_ms")]
    pub health_backoff_ms: u64,

    /// Whether stages restart the service after uploads
    #[serde(default = "default_true")]
    pub restart_required: bool,

    /// Observation window before sampling stage metrics
    #[serde(default = "default_monitoring_duration_ms")]
    pub monitoring_duration_ms: u64,

    /// Promotion thresholds
    #[serde(default)]
    pub thresholds: MetricThresholds,

    /// Remote directory holding per-deploy backups
    #[serde(default = "default_backup_root")]
    pub backup_root: String,

    /// Per-command deadline for stage commands
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Minimum free disk on targets before a stage starts, kilobytes
    #[serde(default = "default_min_free_disk_kb")]
    pub min_free_disk_kb: u64,

    /// Rollback records retained
    #[serde(default = "default_max_history")]
    pub max_history: usize,

    /// Database rollback command, run only with critical approval
    #[serde(default)]
    pub db_rollback_command: Option<String>,

    /// Traffic switch command template (`{pool}` / `{percentage}`)
    #[serde(default = "default_traffic_command")]
    pub traffic_command: String,

    /// Settle time after a traffic switch
    #[serde(default = "default_traffic_propagation_ms")]
    pub traffic_propagation_ms: u64,
}

fn default_health_command() -> String {
    "/usr/local/bin/healthcheck".to_string()
}
fn default_health_attempts() -> u32 {
    3
}
fn default_health_backoff_ms() -> u64 {
    1000
}
fn default_true() -> bool {
    true
}
fn default_monitoring_duration_ms() -> u64 {
    30_000
}
fn default_backup_root() -> String {
    "/var/backups/medulla".to_string()
}
fn default_command_timeout_ms() -> u64 {
    60_000
}
fn default_min_free_disk_kb() -> u64 {
    524_288
}
fn default_max_history() -> usize {
    100
}
fn default_traffic_command() -> String {
    "lbctl switch {pool} {percentage}".to_string()
}
fn default_traffic_propagation_ms() -> u64 {
    5_000
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            stages: StageConfig::default_staircase(),
            production_hosts: Vec::new(),
            health_command: default_health_command(),
            health_attempts: default_health_attempts(),
            health_backoff_ms: default_health_backoff_ms(),
            restart_required: true,
            monitoring_duration_ms: default_monitoring_duration_ms(),
            thresholds: MetricThresholds::default(),
            backup_root: default_backup_root(),
            command_timeout_ms: default_command_timeout_ms(),
            min_free_disk_kb: default_min_free_disk_kb(),
            max_history: default_max_history(),
            db_rollback_command: None,
            traffic_command: default_traffic_command(),
            traffic_propagation_ms: default_traffic_propagation_ms(),
        }
    }
}

impl DeployConfig {
    /// Per-command deadline as a `Duration`
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Resolve the concrete target list for a stage configuration
    ///
    /// Explicit targets win; otherwise a leading percentage slice of the
    /// production fleet is taken (at least one host when the fleet is
    /// non-empty).
    #[must_use]
    pub fn resolve_targets(&self, stage: &StageConfig) -> Vec<Host> {
        if let Some(targets) = &stage.targets {
            return targets.clone();
        }
        if self.production_hosts.is_empty() {
            return Vec::new();
        }
        let count = (self.production_hosts.len() * usize::from(stage.percentage)).div_ceil(100);
        self.production_hosts
            .iter()
            .take(count.max(1))
            .cloned()
            .collect()
    }

    /// Resolve targets by stage name
    ///
    /// Unknown stage names fall back to the full production host list. That
    /// fallback is deliberate and load-bearing for operator-invoked
    /// rollbacks of renamed stages; a warning is logged so it is visible.
    #[must_use]
    pub fn stage_targets(&self, name: &str) -> Vec<Host> {
        match self.stages.iter().find(|s| s.name == name) {
            Some(stage) => self.resolve_targets(stage),
            None => {
                tracing::warn!(stage = %name, "unknown stage, falling back to production hosts");
                self.production_hosts.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fleet(n: usize) -> Vec<Host> {
        (0..n)
            .map(|i| Host::new(format!("web-{i:02}"), "deploy"))
            .collect()
    }

    #[test]
    fn test_percentage_slice_rounds_up() {
        let config = DeployConfig {
            production_hosts: fleet(10),
            ..Default::default()
        };
        assert_eq!(config.stage_targets("canary-10").len(), 1);
        assert_eq!(config.stage_targets("canary-50").len(), 5);
        assert_eq!(config.stage_targets("production-100").len(), 10);
    }

    #[test]
    fn test_small_fleet_gets_at_least_one_canary() {
        let config = DeployConfig {
            production_hosts: fleet(3),
            ..Default::default()
        };
        assert_eq!(config.stage_targets("canary-10").len(), 1);
    }

    #[test]
    fn test_unknown_stage_falls_back_to_production() {
        let config = DeployConfig {
            production_hosts: fleet(4),
            ..Default::default()
        };
        assert_eq!(config.stage_targets("does-not-exist").len(), 4);
    }

    #[test]
    fn test_explicit_targets_win() {
        let mut config = DeployConfig {
            production_hosts: fleet(10),
            ..Default::default()
        };
        config.stages[0].targets = Some(fleet(2));
        assert_eq!(config.stage_targets("canary-10").len(), 2);
    }
}
