//! Auto-heal playbooks and outcomes
//!
//! Playbooks pair a matching condition with remediation actions. The
//! orchestrator reflects their outcomes back onto the incident ticket.

use crate::alert::{Alert, AlertLevel};
use serde::{Deserialize, Serialize};

/// Condition a playbook fires on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookCondition {
    /// Metric the playbook handles
    pub metric: String,
    /// Minimum severity
    #[serde(default = "default_min_level")]
    pub min_level: AlertLevel,
}

fn default_min_level() -> AlertLevel {
    AlertLevel::High
}

/// A named remediation scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    /// Scenario id
    pub id: String,
    /// Firing condition
    pub condition: PlaybookCondition,
    /// Shell actions, run in order through the executor
    pub actions: Vec<String>,
}

impl Playbook {
    /// Whether this playbook applies to an alert
    #[must_use]
    pub fn matches(&self, alert: &Alert) -> bool {
        alert.should_auto_heal
            && alert.metric == self.condition.metric
            && alert.level >= self.condition.min_level
    }
}

/// Pick the first playbook matching an alert
#[must_use]
pub fn match_playbook<'a>(playbooks: &'a [Playbook], alert: &Alert) -> Option<&'a Playbook> {
    playbooks.iter().find(|p| p.matches(alert))
}

/// One executed remediation action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealAction {
    /// Command that ran
    pub command: String,
    /// Whether it exited zero everywhere
    pub success: bool,
    /// Trimmed output, when any
    #[serde(default)]
    pub output: Option<String>,
}

/// Outcome of one auto-heal run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealResult {
    /// Playbook that ran
    pub playbook: String,
    /// Whether every action succeeded
    pub success: bool,
    /// Wall-clock duration
    pub duration_ms: u64,
    /// Per-action detail
    pub actions: Vec<HealAction>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn alert(metric: &str, level: AlertLevel, auto_heal: bool) -> Alert {
        Alert {
            id: "a-1".to_string(),
            metric: metric.to_string(),
            value: 97.0,
            threshold: Some(90.0),
            level,
            message: "saturated".to_string(),
            timestamp: Utc::now(),
            should_auto_heal: auto_heal,
            metadata: BTreeMap::new(),
        }
    }

    fn playbooks() -> Vec<Playbook> {
        vec![
            Playbook {
                id: "disk-pressure".to_string(),
                condition: PlaybookCondition {
                    metric: "disk".to_string(),
                    min_level: AlertLevel::Warning,
                },
                actions: vec!["journalctl --vacuum-size=200M".to_string()],
            },
            Playbook {
                id: "cpu-runaway".to_string(),
                condition: PlaybookCondition {
                    metric: "cpu".to_string(),
                    min_level: AlertLevel::High,
                },
                actions: vec!["systemctl restart storefront".to_string()],
            },
        ]
    }

    #[test]
    fn test_matching_respects_metric_and_level() {
        let books = playbooks();
        assert_eq!(
            match_playbook(&books, &alert("cpu", AlertLevel::High, true)).map(|p| p.id.as_str()),
            Some("cpu-runaway")
        );
        assert!(match_playbook(&books, &alert("cpu", AlertLevel::Warning, true)).is_none());
        assert!(match_playbook(&books, &alert("network", AlertLevel::Critical, true)).is_none());
    }

    #[test]
    fn test_auto_heal_flag_gates_matching() {
        let books = playbooks();
        assert!(match_playbook(&books, &alert("cpu", AlertLevel::Critical, false)).is_none());
    }
}
