//! Promotion gates
//!
//! Stage metrics are sampled from an external monitoring source (the
//! platform never collects its own) and validated against the configured
//! thresholds. The first violated rule produces the human-readable reason
//! recorded on the deployment.

use crate::config::MetricThresholds;
use crate::error::DeployResult;
use crate::types::StageMetrics;
use async_trait::async_trait;
use serde::Serialize;

/// Outcome of threshold validation
#[derive(Debug, Clone, Serialize)]
pub struct ValidationOutcome {
    /// Whether every rule passed
    pub passed: bool,
    /// First violated rule, when one was
    pub reason: Option<String>,
}

/// Validate sampled metrics against promotion thresholds
///
/// Rules are checked in a fixed order (error rate, response time, CPU,
/// memory) so the recorded reason is deterministic.
#[must_use]
pub fn validate_metrics(
    metrics: &StageMetrics,
    thresholds: &MetricThresholds,
) -> ValidationOutcome {
    let rules: [(&str, f64, f64); 4] = [
        ("errorRate", metrics.error_rate, thresholds.max_error_rate),
        (
            "responseTime",
            metrics.response_time_ms,
            thresholds.max_response_time_ms,
        ),
        ("cpu", metrics.cpu, thresholds.max_cpu),
        ("memory", metrics.memory, thresholds.max_memory),
    ];

    for (name, value, max) in rules {
        if value > max {
            return ValidationOutcome {
                passed: false,
                reason: Some(format!("{name} {value:.2} exceeds threshold {max:.2}")),
            };
        }
    }

    ValidationOutcome {
        passed: true,
        reason: None,
    }
}

/// Source of stage metrics
///
/// Production wires this to the monitoring pipeline's artifact store; tests
/// script it per stage.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Sample metrics for the named stage
    async fn sample(&self, stage: &str) -> DeployResult<StageMetrics>;
}
