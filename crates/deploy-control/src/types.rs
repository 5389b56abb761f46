//! Deployment records and state machine types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One file replaced by a patch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    /// Absolute remote path
    pub file: String,
    /// Content currently deployed
    pub original: String,
    /// Content to deploy
    pub patched: String,
}

/// An immutable set of file changes to roll out
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patch {
    /// Patch id
    pub id: String,
    /// Files to replace
    pub changes: Vec<FileChange>,
    /// Source repository
    pub repository: String,
    /// Service restarted after upload
    pub service_name: String,
}

/// Deployment lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Registered, not yet started
    Pending,
    /// Stages are executing
    InProgress,
    /// All stages promoted
    Success,
    /// A stage failed before rollback could run
    Failed,
    /// Final stage passed its gates; waiting on an approver
    AwaitingApproval,
    /// Stages were reverted
    RolledBack,
}

impl DeploymentStatus {
    /// Get string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::AwaitingApproval => "awaiting_approval",
            Self::RolledBack => "rolled_back",
        }
    }

    /// Whether a rollback may start from this state
    #[must_use]
    pub fn can_rollback(&self) -> bool {
        matches!(self, Self::InProgress | Self::AwaitingApproval)
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stage lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Declared, not started
    Pending,
    /// Executing
    InProgress,
    /// Passed every gate
    Success,
    /// A step or gate failed
    Failed,
    /// Skipped (fail-fast or cancellation)
    Skipped,
}

/// Metrics sampled for one stage's observation window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageMetrics {
    /// Error rate, percent
    pub error_rate: f64,
    /// Mean response time, milliseconds
    pub response_time_ms: f64,
    /// CPU utilization, percent
    pub cpu: f64,
    /// Memory utilization, percent
    pub memory: f64,
}

/// Execution record for one stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage name
    pub name: String,
    /// Fleet percentage the stage targets
    pub percentage: Option<u8>,
    /// Stage state
    pub status: StageStatus,
    /// Start timestamp
    pub started_at: DateTime<Utc>,
    /// Completion timestamp
    pub completed_at: Option<DateTime<Utc>>,
    /// Metrics sampled after the stage, when it got that far
    pub metrics: Option<StageMetrics>,
    /// Health check outcome, when it ran
    pub health_ok: Option<bool>,
}

impl StageRecord {
    /// Begin a stage record
    #[must_use]
    pub fn begin(name: &str, percentage: Option<u8>, now: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            percentage,
            status: StageStatus::InProgress,
            started_at: now,
            completed_at: None,
            metrics: None,
            health_ok: None,
        }
    }
}

/// A staged rollout of one patch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    /// Deployment id (`deploy-<epochMs>-<rand>`)
    pub id: String,
    /// The patch being rolled out
    pub patch: Patch,
    /// Source repository
    pub repository: String,
    /// Stage records, append-only during execution
    pub stages: Vec<StageRecord>,
    /// Lifecycle state
    pub status: DeploymentStatus,
    /// Start timestamp
    pub started_at: DateTime<Utc>,
    /// Completion timestamp
    pub completed_at: Option<DateTime<Utc>>,
    /// Why the deployment was rolled back, when it was
    pub rollback_reason: Option<String>,
}

impl Deployment {
    /// Stage records that completed successfully, in execution order
    #[must_use]
    pub fn successful_stages(&self) -> Vec<&StageRecord> {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Success)
            .collect()
    }
}
