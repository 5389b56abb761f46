//! Staged deployment and rollback control
//!
//! This crate drives Medulla's remediation path:
//! - A deployment controller walking canary stages with backups, uploads,
//!   service restarts, health checks, and metric-gated promotion
//! - A rollback controller replaying promoted stages in reverse from
//!   on-host backups, with forensic snapshots and a bounded history
//! - Pluggable approval hooks (default deny) gating production promotion
//!   and destructive operations

#![warn(missing_docs)]

pub mod approval;
pub mod config;
pub mod controller;
pub mod error;
pub mod metrics;
pub mod rollback;
pub mod snapshot;
pub mod store;
pub mod types;

pub use approval::{ApprovalHook, DenyAll};
pub use config::{DeployConfig, MetricThresholds, StageConfig};
pub use controller::{CancelHandle, DeploymentController};
pub use error::{DeployError, DeployResult};
pub use metrics::{validate_metrics, MetricsSource, ValidationOutcome};
pub use rollback::{
    DbRollbackOutcome, RollbackController, RollbackRecord, RollbackStatus, RollbackStep,
    RollbackStepStatus,
};
pub use snapshot::{HostState, Snapshot};
pub use store::DeploymentStore;
pub use types::{
    Deployment, DeploymentStatus, FileChange, Patch, StageMetrics, StageRecord, StageStatus,
};
