//! Deployment and rollback error types

use thiserror::Error;

/// Deployment and rollback error types
#[derive(Debug, Error)]
pub enum DeployError {
    /// No deployment registered under the id
    #[error("Deployment not found: {id}")]
    DeploymentNotFound {
        /// Requested deployment id
        id: String,
    },

    /// Pre-flight checks (disk, reachability) rejected the stage
    #[error("Pre-flight failed for stage {stage}: {reason}")]
    PreflightFailed {
        /// Stage name
        stage: String,
        /// What failed
        reason: String,
    },

    /// Creating the pre-deploy backup failed
    #[error("Backup failed for stage {stage}: {reason}")]
    BackupFailed {
        /// Stage name
        stage: String,
        /// What failed
        reason: String,
    },

    /// Writing a patched file to targets failed
    #[error("Upload of {file} failed for stage {stage}: {reason}")]
    UploadFailed {
        /// Stage name
        stage: String,
        /// Remote file path
        file: String,
        /// What failed
        reason: String,
    },

    /// Service restart failed
    #[error("Restart failed for stage {stage}: {reason}")]
    RestartFailed {
        /// Stage name
        stage: String,
        /// What failed
        reason: String,
    },

    /// Every health-check attempt failed
    #[error("Health check failed for stage {stage} after {attempts} attempts")]
    HealthCheckFailed {
        /// Stage name
        stage: String,
        /// Attempts made
        attempts: u32,
    },

    /// The monitoring source had no usable sample for the stage
    #[error("Metrics unavailable for stage {stage}: {reason}")]
    MetricsUnavailable {
        /// Stage name
        stage: String,
        /// What was missing
        reason: String,
    },

    /// Stage metrics violated a promotion threshold
    #[error("Metric threshold violated in stage {stage}: {reason}")]
    ThresholdViolated {
        /// Stage name
        stage: String,
        /// First violated rule, human-readable
        reason: String,
    },

    /// No backup directory exists for a host being reverted
    #[error("No backup found on {host}")]
    BackupNotFound {
        /// Host key
        host: String,
    },

    /// Copying a backup back into place failed
    #[error("Restore failed on {host}: {reason}")]
    RestoreFailed {
        /// Host key
        host: String,
        /// What failed
        reason: String,
    },

    /// Post-rollback verification failed
    #[error("Rollback verification failed for stage {stage}")]
    RollbackVerifyFailed {
        /// Stage name
        stage: String,
    },

    /// Requested state change is not allowed
    #[error("Invalid deployment transition from {from} to {to}")]
    InvalidTransition {
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// The operation was cancelled by its handle
    #[error("Deployment cancelled during {stage}")]
    Cancelled {
        /// Stage in flight when cancelled
        stage: String,
    },

    /// Remote execution layer failure
    #[error(transparent)]
    Exec(#[from] remote_exec::RemoteExecError),
}

/// Result alias for deployment operations
pub type DeployResult<T> = Result<T, DeployError>;
