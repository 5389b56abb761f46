//! Approval hooks
//!
//! Production promotion and destructive operations are gated behind
//! pluggable async approvers. The default denies everything; deployments
//! then halt at `awaiting_approval` and critical operations stay dry-run
//! until an external approval channel is wired in.

use async_trait::async_trait;
use tracing::info;

/// Pluggable approver for promotion and critical operations
#[async_trait]
pub trait ApprovalHook: Send + Sync {
    /// Approve promoting the named stage of a deployment
    async fn request_approval(&self, deployment_id: &str, stage: &str) -> bool;

    /// Approve a destructive operation (database rollback, traffic flip)
    async fn request_critical_approval(&self, action: &str) -> bool;
}

/// Default approver: refuses everything
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

#[async_trait]
impl ApprovalHook for DenyAll {
    async fn request_approval(&self, deployment_id: &str, stage: &str) -> bool {
        info!(deployment = %deployment_id, stage = %stage, "approval requested, no approver wired: denying");
        false
    }

    async fn request_critical_approval(&self, action: &str) -> bool {
        info!(action = %action, "critical approval requested, no approver wired: denying");
        false
    }
}
