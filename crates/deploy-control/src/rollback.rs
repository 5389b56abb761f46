//! Rollback controller
//!
//! Undoes a deployment by replaying its stages in reverse from the
//! pre-deploy backups left on each host. A forensic snapshot is captured
//! before any restore; failed steps never abort the remaining stages, they
//! only mark the record failed for a human to pick up.

use crate::approval::ApprovalHook;
use crate::config::DeployConfig;
use crate::controller::{failure_summary, generate_id};
use crate::error::{DeployError, DeployResult};
use crate::snapshot::{self, Snapshot};
use crate::store::DeploymentStore;
use crate::types::{Deployment, DeploymentStatus, StageRecord, StageStatus};
use chrono::{DateTime, Utc};
use ops_core::{Clock, Host};
use parking_lot::RwLock;
use remote_exec::{escape_single_quotes, ExecOptions, ExecRequest, ExecResult, RemoteExecutor};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Rollback step state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStepStatus {
    /// Stage reverted cleanly
    Completed,
    /// Restore or health check failed
    Failed,
}

/// One reverted stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackStep {
    /// Stage name
    pub stage: String,
    /// Step state
    pub status: RollbackStepStatus,
    /// Start timestamp
    pub started_at: DateTime<Utc>,
    /// Completion timestamp
    pub completed_at: DateTime<Utc>,
    /// Failure detail, when the step failed
    pub error: Option<String>,
}

/// Rollback record state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    /// Steps are executing
    InProgress,
    /// Every step and the verification passed
    Completed,
    /// At least one step or the verification failed
    Failed,
}

/// Record of one rollback run, appended to a bounded history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRecord {
    /// Rollback id
    pub id: String,
    /// Deployment reverted
    pub deployment_id: String,
    /// Operator- or gate-supplied reason
    pub reason: String,
    /// Reverted stages, in execution (reverse-promotion) order
    pub steps: Vec<RollbackStep>,
    /// Forensic capture taken before the first restore
    pub snapshot: Snapshot,
    /// Record state
    pub status: RollbackStatus,
    /// Start timestamp
    pub started_at: DateTime<Utc>,
    /// Completion timestamp
    pub completed_at: Option<DateTime<Utc>>,
}

/// Outcome of a gated database rollback
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DbRollbackOutcome {
    /// Whether the rollback command ran and succeeded
    pub success: bool,
    /// True when the request was refused and nothing ran
    pub dry_run: bool,
}

/// Reverse-order rollback controller
pub struct RollbackController {
    config: Arc<DeployConfig>,
    executor: Arc<dyn RemoteExecutor>,
    store: Arc<DeploymentStore>,
    approval: Arc<dyn ApprovalHook>,
    clock: Arc<dyn Clock>,
    history: RwLock<VecDeque<RollbackRecord>>,
}

impl RollbackController {
    /// Create a controller over shared collaborators
    pub fn new(
        config: Arc<DeployConfig>,
        executor: Arc<dyn RemoteExecutor>,
        store: Arc<DeploymentStore>,
        approval: Arc<dyn ApprovalHook>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            executor,
            store,
            approval,
            clock,
            history: RwLock::new(VecDeque::new()),
        }
    }

    /// Roll a deployment back
    ///
    /// With `partial` set, only stages still `failed`/`in_progress` are
    /// reverted; otherwise every successfully promoted stage is. Step
    /// failures are recorded and the remaining stages still run; any
    /// failure (including verification) leaves the record `failed`.
    pub async fn rollback(
        &self,
        deployment_id: &str,
        reason: &str,
        partial: bool,
    ) -> DeployResult<RollbackRecord> {
        let deployment =
            self.store
                .get(deployment_id)
                .ok_or_else(|| DeployError::DeploymentNotFound {
                    id: deployment_id.to_string(),
                })?;

        if !deployment.status.can_rollback() {
            return Err(DeployError::InvalidTransition {
                from: deployment.status.to_string(),
                to: DeploymentStatus::RolledBack.to_string(),
            });
        }

        let affected: Vec<StageRecord> = deployment
            .stages
            .iter()
            .filter(|s| {
                if partial {
                    matches!(s.status, StageStatus::Failed | StageStatus::InProgress)
                } else {
                    s.status == StageStatus::Success
                }
            })
            .cloned()
            .collect();

        info!(
            deployment = %deployment_id,
            reason = %reason,
            stages = affected.len(),
            partial,
            "rollback started"
        );

        let snapshot = self.capture_snapshot(&deployment, &affected).await;
        let mut record = RollbackRecord {
            id: generate_id("rollback", self.clock.as_ref()),
            deployment_id: deployment_id.to_string(),
            reason: reason.to_string(),
            steps: Vec::new(),
            snapshot,
            status: RollbackStatus::InProgress,
            started_at: self.clock.now(),
            completed_at: None,
        };

        // Reverse promotion order: the widest stage is reverted first.
        for stage in affected.iter().rev() {
            let step = self.rollback_stage(&deployment, stage).await;
            if step.status == RollbackStepStatus::Failed {
                warn!(
                    deployment = %deployment_id,
                    stage = %stage.name,
                    error = ?step.error,
                    "rollback step failed, continuing with remaining stages"
                );
            }
            record.steps.push(step);
        }

        let verify_ok = self.verify_rollback(&record).await;
        let any_step_failed = record
            .steps
            .iter()
            .any(|s| s.status == RollbackStepStatus::Failed);
        record.status = if any_step_failed || !verify_ok {
            RollbackStatus::Failed
        } else {
            RollbackStatus::Completed
        };
        record.completed_at = Some(self.clock.now());

        let completed_at = self.clock.now();
        self.store.update(deployment_id, |d| {
            d.status = DeploymentStatus::RolledBack;
            d.rollback_reason = Some(reason.to_string());
            d.completed_at = Some(completed_at);
        });

        self.push_history(record.clone());
        info!(deployment = %deployment_id, status = ?record.status, "rollback finished");
        Ok(record)
    }

    /// Recent rollback records, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<RollbackRecord> {
        self.history.read().iter().cloned().collect()
    }

    /// Capture host state for the first target of each affected stage
    async fn capture_snapshot(
        &self,
        deployment: &Deployment,
        affected: &[StageRecord],
    ) -> Snapshot {
        let mut sample_hosts: Vec<Host> = Vec::new();
        for stage in affected {
            if let Some(host) = self.config.stage_targets(&stage.name).first() {
                if !sample_hosts.iter().any(|h| h.pool_key() == host.pool_key()) {
                    sample_hosts.push(host.clone());
                }
            }
        }
        snapshot::capture(
            &self.executor,
            &deployment.id,
            &sample_hosts,
            self.clock.now(),
            self.config.command_timeout_ms,
        )
        .await
    }

    async fn rollback_stage(&self, deployment: &Deployment, stage: &StageRecord) -> RollbackStep {
        let started_at = self.clock.now();
        let outcome = self.rollback_stage_inner(deployment, stage).await;
        let (status, error) = match outcome {
            Ok(()) => (RollbackStepStatus::Completed, None),
            Err(e) => (RollbackStepStatus::Failed, Some(e.to_string())),
        };
        RollbackStep {
            stage: stage.name.clone(),
            status,
            started_at,
            completed_at: self.clock.now(),
            error,
        }
    }

    async fn rollback_stage_inner(
        &self,
        deployment: &Deployment,
        stage: &StageRecord,
    ) -> DeployResult<()> {
        let targets = self.config.stage_targets(&stage.name);
        if targets.is_empty() {
            return Err(DeployError::RestoreFailed {
                host: stage.name.clone(),
                reason: "no targets resolved".to_string(),
            });
        }

        let backup_dir = self.find_latest_backup(&targets).await?;
        self.restore_from_backup(deployment, &targets, &backup_dir)
            .await?;

        if self.config.restart_required {
            let command = format!(
                "systemctl restart '{}'",
                escape_single_quotes(&deployment.patch.service_name)
            );
            let result = self.exec(&targets, command).await?;
            if !result.success {
                return Err(DeployError::RestartFailed {
                    stage: stage.name.clone(),
                    reason: failure_summary(&result),
                });
            }
        }

        self.health_check(&stage.name, &targets, 3).await
    }

    /// Newest backup directory on the stage's first target
    async fn find_latest_backup(&self, targets: &[Host]) -> DeployResult<String> {
        let probe = &targets[..1];
        let command = format!("ls -td {}/backup-* | head -n 1", self.config.backup_root);
        let result = self.exec(probe, command).await?;
        let host_result = &result.results[0];
        let dir = host_result.stdout.trim();
        if !host_result.success || dir.is_empty() {
            return Err(DeployError::BackupNotFound {
                host: host_result.host.clone(),
            });
        }
        Ok(dir.to_string())
    }

    /// Copy each backed-up file back over its deployed path
    async fn restore_from_backup(
        &self,
        deployment: &Deployment,
        targets: &[Host],
        backup_dir: &str,
    ) -> DeployResult<()> {
        let parts: Vec<String> = deployment
            .patch
            .changes
            .iter()
            .map(|change| {
                let base = change.file.rsplit('/').next().unwrap_or(&change.file);
                format!(
                    "cp -r '{}/{}' '{}'",
                    escape_single_quotes(backup_dir),
                    escape_single_quotes(base),
                    escape_single_quotes(&change.file)
                )
            })
            .collect();

        let result = self.exec(targets, parts.join(" && ")).await?;
        if !result.success {
            let failed = result
                .results
                .iter()
                .find(|r| !r.success)
                .map(|r| r.host.clone())
                .unwrap_or_default();
            return Err(DeployError::RestoreFailed {
                host: failed,
                reason: failure_summary(&result),
            });
        }
        Ok(())
    }

    async fn health_check(&self, stage: &str, targets: &[Host], attempts: u32) -> DeployResult<()> {
        for attempt in 1..=attempts {
            let result = self
                .exec(targets, self.config.health_command.clone())
                .await?;
            if result.success {
                return Ok(());
            }
            if attempt < attempts {
                tokio::time::sleep(Duration::from_millis(
                    self.config.health_backoff_ms * u64::from(attempt),
                ))
                .await;
            }
        }
        Err(DeployError::HealthCheckFailed {
            stage: stage.to_string(),
            attempts,
        })
    }

    /// Health-check every reverted stage; false when any check fails
    async fn verify_rollback(&self, record: &RollbackRecord) -> bool {
        for step in &record.steps {
            if step.status != RollbackStepStatus::Completed {
                continue;
            }
            let targets = self.config.stage_targets(&step.stage);
            if targets.is_empty() {
                continue;
            }
            match self.health_check(&step.stage, &targets, 1).await {
                Ok(()) => {}
                Err(e) => {
                    warn!(stage = %step.stage, error = %e, "rollback verification failed");
                    return false;
                }
            }
        }
        true
    }

    /// Database rollback, gated behind critical approval
    ///
    /// Without an approver the request is refused and reported as a dry
    /// run; nothing touches the database.
    pub async fn db_rollback(&self, deployment_id: &str) -> DeployResult<DbRollbackOutcome> {
        let approved = self
            .approval
            .request_critical_approval("database-rollback")
            .await;
        if !approved {
            info!(deployment = %deployment_id, "database rollback refused, dry run");
            return Ok(DbRollbackOutcome {
                success: false,
                dry_run: true,
            });
        }

        let Some(command) = self.config.db_rollback_command.clone() else {
            return Ok(DbRollbackOutcome {
                success: false,
                dry_run: false,
            });
        };
        let result = self.exec(&self.config.production_hosts, command).await?;
        Ok(DbRollbackOutcome {
            success: result.success,
            dry_run: false,
        })
    }

    /// Flip the active traffic pool and wait for propagation
    pub async fn switch_traffic(&self, pool: &str, percentage: u8) -> DeployResult<()> {
        let command = self
            .config
            .traffic_command
            .replace("{pool}", pool)
            .replace("{percentage}", &percentage.to_string());
        let result = self.exec(&self.config.production_hosts, command).await?;
        if !result.success {
            return Err(DeployError::RestoreFailed {
                host: "traffic".to_string(),
                reason: failure_summary(&result),
            });
        }
        tokio::time::sleep(Duration::from_millis(self.config.traffic_propagation_ms)).await;
        Ok(())
    }

    /// Route all traffic back to the blue pool
    pub async fn traffic_rollback(&self) -> DeployResult<()> {
        self.switch_traffic("blue", 100).await
    }

    async fn exec(&self, targets: &[Host], command: String) -> DeployResult<ExecResult> {
        let request = ExecRequest {
            targets: targets.to_vec(),
            command,
            options: ExecOptions {
                timeout_ms: Some(self.config.command_timeout_ms),
                ..ExecOptions::default()
            },
        };
        Ok(self.executor.execute(request).await?)
    }

    fn push_history(&self, record: RollbackRecord) {
        let mut history = self.history.write();
        history.push_back(record);
        while history.len() > self.config.max_history {
            history.pop_front();
        }
    }
}
