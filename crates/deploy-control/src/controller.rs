//! Staged deployment controller
//!
//! Walks a deployment through the configured stage staircase. Every stage
//! runs the same sequence: pre-flight, backup, upload, restart, health
//! check, observation window, metric validation. A failed gate rolls back
//! every stage that already promoted.

use crate::approval::ApprovalHook;
use crate::config::{DeployConfig, StageConfig};
use crate::error::{DeployError, DeployResult};
use crate::metrics::{validate_metrics, MetricsSource};
use crate::rollback::RollbackController;
use crate::store::DeploymentStore;
use crate::types::{Deployment, DeploymentStatus, Patch, StageMetrics, StageRecord, StageStatus};
use ops_core::{Clock, Host};
use remote_exec::{escape_single_quotes, ExecOptions, ExecRequest, ExecResult, RemoteExecutor};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Cooperative cancellation handle for a running deployment
///
/// Checked between stage steps; a cancelled deployment fails its current
/// stage and triggers rollback of completed stages.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Create an un-cancelled handle
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

static LAST_ID_MS: AtomicI64 = AtomicI64::new(0);

/// Generate a `<prefix>-<epochMs>-<rand>` identifier
///
/// The millisecond component is strictly monotonic within the process so
/// ids sort in creation order even under bursts.
pub(crate) fn generate_id(prefix: &str, clock: &dyn Clock) -> String {
    let now_ms = clock.now().timestamp_millis();
    let claimed = loop {
        let last = LAST_ID_MS.load(Ordering::Relaxed);
        let candidate = now_ms.max(last + 1);
        if LAST_ID_MS
            .compare_exchange(last, candidate, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            break candidate;
        }
    };
    format!("{prefix}-{claimed}-{:04x}", rand::random::<u16>())
}

/// Hex sha256 of a string
pub(crate) fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

struct StageRun {
    metrics: StageMetrics,
}

/// Staged deployment controller
pub struct DeploymentController {
    config: Arc<DeployConfig>,
    executor: Arc<dyn RemoteExecutor>,
    metrics: Arc<dyn MetricsSource>,
    approval: Arc<dyn ApprovalHook>,
    store: Arc<DeploymentStore>,
    rollback: Arc<RollbackController>,
    clock: Arc<dyn Clock>,
}

impl DeploymentController {
    /// Create a controller over shared collaborators
    pub fn new(
        config: Arc<DeployConfig>,
        executor: Arc<dyn RemoteExecutor>,
        metrics: Arc<dyn MetricsSource>,
        approval: Arc<dyn ApprovalHook>,
        store: Arc<DeploymentStore>,
        rollback: Arc<RollbackController>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            executor,
            metrics,
            approval,
            store,
            rollback,
            clock,
        }
    }

    /// Snapshot a deployment by id
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Deployment> {
        self.store.get(id)
    }

    /// Snapshot every deployment, most recent first
    #[must_use]
    pub fn list(&self) -> Vec<Deployment> {
        self.store.list()
    }

    /// Roll a patch out through the stage staircase
    pub async fn deploy(&self, patch: Patch) -> DeployResult<Deployment> {
        self.deploy_with_cancel(patch, CancelHandle::new()).await
    }

    /// Roll a patch out with an external cancellation handle
    pub async fn deploy_with_cancel(
        &self,
        patch: Patch,
        cancel: CancelHandle,
    ) -> DeployResult<Deployment> {
        let id = generate_id("deploy", self.clock.as_ref());
        let now = self.clock.now();
        let mut deployment = Deployment {
            id: id.clone(),
            repository: patch.repository.clone(),
            patch,
            stages: Vec::new(),
            status: DeploymentStatus::Pending,
            started_at: now,
            completed_at: None,
            rollback_reason: None,
        };
        self.store.put(deployment.clone());

        deployment.status = DeploymentStatus::InProgress;
        self.store.put(deployment.clone());
        info!(deployment = %id, changes = deployment.patch.changes.len(), "deployment started");

        let stages = self.config.stages.clone();
        for stage_cfg in &stages {
            let targets = self.config.resolve_targets(stage_cfg);
            deployment.stages.push(StageRecord::begin(
                &stage_cfg.name,
                Some(stage_cfg.percentage),
                self.clock.now(),
            ));
            self.store.put(deployment.clone());
            info!(deployment = %id, stage = %stage_cfg.name, targets = targets.len(), "stage started");

            let outcome = self
                .run_stage(&deployment, stage_cfg, &targets, &cancel)
                .await;
            let idx = deployment.stages.len() - 1;

            match outcome {
                Ok(run) => {
                    let record = &mut deployment.stages[idx];
                    record.status = StageStatus::Success;
                    record.completed_at = Some(self.clock.now());
                    record.metrics = Some(run.metrics);
                    record.health_ok = Some(true);
                    self.store.put(deployment.clone());
                    info!(deployment = %id, stage = %stage_cfg.name, "stage promoted");

                    if stage_cfg.percentage >= 100 {
                        let approved = self
                            .approval
                            .request_approval(&deployment.id, &stage_cfg.name)
                            .await;
                        if !approved {
                            deployment.status = DeploymentStatus::AwaitingApproval;
                            self.store.put(deployment.clone());
                            info!(deployment = %id, stage = %stage_cfg.name, "halted awaiting approval");
                            return Ok(deployment);
                        }
                    }
                }
                Err(err) => {
                    let record = &mut deployment.stages[idx];
                    record.status = StageStatus::Failed;
                    record.completed_at = Some(self.clock.now());
                    if let DeployError::HealthCheckFailed { .. } = &err {
                        record.health_ok = Some(false);
                    }
                    self.store.put(deployment.clone());
                    warn!(deployment = %id, stage = %stage_cfg.name, error = %err, "stage failed, rolling back");

                    let reason = err.to_string();
                    if let Err(rollback_err) =
                        self.rollback.rollback(&deployment.id, &reason, false).await
                    {
                        error!(deployment = %id, error = %rollback_err, "automatic rollback failed");
                        self.store.update(&deployment.id, |d| {
                            d.status = DeploymentStatus::Failed;
                            d.completed_at = Some(now);
                            d.rollback_reason = Some(reason.clone());
                        });
                    }
                    return self
                        .store
                        .get(&deployment.id)
                        .ok_or(DeployError::DeploymentNotFound { id });
                }
            }
        }

        deployment.status = DeploymentStatus::Success;
        deployment.completed_at = Some(self.clock.now());
        self.store.put(deployment.clone());
        info!(deployment = %id, "deployment succeeded");
        Ok(deployment)
    }

    fn check_cancel(&self, cancel: &CancelHandle, stage: &str) -> DeployResult<()> {
        if cancel.is_cancelled() {
            return Err(DeployError::Cancelled {
                stage: stage.to_string(),
            });
        }
        Ok(())
    }

    async fn run_stage(
        &self,
        deployment: &Deployment,
        stage: &StageConfig,
        targets: &[Host],
        cancel: &CancelHandle,
    ) -> DeployResult<StageRun> {
        let name = stage.name.as_str();

        self.check_cancel(cancel, name)?;
        self.prepare_deployment(name, targets).await?;

        self.check_cancel(cancel, name)?;
        self.create_backup(deployment, name, targets).await?;

        for change in &deployment.patch.changes {
            self.check_cancel(cancel, name)?;
            self.upload_patched_file(name, targets, &change.file, &change.patched)
                .await?;
        }

        if self.config.restart_required {
            self.check_cancel(cancel, name)?;
            self.restart_services(name, targets, &deployment.patch.service_name)
                .await?;
        }

        self.check_cancel(cancel, name)?;
        self.health_check(name, targets, self.config.health_attempts)
            .await?;

        if self.config.monitoring_duration_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.monitoring_duration_ms)).await;
        }
        self.check_cancel(cancel, name)?;

        let metrics = self.metrics.sample(name).await?;
        let validation = validate_metrics(&metrics, &self.config.thresholds);
        if !validation.passed {
            return Err(DeployError::ThresholdViolated {
                stage: name.to_string(),
                reason: validation.reason.unwrap_or_else(|| "unknown".to_string()),
            });
        }

        Ok(StageRun { metrics })
    }

    /// Pre-flight: every target reachable with enough free disk
    async fn prepare_deployment(&self, stage: &str, targets: &[Host]) -> DeployResult<()> {
        if targets.is_empty() {
            return Err(DeployError::PreflightFailed {
                stage: stage.to_string(),
                reason: "no targets resolved".to_string(),
            });
        }

        let result = self
            .exec(targets, "df -Pk / | tail -n 1 | awk '{print $4}'".to_string())
            .await?;
        if !result.success {
            return Err(DeployError::PreflightFailed {
                stage: stage.to_string(),
                reason: format!("unreachable targets: {}", failure_summary(&result)),
            });
        }

        for host_result in &result.results {
            let free_kb: u64 = host_result.stdout.trim().parse().unwrap_or(0);
            if free_kb < self.config.min_free_disk_kb {
                return Err(DeployError::PreflightFailed {
                    stage: stage.to_string(),
                    reason: format!(
                        "insufficient disk on {}: {free_kb} kB free, need {}",
                        host_result.host, self.config.min_free_disk_kb
                    ),
                });
            }
        }
        Ok(())
    }

    /// Copy the files about to be replaced into a per-deploy backup directory
    async fn create_backup(
        &self,
        deployment: &Deployment,
        stage: &str,
        targets: &[Host],
    ) -> DeployResult<()> {
        let dir = format!(
            "{}/backup-{}-{}",
            self.config.backup_root,
            deployment.id,
            self.clock.now().timestamp_millis()
        );
        let files = deployment
            .patch
            .changes
            .iter()
            .map(|c| format!("'{}'", escape_single_quotes(&c.file)))
            .collect::<Vec<_>>()
            .join(" ");
        let command = format!("mkdir -p '{dir}' && cp -r {files} '{dir}/'");

        let result = self.exec(targets, command).await?;
        if !result.success {
            return Err(DeployError::BackupFailed {
                stage: stage.to_string(),
                reason: failure_summary(&result),
            });
        }
        Ok(())
    }

    /// Write one patched file to every target and verify the digest
    ///
    /// The upload streams over the transport when possible (SFTP-style
    /// write through stdin), falling back to a shell-escaped echo on hosts
    /// where streaming fails. Either way the contract is checked afterwards:
    /// the remote file's sha256 must equal the patched content's.
    async fn upload_patched_file(
        &self,
        stage: &str,
        targets: &[Host],
        file: &str,
        patched: &str,
    ) -> DeployResult<()> {
        let result = self.executor.upload(targets, file, patched).await?;
        if !result.success {
            return Err(DeployError::UploadFailed {
                stage: stage.to_string(),
                file: file.to_string(),
                reason: failure_summary(&result),
            });
        }

        let expected = sha256_hex(patched);
        let command = format!(
            "sha256sum '{}' | awk '{{print $1}}'",
            escape_single_quotes(file)
        );
        let verify = self.exec(targets, command).await?;
        for host_result in &verify.results {
            if host_result.stdout.trim() != expected {
                return Err(DeployError::UploadFailed {
                    stage: stage.to_string(),
                    file: file.to_string(),
                    reason: format!("digest mismatch on {}", host_result.host),
                });
            }
        }
        Ok(())
    }

    async fn restart_services(
        &self,
        stage: &str,
        targets: &[Host],
        service: &str,
    ) -> DeployResult<()> {
        let command = format!("systemctl restart '{}'", escape_single_quotes(service));
        let result = self.exec(targets, command).await?;
        if !result.success {
            return Err(DeployError::RestartFailed {
                stage: stage.to_string(),
                reason: failure_summary(&result),
            });
        }
        Ok(())
    }

    /// Run the health command with linear backoff between attempts
    async fn health_check(
        &self,
        stage: &str,
        targets: &[Host],
        attempts: u32,
    ) -> DeployResult<()> {
        for attempt in 1..=attempts {
            let result = self
                .exec(targets, self.config.health_command.clone())
                .await?;
            if result.success {
                return Ok(());
            }
            warn!(
                stage = %stage,
                attempt,
                failed = ?result.failed_hosts(),
                "health check attempt failed"
            );
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
}

/// Summarize the failed hosts of a fan-out result
pub(crate) fn failure_summary(result: &ExecResult) -> String {
    let parts: Vec<String> = result
        .results
        .iter()
        .filter(|r| !r.success)
        .map(|r| {
            let detail = r
                .error
                .clone()
                .unwrap_or_else(|| r.stderr.trim().to_string());
            format!("{}: {detail}", r.host)
        })
        .collect();
    parts.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ops_core::SystemClock;

    #[test]
    fn test_generated_ids_are_monotonic() {
        let clock = SystemClock;
        let a = generate_id("deploy", &clock);
        let b = generate_id("deploy", &clock);
        let ms = |id: &str| -> i64 {
            id.split('-').nth(1).and_then(|s| s.parse().ok()).unwrap()
        };
        assert!(ms(&b) > ms(&a));
        assert!(a.starts_with("deploy-"));
    }

    #[test]
    fn test_sha256_hex_matches_known_vector() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
