//! End-to-end staged rollout and rollback scenarios against scripted fakes

use async_trait::async_trait;
use deploy_control::{
    ApprovalHook, CancelHandle, DenyAll, DeployConfig, DeployError, DeploymentController,
    DeploymentStatus, DeploymentStore, FileChange, MetricsSource, Patch, RollbackController,
    RollbackStatus, RollbackStepStatus, StageMetrics, StageStatus,
};
use ops_core::{Host, SystemClock};
use parking_lot::Mutex;
use remote_exec::{ExecRequest, ExecResult, HostResult, RemoteExecResult, RemoteExecutor};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

/// Scripted in-memory stand-in for the SSH fan-out executor
#[derive(Default)]
struct FakeExecutor {
    commands: Mutex<Vec<String>>,
    files: Mutex<HashMap<String, String>>,
    fail_contains: Mutex<Vec<(String, u32)>>,
    empty_backup_listing: Mutex<bool>,
}

impl FakeExecutor {
    fn fail_commands_containing(&self, needle: &str, exit_code: u32) {
        self.fail_contains
            .lock()
            .push((needle.to_string(), exit_code));
    }

    fn respond(&self, command: &str) -> (String, u32) {
        for (needle, code) in self.fail_contains.lock().iter() {
            if command.contains(needle.as_str()) {
                return (String::new(), *code);
            }
        }
        if command.starts_with("sha256sum '") {
            let path = command
                .trim_start_matches("sha256sum '")
                .split('\'')
                .next()
                .unwrap_or("");
            let content = self.files.lock().get(path).cloned().unwrap_or_default();
            let mut hasher = Sha256::new();
            hasher.update(content.as_bytes());
            let digest: String = hasher
                .finalize()
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect();
            return (format!("{digest}\n"), 0);
        }
        if command.starts_with("ls -td") {
            if *self.empty_backup_listing.lock() {
                return (String::new(), 1);
            }
            return ("/var/backups/medulla/backup-deploy-1-100\n".to_string(), 0);
        }
        if command.contains("df -Pk") {
            return ("99999999\n".to_string(), 0);
        }
        ("ok\n".to_string(), 0)
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    async fn execute(&self, request: ExecRequest) -> RemoteExecResult<ExecResult> {
        self.commands.lock().push(request.command.clone());
        let (stdout, exit_code) = self.respond(&request.command);
        let results: Vec<HostResult> = request
            .targets
            .iter()
            .map(|host| HostResult {
                host: host.pool_key(),
                stdout: stdout.clone(),
                stderr: String::new(),
                exit_code: Some(exit_code),
                success: exit_code == 0,
                duration_ms: 1,
                error: None,
            })
            .collect();
        let success = results.iter().all(|r| r.success);
        Ok(ExecResult { success, results })
    }

    async fn upload(
        &self,
        targets: &[Host],
        remote_path: &str,
        content: &str,
    ) -> RemoteExecResult<ExecResult> {
        self.files
            .lock()
            .insert(remote_path.to_string(), content.to_string());
        let results: Vec<HostResult> = targets
            .iter()
            .map(|host| HostResult {
                host: host.pool_key(),
                stdout: String::new(),
                stderr: String::new(),
                exit_code: Some(0),
                success: true,
                duration_ms: 1,
                error: None,
            })
            .collect();
        Ok(ExecResult {
            success: true,
            results,
        })
    }
}

/// Per-stage scripted metrics
struct ScriptedMetrics {
    per_stage: Mutex<HashMap<String, StageMetrics>>,
}

impl ScriptedMetrics {
    fn passing() -> Arc<Self> {
        Arc::new(Self {
            per_stage: Mutex::new(HashMap::new()),
        })
    }

    fn set(&self, stage: &str, metrics: StageMetrics) {
        self.per_stage.lock().insert(stage.to_string(), metrics);
    }
}

#[async_trait]
impl MetricsSource for ScriptedMetrics {
    async fn sample(&self, stage: &str) -> Result<StageMetrics, DeployError> {
        Ok(self
            .per_stage
            .lock()
            .get(stage)
            .copied()
            .unwrap_or(StageMetrics {
                error_rate: 0.1,
                response_time_ms: 120.0,
                cpu: 35.0,
                memory: 40.0,
            }))
    }
}

struct ApproveAll;

#[async_trait]
impl ApprovalHook for ApproveAll {
    async fn request_approval(&self, _deployment_id: &str, _stage: &str) -> bool {
        true
    }

    async fn request_critical_approval(&self, _action: &str) -> bool {
        true
    }
}

struct Harness {
    controller: DeploymentController,
    rollback: Arc<RollbackController>,
    executor: Arc<FakeExecutor>,
    metrics: Arc<ScriptedMetrics>,
}

fn harness(approval: Arc<dyn ApprovalHook>) -> Harness {
    let config = Arc::new(DeployConfig {
        production_hosts: (0..4)
            .map(|i| Host::new(format!("web-{i:02}"), "deploy"))
            .collect(),
        health_backoff_ms: 1,
        monitoring_duration_ms: 0,
        command_timeout_ms: 1000,
        traffic_propagation_ms: 0,
        ..Default::default()
    });
    let executor = Arc::new(FakeExecutor::default());
    let metrics = ScriptedMetrics::passing();
    let store = Arc::new(DeploymentStore::new());
    let clock = Arc::new(SystemClock);
    let rollback = Arc::new(RollbackController::new(
        config.clone(),
        executor.clone(),
        store.clone(),
        approval.clone(),
        clock.clone(),
    ));
    let controller = DeploymentController::new(
        config,
        executor.clone(),
        metrics.clone(),
        approval,
        store,
        rollback.clone(),
        clock,
    );
    Harness {
        controller,
        rollback,
        executor,
        metrics,
    }
}

fn sample_patch() -> Patch {
    Patch {
        id: "patch-7".to_string(),
        changes: vec![FileChange {
            file: "/srv/app/config/settings.py".to_string(),
            original: "RETRIES = 1\n".to_string(),
            patched: "RETRIES = 3\n".to_string(),
        }],
        repository: "acme/storefront".to_string(),
        service_name: "storefront".to_string(),
    }
}

#[tokio::test]
async fn test_full_staircase_with_approval_succeeds() {
    let h = harness(Arc::new(ApproveAll));
    let deployment = h.controller.deploy(sample_patch()).await.unwrap();

    assert_eq!(deployment.status, DeploymentStatus::Success);
    assert_eq!(deployment.stages.len(), 3);
    assert!(deployment
        .stages
        .iter()
        .all(|s| s.status == StageStatus::Success));
    assert!(deployment.stages[0].metrics.is_some());
    assert!(deployment.completed_at.is_some());
    assert!(h.rollback.history().is_empty());

    // The stage sequence ran backup before upload before restart.
    let commands = h.executor.commands.lock();
    let backup_idx = commands
        .iter()
        .position(|c| c.starts_with("mkdir -p"))
        .unwrap();
    let verify_idx = commands
        .iter()
        .position(|c| c.starts_with("sha256sum"))
        .unwrap();
    let restart_idx = commands
        .iter()
        .position(|c| c.starts_with("systemctl restart"))
        .unwrap();
    assert!(backup_idx < verify_idx);
    assert!(verify_idx < restart_idx);
}

#[tokio::test]
async fn test_default_deny_halts_awaiting_approval() {
    let h = harness(Arc::new(DenyAll));
    let deployment = h.controller.deploy(sample_patch()).await.unwrap();

    assert_eq!(deployment.status, DeploymentStatus::AwaitingApproval);
    // Every stage passed its gates; nothing was rolled back.
    assert!(deployment
        .stages
        .iter()
        .all(|s| s.status == StageStatus::Success));
    assert!(h.rollback.history().is_empty());
}

#[tokio::test]
async fn test_production_threshold_violation_rolls_back_in_reverse() {
    let h = harness(Arc::new(ApproveAll));
    h.metrics.set(
        "production-100",
        StageMetrics {
            error_rate: 2.0,
            response_time_ms: 120.0,
            cpu: 35.0,
            memory: 40.0,
        },
    );

    let deployment = h.controller.deploy(sample_patch()).await.unwrap();

    assert_eq!(deployment.status, DeploymentStatus::RolledBack);
    let reason = deployment.rollback_reason.unwrap();
    assert!(reason.contains("errorRate"), "reason was: {reason}");

    assert_eq!(deployment.stages[0].status, StageStatus::Success);
    assert_eq!(deployment.stages[1].status, StageStatus::Success);
    assert_eq!(deployment.stages[2].status, StageStatus::Failed);

    let history = h.rollback.history();
    assert_eq!(history.len(), 1);
    let record = &history[0];
    assert_eq!(record.status, RollbackStatus::Completed);
    let step_stages: Vec<&str> = record.steps.iter().map(|s| s.stage.as_str()).collect();
    assert_eq!(step_stages, vec!["canary-50", "canary-10"]);
    assert!(record
        .steps
        .iter()
        .all(|s| s.status == RollbackStepStatus::Completed));
    assert!(!record.snapshot.state.is_empty());
}

#[tokio::test]
async fn test_first_stage_health_failure_rolls_back_nothing() {
    let h = harness(Arc::new(ApproveAll));
    h.executor
        .fail_commands_containing("/usr/local/bin/healthcheck", 1);

    let deployment = h.controller.deploy(sample_patch()).await.unwrap();

    assert_eq!(deployment.status, DeploymentStatus::RolledBack);
    assert_eq!(deployment.stages.len(), 1);
    assert_eq!(deployment.stages[0].status, StageStatus::Failed);
    assert_eq!(deployment.stages[0].health_ok, Some(false));

    // No stage had promoted, so the record has no steps.
    let history = h.rollback.history();
    assert_eq!(history.len(), 1);
    assert!(history[0].steps.is_empty());
}

#[tokio::test]
async fn test_missing_backup_marks_rollback_failed() {
    let h = harness(Arc::new(ApproveAll));
    h.metrics.set(
        "production-100",
        StageMetrics {
            error_rate: 2.0,
            response_time_ms: 120.0,
            cpu: 35.0,
            memory: 40.0,
        },
    );
    *h.executor.empty_backup_listing.lock() = true;

    let deployment = h.controller.deploy(sample_patch()).await.unwrap();
    assert_eq!(deployment.status, DeploymentStatus::RolledBack);

    let history = h.rollback.history();
    let record = &history[0];
    assert_eq!(record.status, RollbackStatus::Failed);
    // Both steps failed but both were attempted.
    assert_eq!(record.steps.len(), 2);
    assert!(record
        .steps
        .iter()
        .all(|s| s.status == RollbackStepStatus::Failed));
    assert!(record.steps[0]
        .error
        .as_deref()
        .unwrap()
        .contains("No backup found"));
}

#[tokio::test]
async fn test_cancelled_deployment_fails_current_stage() {
    let h = harness(Arc::new(ApproveAll));
    let cancel = CancelHandle::new();
    cancel.cancel();

    let deployment = h
        .controller
        .deploy_with_cancel(sample_patch(), cancel)
        .await
        .unwrap();

    assert_eq!(deployment.status, DeploymentStatus::RolledBack);
    assert_eq!(deployment.stages[0].status, StageStatus::Failed);
}

#[tokio::test]
async fn test_rollback_unknown_deployment_errors() {
    let h = harness(Arc::new(ApproveAll));
    let err = h
        .rollback
        .rollback("deploy-0-zzzz", "operator request", false)
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::DeploymentNotFound { .. }));
}

#[tokio::test]
async fn test_rollback_of_completed_deployment_is_rejected() {
    let h = harness(Arc::new(ApproveAll));
    let deployment = h.controller.deploy(sample_patch()).await.unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Success);

    let err = h
        .rollback
        .rollback(&deployment.id, "second thoughts", false)
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_db_rollback_defaults_to_dry_run() {
    let h = harness(Arc::new(DenyAll));
    let outcome = h.rollback.db_rollback("deploy-1-abcd").await.unwrap();
    assert!(!outcome.success);
    assert!(outcome.dry_run);
}

#[tokio::test]
async fn test_upload_digest_is_verified() {
    let h = harness(Arc::new(ApproveAll));
    let deployment = h.controller.deploy(sample_patch()).await.unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Success);

    // The patched content actually landed in the fake's file system.
    assert_eq!(
        h.executor
            .files
            .lock()
            .get("/srv/app/config/settings.py")
            .map(String::as_str),
        Some("RETRIES = 3\n")
    );
}
