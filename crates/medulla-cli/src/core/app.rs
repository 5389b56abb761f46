//! Application wiring
//!
//! Builds the component graph from loaded configuration: connection pool,
//! fan-out executor, deployment and rollback controllers, artifact store.
//! Everything is owned here and passed down by reference; there are no
//! globals.

use crate::core::artifacts::ArtifactStore;
use crate::core::config::ConfigStore;
use anyhow::Result;
use async_trait::async_trait;
use deploy_control::{
    DenyAll, DeployConfig, DeployError, DeploymentController, DeploymentStore, MetricsSource,
    RollbackController, StageMetrics,
};
use ops_core::SystemClock;
use remote_exec::{ConnectionPool, RemoteExecutor, SshConnector, SshExecutor};
use std::sync::Arc;

/// Stage metrics read from the newest artifact-store sample
///
/// The platform never collects its own metrics; the monitoring pipeline
/// drops samples into the artifact store and promotion gates read the
/// latest one.
pub struct ArtifactMetricsSource {
    artifacts: ArtifactStore,
}

impl ArtifactMetricsSource {
    /// Create a source over an artifact store
    pub fn new(artifacts: ArtifactStore) -> Self {
        Self { artifacts }
    }
}

#[async_trait]
impl MetricsSource for ArtifactMetricsSource {
    async fn sample(&self, stage: &str) -> Result<StageMetrics, DeployError> {
        let latest = self
            .artifacts
            .latest_metrics()
            .map_err(|e| DeployError::MetricsUnavailable {
                stage: stage.to_string(),
                reason: e.to_string(),
            })?;
        let Some((_, value)) = latest else {
            return Err(DeployError::MetricsUnavailable {
                stage: stage.to_string(),
                reason: "no metrics samples recorded".to_string(),
            });
        };

        let field = |name: &str| value.get(name).and_then(serde_json::Value::as_f64);
        Ok(StageMetrics {
            error_rate: field("error_rate").unwrap_or(0.0),
            response_time_ms: field("response_time_ms").unwrap_or(0.0),
            cpu: field("cpu").unwrap_or(0.0),
            memory: field("memory").unwrap_or(0.0),
        })
    }
}

/// The assembled application
pub struct App {
    /// Shared SSH connection pool
    pub pool: Arc<ConnectionPool>,
    /// Fan-out executor over the pool
    pub executor: Arc<dyn RemoteExecutor>,
    /// Deployment configuration
    pub deploy_config: Arc<DeployConfig>,
    /// Deployment registry
    pub deployments: Arc<DeploymentStore>,
    /// Rollback controller
    pub rollback: Arc<RollbackController>,
    /// Deployment controller
    pub controller: DeploymentController,
    /// Artifact store
    pub artifacts: ArtifactStore,
}

impl App {
    /// Build the component graph from configuration
    pub fn build(config: &ConfigStore, artifacts_dir: &str) -> Result<App> {
        let deploy_config = Arc::new(config.deploy_config()?);
        let pool_config = config.pool_config()?;

        let pool = Arc::new(ConnectionPool::new(
            pool_config,
            Arc::new(SshConnector::new()),
        ));
        let executor: Arc<dyn RemoteExecutor> = Arc::new(SshExecutor::new(pool.clone()));

        let artifacts = ArtifactStore::new(artifacts_dir);
        let metrics = Arc::new(ArtifactMetricsSource::new(artifacts.clone()));
        let approval = Arc::new(DenyAll);
        let clock = Arc::new(SystemClock);
        let deployments = Arc::new(DeploymentStore::new());

        let rollback = Arc::new(RollbackController::new(
            deploy_config.clone(),
            executor.clone(),
            deployments.clone(),
            approval.clone(),
            clock.clone(),
        ));
        let controller = DeploymentController::new(
            deploy_config.clone(),
            executor.clone(),
            metrics,
            approval,
            deployments.clone(),
            rollback.clone(),
            clock,
        );

        Ok(App {
            pool,
            executor,
            deploy_config,
            deployments,
            rollback,
            controller,
            artifacts,
        })
    }
}
