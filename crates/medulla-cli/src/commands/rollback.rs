//! `medulla rollback` - revert a deployment from this session's registry

use crate::core::app::App;
use anyhow::{bail, Result};
use deploy_control::RollbackStatus;

pub async fn run(app: &App, deployment_id: &str, reason: &str, partial: bool) -> Result<()> {
    let record = app.rollback.rollback(deployment_id, reason, partial).await?;

    println!("rollback {} [{:?}]", record.id, record.status);
    for step in &record.steps {
        match &step.error {
            Some(error) => println!("  {:<16} failed: {error}", step.stage),
            None => println!("  {:<16} {:?}", step.stage, step.status),
        }
    }
    println!(
        "snapshot covers {} host(s) at {}",
        record.snapshot.state.len(),
        record.snapshot.timestamp.to_rfc3339()
    );

    app.pool.close_all().await;
    if record.status == RollbackStatus::Failed {
        bail!("rollback finished with failures; manual intervention required");
    }
    Ok(())
}
