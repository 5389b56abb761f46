//! `medulla deploy` - staged rollout of a patch file

use crate::core::app::App;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use deploy_control::{Deployment, DeploymentStatus, Patch};

pub async fn run(app: &App, patch_file: &str) -> Result<()> {
    let text = std::fs::read_to_string(patch_file)
        .with_context(|| format!("reading patch file {patch_file}"))?;
    let patch: Patch =
        serde_json::from_str(&text).with_context(|| format!("parsing patch file {patch_file}"))?;

    let deployment = app.controller.deploy(patch).await?;
    print_deployment(&deployment);

    let report = render_report(&deployment);
    let path = app
        .artifacts
        .write_report("deploy", Utc::now(), &report)?;
    println!("report: {}", path.display());

    app.pool.close_all().await;
    match deployment.status {
        DeploymentStatus::Success | DeploymentStatus::AwaitingApproval => Ok(()),
        status => bail!("deployment ended {status}"),
    }
}

fn print_deployment(deployment: &Deployment) {
    println!("deployment {} [{}]", deployment.id, deployment.status);
    for stage in &deployment.stages {
        let metrics = stage
            .metrics
            .map(|m| {
                format!(
                    "errorRate={:.2} responseTime={:.0}ms cpu={:.0}% mem={:.0}%",
                    m.error_rate, m.response_time_ms, m.cpu, m.memory
                )
            })
            .unwrap_or_else(|| "-".to_string());
        println!("  {:<16} {:<12} {metrics}", stage.name, format!("{:?}", stage.status));
    }
    if let Some(reason) = &deployment.rollback_reason {
        println!("  rolled back: {reason}");
    }
}

fn render_report(deployment: &Deployment) -> String {
    let mut lines = vec![
        format!("# Deploy report: {}", deployment.id),
        String::new(),
        format!("- repository: {}", deployment.repository),
        format!("- status: {}", deployment.status),
        format!("- started: {}", deployment.started_at.to_rfc3339()),
    ];
    if let Some(at) = deployment.completed_at {
        lines.push(format!("- completed: {}", at.to_rfc3339()));
    }
    if let Some(reason) = &deployment.rollback_reason {
        lines.push(format!("- rollback reason: {reason}"));
    }
    lines.push(String::new());
    lines.push("## Stages".to_string());
    for stage in &deployment.stages {
        lines.push(format!("- {} [{:?}]", stage.name, stage.status));
    }
    lines.join("\n")
}
