//! `medulla incident` - push a synthetic alert through the pipeline
//!
//! Exercises the full loop: fingerprint, dedup, ticket creation, optional
//! auto-heal execution, and outcome reflection onto the ticket.

use crate::core::app::App;
use crate::core::config::ConfigStore;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use incident_desk::{
    match_playbook, Alert, AlertLevel, HealAction, HealResult, IncidentOrchestrator, TicketClient,
};
use remote_exec::ExecRequest;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

#[allow(clippy::too_many_arguments)]
pub async fn run(
    app: &App,
    config: &ConfigStore,
    metric: &str,
    value: f64,
    level: &str,
    message: &str,
    heal: bool,
) -> Result<()> {
    let level = parse_level(level)?;
    let desk_config = config.desk_config()?;
    let client = Arc::new(
        TicketClient::new(desk_config.clone()).context("constructing service desk client")?,
    );
    let orchestrator = IncidentOrchestrator::new(desk_config, client);

    let alert = Alert {
        id: format!("manual-{}", Utc::now().timestamp_millis()),
        metric: metric.to_string(),
        value,
        threshold: None,
        level,
        message: message.to_string(),
        timestamp: Utc::now(),
        should_auto_heal: heal,
        metadata: BTreeMap::new(),
    };

    let Some(outcome) = orchestrator.create_incident_from_alert(&alert).await else {
        bail!("incident pipeline returned nothing (disabled, or the service desk is down)");
    };
    println!(
        "ticket {} ({})",
        outcome.ticket_key,
        if outcome.deduplicated {
            "deduplicated"
        } else {
            "created"
        }
    );

    let writeup = format!(
        "# Incident {}\n\n- metric: {} = {}\n- level: {}\n- ticket: {}\n- deduplicated: {}\n\n{}\n",
        alert.id, alert.metric, alert.value, alert.level, outcome.ticket_key,
        outcome.deduplicated, alert.message
    );
    app.artifacts.write_incident(&alert.id, &writeup)?;

    if heal {
        let playbooks = config.playbooks()?;
        match match_playbook(&playbooks, &alert) {
            Some(playbook) => {
                info!(playbook = %playbook.id, "running auto-heal playbook");
                let heal_result = run_playbook(app, playbook).await?;
                let reflected = orchestrator
                    .update_incident_with_auto_heal_result(&outcome.ticket_key, &heal_result)
                    .await;
                if reflected.is_none() {
                    println!("warning: could not reflect the outcome onto the ticket");
                }
                println!(
                    "auto-heal {}: {}",
                    playbook.id,
                    if heal_result.success { "succeeded" } else { "failed" }
                );
            }
            None => println!("no playbook matches this alert"),
        }
    }

    app.pool.close_all().await;
    Ok(())
}

async fn run_playbook(
    app: &App,
    playbook: &incident_desk::Playbook,
) -> Result<HealResult> {
    let targets = app.deploy_config.production_hosts.clone();
    if targets.is_empty() {
        bail!("no production hosts configured for auto-heal actions");
    }

    let started = Instant::now();
    let mut actions = Vec::new();
    let mut all_ok = true;
    for command in &playbook.actions {
        let result = app
            .executor
            .execute(ExecRequest::new(targets.clone(), command.clone()))
            .await?;
        all_ok &= result.success;
        let output = result
            .results
            .first()
            .map(|r| r.stdout.trim().to_string())
            .filter(|s| !s.is_empty());
        actions.push(HealAction {
            command: command.clone(),
            success: result.success,
            output,
        });
        if !result.success {
            break;
        }
    }

    Ok(HealResult {
        playbook: playbook.id.clone(),
        success: all_ok,
        duration_ms: started.elapsed().as_millis() as u64,
        actions,
    })
}

fn parse_level(level: &str) -> Result<AlertLevel> {
    match level.to_lowercase().as_str() {
        "info" => Ok(AlertLevel::Info),
        "warning" => Ok(AlertLevel::Warning),
        "high" => Ok(AlertLevel::High),
        "critical" => Ok(AlertLevel::Critical),
        other => bail!("unknown alert level: {other}"),
    }
}
