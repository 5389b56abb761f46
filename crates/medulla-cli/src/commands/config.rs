//! `medulla config check` - validate every configuration file

use crate::core::config::{ConfigError, ConfigStore};
use anyhow::Result;
use incident_desk::TicketClient;

pub fn check(config: &ConfigStore) -> Result<()> {
    let sources = config.monitoring_sources()?;
    println!(
        "monitoring-sources.json: {} log path(s), {} healthcheck(s)",
        sources.logs.paths.len(),
        sources.healthchecks.len()
    );

    let thresholds = config.alert_thresholds()?;
    println!("alert-thresholds.json: {} metric(s)", thresholds.len());

    let playbooks = config.playbooks()?;
    println!("autoheal-playbooks.json: {} playbook(s)", playbooks.len());

    let desk = config.desk_config()?;
    // Constructing the client resolves ${VAR} credential references, so a
    // missing variable fails the check rather than the first alert.
    TicketClient::new(desk.clone()).map_err(|e| ConfigError::Invalid {
        path: "jsm-config.json".to_string(),
        reason: e.to_string(),
    })?;
    println!(
        "jsm-config.json: desk {} (enabled: {})",
        desk.service_desk_id, desk.enabled
    );

    let deploy = config.deploy_config()?;
    let pool = config.pool_config()?;
    println!(
        "deploy-config.json: {} stage(s), {} production host(s), pool cap {}",
        deploy.stages.len(),
        deploy.production_hosts.len(),
        pool.max_connections
    );

    println!("configuration ok");
    Ok(())
}
