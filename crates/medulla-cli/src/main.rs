//! Medulla operator CLI
//!
//! Fleet remediation and incident automation: fan commands out over SSH,
//! roll patches through canary stages with metric-gated promotion, revert
//! them from on-host backups, and push alerts into the service desk.
//!
//! Usage:
//!   medulla exec --targets web-01,web-02 -- uptime
//!   medulla deploy --patch-file patch.json
//!   medulla rollback --deployment deploy-... --reason "bad canary"
//!   medulla incident --metric cpu --value 97 --level high --heal
//!   medulla pool --probe
//!   medulla config check
//!
//! Exit codes: 0 success, 1 core failure, 2 configuration error.

mod cli;
mod commands;
mod core;

use anyhow::Result;
use clap::Parser;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Commands, ConfigAction};
use crate::core::app::App;
use crate::core::config::{ConfigError, ConfigStore};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            error!("{e:#}");
            if e.downcast_ref::<ConfigError>().is_some() {
                2
            } else {
                1
            }
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<()> {
    let config = ConfigStore::new(&cli.config_dir);

    match cli.command {
        Commands::Config {
            action: ConfigAction::Check,
        } => commands::config::check(&config),
        Commands::Exec {
            targets,
            user,
            timeout_ms,
            fail_fast,
            command,
        } => {
            let app = App::build(&config, &cli.artifacts_dir)?;
            commands::exec::run(&app, targets, &user, timeout_ms, fail_fast, &command).await
        }
        Commands::Deploy { patch_file } => {
            let app = App::build(&config, &cli.artifacts_dir)?;
            commands::deploy::run(&app, &patch_file).await
        }
        Commands::Rollback {
            deployment,
            reason,
            partial,
        } => {
            let app = App::build(&config, &cli.artifacts_dir)?;
            commands::rollback::run(&app, &deployment, &reason, partial).await
        }
        Commands::Incident {
            metric,
            value,
            level,
            message,
            heal,
        } => {
            let app = App::build(&config, &cli.artifacts_dir)?;
            commands::incident::run(&app, &config, &metric, value, &level, &message, heal).await
        }
        Commands::Pool { probe } => {
            let app = App::build(&config, &cli.artifacts_dir)?;
            commands::pool::run(&app, probe).await
        }
    }
}
