//! Medulla CLI structure
//!
//! Root command with subcommands for remote execution, staged deployment,
//! rollback, incident simulation, pool inspection, and config validation.

use clap::{Parser, Subcommand};

/// Medulla - fleet remediation and incident automation
#[derive(Parser)]
#[command(name = "medulla")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Configuration directory
    #[arg(short, long, default_value = "config", global = true)]
    pub config_dir: String,

    /// Artifact directory (metrics, analysis, incidents, reports)
    #[arg(short, long, default_value = "artifacts", global = true)]
    pub artifacts_dir: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a command across fleet hosts
    Exec {
        /// Comma-separated hostnames; defaults to the configured production fleet
        #[arg(short, long)]
        targets: Option<String>,

        /// Login user for ad-hoc targets
        #[arg(short, long, default_value = "ops")]
        user: String,

        /// Per-host timeout in milliseconds
        #[arg(long, default_value_t = 60_000)]
        timeout_ms: u64,

        /// Stop dispatching after the first host failure
        #[arg(long)]
        fail_fast: bool,

        /// Command line to run
        command: Vec<String>,
    },

    /// Roll a patch out through the canary staircase
    Deploy {
        /// Path to a patch JSON file
        #[arg(short, long)]
        patch_file: String,
    },

    /// Roll a deployment from this session back
    Rollback {
        /// Deployment id
        #[arg(short, long)]
        deployment: String,

        /// Reason recorded on the rollback
        #[arg(short, long, default_value = "operator request")]
        reason: String,

        /// Only revert failed/in-progress stages
        #[arg(long)]
        partial: bool,
    },

    /// Push a synthetic alert through the incident pipeline
    Incident {
        /// Metric name
        #[arg(short, long)]
        metric: String,

        /// Observed value
        #[arg(long, default_value_t = 0.0)]
        value: f64,

        /// Severity: info, warning, high, critical
        #[arg(short, long, default_value = "high")]
        level: String,

        /// Alert message
        #[arg(long, default_value = "manually raised alert")]
        message: String,

        /// Run the matching auto-heal playbook and reflect the outcome
        #[arg(long)]
        heal: bool,
    },

    /// Inspect the SSH connection pool
    Pool {
        /// Probe every configured host before reporting
        #[arg(long)]
        probe: bool,
    },

    /// Validate every configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Load and validate all config files
    Check,
}
