//! `medulla exec` - fan a command out across hosts

use crate::core::app::App;
use anyhow::{bail, Result};
use ops_core::Host;
use remote_exec::{ExecOptions, ExecRequest};

pub async fn run(
    app: &App,
    targets: Option<String>,
    user: &str,
    timeout_ms: u64,
    fail_fast: bool,
    command: &[String],
) -> Result<()> {
    if command.is_empty() {
        bail!("no command given");
    }
    let hosts: Vec<Host> = match targets {
        Some(list) => list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|name| Host::new(name, user))
            .collect(),
        None => app.deploy_config.production_hosts.clone(),
    };
    if hosts.is_empty() {
        bail!("no targets: pass --targets or configure production_hosts");
    }

    let request = ExecRequest {
        targets: hosts,
        command: command.join(" "),
        options: ExecOptions {
            timeout_ms: Some(timeout_ms),
            fail_fast,
            ..ExecOptions::default()
        },
    };
    let result = app.executor.execute(request).await?;

    for host_result in &result.results {
        let status = match (&host_result.error, host_result.exit_code) {
            (Some(error), _) => format!("error: {error}"),
            (None, Some(code)) => format!("exit {code}"),
            (None, None) => "no exit status".to_string(),
        };
        println!(
            "=== {} ({status}, {}ms)",
            host_result.host, host_result.duration_ms
        );
        if !host_result.stdout.is_empty() {
            print!("{}", host_result.stdout);
        }
        if !host_result.stderr.is_empty() {
            eprint!("{}", host_result.stderr);
        }
    }

    app.pool.close_all().await;
    if !result.success {
        bail!("{} host(s) failed", result.failed_hosts().len());
    }
    Ok(())
}
