//! Forensic host snapshots
//!
//! Captured at rollback start from the first target of each affected stage.
//! Snapshots exist for post-incident comparison only; restore always comes
//! from the on-host backups, never from a snapshot.

use chrono::{DateTime, Utc};
use ops_core::Host;
use remote_exec::{ExecOptions, ExecRequest, RemoteExecutor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Captured state of one host
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostState {
    /// Top processes by CPU
    pub processes: String,
    /// Failed service units
    pub services: String,
    /// Filesystem usage
    pub disk: String,
    /// Memory usage
    pub memory: String,
    /// Socket summary
    pub network: String,
}

/// Point-in-time capture across sampled hosts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Capture timestamp
    pub timestamp: DateTime<Utc>,
    /// Deployment the capture belongs to
    pub deployment_id: String,
    /// Host key to captured state
    pub state: HashMap<String, HostState>,
}

const SNAPSHOT_COMMANDS: [(&str, &str); 5] = [
    ("processes", "ps aux --sort=-%cpu | head -n 15"),
    (
        "services",
        "systemctl list-units --state=failed --no-pager | head -n 20",
    ),
    ("disk", "df -h"),
    ("memory", "free -m"),
    ("network", "ss -s"),
];

/// Capture a forensic snapshot of the given sample hosts
///
/// Command failures degrade to empty sections rather than failing the
/// rollback that requested the capture.
pub async fn capture(
    executor: &Arc<dyn RemoteExecutor>,
    deployment_id: &str,
    hosts: &[Host],
    timestamp: DateTime<Utc>,
    timeout_ms: u64,
) -> Snapshot {
    let mut state: HashMap<String, HostState> = hosts
        .iter()
        .map(|h| (h.pool_key(), HostState::default()))
        .collect();

    for (section, command) in SNAPSHOT_COMMANDS {
        let request = ExecRequest {
            targets: hosts.to_vec(),
            command: command.to_string(),
            options: ExecOptions {
                timeout_ms: Some(timeout_ms),
                ..ExecOptions::default()
            },
        };
        match executor.execute(request).await {
            Ok(result) => {
                for host_result in result.results {
                    if let Some(entry) = state.get_mut(&host_result.host) {
                        let text = if host_result.success {
                            host_result.stdout
                        } else {
                            String::new()
                        };
                        match section {
                            "processes" => entry.processes = text,
                            "services" => entry.services = text,
                            "disk" => entry.disk = text,
                            "memory" => entry.memory = text,
                            "network" => entry.network = text,
                            _ => {}
                        }
                    }
                }
            }
            Err(e) => {
                debug!(section, error = %e, "snapshot command failed, leaving section empty");
            }
        }
    }

    Snapshot {
        timestamp,
        deployment_id: deployment_id.to_string(),
        state,
    }
}
