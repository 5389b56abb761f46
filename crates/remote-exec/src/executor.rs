//! Fan-out command executor
//!
//! Runs one command across N targets with bounded concurrency. Per-host
//! results always come back in target order regardless of completion order,
//! and one host failing never disturbs the others unless fail-fast is set.

use crate::error::{RemoteExecError, RemoteExecResult};
use crate::pool::ConnectionPool;
use async_trait::async_trait;
use ops_core::Host;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Fan-out options
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Dispatch hosts concurrently
    pub parallel: bool,
    /// Per-host command deadline
    pub timeout_ms: Option<u64>,
    /// Stop dispatching after the first host failure
    pub fail_fast: bool,
    /// Cap on in-flight hosts
    pub max_concurrent: usize,
    /// Working directory for the command
    pub cwd: Option<String>,
    /// Environment assignments prefixed onto the command
    pub env: Vec<(String, String)>,
}

const fn default_max_concurrent() -> usize {
    8
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            parallel: true,
            timeout_ms: None,
            fail_fast: false,
            max_concurrent: default_max_concurrent(),
            cwd: None,
            env: Vec::new(),
        }
    }
}

/// One command against a target set
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Hosts to run against
    pub targets: Vec<Host>,
    /// Command line
    pub command: String,
    /// Fan-out options
    pub options: ExecOptions,
}

impl ExecRequest {
    /// Build a request with default options
    pub fn new(targets: Vec<Host>, command: impl Into<String>) -> Self {
        Self {
            targets,
            command: command.into(),
            options: ExecOptions::default(),
        }
    }
}

/// Per-host outcome
#[derive(Debug, Clone, Serialize)]
pub struct HostResult {
    /// Host key
    pub host: String,
    /// Collected stdout
    pub stdout: String,
    /// Collected stderr
    pub stderr: String,
    /// Remote exit code, when one arrived
    pub exit_code: Option<u32>,
    /// Whether the command exited zero
    pub success: bool,
    /// Wall-clock duration
    pub duration_ms: u64,
    /// Failure description when the command never completed
    pub error: Option<String>,
}

impl HostResult {
    fn failure(host: String, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            host,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            success: false,
            duration_ms,
            error: Some(error.into()),
        }
    }
}

/// Aggregate fan-out outcome
#[derive(Debug, Clone, Serialize)]
pub struct ExecResult {
    /// Conjunction of per-host success
    pub success: bool,
    /// Per-host outcomes, in target order
    pub results: Vec<HostResult>,
}

impl ExecResult {
    /// Look up the result for a host key
    #[must_use]
    pub fn result_for(&self, host: &str) -> Option<&HostResult> {
        self.results.iter().find(|r| r.host == host)
    }

    /// Hosts that failed
    #[must_use]
    pub fn failed_hosts(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.host.as_str())
            .collect()
    }
}

/// Capability seam consumed by the deployment and rollback controllers
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run one command across the request's targets
    async fn execute(&self, request: ExecRequest) -> RemoteExecResult<ExecResult>;

    /// Write `content` to `remote_path` on every target
    async fn upload(
        &self,
        targets: &[Host],
        remote_path: &str,
        content: &str,
    ) -> RemoteExecResult<ExecResult>;
}

/// Escape a string for inclusion inside single quotes in a shell command
///
/// Each embedded `'` becomes `'\''`.
#[must_use]
pub fn escape_single_quotes(content: &str) -> String {
    content.replace('\'', "'\\''")
}

enum HostOp {
    Exec { command: String },
    Upload { remote_path: String, content: Vec<u8> },
}

/// Pool-backed fan-out executor
pub struct SshExecutor {
    pool: Arc<ConnectionPool>,
}

impl SshExecutor {
    /// Create an executor over a connection pool
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    /// Access the underlying pool
    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    fn shell_command(command: &str, options: &ExecOptions) -> String {
        let mut parts = Vec::new();
        if let Some(cwd) = &options.cwd {
            parts.push(format!("cd '{}' &&", escape_single_quotes(cwd)));
        }
        for (key, value) in &options.env {
            parts.push(format!("{key}='{}'", escape_single_quotes(value)));
        }
        parts.push(command.to_string());
        parts.join(" ")
    }

    async fn fan_out(
        &self,
        targets: &[Host],
        options: &ExecOptions,
        make_op: impl Fn(&Host) -> HostOp,
    ) -> ExecResult {
        let timeout = options.timeout_ms.map(Duration::from_millis);

        if !options.parallel || targets.len() <= 1 {
            let mut results = Vec::with_capacity(targets.len());
            let mut all_ok = true;
            for host in targets {
                let result =
                    run_host(&self.pool, host.clone(), make_op(host), timeout).await;
                all_ok &= result.success;
                results.push(result);
                if options.fail_fast && !all_ok {
                    break;
                }
            }
            // Hosts skipped by fail-fast still get an entry.
            for host in targets.iter().skip(results.len()) {
                results.push(HostResult::failure(
                    host.pool_key(),
                    "aborted before execution",
                    0,
                ));
            }
            return ExecResult {
                success: all_ok,
                results,
            };
        }

        let cap = options
            .max_concurrent
            .min(targets.len())
            .min(self.pool.max_connections())
            .max(1);
        let semaphore = Arc::new(Semaphore::new(cap));
        let aborted = Arc::new(AtomicBool::new(false));
        let mut join_set: JoinSet<(usize, HostResult)> = JoinSet::new();

        for (index, host) in targets.iter().enumerate() {
            let pool = Arc::clone(&self.pool);
            let semaphore = Arc::clone(&semaphore);
            let aborted = Arc::clone(&aborted);
            let fail_fast = options.fail_fast;
            let host = host.clone();
            let op = make_op(&host);

            join_set.spawn(async move {
                // Semaphore is never closed while tasks run.
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                if fail_fast && aborted.load(Ordering::Relaxed) {
                    return (
                        index,
                        HostResult::failure(host.pool_key(), "aborted before execution", 0),
                    );
                }
                let result = run_host(&pool, host, op, timeout).await;
                if fail_fast && !result.success {
                    aborted.store(true, Ordering::Relaxed);
                }
                (index, result)
            });
        }

        let mut slots: Vec<Option<HostResult>> = (0..targets.len()).map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(e) => warn!(error = %e, "fan-out task panicked"),
            }
        }

        let results: Vec<HostResult> = slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.unwrap_or_else(|| {
                    HostResult::failure(targets[i].pool_key(), "task failed", 0)
                })
            })
            .collect();
        let success = results.iter().all(|r| r.success);
        ExecResult { success, results }
    }
}

/// Run one operation against one host, retrying once on connection errors
async fn run_host(
    pool: &Arc<ConnectionPool>,
    host: Host,
    op: HostOp,
    timeout: Option<Duration>,
) -> HostResult {
    let key = host.pool_key();
    let started = Instant::now();

    for attempt in 0..2 {
        let session = match pool.acquire(&host).await {
            Ok(session) => session,
            Err(err) => {
                if attempt == 0 && err.is_retryable() {
                    debug!(host = %key, error = %err, "acquire failed, retrying once");
                    continue;
                }
                return HostResult::failure(
                    key,
                    err.to_string(),
                    started.elapsed().as_millis() as u64,
                );
            }
        };

        let work = async {
            match &op {
                HostOp::Exec { command } => session.transport.exec(command).await,
                HostOp::Upload {
                    remote_path,
                    content,
                } => match session.transport.upload(remote_path, content).await {
                    Ok(()) => Ok(crate::transport::CommandOutput {
                        stdout: String::new(),
                        stderr: String::new(),
                        exit_code: Some(0),
                    }),
                    Err(err @ RemoteExecError::UploadFailed { .. }) => {
                        // Streaming write failed; fall back to a quoted echo
                        // so hosts without a working stdin pipe still land
                        // the content.
                        debug!(host = %session.key, error = %err, "streaming upload failed, falling back to shell write");
                        let text = String::from_utf8_lossy(content);
                        let fallback = format!(
                            "echo '{}' > '{}'",
                            escape_single_quotes(text.trim_end_matches('\n')),
                            remote_path
                        );
                        session.transport.exec(&fallback).await
                    }
                    Err(err) => Err(err),
                },
            }
        };

        let outcome = match timeout {
            Some(deadline) => match tokio::time::timeout(deadline, work).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    pool.poison(&host).await;
                    pool.release(&host).await;
                    return HostResult::failure(
                        key,
                        "timeout",
                        started.elapsed().as_millis() as u64,
                    );
                }
            },
            None => work.await,
        };

        match outcome {
            Ok(output) => {
                pool.release(&host).await;
                let success = output.success();
                return HostResult {
                    host: key,
                    stdout: output.stdout,
                    stderr: output.stderr,
                    exit_code: output.exit_code,
                    success,
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: None,
                };
            }
            Err(err) => {
                pool.poison(&host).await;
                pool.release(&host).await;
                if attempt == 0 && err.is_retryable() {
                    debug!(host = %key, error = %err, "transport error, retrying with fresh connection");
                    continue;
                }
                return HostResult::failure(
                    key,
                    err.to_string(),
                    started.elapsed().as_millis() as u64,
                );
            }
        }
    }

    HostResult::failure(key, "retries exhausted", started.elapsed().as_millis() as u64)
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(&self, request: ExecRequest) -> RemoteExecResult<ExecResult> {
        let command = Self::shell_command(&request.command, &request.options);
        debug!(
            targets = request.targets.len(),
            command = %request.command,
            "fan-out execute"
        );
        Ok(self
            .fan_out(&request.targets, &request.options, |_| HostOp::Exec {
                command: command.clone(),
            })
            .await)
    }

    async fn upload(
        &self,
        targets: &[Host],
        remote_path: &str,
        content: &str,
    ) -> RemoteExecResult<ExecResult> {
        debug!(targets = targets.len(), path = %remote_path, "fan-out upload");
        Ok(self
            .fan_out(targets, &ExecOptions::default(), |_| HostOp::Upload {
                remote_path: remote_path.to_string(),
                content: content.as_bytes().to_vec(),
            })
            .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use crate::transport::{CommandOutput, Connector, Transport};
    use ops_core::ManualClock;
    use parking_lot::Mutex as SyncMutex;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct HostScript {
        exec_delay_ms: u64,
        exit_code: u32,
        hang: bool,
    }

    struct ScriptedTransport {
        host: String,
        script: Arc<SyncMutex<HashMap<String, HostScript>>>,
        closed: AtomicBool,
        files: Arc<SyncMutex<HashMap<String, Vec<u8>>>>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn exec(&self, command: &str) -> RemoteExecResult<CommandOutput> {
            let (delay, exit_code, hang) = {
                let script = self.script.lock();
                script
                    .get(&self.host)
                    .map(|s| (s.exec_delay_ms, s.exit_code, s.hang))
                    .unwrap_or((0, 0, false))
            };
            if hang {
                std::future::pending::<()>().await;
            }
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            Ok(CommandOutput {
                stdout: format!("{}:{}", self.host, command),
                stderr: String::new(),
                exit_code: Some(exit_code),
            })
        }

        async fn upload(&self, remote_path: &str, content: &[u8]) -> RemoteExecResult<()> {
            self.files
                .lock()
                .insert(format!("{}:{}", self.host, remote_path), content.to_vec());
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Relaxed)
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::Relaxed);
        }
    }

    struct ScriptedConnector {
        script: Arc<SyncMutex<HashMap<String, HostScript>>>,
        files: Arc<SyncMutex<HashMap<String, Vec<u8>>>>,
        fail_connects: SyncMutex<HashMap<String, usize>>,
        opened: AtomicUsize,
    }

    impl ScriptedConnector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                script: Arc::new(SyncMutex::new(HashMap::new())),
                files: Arc::new(SyncMutex::new(HashMap::new())),
                fail_connects: SyncMutex::new(HashMap::new()),
                opened: AtomicUsize::new(0),
            })
        }

        fn set_script(&self, host: &str, script: HostScript) {
            self.script.lock().insert(host.to_string(), script);
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(
            &self,
            host: &Host,
            _timeout: Duration,
        ) -> RemoteExecResult<Box<dyn Transport>> {
            let key = host.pool_key();
            {
                let mut failures = self.fail_connects.lock();
                if let Some(remaining) = failures.get_mut(&key) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(RemoteExecError::ConnectError {
                            host: key,
                            reason: "injected failure".to_string(),
                        });
                    }
                }
            }
            self.opened.fetch_add(1, Ordering::Relaxed);
            Ok(Box::new(ScriptedTransport {
                host: key,
                script: Arc::clone(&self.script),
                closed: AtomicBool::new(false),
                files: Arc::clone(&self.files),
            }))
        }
    }

    fn test_executor(max: usize) -> (SshExecutor, Arc<ScriptedConnector>) {
        let connector = ScriptedConnector::new();
        let config = PoolConfig {
            max_connections: max,
            idle_timeout_ms: 60_000,
            connect_timeout_ms: 1000,
            acquire_timeout_ms: 2000,
        };
        let pool = Arc::new(ConnectionPool::with_clock(
            config,
            connector.clone(),
            Arc::new(ManualClock::from_system()),
        ));
        (SshExecutor::new(pool), connector)
    }

    fn hosts(names: &[&str]) -> Vec<Host> {
        names.iter().map(|n| Host::new(*n, "deploy")).collect()
    }

    #[tokio::test]
    async fn test_results_preserve_target_order() {
        let (executor, connector) = test_executor(8);
        // h2 responds slowest; order must still be h1, h2, h3.
        connector.set_script(
            "h2",
            HostScript {
                exec_delay_ms: 150,
                ..Default::default()
            },
        );

        let result = executor
            .execute(ExecRequest::new(hosts(&["h1", "h2", "h3"]), "echo x"))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.results.len(), 3);
        assert_eq!(result.results[0].host, "h1");
        assert_eq!(result.results[1].host, "h2");
        assert_eq!(result.results[2].host, "h3");
    }

    #[tokio::test]
    async fn test_one_failure_does_not_abort_others() {
        let (executor, connector) = test_executor(8);
        connector.set_script(
            "h2",
            HostScript {
                exit_code: 1,
                ..Default::default()
            },
        );

        let result = executor
            .execute(ExecRequest::new(hosts(&["h1", "h2", "h3"]), "deploy"))
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.results[0].success);
        assert!(!result.results[1].success);
        assert_eq!(result.results[1].exit_code, Some(1));
        assert!(result.results[2].success);
        assert_eq!(result.failed_hosts(), vec!["h2"]);
    }

    #[tokio::test]
    async fn test_timeout_produces_timeout_error_and_poisons() {
        let (executor, connector) = test_executor(4);
        connector.set_script(
            "h1",
            HostScript {
                hang: true,
                ..Default::default()
            },
        );

        let mut request = ExecRequest::new(hosts(&["h1"]), "sleep 9999");
        request.options.timeout_ms = Some(100);
        let result = executor.execute(request).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.results[0].error.as_deref(), Some("timeout"));

        // Connection was poisoned and destroyed on release.
        assert_eq!(executor.pool().status().await.pool_size, 0);
    }

    #[tokio::test]
    async fn test_connect_error_retried_once() {
        let (executor, connector) = test_executor(4);
        connector
            .fail_connects
            .lock()
            .insert("h1".to_string(), 1);

        let result = executor
            .execute(ExecRequest::new(hosts(&["h1"]), "uptime"))
            .await
            .unwrap();

        assert!(result.success, "second attempt should have connected");
        assert_eq!(
            executor.pool().status().await.stats.failed_connections,
            1
        );
    }

    #[tokio::test]
    async fn test_persistent_connect_error_reported_per_host() {
        let (executor, connector) = test_executor(4);
        connector
            .fail_connects
            .lock()
            .insert("h1".to_string(), 10);

        let result = executor
            .execute(ExecRequest::new(hosts(&["h1", "h2"]), "uptime"))
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.results[0]
            .error
            .as_deref()
            .unwrap()
            .contains("Failed to connect"));
        assert!(result.results[1].success);
    }

    #[tokio::test]
    async fn test_fail_fast_aborts_remaining_hosts() {
        let (executor, connector) = test_executor(8);
        connector.set_script(
            "h1",
            HostScript {
                exit_code: 1,
                ..Default::default()
            },
        );
        // Slow the rest so h1's failure lands first.
        for h in ["h2", "h3", "h4"] {
            connector.set_script(
                h,
                HostScript {
                    exec_delay_ms: 300,
                    ..Default::default()
                },
            );
        }

        let mut request = ExecRequest::new(hosts(&["h1", "h2", "h3", "h4"]), "deploy");
        request.options.fail_fast = true;
        request.options.max_concurrent = 1;
        let result = executor.execute(request).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.results.len(), 4);
        assert!(result.results[1..]
            .iter()
            .all(|r| r.error.as_deref() == Some("aborted before execution")));
    }

    #[tokio::test]
    async fn test_sequential_mode_runs_in_order() {
        let (executor, _connector) = test_executor(8);
        let mut request = ExecRequest::new(hosts(&["h1", "h2"]), "echo x");
        request.options.parallel = false;
        let result = executor.execute(request).await.unwrap();
        assert!(result.success);
        assert_eq!(result.results[0].host, "h1");
        assert_eq!(result.results[1].host, "h2");
    }

    #[tokio::test]
    async fn test_upload_streams_content() {
        let (executor, connector) = test_executor(4);
        let result = executor
            .upload(&hosts(&["h1", "h2"]), "/etc/app/app.conf", "retries=3\n")
            .await
            .unwrap();

        assert!(result.success);
        let files = connector.files.lock();
        assert_eq!(
            files.get("h1:/etc/app/app.conf").map(Vec::as_slice),
            Some("retries=3\n".as_bytes())
        );
        assert!(files.contains_key("h2:/etc/app/app.conf"));
    }

    #[tokio::test]
    async fn test_env_and_cwd_shape_the_command() {
        let (executor, _connector) = test_executor(4);
        let mut request = ExecRequest::new(hosts(&["h1"]), "./run.sh");
        request.options.cwd = Some("/srv/app".to_string());
        request.options.env = vec![("MODE".to_string(), "canary".to_string())];
        let result = executor.execute(request).await.unwrap();

        assert_eq!(
            result.results[0].stdout,
            "h1:cd '/srv/app' && MODE='canary' ./run.sh"
        );
    }

    #[test]
    fn test_escape_single_quotes() {
        assert_eq!(escape_single_quotes("plain"), "plain");
        assert_eq!(escape_single_quotes("it's"), "it'\\''s");
        assert_eq!(escape_single_quotes("''"), "'\\'''\\''");
    }
}
