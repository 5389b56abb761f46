//! Transport abstraction over a live remote session
//!
//! The pool and executor are written against these traits so tests can run
//! against in-memory fakes and production runs against the SSH transport.

use crate::error::RemoteExecResult;
use async_trait::async_trait;
use ops_core::Host;
use std::time::Duration;

/// Command execution result
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Exit code
    pub exit_code: Option<u32>,
}

impl CommandOutput {
    /// Whether the command exited zero
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// A live session bound to one host
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute a command and collect stdout/stderr until EOF
    async fn exec(&self, command: &str) -> RemoteExecResult<CommandOutput>;

    /// Stream content into a remote file
    async fn upload(&self, remote_path: &str, content: &[u8]) -> RemoteExecResult<()>;

    /// Whether the underlying session has closed
    fn is_closed(&self) -> bool;

    /// Tear the session down
    async fn close(&self);
}

/// Factory opening transports for hosts
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new transport, bounded by `timeout`
    async fn connect(
        &self,
        host: &Host,
        timeout: Duration,
    ) -> RemoteExecResult<Box<dyn Transport>>;
}
