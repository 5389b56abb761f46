//! SSH connection pooling and fan-out command execution
//!
//! This crate provides the remote-execution layer of the Medulla platform:
//! - A connection pool holding at most one multiplexed SSH session per host,
//!   with exclusive checkout, idle reaping, and capacity eviction
//! - A fan-out executor running one command across N targets with bounded
//!   concurrency, order-preserving results, and per-host deadlines
//! - Trait seams (`Connector`, `Transport`, `RemoteExecutor`) so higher
//!   layers and tests run against fakes instead of live SSH

#![warn(missing_docs)]

pub mod error;
pub mod executor;
pub mod pool;
pub mod ssh;
pub mod transport;

pub use error::{RemoteExecError, RemoteExecResult};
pub use executor::{
    escape_single_quotes, ExecOptions, ExecRequest, ExecResult, HostResult, RemoteExecutor,
    SshExecutor,
};
pub use pool::{ConnectionInfo, ConnectionPool, PoolConfig, PoolStats, PoolStatus, PooledSession};
pub use ssh::{SshConnector, SshTransport};
pub use transport::{CommandOutput, Connector, Transport};
