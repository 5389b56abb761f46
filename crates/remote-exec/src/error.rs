//! Remote execution error types

use thiserror::Error;

/// Remote execution error types
#[derive(Debug, Error)]
pub enum RemoteExecError {
    /// Pool is at capacity with nothing evictable
    #[error("Connection pool exhausted: {busy}/{max} connections busy")]
    PoolExhausted {
        /// Connections currently checked out
        busy: usize,
        /// Pool capacity
        max: usize,
    },

    /// Opening the transport failed
    #[error("Failed to connect to {host}: {reason}")]
    ConnectError {
        /// Target host
        host: String,
        /// Underlying failure
        reason: String,
    },

    /// The remote side rejected our credentials
    #[error("Authentication failed for {user}@{host}")]
    AuthFailed {
        /// Login user
        user: String,
        /// Target host
        host: String,
    },

    /// Waited too long for a busy connection to be released
    #[error("Timed out waiting for a connection to {host}")]
    AcquireTimeout {
        /// Target host
        host: String,
    },

    /// Per-host command deadline expired
    #[error("Command timed out on {host} after {timeout_ms}ms")]
    CommandTimeout {
        /// Target host
        host: String,
        /// Deadline that expired
        timeout_ms: u64,
    },

    /// Command could not be dispatched or produced no exit status
    #[error("Command failed on {host}: {reason}")]
    CommandFailed {
        /// Target host
        host: String,
        /// Underlying failure
        reason: String,
    },

    /// The underlying session closed mid-operation
    #[error("Transport channel closed for {host}")]
    ChannelClosed {
        /// Target host
        host: String,
    },

    /// Streaming file upload failed
    #[error("Upload to {host} failed: {reason}")]
    UploadFailed {
        /// Target host
        host: String,
        /// Underlying failure
        reason: String,
    },
}

impl RemoteExecError {
    /// Whether a fresh connection is worth one retry for this error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectError { .. } | Self::ChannelClosed { .. }
        )
    }
}

/// Result alias for remote execution operations
pub type RemoteExecResult<T> = Result<T, RemoteExecError>;
