//! Incident and ticketing error types

use thiserror::Error;

/// Incident and ticketing error types
#[derive(Debug, Error)]
pub enum IncidentError {
    /// A `${VAR}` credential reference points at an unset variable
    #[error("Environment variable {var} is not set")]
    EnvVarMissing {
        /// Variable name
        var: String,
    },

    /// Terminal HTTP error from the service desk
    #[error("Service desk API error {status}: {body}")]
    ApiError {
        /// HTTP status
        status: u16,
        /// Response body
        body: String,
    },

    /// Retries on 429 were exhausted
    #[error("Service desk rate limit exhausted after retries")]
    RateLimitExhausted,

    /// Network or timeout failure after retries
    #[error("Service desk request failed: {reason}")]
    Network {
        /// Underlying failure
        reason: String,
    },

    /// Configuration rejected at construction
    #[error("Invalid ticketing configuration: {reason}")]
    InvalidConfig {
        /// What was rejected
        reason: String,
    },
}

/// Result alias for incident operations
pub type IncidentResult<T> = Result<T, IncidentError>;
