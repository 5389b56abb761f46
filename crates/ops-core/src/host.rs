//! Fleet host identity types
//!
//! Core data structures describing remote hosts and how to authenticate
//! against them. A `Host` is immutable once registered with a component.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Authentication material reference for a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "method")]
pub enum AuthMethod {
    /// Private key file on disk
    KeyFile {
        /// Path to the private key
        path: PathBuf,
    },
    /// Password looked up from the named environment variable
    PasswordEnv {
        /// Environment variable holding the password
        var: String,
    },
    /// Try the conventional key paths under ~/.ssh
    DefaultKeys,
}

impl Default for AuthMethod {
    fn default() -> Self {
        Self::DefaultKeys
    }
}

impl AuthMethod {
    /// Get string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KeyFile { .. } => "key_file",
            Self::PasswordEnv { .. } => "password_env",
            Self::DefaultKeys => "default_keys",
        }
    }
}

/// A remote host in the managed fleet
///
/// Identity is `(hostname, port, user)`; the pool key is the lowercased
/// hostname so callers may address a host case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// Hostname or address
    pub hostname: String,
    /// SSH port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Login user
    pub user: String,
    /// Authentication material reference
    #[serde(default)]
    pub auth: AuthMethod,
    /// Optional operator tags (role, rack, environment)
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

impl Host {
    /// Create a host with the default port and key discovery
    pub fn new(hostname: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            port: DEFAULT_SSH_PORT,
            user: user.into(),
            auth: AuthMethod::DefaultKeys,
            tags: Vec::new(),
        }
    }

    /// Set the SSH port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the authentication method
    #[must_use]
    pub fn with_auth(mut self, auth: AuthMethod) -> Self {
        self.auth = auth;
        self
    }

    /// Add an operator tag
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Normalized key used by connection pools and result maps
    #[must_use]
    pub fn pool_key(&self) -> String {
        self.hostname.to_lowercase()
    }

    /// `host:port` address string
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    /// Whether the host carries the given tag
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

impl std::fmt::Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.hostname, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_key_is_lowercased() {
        let host = Host::new("Web-01.Example.COM", "deploy");
        assert_eq!(host.pool_key(), "web-01.example.com");
    }

    #[test]
    fn test_builder_defaults() {
        let host = Host::new("db-01", "ops")
            .with_port(2222)
            .with_tag("production");
        assert_eq!(host.port, 2222);
        assert_eq!(host.auth, AuthMethod::DefaultKeys);
        assert!(host.has_tag("production"));
        assert!(!host.has_tag("canary"));
    }

    #[test]
    fn test_host_display() {
        let host = Host::new("web-01", "deploy");
        assert_eq!(host.to_string(), "deploy@web-01:22");
    }

    #[test]
    fn test_auth_method_roundtrip() {
        let auth = AuthMethod::KeyFile {
            path: "/home/ops/.ssh/id_ed25519".into(),
        };
        let json = serde_json::to_string(&auth).unwrap();
        let parsed: AuthMethod = serde_json::from_str(&json).unwrap();
        assert_eq!(auth, parsed);
    }
}
