//! Alert records and fingerprinting

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    /// Informational, no action expected
    Info,
    /// Degradation worth watching
    Warning,
    /// Degradation needing attention
    High,
    /// Outage-grade
    Critical,
}

impl AlertLevel {
    /// Get string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An immutable alert from a monitoring source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Alert id
    pub id: String,
    /// Metric the alert fired on
    pub metric: String,
    /// Observed value
    pub value: f64,
    /// Threshold that was crossed, when known
    pub threshold: Option<f64>,
    /// Severity
    pub level: AlertLevel,
    /// Human-readable message
    pub message: String,
    /// Fire timestamp
    pub timestamp: DateTime<Utc>,
    /// Whether auto-heal playbooks may act on this alert
    pub should_auto_heal: bool,
    /// Extra source attributes
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Derive the dedup fingerprint for an alert
///
/// The key is sha256 over `(metric, level)` plus the configured metadata
/// keys, hex-encoded and truncated to 16 characters. Metadata keys absent
/// from the alert contribute nothing, so two alerts differing only in an
/// unconfigured attribute collapse together.
#[must_use]
pub fn fingerprint(alert: &Alert, metadata_keys: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(alert.metric.as_bytes());
    hasher.update([0u8]);
    hasher.update(alert.level.as_str().as_bytes());
    for key in metadata_keys {
        if let Some(value) = alert.metadata.get(key) {
            hasher.update([0u8]);
            hasher.update(key.as_bytes());
            hasher.update([b'=']);
            hasher.update(value.as_bytes());
        }
    }
    let digest = hasher.finalize();
    digest
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>()[..16]
        .to_string()
}
