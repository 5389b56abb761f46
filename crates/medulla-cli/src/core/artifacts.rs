//! On-disk artifact store
//!
//! Filesystem layout consumed by the rest of the platform:
//! - `metrics/metrics-<ts>.json` - one file per monitoring sample
//! - `analysis/log-insights-<ts>.md` - anomaly tagger output
//! - `incidents/<incidentId>.md` - incident writeups
//! - `reports/ops-report-<type>-<ts>.md` - operator reports
//!
//! Recency queries list the directory, filter by filename prefix, sort
//! descending, and stop as soon as an embedded timestamp falls outside the
//! requested window.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use std::path::{Path, PathBuf};

const TS_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.3fZ";

/// Filesystem artifact store
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Create a store rooted at the given directory
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Format a timestamp for embedding in filenames
    #[must_use]
    pub fn timestamp_slug(at: DateTime<Utc>) -> String {
        at.format(TS_FORMAT).to_string()
    }

    /// Parse a filename-embedded timestamp
    #[must_use]
    pub fn parse_timestamp_slug(slug: &str) -> Option<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(slug, TS_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }

    fn write_file(&self, subdir: &str, name: &str, content: &str) -> Result<PathBuf> {
        let dir = self.root.join(subdir);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join(name);
        std::fs::write(&path, content)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    /// Persist one metrics sample
    pub fn write_metrics(&self, at: DateTime<Utc>, payload: &Value) -> Result<PathBuf> {
        let name = format!("metrics-{}.json", Self::timestamp_slug(at));
        self.write_file("metrics", &name, &serde_json::to_string_pretty(payload)?)
    }

    /// Persist a log-analysis writeup
    pub fn write_analysis(&self, at: DateTime<Utc>, markdown: &str) -> Result<PathBuf> {
        let name = format!("log-insights-{}.md", Self::timestamp_slug(at));
        self.write_file("analysis", &name, markdown)
    }

    /// Persist an incident writeup
    pub fn write_incident(&self, incident_id: &str, markdown: &str) -> Result<PathBuf> {
        self.write_file("incidents", &format!("{incident_id}.md"), markdown)
    }

    /// Persist an operator report
    pub fn write_report(
        &self,
        report_type: &str,
        at: DateTime<Utc>,
        markdown: &str,
    ) -> Result<PathBuf> {
        let name = format!("ops-report-{report_type}-{}.md", Self::timestamp_slug(at));
        self.write_file("reports", &name, markdown)
    }

    fn sorted_entries(&self, subdir: &str, prefix: &str) -> Result<Vec<String>> {
        let dir = self.root.join(subdir);
        let mut names = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => {
                return Err(e).with_context(|| format!("listing {}", dir.display()));
            }
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(prefix) {
                names.push(name);
            }
        }
        names.sort_by(|a, b| b.cmp(a));
        Ok(names)
    }

    fn metrics_timestamp(name: &str) -> Option<DateTime<Utc>> {
        let slug = name.strip_prefix("metrics-")?.strip_suffix(".json")?;
        Self::parse_timestamp_slug(slug)
    }

    /// Newest metrics sample, when any exists
    pub fn latest_metrics(&self) -> Result<Option<(DateTime<Utc>, Value)>> {
        let names = self.sorted_entries("metrics", "metrics-")?;
        for name in names {
            let Some(at) = Self::metrics_timestamp(&name) else {
                continue;
            };
            let path = self.root.join("metrics").join(&name);
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let value: Value = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            return Ok(Some((at, value)));
        }
        Ok(None)
    }

    /// Metrics samples inside the window, newest first
    pub fn recent_metrics(&self, window_minutes: i64) -> Result<Vec<(DateTime<Utc>, Value)>> {
        let cutoff = Utc::now() - chrono::Duration::minutes(window_minutes);
        let mut samples = Vec::new();
        for name in self.sorted_entries("metrics", "metrics-")? {
            let Some(at) = Self::metrics_timestamp(&name) else {
                continue;
            };
            // Names sort newest-first; the first stale entry ends the scan.
            if at < cutoff {
                break;
            }
            let path = self.root.join("metrics").join(&name);
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let value: Value = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            samples.push((at, value));
        }
        Ok(samples)
    }
}
