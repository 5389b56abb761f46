//! Incident orchestrator
//!
//! Translates alerts into deduplicated service desk tickets and reflects
//! auto-heal outcomes back onto them. Ticket-side failures are swallowed to
//! `None`: alerts are fire-and-forget and will be re-raised by the next
//! monitoring poll, so the caller only logs.

use crate::alert::{fingerprint, Alert};
use crate::dedup::DedupCache;
use crate::heal::HealResult;
use crate::ticket::{CreateRequest, DeskConfig, TicketApi};
use chrono::{DateTime, Utc};
use ops_core::{Clock, SystemClock};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Label added when auto-heal resolved the incident
pub const LABEL_AUTO_HEAL_SUCCESS: &str = "autoHealSuccess";
/// Label added when auto-heal failed
pub const LABEL_AUTO_HEAL_FAILED: &str = "autoHealFailed";
/// Label asking a human to step in
pub const LABEL_MANUAL_INTERVENTION: &str = "manualIntervention";

/// Result of pushing one alert through the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncidentOutcome {
    /// Ticket carrying the incident
    pub ticket_key: String,
    /// True when an existing ticket absorbed the alert
    pub deduplicated: bool,
}

/// Incident lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentState {
    /// Ticket is open and collecting alerts
    Open,
    /// Auto-heal resolved the ticket
    Resolved,
    /// Closed on the desk side
    Closed,
}

/// Tracked state of one incident ticket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    /// Issue key on the service desk
    pub ticket_key: String,
    /// Fingerprint the incident collapses alerts onto
    pub fingerprint: String,
    /// First-seen timestamp
    pub created_at: DateTime<Utc>,
    /// Most recent alert timestamp
    pub last_seen_at: DateTime<Utc>,
    /// Alerts absorbed so far
    pub alert_count: u32,
    /// Lifecycle state
    pub state: IncidentState,
    /// Labels added by auto-heal reflection
    pub auto_heal_labels: Vec<String>,
}

/// Alert-to-ticket orchestrator
pub struct IncidentOrchestrator {
    config: DeskConfig,
    api: Arc<dyn TicketApi>,
    cache: DedupCache,
    incidents: Mutex<HashMap<String, Incident>>,
    clock: Arc<dyn Clock>,
}

impl IncidentOrchestrator {
    /// Create an orchestrator over a ticket API
    pub fn new(config: DeskConfig, api: Arc<dyn TicketApi>) -> Self {
        Self::with_clock(config, api, Arc::new(SystemClock))
    }

    /// Create an orchestrator with an explicit clock
    pub fn with_clock(config: DeskConfig, api: Arc<dyn TicketApi>, clock: Arc<dyn Clock>) -> Self {
        let cache = DedupCache::new(config.window_minutes, config.dedup_cache_cap);
        Self {
            config,
            api,
            cache,
            incidents: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Record an alert against an incident, creating the entry when absent
    fn track_alert(&self, ticket_key: &str, fp: &str, now: DateTime<Utc>) {
        let mut incidents = self.incidents.lock();
        let incident = incidents
            .entry(ticket_key.to_string())
            .or_insert_with(|| Incident {
                ticket_key: ticket_key.to_string(),
                fingerprint: fp.to_string(),
                created_at: now,
                last_seen_at: now,
                alert_count: 0,
                state: IncidentState::Open,
                auto_heal_labels: Vec::new(),
            });
        incident.alert_count += 1;
        incident.last_seen_at = now;
    }

    /// Snapshot a tracked incident
    #[must_use]
    pub fn incident(&self, ticket_key: &str) -> Option<Incident> {
        self.incidents.lock().get(ticket_key).cloned()
    }

    /// Snapshot every tracked incident
    #[must_use]
    pub fn incidents(&self) -> Vec<Incident> {
        self.incidents.lock().values().cloned().collect()
    }

    /// Open or dedup a ticket for an alert
    ///
    /// Returns `None` when the orchestrator is disabled or the service desk
    /// failed; the alert will come around again on the next poll.
    pub async fn create_incident_from_alert(&self, alert: &Alert) -> Option<IncidentOutcome> {
        if !self.config.enabled {
            return None;
        }

        let now = self.clock.now();
        let fp = fingerprint(alert, &self.config.fingerprint_metadata_keys);

        // Fresh cache hit: comment on the existing ticket.
        if let Some(ticket_key) = self.cache.lookup(&fp, now) {
            debug!(fingerprint = %fp, ticket = %ticket_key, "deduplicated via cache");
            return match self
                .api
                .add_comment(&ticket_key, &dedup_comment(alert), true)
                .await
            {
                Ok(()) => {
                    self.track_alert(&ticket_key, &fp, now);
                    Some(IncidentOutcome {
                        ticket_key,
                        deduplicated: true,
                    })
                }
                Err(e) => {
                    warn!(ticket = %ticket_key, error = %e, "dedup comment failed");
                    None
                }
            };
        }

        // Cache miss: look for a recent open ticket carrying the fingerprint.
        let jql = format!(
            "labels = \"fp-{fp}\" AND created >= -{}m AND statusCategory != Done",
            self.config.window_minutes
        );
        match self.api.search_issues(&jql).await {
            Ok(existing) => {
                if let Some(ticket) = existing.first() {
                    debug!(fingerprint = %fp, ticket = %ticket.key, "deduplicated via search");
                    self.cache.insert(&fp, &ticket.key, now);
                    return match self
                        .api
                        .add_comment(&ticket.key, &dedup_comment(alert), true)
                        .await
                    {
                        Ok(()) => {
                            self.track_alert(&ticket.key, &fp, now);
                            Some(IncidentOutcome {
                                ticket_key: ticket.key.clone(),
                                deduplicated: true,
                            })
                        }
                        Err(e) => {
                            warn!(ticket = %ticket.key, error = %e, "dedup comment failed");
                            None
                        }
                    };
                }
            }
            Err(e) => {
                warn!(fingerprint = %fp, error = %e, "fingerprint search failed");
                return None;
            }
        }

        // New incident.
        let request = self.build_create_request(alert, &fp);
        let ticket = match self.api.create_request(request).await {
            Ok(ticket) => ticket,
            Err(e) => {
                warn!(alert = %alert.id, error = %e, "ticket creation failed");
                return None;
            }
        };

        // The fingerprint label is what search-side dedup keys on; losing it
        // only degrades dedup for other processes, so it is best-effort.
        let labels = vec![format!("fp-{fp}"), "medulla".to_string()];
        if let Err(e) = self.api.add_labels(&ticket.key, &labels).await {
            warn!(ticket = %ticket.key, error = %e, "failed to label new ticket");
        }

        self.cache.insert(&fp, &ticket.key, now);
        self.track_alert(&ticket.key, &fp, now);
        info!(ticket = %ticket.key, alert = %alert.id, fingerprint = %fp, "incident created");
        Some(IncidentOutcome {
            ticket_key: ticket.key,
            deduplicated: false,
        })
    }

    /// Reflect an auto-heal outcome onto the incident ticket
    ///
    /// Success resolves the ticket via the configured transition; failure
    /// labels it for manual intervention and leaves the state alone.
    pub async fn update_incident_with_auto_heal_result(
        &self,
        ticket_key: &str,
        heal: &HealResult,
    ) -> Option<()> {
        if !self.config.enabled {
            return None;
        }

        if let Err(e) = self
            .api
            .add_comment(ticket_key, &heal_comment(heal), true)
            .await
        {
            warn!(ticket = %ticket_key, error = %e, "auto-heal comment failed");
            return None;
        }

        if let Some(field_id) = self.config.custom_fields.get("autoHealResult") {
            let value = if heal.success { "success" } else { "failed" };
            if let Err(e) = self
                .api
                .update_issue(ticket_key, json!({ field_id.as_str(): value }))
                .await
            {
                warn!(ticket = %ticket_key, error = %e, "auto-heal field update failed");
                return None;
            }
        }

        if heal.success {
            if let Err(e) = self
                .api
                .add_labels(ticket_key, &[LABEL_AUTO_HEAL_SUCCESS.to_string()])
                .await
            {
                warn!(ticket = %ticket_key, error = %e, "auto-heal label failed");
                return None;
            }
            if let Some(transition_id) = self.config.transition_mapping.get("resolved") {
                if let Err(e) = self
                    .api
                    .transition_issue(
                        ticket_key,
                        transition_id,
                        Some("Resolved automatically by auto-heal."),
                    )
                    .await
                {
                    warn!(ticket = %ticket_key, error = %e, "resolve transition failed");
                    return None;
                }
            }
        } else {
            let labels = vec![
                LABEL_AUTO_HEAL_FAILED.to_string(),
                LABEL_MANUAL_INTERVENTION.to_string(),
            ];
            if let Err(e) = self.api.add_labels(ticket_key, &labels).await {
                warn!(ticket = %ticket_key, error = %e, "failure labels failed");
                return None;
            }
        }

        {
            let mut incidents = self.incidents.lock();
            if let Some(incident) = incidents.get_mut(ticket_key) {
                if heal.success {
                    incident.state = IncidentState::Resolved;
                    incident.auto_heal_labels
                        .push(LABEL_AUTO_HEAL_SUCCESS.to_string());
                } else {
                    incident
                        .auto_heal_labels
                        .push(LABEL_AUTO_HEAL_FAILED.to_string());
                    incident
                        .auto_heal_labels
                        .push(LABEL_MANUAL_INTERVENTION.to_string());
                }
            }
        }

        Some(())
    }

    /// Wipe the dedup cache (tests and operational resets)
    pub fn clear_incident_cache(&self) {
        self.cache.clear();
    }

    /// Current dedup cache size
    #[must_use]
    pub fn cached_incidents(&self) -> usize {
        self.cache.len()
    }

    fn build_create_request(&self, alert: &Alert, fp: &str) -> CreateRequest {
        let level = alert.level.as_str().to_uppercase();
        let short = alert.message.lines().next().unwrap_or("");
        let summary = format!("[{level}] {} - {short}", alert.metric);

        let threshold = alert
            .threshold
            .map(|t| t.to_string())
            .unwrap_or_else(|| "N/A".to_string());
        let metadata = serde_json::to_string(&alert.metadata).unwrap_or_else(|_| "{}".to_string());
        let description = format!(
            "Alert ID: {}\nMetric: {}\nValue: {}\nThreshold: {}\nLevel: {}\nTimestamp: {}\nFingerprint: {}\n\n{}\n\nMetadata: {}",
            alert.id,
            alert.metric,
            alert.value,
            threshold,
            alert.level,
            alert.timestamp.to_rfc3339(),
            fp,
            alert.message,
            metadata
        );

        let priority = self
            .config
            .priority_mapping
            .get(alert.level.as_str())
            .cloned();

        let mut custom_fields = std::collections::HashMap::new();
        for (name, field_id) in &self.config.custom_fields {
            let value = match name.as_str() {
                "alertId" => json!(alert.id),
                "metric" => json!(alert.metric),
                "level" => json!(alert.level.as_str()),
                "value" => json!(alert.value),
                "fingerprint" => json!(fp),
                _ => continue,
            };
            custom_fields.insert(field_id.clone(), value);
        }

        CreateRequest {
            summary,
            description,
            priority,
            custom_fields,
        }
    }
}

fn dedup_comment(alert: &Alert) -> String {
    format!(
        "Alert re-fired: {} = {} at {} (alert {})",
        alert.metric,
        alert.value,
        alert.timestamp.to_rfc3339(),
        alert.id
    )
}

fn heal_comment(heal: &HealResult) -> String {
    let mut lines = vec![
        format!("Auto-heal playbook: {}", heal.playbook),
        format!(
            "Outcome: {}",
            if heal.success { "success" } else { "failed" }
        ),
        format!("Duration: {}ms", heal.duration_ms),
        "Actions:".to_string(),
    ];
    for action in &heal.actions {
        lines.push(format!(
            "- {} ({})",
            action.command,
            if action.success { "ok" } else { "failed" }
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertLevel;
    use crate::error::{IncidentError, IncidentResult};
    use crate::heal::HealAction;
    use crate::ticket::{AuthConfig, TicketRef};
    use async_trait::async_trait;
    use chrono::Utc;
    use ops_core::ManualClock;
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::collections::{BTreeMap, HashMap};

    #[derive(Default)]
    struct ScriptedDesk {
        created: Mutex<Vec<CreateRequest>>,
        comments: Mutex<Vec<(String, String)>>,
        labels: Mutex<Vec<(String, Vec<String>)>>,
        transitions: Mutex<Vec<(String, String)>>,
        updates: Mutex<Vec<(String, Value)>>,
        search_results: Mutex<Vec<TicketRef>>,
        next_key: Mutex<u32>,
        fail_all: Mutex<bool>,
    }

    impl ScriptedDesk {
        fn check(&self) -> IncidentResult<()> {
            if *self.fail_all.lock() {
                return Err(IncidentError::Network {
                    reason: "injected".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl TicketApi for ScriptedDesk {
        async fn create_request(&self, request: CreateRequest) -> IncidentResult<TicketRef> {
            self.check()?;
            let mut next = self.next_key.lock();
            *next += 1;
            let key = format!("OPS-{next}");
            self.created.lock().push(request);
            Ok(TicketRef { key })
        }

        async fn get_request(&self, _issue_key: &str) -> IncidentResult<Value> {
            self.check()?;
            Ok(Value::Null)
        }

        async fn add_comment(
            &self,
            issue_key: &str,
            body: &str,
            _public: bool,
        ) -> IncidentResult<()> {
            self.check()?;
            self.comments
                .lock()
                .push((issue_key.to_string(), body.to_string()));
            Ok(())
        }

        async fn transition_issue(
            &self,
            issue_key: &str,
            transition_id: &str,
            _comment: Option<&str>,
        ) -> IncidentResult<()> {
            self.check()?;
            self.transitions
                .lock()
                .push((issue_key.to_string(), transition_id.to_string()));
            Ok(())
        }

        async fn update_issue(&self, issue_key: &str, fields: Value) -> IncidentResult<()> {
            self.check()?;
            self.updates.lock().push((issue_key.to_string(), fields));
            Ok(())
        }

        async fn add_labels(&self, issue_key: &str, labels: &[String]) -> IncidentResult<()> {
            self.check()?;
            self.labels
                .lock()
                .push((issue_key.to_string(), labels.to_vec()));
            Ok(())
        }

        async fn search_issues(&self, _jql: &str) -> IncidentResult<Vec<TicketRef>> {
            self.check()?;
            Ok(self.search_results.lock().clone())
        }

        async fn get_service_desk(&self) -> IncidentResult<Value> {
            self.check()?;
            Ok(Value::Null)
        }

        async fn get_request_types(&self) -> IncidentResult<Value> {
            self.check()?;
            Ok(Value::Null)
        }
    }

    fn config(enabled: bool) -> DeskConfig {
        DeskConfig {
            enabled,
            base_url: "http://desk.local".to_string(),
            auth: AuthConfig::Bearer {
                token: "t".to_string(),
            },
            service_desk_id: "10".to_string(),
            request_type_id: "42".to_string(),
            max_requests_per_minute: 60,
            timeout_ms: 1000,
            retry_base_ms: 10,
            window_minutes: 30,
            dedup_cache_cap: 64,
            priority_mapping: HashMap::from([
                ("high".to_string(), "High".to_string()),
                ("critical".to_string(), "Highest".to_string()),
            ]),
            transition_mapping: HashMap::from([("resolved".to_string(), "31".to_string())]),
            custom_fields: HashMap::from([
                ("autoHealResult".to_string(), "customfield_9001".to_string()),
                ("metric".to_string(), "customfield_9002".to_string()),
            ]),
            fingerprint_metadata_keys: Vec::new(),
        }
    }

    fn cpu_alert() -> Alert {
        Alert {
            id: "a-1".to_string(),
            metric: "cpu".to_string(),
            value: 97.0,
            threshold: Some(90.0),
            level: AlertLevel::High,
            message: "cpu saturated on web tier".to_string(),
            timestamp: Utc::now(),
            should_auto_heal: true,
            metadata: BTreeMap::new(),
        }
    }

    fn setup(enabled: bool) -> (IncidentOrchestrator, Arc<ScriptedDesk>, ManualClock) {
        let desk = Arc::new(ScriptedDesk::default());
        let clock = ManualClock::from_system();
        let orchestrator = IncidentOrchestrator::with_clock(
            config(enabled),
            desk.clone(),
            Arc::new(clock.clone()),
        );
        (orchestrator, desk, clock)
    }

    #[tokio::test]
    async fn test_first_alert_creates_ticket() {
        let (orchestrator, desk, _clock) = setup(true);
        let outcome = orchestrator
            .create_incident_from_alert(&cpu_alert())
            .await
            .unwrap();

        assert_eq!(outcome.ticket_key, "OPS-1");
        assert!(!outcome.deduplicated);

        let created = desk.created.lock();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].summary, "[HIGH] cpu - cpu saturated on web tier");
        assert!(created[0].description.contains("Threshold: 90"));
        assert_eq!(created[0].priority.as_deref(), Some("High"));
        assert!(created[0].custom_fields.contains_key("customfield_9002"));

        // The new ticket carries its fingerprint label.
        let labels = desk.labels.lock();
        assert!(labels[0].1.iter().any(|l| l.starts_with("fp-")));
    }

    #[tokio::test]
    async fn test_same_fingerprint_inside_window_dedups() {
        let (orchestrator, desk, clock) = setup(true);
        let first = orchestrator
            .create_incident_from_alert(&cpu_alert())
            .await
            .unwrap();

        clock.advance_minutes(10);
        let second = orchestrator
            .create_incident_from_alert(&cpu_alert())
            .await
            .unwrap();

        assert_eq!(second.ticket_key, first.ticket_key);
        assert!(second.deduplicated);
        assert_eq!(desk.created.lock().len(), 1);
        assert_eq!(desk.comments.lock().len(), 1);

        let incident = orchestrator.incident(&first.ticket_key).unwrap();
        assert_eq!(incident.alert_count, 2);
        assert_eq!(incident.state, IncidentState::Open);
        assert!(incident.last_seen_at > incident.created_at);
    }

    #[tokio::test]
    async fn test_expired_window_opens_new_ticket() {
        let (orchestrator, desk, clock) = setup(true);
        orchestrator
            .create_incident_from_alert(&cpu_alert())
            .await
            .unwrap();

        clock.advance_minutes(31);
        let second = orchestrator
            .create_incident_from_alert(&cpu_alert())
            .await
            .unwrap();

        assert_eq!(second.ticket_key, "OPS-2");
        assert!(!second.deduplicated);
        assert_eq!(desk.created.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_search_fallback_dedups_across_restarts() {
        let (orchestrator, desk, _clock) = setup(true);
        // Another process already opened a ticket for this fingerprint.
        desk.search_results.lock().push(TicketRef {
            key: "OPS-77".to_string(),
        });

        let outcome = orchestrator
            .create_incident_from_alert(&cpu_alert())
            .await
            .unwrap();

        assert_eq!(outcome.ticket_key, "OPS-77");
        assert!(outcome.deduplicated);
        assert!(desk.created.lock().is_empty());
        assert_eq!(orchestrator.cached_incidents(), 1);
    }

    #[tokio::test]
    async fn test_upstream_failure_returns_none() {
        let (orchestrator, desk, _clock) = setup(true);
        *desk.fail_all.lock() = true;
        assert!(orchestrator
            .create_incident_from_alert(&cpu_alert())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_disabled_mode_returns_none() {
        let (orchestrator, desk, _clock) = setup(false);
        assert!(orchestrator
            .create_incident_from_alert(&cpu_alert())
            .await
            .is_none());
        assert!(desk.created.lock().is_empty());

        let heal = HealResult {
            playbook: "cpu-runaway".to_string(),
            success: true,
            duration_ms: 1200,
            actions: vec![],
        };
        assert!(orchestrator
            .update_incident_with_auto_heal_result("OPS-1", &heal)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_clear_cache_forgets_fingerprints() {
        let (orchestrator, desk, _clock) = setup(true);
        orchestrator
            .create_incident_from_alert(&cpu_alert())
            .await
            .unwrap();
        orchestrator.clear_incident_cache();
        assert_eq!(orchestrator.cached_incidents(), 0);

        // Without cache or search hits a second ticket is opened.
        orchestrator
            .create_incident_from_alert(&cpu_alert())
            .await
            .unwrap();
        assert_eq!(desk.created.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_heal_success_resolves_and_labels() {
        let (orchestrator, desk, _clock) = setup(true);
        let heal = HealResult {
            playbook: "cpu-runaway".to_string(),
            success: true,
            duration_ms: 900,
            actions: vec![HealAction {
                command: "systemctl restart storefront".to_string(),
                success: true,
                output: None,
            }],
        };

        orchestrator
            .update_incident_with_auto_heal_result("OPS-1", &heal)
            .await
            .unwrap();

        let comments = desk.comments.lock();
        assert!(comments[0].1.contains("cpu-runaway"));
        assert!(comments[0].1.contains("systemctl restart storefront"));

        let updates = desk.updates.lock();
        assert_eq!(updates[0].1["customfield_9001"], "success");

        let labels = desk.labels.lock();
        assert_eq!(labels[0].1, vec![LABEL_AUTO_HEAL_SUCCESS.to_string()]);

        let transitions = desk.transitions.lock();
        assert_eq!(transitions[0], ("OPS-1".to_string(), "31".to_string()));
    }

    #[tokio::test]
    async fn test_heal_success_marks_incident_resolved() {
        let (orchestrator, _desk, _clock) = setup(true);
        let outcome = orchestrator
            .create_incident_from_alert(&cpu_alert())
            .await
            .unwrap();

        let heal = HealResult {
            playbook: "cpu-runaway".to_string(),
            success: true,
            duration_ms: 900,
            actions: vec![],
        };
        orchestrator
            .update_incident_with_auto_heal_result(&outcome.ticket_key, &heal)
            .await
            .unwrap();

        let incident = orchestrator.incident(&outcome.ticket_key).unwrap();
        assert_eq!(incident.state, IncidentState::Resolved);
        assert_eq!(
            incident.auto_heal_labels,
            vec![LABEL_AUTO_HEAL_SUCCESS.to_string()]
        );
    }

    #[tokio::test]
    async fn test_heal_failure_labels_without_transition() {
        let (orchestrator, desk, _clock) = setup(true);
        let heal = HealResult {
            playbook: "cpu-runaway".to_string(),
            success: false,
            duration_ms: 450,
            actions: vec![],
        };

        orchestrator
            .update_incident_with_auto_heal_result("OPS-1", &heal)
            .await
            .unwrap();

        let labels = desk.labels.lock();
        assert_eq!(
            labels[0].1,
            vec![
                LABEL_AUTO_HEAL_FAILED.to_string(),
                LABEL_MANUAL_INTERVENTION.to_string()
            ]
        );
        assert!(desk.transitions.lock().is_empty());

        let updates = desk.updates.lock();
        assert_eq!(updates[0].1["customfield_9001"], "failed");
    }
}
