//! Service desk client
//!
//! Thin, resilient HTTP facade over the service desk REST API: token-bucket
//! rate limiting, exponential-backoff retries on transient failures, and
//! `${VAR}` credential resolution at construction.

use crate::error::{IncidentError, IncidentResult};
use crate::ratelimit::TokenBucket;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Service desk authentication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum AuthConfig {
    /// Email + API token, sent as HTTP Basic
    Basic {
        /// Account email, may be a `${VAR}` reference
        email: String,
        /// API token, may be a `${VAR}` reference
        api_token: String,
    },
    /// Bearer token
    Bearer {
        /// Token, may be a `${VAR}` reference
        token: String,
    },
}

/// Service desk and orchestrator configuration (`jsm-config.json`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeskConfig {
    /// Master switch; when false every operation returns `None`
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// API base URL, no trailing slash
    pub base_url: String,

    /// Authentication
    pub auth: AuthConfig,

    /// Service desk to file requests against
    pub service_desk_id: String,

    /// Request type for new incidents
    pub request_type_id: String,

    /// Outbound request budget
    #[serde(default = "default_max_requests_per_minute")]
    pub max_requests_per_minute: u32,

    /// Per-request HTTP timeout
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Base delay for exponential retry backoff
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    /// Dedup window
    #[serde(default = "default_window_minutes")]
    pub window_minutes: i64,

    /// Dedup cache entry cap
    #[serde(default = "default_dedup_cache_cap")]
    pub dedup_cache_cap: usize,

    /// Alert level to desk priority name
    #[serde(default)]
    pub priority_mapping: HashMap<String, String>,

    /// Logical transition name ("resolved") to desk transition id
    #[serde(default)]
    pub transition_mapping: HashMap<String, String>,

    /// Logical field name to desk custom field id
    #[serde(default)]
    pub custom_fields: HashMap<String, String>,

    /// Metadata keys participating in the alert fingerprint
    #[serde(default)]
    pub fingerprint_metadata_keys: Vec<String>,
}

fn default_true() -> bool {
    true
}
fn default_max_requests_per_minute() -> u32 {
    30
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_retry_base_ms() -> u64 {
    500
}
fn default_window_minutes() -> i64 {
    30
}
fn default_dedup_cache_cap() -> usize {
    1024
}

/// Resolve `${VAR}` references against the environment
///
/// Plain strings pass through; a reference to an unset variable fails.
pub fn resolve_env_refs(value: &str) -> IncidentResult<String> {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        let Some(end) = tail.find('}') else {
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let var = &tail[..end];
        let resolved = std::env::var(var).map_err(|_| IncidentError::EnvVarMissing {
            var: var.to_string(),
        })?;
        out.push_str(&resolved);
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Reference to a created or found ticket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRef {
    /// Issue key, e.g. `OPS-123`
    pub key: String,
}

/// Fields for a new service desk request
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    /// Request summary line
    pub summary: String,
    /// Request description body
    pub description: String,
    /// Desk priority name, when mapped
    pub priority: Option<String>,
    /// Custom field id to value
    pub custom_fields: HashMap<String, Value>,
}

/// Capability seam over the service desk REST API
#[async_trait]
pub trait TicketApi: Send + Sync {
    /// File a new request
    async fn create_request(&self, request: CreateRequest) -> IncidentResult<TicketRef>;

    /// Fetch a request by issue key
    async fn get_request(&self, issue_key: &str) -> IncidentResult<Value>;

    /// Append a comment
    async fn add_comment(&self, issue_key: &str, body: &str, public: bool) -> IncidentResult<()>;

    /// Move an issue through a workflow transition
    async fn transition_issue(
        &self,
        issue_key: &str,
        transition_id: &str,
        comment: Option<&str>,
    ) -> IncidentResult<()>;

    /// Update issue fields
    async fn update_issue(&self, issue_key: &str, fields: Value) -> IncidentResult<()>;

    /// Add labels to an issue
    async fn add_labels(&self, issue_key: &str, labels: &[String]) -> IncidentResult<()>;

    /// Search issues by JQL
    async fn search_issues(&self, jql: &str) -> IncidentResult<Vec<TicketRef>>;

    /// Fetch the configured service desk
    async fn get_service_desk(&self) -> IncidentResult<Value>;

    /// Fetch the desk's request types
    async fn get_request_types(&self) -> IncidentResult<Value>;
}

const MAX_ATTEMPTS: u32 = 4;

/// reqwest-backed `TicketApi` implementation
pub struct TicketClient {
    config: DeskConfig,
    client: reqwest::Client,
    auth_header: String,
    bucket: TokenBucket,
}

impl TicketClient {
    /// Build a client, resolving credential references
    ///
    /// Fails with `EnvVarMissing` when a `${VAR}` reference cannot be
    /// resolved, so misconfiguration surfaces at startup rather than on the
    /// first alert.
    pub fn new(config: DeskConfig) -> IncidentResult<Self> {
        let auth_header = match &config.auth {
            AuthConfig::Basic { email, api_token } => {
                let email = resolve_env_refs(email)?;
                let token = resolve_env_refs(api_token)?;
                format!("Basic {}", BASE64.encode(format!("{email}:{token}")))
            }
            AuthConfig::Bearer { token } => {
                format!("Bearer {}", resolve_env_refs(token)?)
            }
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| IncidentError::InvalidConfig {
                reason: e.to_string(),
            })?;

        let bucket = TokenBucket::per_minute(config.max_requests_per_minute);
        Ok(Self {
            config,
            client,
            auth_header,
            bucket,
        })
    }

    /// Issue one request with rate limiting and retry
    ///
    /// Retries (up to 3, so 4 calls total) apply to network failures, 429
    /// (honoring `Retry-After`), and 5xx. Other 4xx are terminal.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> IncidentResult<Value> {
        let url = format!("{}{}", self.config.base_url, path);
        let mut last_error = IncidentError::Network {
            reason: "no attempts made".to_string(),
        };

        for attempt in 0..MAX_ATTEMPTS {
            self.bucket.acquire().await;

            let mut request = self
                .client
                .request(method.clone(), &url)
                .header("Authorization", &self.auth_header)
                .header("Accept", "application/json");
            if let Some(body) = &body {
                request = request.json(body);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!(url = %url, attempt, error = %e, "request failed");
                    last_error = IncidentError::Network {
                        reason: e.to_string(),
                    };
                    self.backoff(attempt, None).await;
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                if status == StatusCode::NO_CONTENT {
                    return Ok(Value::Null);
                }
                return response.json::<Value>().await.or(Ok(Value::Null));
            }

            let retry_after = parse_retry_after(&response);
            let text = response.text().await.unwrap_or_default();

            if status == StatusCode::TOO_MANY_REQUESTS {
                warn!(url = %url, attempt, "rate limited by service desk");
                last_error = IncidentError::RateLimitExhausted;
                self.backoff(attempt, retry_after).await;
                continue;
            }
            if status.is_server_error() {
                warn!(url = %url, attempt, status = status.as_u16(), "server error");
                last_error = IncidentError::ApiError {
                    status: status.as_u16(),
                    body: text,
                };
                self.backoff(attempt, None).await;
                continue;
            }

            // Remaining 4xx are terminal.
            return Err(IncidentError::ApiError {
                status: status.as_u16(),
                body: text,
            });
        }

        Err(last_error)
    }

    async fn backoff(&self, attempt: u32, retry_after: Option<Duration>) {
        if attempt + 1 >= MAX_ATTEMPTS {
            return;
        }
        let delay = retry_after.unwrap_or_else(|| {
            Duration::from_millis(self.config.retry_base_ms * 2u64.pow(attempt))
        });
        debug!(delay_ms = delay.as_millis() as u64, "backing off before retry");
        tokio::time::sleep(delay).await;
    }
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl TicketApi for TicketClient {
    async fn create_request(&self, request: CreateRequest) -> IncidentResult<TicketRef> {
        let mut field_values = json!({
            "summary": request.summary,
            "description": request.description,
        });
        if let Some(priority) = &request.priority {
            field_values["priority"] = json!({ "name": priority });
        }
        for (field_id, value) in &request.custom_fields {
            field_values[field_id.as_str()] = value.clone();
        }

        let body = json!({
            "serviceDeskId": self.config.service_desk_id,
            "requestTypeId": self.config.request_type_id,
            "requestFieldValues": field_values,
        });
        let response = self
            .send(Method::POST, "/rest/servicedeskapi/request", Some(body))
            .await?;

        let key = response
            .get("issueKey")
            .and_then(Value::as_str)
            .ok_or_else(|| IncidentError::ApiError {
                status: 200,
                body: "create response missing issueKey".to_string(),
            })?;
        Ok(TicketRef {
            key: key.to_string(),
        })
    }

    async fn get_request(&self, issue_key: &str) -> IncidentResult<Value> {
        self.send(
            Method::GET,
            &format!("/rest/servicedeskapi/request/{issue_key}"),
            None,
        )
        .await
    }

    async fn add_comment(&self, issue_key: &str, body: &str, public: bool) -> IncidentResult<()> {
        self.send(
            Method::POST,
            &format!("/rest/servicedeskapi/request/{issue_key}/comment"),
            Some(json!({ "body": body, "public": public })),
        )
        .await
        .map(|_| ())
    }

    async fn transition_issue(
        &self,
        issue_key: &str,
        transition_id: &str,
        comment: Option<&str>,
    ) -> IncidentResult<()> {
        let mut body = json!({ "id": transition_id });
        if let Some(comment) = comment {
            body["additionalComment"] = json!({ "body": comment });
        }
        self.send(
            Method::POST,
            &format!("/rest/servicedeskapi/request/{issue_key}/transition"),
            Some(body),
        )
        .await
        .map(|_| ())
    }

    async fn update_issue(&self, issue_key: &str, fields: Value) -> IncidentResult<()> {
        self.send(
            Method::PUT,
            &format!("/rest/api/2/issue/{issue_key}"),
            Some(json!({ "fields": fields })),
        )
        .await
        .map(|_| ())
    }

    async fn add_labels(&self, issue_key: &str, labels: &[String]) -> IncidentResult<()> {
        let adds: Vec<Value> = labels.iter().map(|l| json!({ "add": l })).collect();
        self.send(
            Method::PUT,
            &format!("/rest/api/2/issue/{issue_key}"),
            Some(json!({ "update": { "labels": adds } })),
        )
        .await
        .map(|_| ())
    }

    async fn search_issues(&self, jql: &str) -> IncidentResult<Vec<TicketRef>> {
        let encoded: String = url_encode(jql);
        let response = self
            .send(
                Method::GET,
                &format!("/rest/api/2/search?jql={encoded}"),
                None,
            )
            .await?;
        let issues = response
            .get("issues")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(issues
            .iter()
            .filter_map(|issue| issue.get("key").and_then(Value::as_str))
            .map(|key| TicketRef {
                key: key.to_string(),
            })
            .collect())
    }

    async fn get_service_desk(&self) -> IncidentResult<Value> {
        self.send(
            Method::GET,
            &format!(
                "/rest/servicedeskapi/servicedesk/{}",
                self.config.service_desk_id
            ),
            None,
        )
        .await
    }

    async fn get_request_types(&self) -> IncidentResult<Value> {
        self.send(
            Method::GET,
            &format!(
                "/rest/servicedeskapi/servicedesk/{}/requesttype",
                self.config.service_desk_id
            ),
            None,
        )
        .await
    }
}

/// Minimal percent-encoding for JQL query values
fn url_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_env_refs_passthrough() {
        assert_eq!(resolve_env_refs("plain-token").unwrap(), "plain-token");
    }

    #[test]
    fn test_resolve_env_refs_substitutes() {
        std::env::set_var("MEDULLA_TEST_TOKEN", "s3cr3t");
        assert_eq!(
            resolve_env_refs("${MEDULLA_TEST_TOKEN}").unwrap(),
            "s3cr3t"
        );
        assert_eq!(
            resolve_env_refs("prefix-${MEDULLA_TEST_TOKEN}-suffix").unwrap(),
            "prefix-s3cr3t-suffix"
        );
    }

    #[test]
    fn test_resolve_env_refs_missing_fails() {
        let err = resolve_env_refs("${MEDULLA_TEST_DOES_NOT_EXIST}").unwrap_err();
        assert!(matches!(err, IncidentError::EnvVarMissing { var } if var == "MEDULLA_TEST_DOES_NOT_EXIST"));
    }

    #[test]
    fn test_client_construction_fails_on_missing_var() {
        let config = DeskConfig {
            enabled: true,
            base_url: "http://localhost:1".to_string(),
            auth: AuthConfig::Bearer {
                token: "${MEDULLA_TEST_ALSO_MISSING}".to_string(),
            },
            service_desk_id: "10".to_string(),
            request_type_id: "42".to_string(),
            max_requests_per_minute: 30,
            timeout_ms: 1000,
            retry_base_ms: 10,
            window_minutes: 30,
            dedup_cache_cap: 16,
            priority_mapping: HashMap::new(),
            transition_mapping: HashMap::new(),
            custom_fields: HashMap::new(),
            fingerprint_metadata_keys: Vec::new(),
        };
        assert!(TicketClient::new(config).is_err());
    }

    #[test]
    fn test_url_encode() {
        assert_eq!(url_encode("a b=\"c\""), "a%20b%3D%22c%22");
    }
}
