//! Incident orchestration and service desk integration
//!
//! This crate turns monitoring alerts into deduplicated service desk
//! tickets and reflects remediation outcomes back onto them:
//! - Alert fingerprinting and a windowed, bounded dedup cache
//! - A rate-limited, retry-aware REST client over the service desk API
//! - The orchestrator pipeline (cache, search fallback, create, auto-heal
//!   reflection) with a `TicketApi` seam for test fakes
//! - Auto-heal playbook matching and outcome records

#![warn(missing_docs)]

pub mod alert;
pub mod dedup;
pub mod error;
pub mod heal;
pub mod orchestrator;
pub mod ratelimit;
pub mod ticket;

pub use alert::{fingerprint, Alert, AlertLevel};
pub use dedup::DedupCache;
pub use error::{IncidentError, IncidentResult};
pub use heal::{match_playbook, HealAction, HealResult, Playbook, PlaybookCondition};
pub use orchestrator::{
    Incident, IncidentOrchestrator, IncidentOutcome, IncidentState, LABEL_AUTO_HEAL_FAILED,
    LABEL_AUTO_HEAL_SUCCESS, LABEL_MANUAL_INTERVENTION,
};
pub use ratelimit::TokenBucket;
pub use ticket::{
    resolve_env_refs, AuthConfig, CreateRequest, DeskConfig, TicketApi, TicketClient, TicketRef,
};
