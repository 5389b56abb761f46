//! Fingerprint dedup cache
//!
//! Maps alert fingerprints to the ticket already opened for them inside a
//! sliding window. Expiry is lazy on access; a bounded insertion-order cap
//! keeps one-shot fingerprints from accumulating forever.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone)]
struct DedupEntry {
    ticket_key: String,
    created_at: DateTime<Utc>,
}

/// Windowed, bounded fingerprint-to-ticket cache
pub struct DedupCache {
    window: Duration,
    cap: usize,
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, DedupEntry>,
    order: VecDeque<String>,
}

impl DedupCache {
    /// Create a cache with the given window and entry cap
    #[must_use]
    pub fn new(window_minutes: i64, cap: usize) -> Self {
        Self {
            window: Duration::minutes(window_minutes),
            cap,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Ticket key for a fresh fingerprint, expiring stale entries on the way
    #[must_use]
    pub fn lookup(&self, fingerprint: &str, now: DateTime<Utc>) -> Option<String> {
        let mut inner = self.inner.lock();
        let stale = match inner.entries.get(fingerprint) {
            Some(entry) if now - entry.created_at < self.window => {
                return Some(entry.ticket_key.clone());
            }
            Some(_) => true,
            None => false,
        };
        if stale {
            inner.entries.remove(fingerprint);
            inner.order.retain(|k| k != fingerprint);
        }
        None
    }

    /// Record the ticket opened for a fingerprint
    pub fn insert(&self, fingerprint: &str, ticket_key: &str, now: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(fingerprint) {
            inner.order.push_back(fingerprint.to_string());
        }
        inner.entries.insert(
            fingerprint.to_string(),
            DedupEntry {
                ticket_key: ticket_key.to_string(),
                created_at: now,
            },
        );
        while inner.order.len() > self.cap {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }
    }

    /// Drop every entry
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    /// Current entry count
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
