//! SSH connection pool
//!
//! Keeps at most one live session per host key, hands sessions out
//! exclusively, and reaps idle ones in the background. All map and counter
//! mutations happen under a single lock; waiting for a busy connection is
//! bounded by the acquire timeout.

use crate::error::{RemoteExecError, RemoteExecResult};
use crate::transport::{Connector, Transport};
use chrono::{DateTime, Utc};
use ops_core::{Clock, Host, SystemClock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Connection pool configuration
#[derive(Debug, Clone, serde::Deserialize, Serialize)]
pub struct PoolConfig {
    /// Maximum concurrent sessions
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Idle lifetime before a session is reaped
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Deadline for opening a new session
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Deadline for waiting on a busy session
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

const fn default_max_connections() -> usize {
    10
}

const fn default_idle_timeout_ms() -> u64 {
    300_000
}

const fn default_connect_timeout_ms() -> u64 {
    10_000
}

const fn default_acquire_timeout_ms() -> u64 {
    30_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            idle_timeout_ms: default_idle_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl PoolConfig {
    /// Idle lifetime as a `Duration`
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Connect deadline as a `Duration`
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Acquire deadline as a `Duration`
    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Pool counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    /// Sessions opened over the pool's lifetime
    pub total_connections: u64,
    /// Sessions currently checked out
    pub active_connections: usize,
    /// Session open attempts that failed
    pub failed_connections: u64,
}

/// Per-connection status line
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    /// Host key
    pub host: String,
    /// Whether the session is checked out
    pub in_use: bool,
    /// Milliseconds since last use
    pub idle_ms: i64,
    /// Milliseconds since creation
    pub age_ms: i64,
}

/// Point-in-time pool status
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    /// Counters
    pub stats: PoolStats,
    /// Entries currently held
    pub pool_size: usize,
    /// Capacity
    pub max_connections: usize,
    /// Per-connection detail
    pub connections: Vec<ConnectionInfo>,
}

/// A pooled session entry
struct Connection {
    transport: Arc<dyn Transport>,
    created_at: DateTime<Utc>,
    last_used: DateTime<Utc>,
    in_use: bool,
    poisoned: bool,
}

/// Slot state: a placeholder reserves capacity and key uniqueness while a
/// connect is in flight without holding the pool lock across I/O.
enum Slot {
    Connecting,
    Ready(Connection),
}

struct PoolInner {
    slots: HashMap<String, Slot>,
    stats: PoolStats,
}

/// A session checked out of the pool
///
/// Callers must hand the host back via [`ConnectionPool::release`] (or
/// [`ConnectionPool::poison`] first, when the transport misbehaved).
pub struct PooledSession {
    /// Host key the session is bound to
    pub key: String,
    /// The live transport
    pub transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// SSH connection pool keyed by normalized host
pub struct ConnectionPool {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    clock: Arc<dyn Clock>,
    inner: Mutex<PoolInner>,
    released: Notify,
    shutdown: AtomicBool,
}

impl ConnectionPool {
    /// Create a pool over the given connector
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        Self::with_clock(config, connector, Arc::new(SystemClock))
    }

    /// Create a pool with an explicit clock
    pub fn with_clock(
        config: PoolConfig,
        connector: Arc<dyn Connector>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            connector,
            clock,
            inner: Mutex::new(PoolInner {
                slots: HashMap::new(),
                stats: PoolStats::default(),
            }),
            released: Notify::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Pool capacity
    #[must_use]
    pub fn max_connections(&self) -> usize {
        self.config.max_connections
    }

    /// Check a session out for exclusive use
    ///
    /// Reuses an idle session for the host when one exists, otherwise opens
    /// a new one. Waits up to the acquire timeout when the host's session is
    /// busy; fails with `PoolExhausted` when the pool is full of busy
    /// sessions for other hosts.
    pub async fn acquire(&self, host: &Host) -> RemoteExecResult<PooledSession> {
        let deadline = tokio::time::Instant::now() + self.config.acquire_timeout();
        let key = host.pool_key();

        loop {
            enum Action {
                Use(Arc<dyn Transport>),
                Connect,
                Wait,
            }

            let mut stale: Option<Arc<dyn Transport>> = None;
            let action = {
                let mut inner = self.inner.lock().await;
                match inner.slots.get_mut(&key) {
                    Some(Slot::Connecting) => Action::Wait,
                    Some(Slot::Ready(conn)) if conn.in_use => Action::Wait,
                    Some(Slot::Ready(conn)) => {
                        if conn.poisoned || conn.transport.is_closed() {
                            if let Some(Slot::Ready(conn)) = inner.slots.remove(&key) {
                                stale = Some(conn.transport);
                            }
                            self.reserve_slot(&mut inner, &key, host)?;
                            Action::Connect
                        } else {
                            conn.in_use = true;
                            conn.last_used = self.clock.now();
                            let transport = Arc::clone(&conn.transport);
                            inner.stats.active_connections += 1;
                            Action::Use(transport)
                        }
                    }
                    None => {
                        self.reserve_slot(&mut inner, &key, host)?;
                        Action::Connect
                    }
                }
            };

            if let Some(transport) = stale {
                transport.close().await;
            }

            match action {
                Action::Use(transport) => {
                    debug!(host = %key, "reusing pooled connection");
                    return Ok(PooledSession {
                        key,
                        transport,
                    });
                }
                Action::Connect => return self.connect_slot(host, key).await,
                Action::Wait => {
                    let now = tokio::time::Instant::now();
                    if now >= deadline {
                        return Err(RemoteExecError::AcquireTimeout {
                            host: key,
                        });
                    }
                    let step = std::cmp::min(deadline - now, Duration::from_millis(100));
                    tokio::select! {
                        _ = self.released.notified() => {}
                        _ = tokio::time::sleep(step) => {}
                    }
                }
            }
        }
    }

    /// Reserve a `Connecting` slot, evicting an idle entry when at capacity
    fn reserve_slot(
        &self,
        inner: &mut PoolInner,
        key: &str,
        host: &Host,
    ) -> RemoteExecResult<()> {
        if inner.slots.len() >= self.config.max_connections {
            let evictable = inner
                .slots
                .iter()
                .filter_map(|(k, slot)| match slot {
                    Slot::Ready(conn) if !conn.in_use => Some((k.clone(), conn.last_used)),
                    _ => None,
                })
                .min_by_key(|(_, last_used)| *last_used)
                .map(|(k, _)| k);

            match evictable {
                Some(victim) => {
                    debug!(host = %host.hostname, victim = %victim, "evicting idle connection for capacity");
                    if let Some(Slot::Ready(conn)) = inner.slots.remove(&victim) {
                        // Close without awaiting inside the lock; the session
                        // task notices the dropped handle.
                        drop(conn);
                    }
                }
                None => {
                    let busy = inner
                        .slots
                        .values()
                        .filter(|slot| matches!(slot, Slot::Ready(c) if c.in_use))
                        .count();
                    return Err(RemoteExecError::PoolExhausted {
                        busy,
                        max: self.config.max_connections,
                    });
                }
            }
        }
        inner.slots.insert(key.to_string(), Slot::Connecting);
        Ok(())
    }

    /// Open the transport for a reserved slot
    async fn connect_slot(&self, host: &Host, key: String) -> RemoteExecResult<PooledSession> {
        let result = self
            .connector
            .connect(host, self.config.connect_timeout())
            .await;

        let mut inner = self.inner.lock().await;
        match result {
            Ok(transport) => {
                let transport: Arc<dyn Transport> = Arc::from(transport);
                let now = self.clock.now();
                // Only fill the slot if our reservation survived; close_all
                // may have drained the pool while the connect was in flight.
                if matches!(inner.slots.get(&key), Some(Slot::Connecting)) {
                    inner.slots.insert(
                        key.clone(),
                        Slot::Ready(Connection {
                            transport: Arc::clone(&transport),
                            created_at: now,
                            last_used: now,
                            in_use: true,
                            poisoned: false,
                        }),
                    );
                    inner.stats.active_connections += 1;
                }
                inner.stats.total_connections += 1;
                info!(host = %key, total = inner.stats.total_connections, "opened connection");
                Ok(PooledSession { key, transport })
            }
            Err(err) => {
                inner.slots.remove(&key);
                inner.stats.failed_connections += 1;
                self.released.notify_waiters();
                warn!(host = %key, error = %err, "connection open failed");
                Err(err)
            }
        }
    }

    /// Hand a session back to the pool
    ///
    /// Idempotent; unknown hosts are ignored. A poisoned session is
    /// destroyed instead of recycled.
    pub async fn release(&self, host: &Host) {
        let key = host.pool_key();
        let now = self.clock.now();
        let mut destroy: Option<Arc<dyn Transport>> = None;
        {
            let mut inner = self.inner.lock().await;
            let mut was_in_use = false;
            let mut dead = false;
            if let Some(Slot::Ready(conn)) = inner.slots.get_mut(&key) {
                if conn.in_use {
                    conn.in_use = false;
                    conn.last_used = now;
                    was_in_use = true;
                }
                dead = conn.poisoned || conn.transport.is_closed();
            }
            if was_in_use {
                inner.stats.active_connections =
                    inner.stats.active_connections.saturating_sub(1);
            }
            if dead {
                if let Some(Slot::Ready(conn)) = inner.slots.remove(&key) {
                    destroy = Some(conn.transport);
                }
            }
        }
        if let Some(transport) = destroy {
            debug!(host = %key, "destroying poisoned connection on release");
            transport.close().await;
        }
        self.released.notify_waiters();
    }

    /// Mark a host's session as unusable
    ///
    /// The next `release` destroys it instead of recycling.
    pub async fn poison(&self, host: &Host) {
        let mut inner = self.inner.lock().await;
        if let Some(Slot::Ready(conn)) = inner.slots.get_mut(&host.pool_key()) {
            conn.poisoned = true;
        }
    }

    /// Tear down and remove a host's session. Idempotent.
    pub async fn close(&self, host: &Host) {
        let key = host.pool_key();
        let destroy = {
            let mut inner = self.inner.lock().await;
            match inner.slots.remove(&key) {
                Some(Slot::Ready(conn)) => {
                    if conn.in_use {
                        inner.stats.active_connections =
                            inner.stats.active_connections.saturating_sub(1);
                    }
                    Some(conn.transport)
                }
                _ => None,
            }
        };
        if let Some(transport) = destroy {
            transport.close().await;
        }
        self.released.notify_waiters();
    }

    /// Tear down every session
    pub async fn close_all(&self) {
        let transports: Vec<Arc<dyn Transport>> = {
            let mut inner = self.inner.lock().await;
            inner.stats.active_connections = 0;
            inner
                .slots
                .drain()
                .filter_map(|(_, slot)| match slot {
                    Slot::Ready(conn) => Some(conn.transport),
                    Slot::Connecting => None,
                })
                .collect()
        };
        for transport in transports {
            transport.close().await;
        }
        self.released.notify_waiters();
    }

    /// Destroy idle sessions past the idle timeout
    ///
    /// Never touches checked-out sessions.
    pub async fn cleanup(&self) {
        let idle_timeout =
            chrono::Duration::milliseconds(self.config.idle_timeout_ms as i64);
        let now = self.clock.now();

        let expired: Vec<(String, Arc<dyn Transport>)> = {
            let mut inner = self.inner.lock().await;
            let keys: Vec<String> = inner
                .slots
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Ready(conn)
                        if !conn.in_use && now - conn.last_used > idle_timeout =>
                    {
                        Some(key.clone())
                    }
                    _ => None,
                })
                .collect();
            keys.into_iter()
                .filter_map(|key| match inner.slots.remove(&key) {
                    Some(Slot::Ready(conn)) => Some((key, conn.transport)),
                    _ => None,
                })
                .collect()
        };

        for (key, transport) in expired {
            debug!(host = %key, "reaping idle connection");
            transport.close().await;
        }
    }

    /// Point-in-time pool status
    pub async fn status(&self) -> PoolStatus {
        let inner = self.inner.lock().await;
        let now = self.clock.now();
        let connections = inner
            .slots
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Ready(conn) => Some(ConnectionInfo {
                    host: key.clone(),
                    in_use: conn.in_use,
                    idle_ms: (now - conn.last_used).num_milliseconds(),
                    age_ms: (now - conn.created_at).num_milliseconds(),
                }),
                Slot::Connecting => None,
            })
            .collect();

        PoolStatus {
            stats: inner.stats.clone(),
            pool_size: inner.slots.len(),
            max_connections: self.config.max_connections,
            connections,
        }
    }

    /// Start the periodic idle reaper
    ///
    /// Runs at a quarter of the idle timeout until [`ConnectionPool::shutdown`].
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        let cadence = std::cmp::max(self.config.idle_timeout_ms / 4, 250);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(cadence));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if pool.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                pool.cleanup().await;
            }
        })
    }

    /// Stop the reaper and tear down every session
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.close_all().await;
    }
}
