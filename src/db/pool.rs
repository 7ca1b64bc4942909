// src/db/pool.rs
//
// Bounded SQLite connection pool
//
// PRINCIPLES:
// - A connection is owned by the idle queue or by exactly one borrower
// - The idle queue and the ConnectionInfo map change only under the pool lock
// - No SQLite work (open, liveness check, close) happens while the lock is held
// - Exhaustion degrades to an emergency connection, never to an error
//
// Permanent connections are capped at `capacity`. Emergency connections are
// created when `acquire` times out; they are counted separately and are
// closed when released instead of joining the idle queue.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::PoolConfig;
use crate::db::connection::{
    connection_is_alive, create_connection_manager, open_connection, ConnectionManager,
};
use crate::db::monitor::MonitorHandle;
use crate::error::{AppError, AppResult};

const MONITOR_THREAD_NAME: &str = "filevault-pool-monitor";
const UTILIZATION_WARNING_RATIO: f64 = 0.8;
const EXHAUSTION_WARNING_THRESHOLD: u64 = 10;

// ============================================================================
// PUBLIC TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    /// Counts against pool capacity and is recycled through the idle queue
    Pooled,
    /// Overflow connection created during exhaustion, closed on release
    Emergency,
}

/// Bookkeeping for one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub kind: ConnectionKind,
    pub created_at: Instant,
    pub last_used: Instant,
    pub use_count: u64,
    /// Name (or id) of the thread currently holding the connection
    pub owner_thread: Option<String>,
    pub active: bool,
}

impl ConnectionInfo {
    fn new(id: ConnectionId, kind: ConnectionKind) -> Self {
        let now = Instant::now();
        Self {
            id,
            kind,
            created_at: now,
            last_used: now,
            use_count: 0,
            owner_thread: None,
            active: false,
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_time(&self) -> Duration {
        self.last_used.elapsed()
    }

    fn mark_borrowed(&mut self) {
        let current = thread::current();
        self.owner_thread = Some(
            current
                .name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{:?}", current.id())),
        );
        self.last_used = Instant::now();
        self.use_count += 1;
        self.active = true;
    }

    fn mark_returned(&mut self) {
        self.owner_thread = None;
        self.last_used = Instant::now();
        self.active = false;
    }
}

/// Aggregate pool counters. Snapshots are handed to callers by value.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolMetrics {
    pub capacity: usize,
    pub total_connections: usize,
    pub active_connections: usize,
    pub available_connections: usize,
    pub emergency_connections: usize,
    pub connections_created: u64,
    pub connections_closed: u64,
    pub pool_exhaustion_events: u64,
    /// Critical exhaustion alerts actually emitted (rate limited)
    pub exhaustion_alerts: u64,
    pub peak_active_connections: usize,
    pub average_connection_age_secs: f64,
    pub stale_connections_cleaned: u64,
    pub last_cleanup: Option<DateTime<Utc>>,
}

impl PoolMetrics {
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.active_connections as f64 / self.capacity as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    pub status: HealthStatus,
    pub warnings: Vec<String>,
    pub long_idle_connections: usize,
    pub metrics: PoolMetrics,
}

/// Result of an administrative cleanup.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub connections_before: usize,
    pub connections_after: usize,
    pub cleaned: usize,
}

// ============================================================================
// SHARED STATE
// ============================================================================

struct IdleConnection {
    id: ConnectionId,
    conn: Connection,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<IdleConnection>,
    infos: HashMap<ConnectionId, ConnectionInfo>,
    /// Live permanent connections, idle or borrowed
    permanent: usize,
    /// Live emergency connections (always borrowed)
    emergency: usize,
    active: usize,
    connections_created: u64,
    connections_closed: u64,
    exhaustion_events: u64,
    exhaustion_alerts: u64,
    peak_active: usize,
    stale_cleaned: u64,
    last_cleanup: Option<DateTime<Utc>>,
    last_exhaustion_alert: Option<Instant>,
}

impl PoolState {
    fn track(&mut self, id: ConnectionId, kind: ConnectionKind) {
        self.infos.insert(id, ConnectionInfo::new(id, kind));
        self.connections_created += 1;
    }

    fn check_out(&mut self, id: ConnectionId) {
        if let Some(info) = self.infos.get_mut(&id) {
            info.mark_borrowed();
        }
        self.active += 1;
        self.peak_active = self.peak_active.max(self.active);
    }

    fn forget(&mut self, id: ConnectionId, kind: ConnectionKind) {
        if self.infos.remove(&id).is_none() {
            // Already cleared by close_all.
            return;
        }
        match kind {
            ConnectionKind::Pooled => self.permanent = self.permanent.saturating_sub(1),
            ConnectionKind::Emergency => self.emergency = self.emergency.saturating_sub(1),
        }
        self.connections_closed += 1;
    }

    /// Remove idle connections matching `is_stale`. In-flight connections are
    /// never considered.
    fn evict_idle<F>(&mut self, is_stale: F) -> Vec<IdleConnection>
    where
        F: Fn(&ConnectionInfo) -> bool,
    {
        let mut stale = Vec::new();
        let mut keep = VecDeque::with_capacity(self.idle.len());
        for entry in self.idle.drain(..) {
            match self.infos.get(&entry.id) {
                Some(info) if !is_stale(info) => keep.push_back(entry),
                _ => stale.push(entry),
            }
        }
        self.idle = keep;

        for entry in &stale {
            self.forget(entry.id, ConnectionKind::Pooled);
        }
        self.stale_cleaned += stale.len() as u64;
        self.last_cleanup = Some(Utc::now());
        stale
    }

    fn count_idle_longer_than(&self, threshold: Duration) -> usize {
        self.idle
            .iter()
            .filter_map(|entry| self.infos.get(&entry.id))
            .filter(|info| info.idle_time() > threshold)
            .count()
    }

    fn metrics(&self, capacity: usize) -> PoolMetrics {
        let total = self.infos.len();
        let average_connection_age_secs = if total == 0 {
            0.0
        } else {
            self.infos
                .values()
                .map(|info| info.age().as_secs_f64())
                .sum::<f64>()
                / total as f64
        };

        PoolMetrics {
            capacity,
            total_connections: total,
            active_connections: self.active,
            available_connections: self.idle.len(),
            emergency_connections: self.emergency,
            connections_created: self.connections_created,
            connections_closed: self.connections_closed,
            pool_exhaustion_events: self.exhaustion_events,
            exhaustion_alerts: self.exhaustion_alerts,
            peak_active_connections: self.peak_active,
            average_connection_age_secs,
            stale_connections_cleaned: self.stale_cleaned,
            last_cleanup: self.last_cleanup,
        }
    }
}

struct PoolShared {
    manager: Arc<ConnectionManager>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
    closed: AtomicBool,
    next_id: AtomicU64,
}

impl PoolShared {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        // Every critical section leaves the state consistent, so a panic in
        // another thread does not invalidate it.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn open(&self) -> AppResult<(ConnectionId, Connection)> {
        let conn = open_connection(&self.manager)?;
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        Ok((id, conn))
    }

    fn acquire(self: &Arc<Self>, timeout: Duration) -> AppResult<PooledConnection> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock_state();

        loop {
            if self.is_closed() {
                return Err(AppError::PoolClosed);
            }

            if let Some(IdleConnection { id, conn }) = state.idle.pop_front() {
                state.check_out(id);
                return Ok(PooledConnection::new(Arc::clone(self), id, ConnectionKind::Pooled, conn));
            }

            if state.permanent < self.config.capacity {
                // A slot was freed by eviction or retirement: refill it.
                state.permanent += 1;
                drop(state);
                return self.open_borrowed(ConnectionKind::Pooled);
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }

        state.exhaustion_events += 1;
        state.emergency += 1;
        let alert_due = state
            .last_exhaustion_alert
            .map_or(true, |last| last.elapsed() >= self.config.exhaustion_alert_interval());
        if alert_due {
            state.last_exhaustion_alert = Some(Instant::now());
            state.exhaustion_alerts += 1;
        }
        let events = state.exhaustion_events;
        let active = state.active;
        drop(state);

        if alert_due {
            error!(
                "CRITICAL: connection pool exhausted ({} of {} connections in use, {} exhaustion events); \
                 opening emergency connection",
                active, self.config.capacity, events
            );
        } else {
            debug!("pool exhausted, opening emergency connection (event #{})", events);
        }

        self.open_borrowed(ConnectionKind::Emergency)
    }

    /// Open a connection whose slot (permanent or emergency) is already reserved.
    fn open_borrowed(self: &Arc<Self>, kind: ConnectionKind) -> AppResult<PooledConnection> {
        match self.open() {
            Ok((id, conn)) => {
                let mut state = self.lock_state();
                state.track(id, kind);
                state.check_out(id);
                drop(state);
                debug!("opened {:?} connection {}", kind, id);
                Ok(PooledConnection::new(Arc::clone(self), id, kind, conn))
            }
            Err(e) => {
                let mut state = self.lock_state();
                match kind {
                    ConnectionKind::Pooled => state.permanent = state.permanent.saturating_sub(1),
                    ConnectionKind::Emergency => state.emergency = state.emergency.saturating_sub(1),
                }
                drop(state);
                self.available.notify_one();
                Err(e)
            }
        }
    }

    fn release(&self, id: ConnectionId, kind: ConnectionKind, conn: Connection) {
        let healthy = kind == ConnectionKind::Pooled && connection_is_alive(&conn);
        self.check_in(id, kind, conn, healthy, "failed liveness check");
    }

    fn discard(&self, id: ConnectionId, kind: ConnectionKind, conn: Connection) {
        self.check_in(id, kind, conn, false, "discarded by borrower");
    }

    fn check_in(
        &self,
        id: ConnectionId,
        kind: ConnectionKind,
        conn: Connection,
        healthy: bool,
        unhealthy_reason: &'static str,
    ) {
        let mut state = self.lock_state();
        state.active = state.active.saturating_sub(1);

        let retire_reason = if kind == ConnectionKind::Emergency {
            Some("emergency connection")
        } else if !healthy {
            Some(unhealthy_reason)
        } else if self.is_closed() {
            Some("pool closed")
        } else if state
            .infos
            .get(&id)
            .map_or(true, |info| info.age() > self.config.max_connection_age())
        {
            Some("exceeded max connection age")
        } else if state.idle.len() >= self.config.capacity {
            Some("idle queue full")
        } else {
            None
        };

        match retire_reason {
            None => {
                if let Some(info) = state.infos.get_mut(&id) {
                    info.mark_returned();
                }
                state.idle.push_back(IdleConnection { id, conn });
                drop(state);
                self.available.notify_one();
            }
            Some(reason) => {
                state.forget(id, kind);
                drop(state);
                debug!("closing connection {}: {}", id, reason);
                drop(conn);
                if kind == ConnectionKind::Pooled {
                    // A waiter may now refill the freed slot.
                    self.available.notify_one();
                }
            }
        }
    }

    fn run_maintenance(&self) -> PoolHealth {
        let mut state = self.lock_state();
        let long_idle = state.count_idle_longer_than(self.config.long_idle_warning());
        let max_age = self.config.max_connection_age();
        let max_idle = self.config.max_idle_time();
        let evicted = state.evict_idle(|info| info.age() > max_age || info.idle_time() > max_idle);
        let metrics = state.metrics(self.config.capacity);
        drop(state);

        let evicted_count = evicted.len();
        drop(evicted);
        if evicted_count > 0 {
            info!("pool maintenance evicted {} stale connection(s)", evicted_count);
            self.available.notify_all();
        }

        let health = assess_health(metrics, long_idle);
        for warning in &health.warnings {
            warn!("connection pool: {}", warning);
        }
        health
    }
}

fn assess_health(metrics: PoolMetrics, long_idle_connections: usize) -> PoolHealth {
    let mut warnings = Vec::new();

    let utilization = metrics.utilization();
    if utilization > UTILIZATION_WARNING_RATIO {
        warnings.push(format!(
            "high utilization: {:.0}% ({} of {} connections active)",
            utilization * 100.0,
            metrics.active_connections,
            metrics.capacity
        ));
    }
    if metrics.pool_exhaustion_events > EXHAUSTION_WARNING_THRESHOLD {
        warnings.push(format!(
            "{} pool exhaustion events recorded; consider raising capacity",
            metrics.pool_exhaustion_events
        ));
    }
    if long_idle_connections > 0 {
        warnings.push(format!(
            "{} connection(s) idle for a long time",
            long_idle_connections
        ));
    }

    let status = if metrics.emergency_connections > 0 {
        HealthStatus::Critical
    } else if warnings.is_empty() {
        HealthStatus::Healthy
    } else {
        HealthStatus::Warning
    };

    PoolHealth {
        status,
        warnings,
        long_idle_connections,
        metrics,
    }
}

// ============================================================================
// POOL
// ============================================================================

/// Fixed-capacity pool of SQLite connections shared by worker threads.
///
/// Construct once at startup and share through `Arc<ConnectionPool>`.
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
    monitor: Mutex<Option<MonitorHandle>>,
}

impl ConnectionPool {
    /// Open a pool for the database file at `db_path`.
    pub fn open(db_path: &Path, config: PoolConfig) -> AppResult<Self> {
        let manager = create_connection_manager(db_path, config.busy_timeout());
        Self::new(Arc::new(manager), config)
    }

    /// Create the pool, eagerly open `capacity` connections and start the
    /// monitor thread (unless disabled in `config`).
    pub fn new(manager: Arc<ConnectionManager>, config: PoolConfig) -> AppResult<Self> {
        config.validate()?;

        let shared = Arc::new(PoolShared {
            manager,
            state: Mutex::new(PoolState::default()),
            available: Condvar::new(),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            config,
        });

        for _ in 0..shared.config.capacity {
            let (id, conn) = shared.open()?;
            let mut state = shared.lock_state();
            state.track(id, ConnectionKind::Pooled);
            state.permanent += 1;
            state.idle.push_back(IdleConnection { id, conn });
        }

        let monitor = if shared.config.monitor_enabled {
            let weak: Weak<PoolShared> = Arc::downgrade(&shared);
            let handle = MonitorHandle::spawn(
                MONITOR_THREAD_NAME,
                shared.config.monitor_interval(),
                move || match weak.upgrade() {
                    Some(pool) if !pool.is_closed() => {
                        pool.run_maintenance();
                        true
                    }
                    _ => false,
                },
            )?;
            Some(handle)
        } else {
            None
        };

        info!(
            "connection pool ready: {} connections, acquire timeout {:?}",
            shared.config.capacity,
            shared.config.acquire_timeout()
        );

        Ok(Self {
            shared,
            monitor: Mutex::new(monitor),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn capacity(&self) -> usize {
        self.shared.config.capacity
    }

    /// Borrow a connection, waiting up to `timeout` for one to become idle.
    ///
    /// When the wait times out an emergency connection is returned instead of
    /// an error. Fails only if the pool is closed or SQLite cannot open a
    /// connection at all.
    pub fn acquire(&self, timeout: Duration) -> AppResult<PooledConnection> {
        self.shared.acquire(timeout)
    }

    /// `acquire` with the configured default timeout.
    pub fn get(&self) -> AppResult<PooledConnection> {
        self.acquire(self.shared.config.acquire_timeout())
    }

    /// Return a connection. Equivalent to dropping it.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// One monitor cycle: evict stale idle connections, refresh metrics and
    /// log health warnings.
    pub fn run_maintenance(&self) -> PoolHealth {
        self.shared.run_maintenance()
    }

    /// Aggressively close every idle connection unused for longer than the
    /// configured force-cleanup threshold, regardless of age.
    pub fn force_cleanup(&self) -> CleanupReport {
        let threshold = self.shared.config.force_cleanup_idle();
        let mut state = self.shared.lock_state();
        let connections_before = state.infos.len();
        let evicted = state.evict_idle(|info| info.idle_time() > threshold);
        let connections_after = state.infos.len();
        drop(state);

        let cleaned = evicted.len();
        drop(evicted);
        if cleaned > 0 {
            self.shared.available.notify_all();
        }
        info!(
            "forced pool cleanup closed {} connection(s) ({} -> {})",
            cleaned, connections_before, connections_after
        );

        CleanupReport {
            connections_before,
            connections_after,
            cleaned,
        }
    }

    pub fn metrics(&self) -> PoolMetrics {
        self.shared.lock_state().metrics(self.shared.config.capacity)
    }

    /// Snapshot of per-connection bookkeeping, ordered by id.
    pub fn connection_infos(&self) -> Vec<ConnectionInfo> {
        let state = self.shared.lock_state();
        let mut infos: Vec<_> = state.infos.values().cloned().collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Current health without running eviction.
    pub fn health(&self) -> PoolHealth {
        let state = self.shared.lock_state();
        let long_idle = state.count_idle_longer_than(self.shared.config.long_idle_warning());
        let metrics = state.metrics(self.shared.config.capacity);
        drop(state);
        assess_health(metrics, long_idle)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn monitor_running(&self) -> bool {
        self.monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(MonitorHandle::is_running)
    }

    /// Stop the monitor, close every idle connection and clear all tracking.
    ///
    /// Connections still borrowed are closed when they come back. Safe to call
    /// more than once.
    pub fn close_all(&self) {
        let first_close = !self.shared.closed.swap(true, Ordering::SeqCst);

        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(monitor) = monitor {
            monitor.stop();
        }

        let mut state = self.shared.lock_state();
        let drained: Vec<IdleConnection> = state.idle.drain(..).collect();
        state.connections_closed += drained.len() as u64;
        state.infos.clear();
        state.permanent = 0;
        state.emergency = 0;
        state.active = 0;
        drop(state);

        self.shared.available.notify_all();
        let closed = drained.len();
        drop(drained);

        if first_close {
            info!("connection pool closed ({} idle connection(s) closed)", closed);
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.close_all();
    }
}

// ============================================================================
// BORROWED CONNECTION
// ============================================================================

/// A connection borrowed from the pool. Returned on drop.
pub struct PooledConnection {
    pool: Arc<PoolShared>,
    id: ConnectionId,
    kind: ConnectionKind,
    conn: Option<Connection>,
}

impl PooledConnection {
    fn new(pool: Arc<PoolShared>, id: ConnectionId, kind: ConnectionKind, conn: Connection) -> Self {
        Self {
            pool,
            id,
            kind,
            conn: Some(conn),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn is_emergency(&self) -> bool {
        self.kind == ConnectionKind::Emergency
    }

    /// Close the connection instead of returning it, e.g. after a failed
    /// statement left it in an unknown state.
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.discard(self.id, self.kind, conn);
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("pooled connection used after release")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("pooled connection used after release")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(self.id, self.kind, conn);
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Barrier;
    use tempfile::TempDir;

    fn test_config(capacity: usize) -> PoolConfig {
        PoolConfig {
            capacity,
            acquire_timeout_ms: 50,
            monitor_enabled: false,
            ..PoolConfig::default()
        }
    }

    fn open_pool(capacity: usize) -> (TempDir, ConnectionPool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open(&dir.path().join("pool.db"), test_config(capacity)).unwrap();
        (dir, pool)
    }

    fn open_pool_with(config: PoolConfig) -> (TempDir, ConnectionPool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open(&dir.path().join("pool.db"), config).unwrap();
        (dir, pool)
    }

    #[test]
    fn test_pool_opens_capacity_connections() {
        let (_dir, pool) = open_pool(3);
        let metrics = pool.metrics();
        assert_eq!(metrics.total_connections, 3);
        assert_eq!(metrics.available_connections, 3);
        assert_eq!(metrics.active_connections, 0);
        assert_eq!(metrics.connections_created, 3);
    }

    #[test]
    fn test_acquire_updates_connection_info() {
        let (_dir, pool) = open_pool(1);
        let conn = pool.acquire(Duration::from_millis(50)).unwrap();
        let id = conn.id();

        let info = pool
            .connection_infos()
            .into_iter()
            .find(|info| info.id == id)
            .unwrap();
        assert!(info.active);
        assert_eq!(info.use_count, 1);
        assert!(info.owner_thread.is_some());
        assert_eq!(pool.metrics().active_connections, 1);

        pool.release(conn);
        let info = pool.connection_infos().pop().unwrap();
        assert!(!info.active);
        assert!(info.owner_thread.is_none());
        assert_eq!(pool.metrics().active_connections, 0);
    }

    #[test]
    fn test_concurrent_acquire_returns_distinct_connections() {
        let capacity = 4;
        let (_dir, pool) = open_pool_with(PoolConfig {
            acquire_timeout_ms: 2_000,
            ..test_config(capacity)
        });
        let pool = Arc::new(pool);
        let barrier = Arc::new(Barrier::new(capacity));

        let handles: Vec<_> = (0..capacity)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let conn = pool.get().unwrap();
                    let id = conn.id();
                    let kind = conn.kind();
                    // Hold every connection until all threads have one.
                    barrier.wait();
                    (id, kind)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let ids: HashSet<_> = results.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids.len(), capacity);
        assert!(results.iter().all(|(_, kind)| *kind == ConnectionKind::Pooled));
        assert_eq!(pool.metrics().pool_exhaustion_events, 0);
    }

    #[test]
    fn test_exhaustion_yields_emergency_connection() {
        let (_dir, pool) = open_pool(1);
        let held = pool.get().unwrap();

        let started = Instant::now();
        let emergency = pool.acquire(Duration::from_millis(30)).unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(emergency.is_emergency());
        assert_ne!(emergency.id(), held.id());

        let one: i64 = emergency.query_row("SELECT 1", [], |row| row.get(0)).unwrap();
        assert_eq!(one, 1);

        let metrics = pool.metrics();
        assert_eq!(metrics.pool_exhaustion_events, 1);
        assert_eq!(metrics.emergency_connections, 1);
        assert_eq!(pool.health().status, HealthStatus::Critical);

        let second = pool.acquire(Duration::from_millis(10)).unwrap();
        assert_eq!(pool.metrics().pool_exhaustion_events, 2);
        drop(second);
    }

    #[test]
    fn test_exhaustion_alert_is_rate_limited() {
        let (_dir, pool) = open_pool_with(PoolConfig {
            exhaustion_alert_interval_secs: 60,
            ..test_config(1)
        });
        let _held = pool.get().unwrap();

        drop(pool.acquire(Duration::from_millis(5)).unwrap());
        drop(pool.acquire(Duration::from_millis(5)).unwrap());

        let metrics = pool.metrics();
        assert_eq!(metrics.pool_exhaustion_events, 2);
        assert_eq!(metrics.exhaustion_alerts, 1);
    }

    #[test]
    fn test_exhaustion_alert_repeats_after_interval() {
        let (_dir, pool) = open_pool_with(PoolConfig {
            exhaustion_alert_interval_secs: 0,
            ..test_config(1)
        });
        let _held = pool.get().unwrap();

        drop(pool.acquire(Duration::from_millis(5)).unwrap());
        drop(pool.acquire(Duration::from_millis(5)).unwrap());

        assert_eq!(pool.metrics().exhaustion_alerts, 2);
    }

    #[test]
    fn test_monitor_thread_evicts_stale_connections() {
        let (_dir, pool) = open_pool_with(PoolConfig {
            monitor_enabled: true,
            monitor_interval_secs: 1,
            max_connection_age_secs: 0,
            ..test_config(2)
        });
        assert!(pool.monitor_running());
        assert_eq!(pool.metrics().available_connections, 2);

        let deadline = Instant::now() + Duration::from_secs(10);
        while pool.metrics().stale_connections_cleaned < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }

        let metrics = pool.metrics();
        assert!(metrics.stale_connections_cleaned >= 2);
        assert!(metrics.last_cleanup.is_some());
        assert_eq!(metrics.available_connections, 0);

        // Evicted slots are refilled on demand.
        let conn = pool.get().unwrap();
        assert_eq!(conn.kind(), ConnectionKind::Pooled);
        drop(conn);
        pool.close_all();
    }

    #[test]
    fn test_capacity_two_scenario() {
        let (_dir, pool) = open_pool(2);

        let c1 = pool.get().unwrap();
        let c2 = pool.get().unwrap();
        assert_ne!(c1.id(), c2.id());

        let c3 = pool.get().unwrap();
        assert!(c3.is_emergency());
        assert_eq!(pool.metrics().pool_exhaustion_events, 1);
        let c3_id = c3.id();

        pool.release(c1);
        pool.release(c2);
        pool.release(c3);

        let metrics = pool.metrics();
        assert_eq!(metrics.available_connections, 2);
        assert_eq!(metrics.total_connections, 2);
        assert_eq!(metrics.emergency_connections, 0);
        assert_eq!(metrics.active_connections, 0);
        assert!(pool.connection_infos().iter().all(|info| info.id != c3_id));
    }

    #[test]
    fn test_waiter_is_woken_by_release() {
        let (_dir, pool) = open_pool(1);
        let pool = Arc::new(pool);
        let held = pool.get().unwrap();
        let held_id = held.id();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let conn = pool.acquire(Duration::from_secs(10)).unwrap();
                (conn.id(), conn.kind())
            })
        };

        thread::sleep(Duration::from_millis(30));
        drop(held);

        let (id, kind) = waiter.join().unwrap();
        assert_eq!(id, held_id);
        assert_eq!(kind, ConnectionKind::Pooled);
        assert_eq!(pool.metrics().pool_exhaustion_events, 0);
    }

    #[test]
    fn test_dead_connection_is_not_reused() {
        let (_dir, pool) = open_pool(1);
        let conn = pool.get().unwrap();
        let broken_id = conn.id();
        // Leaves the connection inside an open transaction.
        conn.execute_batch("BEGIN;").unwrap();
        pool.release(conn);

        let metrics = pool.metrics();
        assert_eq!(metrics.connections_closed, 1);
        assert_eq!(metrics.available_connections, 0);

        let next = pool.get().unwrap();
        assert_ne!(next.id(), broken_id);
        assert_eq!(next.kind(), ConnectionKind::Pooled);
        assert!(next.is_autocommit());
    }

    #[test]
    fn test_discard_closes_connection() {
        let (_dir, pool) = open_pool(2);
        let conn = pool.get().unwrap();
        let id = conn.id();
        conn.discard();

        let metrics = pool.metrics();
        assert_eq!(metrics.total_connections, 1);
        assert_eq!(metrics.active_connections, 0);
        assert!(pool.connection_infos().iter().all(|info| info.id != id));
    }

    #[test]
    fn test_maintenance_evicts_only_idle_stale_connections() {
        let (_dir, pool) = open_pool_with(PoolConfig {
            max_connection_age_secs: 0,
            ..test_config(2)
        });

        let in_flight = pool.get().unwrap();
        thread::sleep(Duration::from_millis(5));

        let health = pool.run_maintenance();
        assert_eq!(health.metrics.stale_connections_cleaned, 1);
        assert_eq!(health.metrics.total_connections, 1);
        assert!(health.metrics.last_cleanup.is_some());
        assert!(pool
            .connection_infos()
            .iter()
            .any(|info| info.id == in_flight.id()));

        // Stale on return: retired rather than requeued.
        drop(in_flight);
        let metrics = pool.metrics();
        assert_eq!(metrics.total_connections, 0);
        assert_eq!(metrics.available_connections, 0);

        // Evicted slots are refilled on demand.
        let fresh = pool.get().unwrap();
        assert_eq!(fresh.kind(), ConnectionKind::Pooled);
        assert_eq!(pool.metrics().pool_exhaustion_events, 0);
    }

    #[test]
    fn test_force_cleanup_reports_counts() {
        let (_dir, pool) = open_pool_with(PoolConfig {
            force_cleanup_idle_secs: 0,
            ..test_config(3)
        });
        let held = pool.get().unwrap();
        thread::sleep(Duration::from_millis(5));

        let report = pool.force_cleanup();
        assert_eq!(report.connections_before, 3);
        assert_eq!(report.connections_after, 1);
        assert_eq!(report.cleaned, 2);
        drop(held);
    }

    #[test]
    fn test_health_warns_on_high_utilization() {
        let (_dir, pool) = open_pool(2);
        assert_eq!(pool.health().status, HealthStatus::Healthy);

        let _a = pool.get().unwrap();
        let _b = pool.get().unwrap();
        let health = pool.health();
        assert_eq!(health.status, HealthStatus::Warning);
        assert!(health.warnings.iter().any(|w| w.contains("utilization")));
    }

    #[test]
    fn test_close_all_is_idempotent() {
        let (_dir, pool) = open_pool_with(PoolConfig {
            monitor_enabled: true,
            monitor_interval_secs: 3_600,
            ..test_config(2)
        });
        assert!(pool.monitor_running());
        let borrowed = pool.get().unwrap();

        pool.close_all();
        assert!(pool.is_closed());
        assert!(!pool.monitor_running());
        assert!(matches!(pool.get(), Err(AppError::PoolClosed)));
        let metrics = pool.metrics();
        assert_eq!(metrics.total_connections, 0);
        assert_eq!(metrics.available_connections, 0);

        // Returned after close: closed, not requeued.
        drop(borrowed);
        assert_eq!(pool.metrics().available_connections, 0);

        pool.close_all();
        assert!(pool.is_closed());
    }
}
