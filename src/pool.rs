//! Bounded connection pool over a [`DataSource`].
//!
//! Connections are opened lazily, health-checked on checkout and handed out
//! as [`Lease`]s. A lease is exclusive to one request and returns to the pool
//! when dropped, on every path.

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use r2d2::event::{AcquireEvent, CheckoutEvent, ReleaseEvent, TimeoutEvent};
use r2d2::{HandleError, HandleEvent, Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, warn};

use crate::datasource::DataSource;
use crate::error::PoolError;

/// Snapshot of pool usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Upper bound on open connections
    pub max_size: u32,
    /// Currently open connections
    pub connections: u32,
    /// Open connections not leased
    pub idle: u32,
    /// Connections currently leased
    pub leased: u32,
    /// Successful acquisitions since startup
    pub acquired_total: u64,
    /// Acquisitions that ran out of time
    pub timeouts_total: u64,
    /// Connections closed by the pool (broken, expired or surplus)
    pub discarded_total: u64,
}

#[derive(Debug, Default)]
struct Counters {
    opened: AtomicU64,
    acquired: AtomicU64,
    timeouts: AtomicU64,
    discarded: AtomicU64,
}

#[derive(Debug)]
struct PoolEvents(Arc<Counters>);

impl HandleEvent for PoolEvents {
    fn handle_acquire(&self, event: AcquireEvent) {
        self.0.opened.fetch_add(1, Ordering::Relaxed);
        debug!(connection = event.connection_id(), "Opened pooled connection");
    }

    fn handle_release(&self, event: ReleaseEvent) {
        self.0.discarded.fetch_add(1, Ordering::Relaxed);
        debug!(connection = event.connection_id(), "Closed pooled connection");
    }

    fn handle_checkout(&self, _event: CheckoutEvent) {
        self.0.acquired.fetch_add(1, Ordering::Relaxed);
    }

    fn handle_timeout(&self, event: TimeoutEvent) {
        self.0.timeouts.fetch_add(1, Ordering::Relaxed);
        warn!(timeout_ms = event.timeout().as_millis() as u64, "Connection acquire timed out");
    }
}

/// Keeps the most recent connection error so an exhausted acquire can report it
#[derive(Debug, Default)]
struct LastError(Arc<Mutex<Option<String>>>);

impl HandleError<rusqlite::Error> for LastError {
    fn handle_error(&self, error: rusqlite::Error) {
        warn!(error = %error, "Pooled connection error");
        if let Ok(mut slot) = self.0.lock() {
            *slot = Some(error.to_string());
        }
    }
}

/// An exclusively held connection. Dropping it returns the connection.
pub struct Lease(PooledConnection<SqliteConnectionManager>);

impl Deref for Lease {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.0
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").finish_non_exhaustive()
    }
}

/// Bounded pool of connections to one [`DataSource`]
#[derive(Clone)]
pub struct ConnectionManager {
    pool: Pool<SqliteConnectionManager>,
    source: DataSource,
    counters: Arc<Counters>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("source", &self.source.label())
            .field("status", &self.status())
            .finish()
    }
}

impl ConnectionManager {
    /// Create a pool of at most `max_size` connections. No connection is
    /// opened until the first acquire.
    pub fn new(
        source: DataSource,
        max_size: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, PoolError> {
        if max_size == 0 {
            return Err(PoolError::Build("pool size must be greater than 0".into()));
        }

        let counters = Arc::new(Counters::default());
        let last_error = Arc::new(Mutex::new(None));

        let pool = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(0))
            .test_on_check_out(true)
            .connection_timeout(acquire_timeout)
            .event_handler(Box::new(PoolEvents(Arc::clone(&counters))))
            .error_handler(Box::new(LastError(Arc::clone(&last_error))))
            .build(source.manager())
            .map_err(|e| PoolError::Build(e.to_string()))?;

        debug!(source = %source.label(), max_size, "Connection pool created");

        Ok(Self {
            pool,
            source,
            counters,
            last_error,
        })
    }

    /// Wait up to `timeout` for a connection
    pub fn acquire(&self, timeout: Duration) -> Result<Lease, PoolError> {
        self.pool
            .get_timeout(timeout)
            .map(Lease)
            .map_err(|e| {
                let last_error = self
                    .last_error
                    .lock()
                    .ok()
                    .and_then(|slot| slot.clone())
                    .or_else(|| Some(e.to_string()));
                PoolError::Exhausted {
                    timeout,
                    last_error,
                }
            })
    }

    /// Return a lease early. Equivalent to dropping it.
    pub fn release(&self, lease: Lease) {
        drop(lease);
    }

    /// Current usage snapshot
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.pool.state();
        PoolStatus {
            max_size: self.pool.max_size(),
            connections: state.connections,
            idle: state.idle_connections,
            leased: state.connections.saturating_sub(state.idle_connections),
            acquired_total: self.counters.acquired.load(Ordering::Relaxed),
            timeouts_total: self.counters.timeouts.load(Ordering::Relaxed),
            discarded_total: self.counters.discarded.load(Ordering::Relaxed),
        }
    }

    /// The source this pool connects to
    #[must_use]
    pub const fn source(&self) -> &DataSource {
        &self.source
    }
}
