//! Runs validated statements on a leased connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, InterruptHandle};
use tracing::{debug, warn};

use crate::error::ExecutionError;
use crate::models::{Row, SqlValue};
use crate::pool::Lease;

/// Rows returned by one statement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRows {
    /// Column names in select-list order
    pub columns: Vec<String>,
    /// Result rows
    pub rows: Vec<Row>,
}

fn to_value(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(r) => SqlValue::Real(r),
        ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
    }
}

/// Run `sql` on `conn` and collect every row
pub fn run_statement(conn: &Connection, sql: &str) -> Result<QueryRows, rusqlite::Error> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let mut rows = Vec::new();
    let mut cursor = stmt.query([])?;
    while let Some(row) = cursor.next()? {
        let mut values = Vec::with_capacity(columns.len());
        for (idx, name) in columns.iter().enumerate() {
            values.push((name.clone(), to_value(row.get_ref(idx)?)));
        }
        rows.push(Row { values });
    }

    Ok(QueryRows { columns, rows })
}

/// Interrupts the statement unless disarmed, including when the caller
/// drops the future before the statement finishes
struct CancelOnDrop {
    interrupt: InterruptHandle,
    cancelled: Arc<AtomicBool>,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.cancelled.store(true, Ordering::SeqCst);
            self.interrupt.interrupt();
        }
    }
}

/// Run `sql` on the leased connection, giving up after `timeout`.
///
/// The statement runs on the blocking pool. If the timeout expires or the
/// returned future is dropped first, the statement is interrupted through the
/// connection's interrupt handle, or skipped if it has not started yet. The
/// lease goes back to the pool once the blocking task unwinds and is consumed
/// on every path.
pub async fn execute(sql: &str, lease: Lease, timeout: Duration) -> Result<QueryRows, ExecutionError> {
    let cancelled = Arc::new(AtomicBool::new(false));
    let mut guard = CancelOnDrop {
        interrupt: lease.get_interrupt_handle(),
        cancelled: Arc::clone(&cancelled),
        armed: true,
    };
    let statement = sql.to_string();

    let task = tokio::task::spawn_blocking(move || {
        if cancelled.load(Ordering::SeqCst) {
            drop(lease);
            return Err(ExecutionError::Failed("statement cancelled before it started".to_string()));
        }
        let result = run_statement(&lease, &statement).map_err(|e| ExecutionError::Failed(e.to_string()));
        drop(lease);
        result
    });

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => {
            guard.armed = false;
            if let Ok(rows) = &result {
                debug!(rows = rows.rows.len(), "Statement completed");
            }
            result
        }
        Ok(Err(join_error)) => {
            guard.armed = false;
            Err(ExecutionError::Failed(format!("execution task failed: {join_error}")))
        }
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "Statement timed out, interrupting");
            drop(guard);
            Err(ExecutionError::Timeout(timeout))
        }
    }
}
