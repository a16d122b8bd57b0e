//! SQLite-backed log store

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, params};
use thiserror::Error;
use tracing::debug;

use crate::record::{CostUpdate, LogRecord};

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No record with request_id: {0}")]
    UnknownRequestId(String),
}

/// The unified log store.
///
/// A thin wrapper over a single SQLite database. Frequently-filtered fields
/// get their own indexed columns; the full record is kept as JSON so the
/// schema can grow without migrations.
pub struct LogStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS unified_logs (
    trace_id     TEXT PRIMARY KEY,
    session_id   TEXT NOT NULL,
    parent_id    TEXT,
    node_type    TEXT NOT NULL,
    role         TEXT,
    cascade_id   TEXT,
    cell_name    TEXT,
    phase_name   TEXT,
    caller_id    TEXT,
    request_id   TEXT,
    cost         REAL,
    tokens_in    INTEGER,
    tokens_out   INTEGER,
    timestamp    TEXT NOT NULL,
    record       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_logs_session ON unified_logs(session_id);
CREATE INDEX IF NOT EXISTS idx_logs_request ON unified_logs(request_id);
CREATE INDEX IF NOT EXISTS idx_logs_node_type ON unified_logs(node_type);
";

impl LogStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        debug!(path = %path.as_ref().display(), "LogStore::open: called");
        if let Some(parent) = path.as_ref().parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open an in-memory store (tests, ephemeral runs)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Append a record. Records are immutable once written except for
    /// reconciliation by `request_id`.
    pub fn append(&self, record: &LogRecord) -> Result<(), StoreError> {
        debug!(trace_id = %record.trace_id, node_type = %record.node_type, "LogStore::append");
        let json = serde_json::to_string(record)?;
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT OR REPLACE INTO unified_logs
             (trace_id, session_id, parent_id, node_type, role, cascade_id, cell_name,
              phase_name, caller_id, request_id, cost, tokens_in, tokens_out, timestamp, record)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                record.trace_id,
                record.session_id,
                record.parent_id,
                record.node_type.as_str(),
                record.role,
                record.cascade_id,
                record.cell_name,
                record.phase_name,
                record.caller_id,
                record.request_id,
                record.cost,
                record.tokens_in,
                record.tokens_out,
                record.timestamp.to_rfc3339(),
                json,
            ],
        )?;
        Ok(())
    }

    /// Reconcile provider usage data into every record sharing `request_id`.
    ///
    /// Returns the number of records updated. `None` fields in the update
    /// leave the stored value untouched.
    pub fn reconcile_by_request_id(&self, request_id: &str, update: &CostUpdate) -> Result<usize, StoreError> {
        debug!(%request_id, ?update, "LogStore::reconcile_by_request_id");
        let existing = self.query_where_params("request_id = ?1", params![request_id])?;
        if existing.is_empty() {
            return Err(StoreError::UnknownRequestId(request_id.to_string()));
        }

        let mut updated = 0;
        for mut record in existing {
            if let Some(cost) = update.cost {
                record.cost = Some(cost);
            }
            if let Some(t) = update.tokens_in {
                record.tokens_in = Some(t);
            }
            if let Some(t) = update.tokens_out {
                record.tokens_out = Some(t);
            }
            if let Some(t) = update.tokens_reasoning {
                record.tokens_reasoning = Some(t);
            }
            if let Some(d) = update.duration_ms {
                record.duration_ms = Some(d);
            }
            self.append(&record)?;
            updated += 1;
        }
        Ok(updated)
    }

    /// Query records with a SQL WHERE fragment over the indexed columns:
    /// `session_id`, `parent_id`, `node_type`, `role`, `cascade_id`,
    /// `cell_name`, `phase_name`, `caller_id`, `request_id`, `cost`,
    /// `tokens_in`, `tokens_out`, `timestamp`.
    ///
    /// Intended for trusted internal callers and test harnesses, in the
    /// spirit of `query_logs(where)`.
    pub fn query_where(&self, where_sql: &str) -> Result<Vec<LogRecord>, StoreError> {
        self.query_where_params(where_sql, params![])
    }

    fn query_where_params(
        &self,
        where_sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<LogRecord>, StoreError> {
        debug!(%where_sql, "LogStore::query_where");
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let sql = format!(
            "SELECT record FROM unified_logs WHERE {} ORDER BY timestamp, trace_id",
            where_sql
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(serde_json::from_str(&row?)?);
        }
        Ok(records)
    }

    /// All records for one session, in logical order
    pub fn session_records(&self, session_id: &str) -> Result<Vec<LogRecord>, StoreError> {
        self.query_where_params("session_id = ?1", params![session_id])
    }

    /// Total number of stored records
    pub fn count(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM unified_logs", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::NodeType;

    fn store() -> LogStore {
        LogStore::open_in_memory().unwrap()
    }

    #[test]
    fn test_append_and_query() {
        let store = store();
        let rec = LogRecord {
            role: Some("assistant".into()),
            content: Some(serde_json::json!("hello")),
            ..LogRecord::new("sess-1", NodeType::Agent)
        };
        store.append(&rec).unwrap();

        let got = store.session_records("sess-1").unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].trace_id, rec.trace_id);
        assert_eq!(got[0].content_text(), "hello");
    }

    #[test]
    fn test_query_where_filters_node_type() {
        let store = store();
        store
            .append(&LogRecord::new("s", NodeType::Phase))
            .unwrap();
        store.append(&LogRecord::new("s", NodeType::Turn)).unwrap();

        let phases = store.query_where("node_type = 'phase'").unwrap();
        assert_eq!(phases.len(), 1);
        assert_eq!(phases[0].node_type, NodeType::Phase);
    }

    #[test]
    fn test_reconcile_by_request_id() {
        let store = store();
        let rec = LogRecord {
            request_id: Some("req-42".into()),
            cost: None,
            tokens_in: Some(10),
            ..LogRecord::new("s", NodeType::Agent)
        };
        store.append(&rec).unwrap();

        let updated = store
            .reconcile_by_request_id(
                "req-42",
                &CostUpdate {
                    cost: Some(0.0123),
                    tokens_out: Some(99),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated, 1);

        let got = store.session_records("s").unwrap();
        assert_eq!(got[0].cost, Some(0.0123));
        assert_eq!(got[0].tokens_out, Some(99));
        // Untouched fields survive reconciliation
        assert_eq!(got[0].tokens_in, Some(10));
        assert_eq!(got[0].trace_id, rec.trace_id);
    }

    #[test]
    fn test_reconcile_unknown_request_id() {
        let store = store();
        let err = store.reconcile_by_request_id("missing", &CostUpdate::default());
        assert!(matches!(err, Err(StoreError::UnknownRequestId(_))));
    }

    #[test]
    fn test_records_ordered_by_timestamp() {
        let store = store();
        let mut first = LogRecord::new("s", NodeType::Turn);
        first.timestamp = chrono::Utc::now() - chrono::Duration::seconds(10);
        let second = LogRecord::new("s", NodeType::Turn);
        // Insert out of order
        store.append(&second).unwrap();
        store.append(&first).unwrap();

        let got = store.session_records("s").unwrap();
        assert_eq!(got[0].trace_id, first.trace_id);
        assert_eq!(got[1].trace_id, second.trace_id);
    }
}
