//! SQLite-backed session-record history.
//!
//! One row per emitted record, with JSON-valued capture and violation
//! columns. Backs `/control/history`, `/control/history/stats`, and
//! `/control/history/timeseries`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection};
use serde::Serialize;

use elida_domain::error::{Error, Result};
use elida_domain::record::SessionRecord;
use elida_domain::trace::TraceEvent;
use elida_sessions::SessionRecordSink;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS session_records (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id    TEXT NOT NULL,
    state         TEXT NOT NULL,
    start_ms      INTEGER NOT NULL,
    end_ms        INTEGER NOT NULL,
    duration_ms   INTEGER NOT NULL,
    request_count INTEGER NOT NULL,
    bytes_in      INTEGER NOT NULL,
    bytes_out     INTEGER NOT NULL,
    tokens_in     INTEGER NOT NULL,
    tokens_out    INTEGER NOT NULL,
    backend       TEXT NOT NULL,
    client_addr   TEXT NOT NULL,
    backends_used TEXT NOT NULL,
    metadata      TEXT NOT NULL,
    captured      TEXT NOT NULL,
    violations    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_session_records_end ON session_records (end_ms);
CREATE INDEX IF NOT EXISTS idx_session_records_session ON session_records (session_id);
";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default)]
pub struct HistoryQuery {
    pub session_id: Option<String>,
    pub state: Option<String>,
    pub backend: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryStats {
    pub total: u64,
    pub by_state: HashMap<String, u64>,
    pub total_requests: u64,
    pub total_bytes_in: u64,
    pub total_bytes_out: u64,
    pub avg_duration_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeBucket {
    pub bucket_start: DateTime<Utc>,
    pub count: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

pub struct HistoryStore {
    conn: Mutex<Connection>,
}

impl HistoryStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| Error::Config(format!("opening history db {path}: {e}")))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::Config(format!("history schema: {e}")))?;
        tracing::info!(path, "history store ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Other(format!("opening in-memory db: {e}")))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::Other(format!("history schema: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Persist one record as a single row (single-statement atomicity).
    pub fn insert(&self, record: &SessionRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO session_records (
                session_id, state, start_ms, end_ms, duration_ms,
                request_count, bytes_in, bytes_out, tokens_in, tokens_out,
                backend, client_addr, backends_used, metadata, captured, violations
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                record.id,
                record.state,
                record.start.timestamp_millis(),
                record.end.timestamp_millis(),
                record.duration_ms,
                record.request_count as i64,
                record.bytes_in as i64,
                record.bytes_out as i64,
                record.tokens_in as i64,
                record.tokens_out as i64,
                record.backend,
                record.client_addr,
                serde_json::to_string(&record.backends_used)?,
                serde_json::to_string(&record.metadata)?,
                serde_json::to_string(&record.captured_content)?,
                serde_json::to_string(&record.violations)?,
            ],
        )
        .map_err(|e| Error::Other(format!("history insert: {e}")))?;
        Ok(())
    }

    /// Paginated records, newest first.
    pub fn query(&self, q: &HistoryQuery) -> Result<Vec<SessionRecord>> {
        let mut sql = String::from(
            "SELECT session_id, state, start_ms, end_ms, duration_ms,
                    request_count, bytes_in, bytes_out, tokens_in, tokens_out,
                    backend, client_addr, backends_used, metadata, captured, violations
             FROM session_records WHERE 1=1",
        );
        let mut args: Vec<rusqlite::types::Value> = Vec::new();

        if let Some(session_id) = &q.session_id {
            sql.push_str(" AND session_id = ?");
            args.push(session_id.clone().into());
        }
        if let Some(state) = &q.state {
            sql.push_str(" AND state = ?");
            args.push(state.clone().into());
        }
        if let Some(backend) = &q.backend {
            sql.push_str(" AND backend = ?");
            args.push(backend.clone().into());
        }
        if let Some(since) = q.since {
            sql.push_str(" AND end_ms >= ?");
            args.push(since.timestamp_millis().into());
        }
        if let Some(until) = q.until {
            sql.push_str(" AND end_ms <= ?");
            args.push(until.timestamp_millis().into());
        }
        sql.push_str(" ORDER BY end_ms DESC LIMIT ? OFFSET ?");
        let limit = if q.limit == 0 { 50 } else { q.limit };
        args.push((limit as i64).into());
        args.push((q.offset as i64).into());

        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| Error::Other(format!("history query: {e}")))?;
        let rows = stmt
            .query_map(params_from_iter(args), row_to_record)
            .map_err(|e| Error::Other(format!("history query: {e}")))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Other(format!("history query: {e}")))
    }

    pub fn stats(&self) -> Result<HistoryStats> {
        let conn = self.conn.lock();
        let (total, total_requests, total_bytes_in, total_bytes_out, avg_duration_ms) = conn
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(request_count), 0),
                        COALESCE(SUM(bytes_in), 0),
                        COALESCE(SUM(bytes_out), 0),
                        COALESCE(AVG(duration_ms), 0.0)
                 FROM session_records",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)? as u64,
                        row.get::<_, i64>(1)? as u64,
                        row.get::<_, i64>(2)? as u64,
                        row.get::<_, i64>(3)? as u64,
                        row.get::<_, f64>(4)?,
                    ))
                },
            )
            .map_err(|e| Error::Other(format!("history stats: {e}")))?;

        let mut by_state = HashMap::new();
        let mut stmt = conn
            .prepare("SELECT state, COUNT(*) FROM session_records GROUP BY state")
            .map_err(|e| Error::Other(format!("history stats: {e}")))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })
            .map_err(|e| Error::Other(format!("history stats: {e}")))?;
        for row in rows {
            let (state, count) = row.map_err(|e| Error::Other(format!("history stats: {e}")))?;
            by_state.insert(state, count);
        }

        Ok(HistoryStats {
            total,
            by_state,
            total_requests,
            total_bytes_in,
            total_bytes_out,
            avg_duration_ms,
        })
    }

    /// Records bucketed by end time.
    pub fn timeseries(
        &self,
        bucket_secs: u64,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<TimeBucket>> {
        let bucket_ms = (bucket_secs.max(1) * 1000) as i64;
        let since_ms = since.map(|t| t.timestamp_millis()).unwrap_or(0);
        let until_ms = until
            .map(|t| t.timestamp_millis())
            .unwrap_or(i64::MAX);

        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT (end_ms / ?1) * ?1 AS bucket,
                        COUNT(*),
                        COALESCE(SUM(bytes_in), 0),
                        COALESCE(SUM(bytes_out), 0)
                 FROM session_records
                 WHERE end_ms >= ?2 AND end_ms <= ?3
                 GROUP BY bucket ORDER BY bucket",
            )
            .map_err(|e| Error::Other(format!("history timeseries: {e}")))?;
        let rows = stmt
            .query_map(params![bucket_ms, since_ms, until_ms], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)? as u64,
                    row.get::<_, i64>(2)? as u64,
                    row.get::<_, i64>(3)? as u64,
                ))
            })
            .map_err(|e| Error::Other(format!("history timeseries: {e}")))?;

        let mut buckets = Vec::new();
        for row in rows {
            let (bucket_ms, count, bytes_in, bytes_out) =
                row.map_err(|e| Error::Other(format!("history timeseries: {e}")))?;
            buckets.push(TimeBucket {
                bucket_start: DateTime::from_timestamp_millis(bucket_ms).unwrap_or_default(),
                count,
                bytes_in,
                bytes_out,
            });
        }
        Ok(buckets)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let start_ms: i64 = row.get(2)?;
    let end_ms: i64 = row.get(3)?;
    Ok(SessionRecord {
        id: row.get(0)?,
        state: row.get(1)?,
        start: DateTime::from_timestamp_millis(start_ms).unwrap_or_default(),
        end: DateTime::from_timestamp_millis(end_ms).unwrap_or_default(),
        duration_ms: row.get(4)?,
        request_count: row.get::<_, i64>(5)? as u64,
        bytes_in: row.get::<_, i64>(6)? as u64,
        bytes_out: row.get::<_, i64>(7)? as u64,
        tokens_in: row.get::<_, i64>(8)? as u64,
        tokens_out: row.get::<_, i64>(9)? as u64,
        backend: row.get(10)?,
        client_addr: row.get(11)?,
        backends_used: serde_json::from_str(&row.get::<_, String>(12)?).unwrap_or_default(),
        metadata: serde_json::from_str(&row.get::<_, String>(13)?).unwrap_or_default(),
        captured_content: serde_json::from_str(&row.get::<_, String>(14)?).unwrap_or_default(),
        violations: serde_json::from_str(&row.get::<_, String>(15)?).unwrap_or_default(),
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sink adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Persists each emitted record to the history database. A write failure
/// is logged and dropped — record emission must never take down the
/// session lifecycle path.
pub struct HistoryRecordSink {
    store: Arc<HistoryStore>,
}

impl HistoryRecordSink {
    pub fn new(store: Arc<HistoryStore>) -> Self {
        Self { store }
    }
}

impl SessionRecordSink for HistoryRecordSink {
    fn emit(&self, record: &SessionRecord) {
        if let Err(e) = self.store.insert(record) {
            tracing::warn!(session_id = %record.id, error = %e, "history insert failed");
            return;
        }
        TraceEvent::RecordEmitted {
            session_id: record.id.clone(),
            state: record.state.clone(),
            sink: "history".into(),
        }
        .emit();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(id: &str, state: &str, end: DateTime<Utc>) -> SessionRecord {
        SessionRecord {
            id: id.into(),
            state: state.into(),
            start: end - chrono::Duration::seconds(30),
            end,
            duration_ms: 30_000,
            request_count: 5,
            bytes_in: 100,
            bytes_out: 200,
            tokens_in: 10,
            tokens_out: 20,
            backend: "default".into(),
            backends_used: HashMap::from([("default".into(), 5)]),
            client_addr: "1.2.3.4:1000".into(),
            metadata: HashMap::new(),
            captured_content: Vec::new(),
            violations: Vec::new(),
        }
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn insert_and_query_roundtrip() {
        let store = HistoryStore::open_in_memory().unwrap();
        store.insert(&record("s1", "completed", at(10, 0, 0))).unwrap();
        store.insert(&record("s2", "killed", at(10, 5, 0))).unwrap();

        let all = store.query(&HistoryQuery::default()).unwrap();
        assert_eq!(all.len(), 2);
        // Newest first.
        assert_eq!(all[0].id, "s2");
        assert_eq!(all[1].backends_used.get("default"), Some(&5));

        let killed = store
            .query(&HistoryQuery {
                state: Some("killed".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(killed.len(), 1);
        assert_eq!(killed[0].id, "s2");
    }

    #[test]
    fn query_window_and_paging() {
        let store = HistoryStore::open_in_memory().unwrap();
        for i in 0..10 {
            store.insert(&record(&format!("s{i}"), "completed", at(10, i, 0))).unwrap();
        }
        let page = store
            .query(&HistoryQuery {
                since: Some(at(10, 3, 0)),
                limit: 3,
                offset: 1,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].id, "s8");
    }

    #[test]
    fn stats_aggregate() {
        let store = HistoryStore::open_in_memory().unwrap();
        store.insert(&record("s1", "completed", at(10, 0, 0))).unwrap();
        store.insert(&record("s2", "completed", at(10, 1, 0))).unwrap();
        store.insert(&record("s3", "terminated", at(10, 2, 0))).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_state.get("completed"), Some(&2));
        assert_eq!(stats.total_requests, 15);
        assert_eq!(stats.total_bytes_out, 600);
    }

    #[test]
    fn timeseries_buckets_by_hour() {
        let store = HistoryStore::open_in_memory().unwrap();
        store.insert(&record("s1", "completed", at(10, 10, 0))).unwrap();
        store.insert(&record("s2", "completed", at(10, 50, 0))).unwrap();
        store.insert(&record("s3", "completed", at(11, 10, 0))).unwrap();

        let buckets = store.timeseries(3600, None, None).unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].count, 2);
        assert_eq!(buckets[1].count, 1);
    }
}
