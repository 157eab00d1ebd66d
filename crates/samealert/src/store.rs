//! Durable alert storage in SQLite
//!
//! Each accepted alert becomes one row of the `alerts` table,
//! written in its own transaction. The schema is brought up to
//! date by the [migrations] when the store is opened.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, Row};
use thiserror::Error;

use crate::message::ParsedAlert;
use crate::record::{AlertRecord, RecordId, StoredAlert};

pub mod migrations;

pub use migrations::{MigrationError, MigrationReport, SCHEMA_VERSION};

/// Default time to wait on a locked database
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

// The `regions` column joins labels with "; ", not ",": each
// label, like "Atascosa, Texas", already contains a comma.
const REGION_SEPARATOR: &str = "; ";

const SELECT_COLUMNS: &str = "id, timestamp_utc, originator, event, fips_codes, regions, \
     duration_minutes, issued_code, source, raw_message, event_code, created_at, originator_name";

/// Error reading or writing the alert store
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database error
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Schema could not be brought up to date
    #[error(transparent)]
    Migration(#[from] MigrationError),
}

impl StoreError {
    /// True if retrying the operation might succeed
    ///
    /// Busy and locked databases, and I/O failures, are
    /// transient. Everything else, like constraint violations
    /// or a corrupt schema, is not.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::CannotOpen
            ),
            _ => false,
        }
    }
}

/// Filter for [`AlertStore::query()`]
///
/// All filters are optional. Results are newest first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AlertQuery {
    /// Issued at or after this time
    pub issued_after: Option<DateTime<Utc>>,

    /// Issued strictly before this time
    pub issued_before: Option<DateTime<Utc>>,

    /// Exact event code, like `TOR`
    pub event_code: Option<String>,

    /// Exact originator code, like `WXR`
    pub originator: Option<String>,

    /// Maximum number of results
    pub limit: Option<usize>,
}

/// Summary of store contents
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreStats {
    /// Current schema version
    pub schema_version: i64,

    /// Number of alerts stored
    pub alert_count: i64,

    /// Columns of the `alerts` table
    pub columns: Vec<String>,

    /// Indexes on the `alerts` table
    pub indexes: Vec<String>,

    /// Database file size, for on-disk stores
    pub size_bytes: Option<u64>,
}

impl fmt::Display for StoreStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "schema version {}, {} alerts, indexes [{}]",
            self.schema_version,
            self.alert_count,
            self.indexes.join(", ")
        )?;
        if let Some(size) = self.size_bytes {
            write!(f, ", {} bytes", size)?;
        }
        Ok(())
    }
}

/// SQLite-backed alert store
#[derive(Debug)]
pub struct AlertStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl AlertStore {
    /// Open or create the store at `path`
    ///
    /// Enables write-ahead logging, sets the busy timeout, and
    /// runs migrations. A migration failure is reported as
    /// [`StoreError::Migration`].
    pub fn open<P: AsRef<Path>>(path: P, busy_timeout: StdDuration) -> Result<Self, StoreError> {
        let path = path.as_ref().to_owned();
        let conn = Connection::open(&path)?;
        Self::setup(conn, Some(path), busy_timeout)
    }

    /// Open a private in-memory store
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::setup(
            conn,
            None,
            StdDuration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        )
    }

    fn setup(
        mut conn: Connection,
        path: Option<PathBuf>,
        busy_timeout: StdDuration,
    ) -> Result<Self, StoreError> {
        conn.busy_timeout(busy_timeout)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("store: journal mode {}", mode);

        let report = migrations::migrate(&mut conn, path.as_deref())?;
        if !report.is_noop() {
            info!(
                "store: schema migrated from version {} to {}",
                report.from, report.to
            );
        }

        Ok(Self { conn, path })
    }

    /// Persist one record
    ///
    /// The insert is a single transaction: after this method
    /// returns `Ok`, the record is durable. On error nothing has
    /// been written.
    pub fn store(&mut self, record: &AlertRecord) -> Result<RecordId, StoreError> {
        let alert = record.alert();
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO alerts (timestamp_utc, originator, event, fips_codes, regions, \
             duration_minutes, issued_code, source, raw_message, event_code, created_at, \
             originator_name) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                issued_timestamp(&alert.issued_at()),
                alert.originator(),
                record.event_name(),
                record.location_list(),
                record.regions().join(REGION_SEPARATOR),
                alert.purge_minutes(),
                alert.issue_code().to_string(),
                alert.station(),
                alert.raw(),
                alert.event_code(),
                created_timestamp(&record.received_at()),
                record.originator_name(),
            ],
        )?;
        let id = RecordId(tx.last_insert_rowid());
        tx.commit()?;

        debug!("store: wrote alert {}", id);
        Ok(id)
    }

    /// Search for alerts, newest first
    ///
    /// Rows which cannot be read back as alerts, such as those
    /// written by older software, are skipped.
    pub fn query(&self, query: &AlertQuery) -> Result<Vec<StoredAlert>, StoreError> {
        let mut sql = format!("SELECT {} FROM alerts WHERE 1 = 1", SELECT_COLUMNS);
        let mut values: Vec<Value> = Vec::new();

        if let Some(after) = &query.issued_after {
            values.push(Value::Text(issued_timestamp(after)));
            sql.push_str(&format!(" AND timestamp_utc >= ?{}", values.len()));
        }
        if let Some(before) = &query.issued_before {
            values.push(Value::Text(issued_timestamp(before)));
            sql.push_str(&format!(" AND timestamp_utc < ?{}", values.len()));
        }
        if let Some(event_code) = &query.event_code {
            values.push(Value::Text(event_code.clone()));
            sql.push_str(&format!(" AND event_code = ?{}", values.len()));
        }
        if let Some(originator) = &query.originator {
            values.push(Value::Text(originator.clone()));
            sql.push_str(&format!(" AND originator = ?{}", values.len()));
        }
        sql.push_str(" ORDER BY timestamp_utc DESC, id DESC");
        if let Some(limit) = query.limit {
            values.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
        }

        self.select(&sql, params_from_iter(values.iter()))
    }

    /// Alerts received at or after `since`, newest first
    pub fn recent_since(&self, since: &DateTime<Utc>) -> Result<Vec<StoredAlert>, StoreError> {
        let sql = format!(
            "SELECT {} FROM alerts WHERE created_at >= ?1 ORDER BY created_at DESC, id DESC",
            SELECT_COLUMNS
        );
        self.select(&sql, [created_timestamp(since)])
    }

    /// Schema version, row count, and index names
    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let schema_version = migrations::current_version(&self.conn)?;
        let alert_count = self
            .conn
            .query_row("SELECT COUNT(*) FROM alerts", [], |row| row.get(0))?;
        let columns = migrations::table_columns(&self.conn, "alerts")?;

        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = 'alerts' \
             AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let indexes = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let size_bytes = self
            .path
            .as_ref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len());

        Ok(StoreStats {
            schema_version,
            alert_count,
            columns,
            indexes,
            size_bytes,
        })
    }

    /// Path to the database file, if on disk
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn select<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<StoredAlert>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, |row| Ok(read_row(row)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().flatten().collect())
    }
}

// Read one row, or None if it does not hold a valid alert
fn read_row(row: &Row) -> Option<StoredAlert> {
    let id: i64 = row.get(0).ok()?;
    let text = |idx: usize| -> Option<String> { row.get::<_, Option<String>>(idx).ok()? };

    let issued_at = parse_timestamp(&text(1)?)?;
    let received_at = parse_timestamp(&text(11)?)?;
    let fips = text(4).unwrap_or_default();
    let locations: Vec<&str> = fips.split(',').filter(|s| !s.is_empty()).collect();
    let purge_minutes: u32 = row.get::<_, Option<u32>>(6).ok()??;
    let raw = text(9).unwrap_or_default();

    let alert = match ParsedAlert::from_parts(
        &text(2)?,
        &text(10)?,
        &locations,
        purge_minutes,
        &text(7)?,
        issued_at,
        &text(8)?,
        &raw,
    ) {
        Ok(alert) => alert,
        Err(err) => {
            debug!("store: skipping unreadable alert #{}: {}", id, err);
            return None;
        }
    };

    let regions = text(5)
        .map(|r| {
            r.split(REGION_SEPARATOR)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();
    let event_name = text(3).unwrap_or_else(|| alert.event_code().to_owned());
    let originator_name = text(12).unwrap_or_else(|| alert.originator().to_owned());

    Some(StoredAlert {
        id: RecordId(id),
        record: AlertRecord::new(alert, event_name, originator_name, regions, received_at),
    })
}

fn issued_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn created_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use rusqlite::ffi;

    use super::*;
    use crate::message::RolloverPolicy;
    use crate::reference::ReferenceTables;

    fn rx() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 18, 46, 2).unwrap()
    }

    fn tables() -> ReferenceTables {
        ReferenceTables::from_readers(
            "code,description\nTOR,Tornado Warning\nSVR,Severe Thunderstorm Warning\n".as_bytes(),
            "code,name\nEAS,Broadcast station or cable system\n".as_bytes(),
            "code,name\n48,Texas\n".as_bytes(),
            "fips,county\n48013,Atascosa County\n48029,Bexar County\n".as_bytes(),
        )
        .unwrap()
    }

    fn record(line: &str, received: DateTime<Utc>) -> AlertRecord {
        let alert = ParsedAlert::parse(line, &received, &RolloverPolicy::default()).unwrap();
        AlertRecord::resolve(alert, &tables(), received)
    }

    #[test]
    fn test_store_and_read_back() {
        let mut store = AlertStore::open_in_memory().unwrap();
        let rec = record("ZCZC-EAS-TOR-048013-048029+0030-2921845-KLOX/NWS-", rx());

        let id = store.store(&rec).expect("store");
        let found = store.query(&AlertQuery::default()).unwrap();
        assert_eq!(1, found.len());
        assert_eq!(id, found[0].id);
        assert_eq!(rec, found[0].record);

        let raw: (String, String, String) = store
            .conn
            .query_row(
                "SELECT fips_codes, regions, timestamp_utc FROM alerts WHERE id = ?1",
                [id.0],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!("048013,048029", raw.0);
        assert_eq!("Atascosa, Texas; Bexar, Texas", raw.1);
        assert_eq!("2026-10-19T18:45:00Z", raw.2);
    }

    #[test]
    fn test_query_filters() {
        let mut store = AlertStore::open_in_memory().unwrap();
        store
            .store(&record("ZCZC-EAS-TOR-048013+0030-2921800-KLOX/NWS-", rx()))
            .unwrap();
        store
            .store(&record("ZCZC-WXR-SVR-048013+0030-2921810-KEWX/NWS-", rx()))
            .unwrap();
        let newest = store
            .store(&record("ZCZC-EAS-TOR-048029+0030-2921820-KLOX/NWS-", rx()))
            .unwrap();

        let all = store.query(&AlertQuery::default()).unwrap();
        assert_eq!(3, all.len());
        assert_eq!(newest, all[0].id);

        let tornadoes = store
            .query(&AlertQuery {
                event_code: Some("TOR".to_owned()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(2, tornadoes.len());

        let weather = store
            .query(&AlertQuery {
                originator: Some("WXR".to_owned()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(1, weather.len());
        assert_eq!("SVR", weather[0].record.alert().event_code());

        let windowed = store
            .query(&AlertQuery {
                issued_after: Some(Utc.with_ymd_and_hms(2026, 10, 19, 18, 5, 0).unwrap()),
                issued_before: Some(Utc.with_ymd_and_hms(2026, 10, 19, 18, 20, 0).unwrap()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(1, windowed.len());

        let limited = store
            .query(&AlertQuery {
                limit: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(2, limited.len());
        assert_eq!(newest, limited[0].id);
    }

    #[test]
    fn test_recent_since() {
        let mut store = AlertStore::open_in_memory().unwrap();
        store
            .store(&record(
                "ZCZC-EAS-TOR-048013+0030-2921800-KLOX/NWS-",
                rx() - Duration::minutes(30),
            ))
            .unwrap();
        store
            .store(&record("ZCZC-EAS-TOR-048029+0030-2921845-KLOX/NWS-", rx()))
            .unwrap();

        let recent = store.recent_since(&(rx() - Duration::minutes(5))).unwrap();
        assert_eq!(1, recent.len());
        assert_eq!(rx(), recent[0].record.received_at());
    }

    #[test]
    fn test_unreadable_rows_skipped() {
        let mut store = AlertStore::open_in_memory().unwrap();
        store
            .conn
            .execute(
                "INSERT INTO alerts (timestamp_utc, originator, event) VALUES ('Oct 19', 'WXR', 'Tornado Warning')",
                [],
            )
            .unwrap();
        store
            .store(&record("ZCZC-EAS-TOR-048013+0030-2921845-KLOX/NWS-", rx()))
            .unwrap();

        assert_eq!(1, store.query(&AlertQuery::default()).unwrap().len());
        assert_eq!(2, store.stats().unwrap().alert_count);
    }

    #[test]
    fn test_stats_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alerts.db");
        let timeout = StdDuration::from_millis(DEFAULT_BUSY_TIMEOUT_MS);

        {
            let mut store = AlertStore::open(&path, timeout).unwrap();
            store
                .store(&record("ZCZC-EAS-TOR-048013+0030-2921845-KLOX/NWS-", rx()))
                .unwrap();
        }

        let store = AlertStore::open(&path, timeout).unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(SCHEMA_VERSION, stats.schema_version);
        assert_eq!(1, stats.alert_count);
        assert_eq!(
            stats.indexes,
            &[
                "idx_alerts_created_at",
                "idx_alerts_event_code",
                "idx_alerts_originator",
                "idx_alerts_timestamp",
            ]
        );
        assert!(stats.size_bytes.unwrap_or(0) > 0);
        assert!(!dir.path().join("alerts.db.v3.bak").exists());
    }

    #[test]
    fn test_is_transient() {
        let busy = StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            ffi::Error::new(ffi::SQLITE_BUSY),
            None,
        ));
        let locked = StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            ffi::Error::new(ffi::SQLITE_LOCKED),
            None,
        ));
        let constraint = StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            ffi::Error::new(ffi::SQLITE_CONSTRAINT),
            None,
        ));
        let migration = StoreError::Migration(MigrationError::TooNew {
            found: 9,
            supported: 3,
        });

        assert!(busy.is_transient());
        assert!(locked.is_transient());
        assert!(!constraint.is_transient());
        assert!(!migration.is_transient());
        assert!(!StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows).is_transient());
    }
}
