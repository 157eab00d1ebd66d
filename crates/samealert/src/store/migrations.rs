//! Versioned schema migrations
//!
//! Migrations are an ordered list of forward-only steps. Each
//! step runs in its own transaction together with the
//! `schema_version` row which records it, so a failed step
//! leaves the store at the previous version.
//!
//! Steps are idempotent. A store that was created outside of
//! this module, without a `schema_version` table, is brought up
//! to date without losing rows.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use thiserror::Error;

/// Newest schema version this code understands
pub const SCHEMA_VERSION: i64 = 3;

/// Columns which the `alerts` table must have
pub const EXPECTED_COLUMNS: &[&str] = &[
    "id",
    "timestamp_utc",
    "originator",
    "event",
    "fips_codes",
    "regions",
    "duration_minutes",
    "issued_code",
    "source",
    "raw_message",
    "event_code",
    "created_at",
    "originator_name",
];

const VERSION_TABLE_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    version INTEGER NOT NULL,
    applied_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    description TEXT
)";

/// Error bringing the store schema up to date
///
/// All migration errors are fatal.
#[derive(Error, Debug)]
pub enum MigrationError {
    /// The store was written by newer software
    #[error("database schema version {found} is newer than supported version {supported}")]
    TooNew { found: i64, supported: i64 },

    /// Pre-migration backup failed; nothing was migrated
    #[error("unable to back up database to \"{}\": {source}", path.display())]
    Backup {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// A step failed and was rolled back
    #[error("migration to version {version} ({description}) failed: {source}")]
    Step {
        version: i64,
        description: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// The migrated schema does not have the expected columns
    #[error("alerts table is missing columns: {}", missing.join(", "))]
    Schema { missing: Vec<String> },

    /// Version bookkeeping failed
    #[error("unable to read schema version: {0}")]
    Sql(#[from] rusqlite::Error),
}

/// One forward migration step
#[derive(Clone, Copy)]
pub struct Migration {
    /// Version after this step
    pub version: i64,

    /// Recorded in `schema_version.description`
    pub description: &'static str,

    apply: fn(&Transaction) -> rusqlite::Result<()>,
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("description", &self.description)
            .finish()
    }
}

/// All migration steps, in order
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create alerts table",
        apply: create_alerts,
    },
    Migration {
        version: 2,
        description: "add event_code, created_at, and indexes",
        apply: add_event_code_and_indexes,
    },
    Migration {
        version: 3,
        description: "add originator_name",
        apply: add_originator_name,
    },
];

/// What [`migrate()`] did
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationReport {
    /// Version before migrating
    pub from: i64,

    /// Version after migrating
    pub to: i64,

    /// Backup written before the first step, if any
    pub backup: Option<PathBuf>,
}

impl MigrationReport {
    /// True if no step ran
    pub fn is_noop(&self) -> bool {
        self.from == self.to
    }
}

/// Bring the schema up to [`SCHEMA_VERSION`]
///
/// If the store already holds a schema and needs migrating, it
/// is first copied to `<db_path>.v<N>.bak`. Pass `None` for
/// `db_path` to skip the backup, as for in-memory stores.
///
/// After migrating, the `alerts` columns are checked with
/// [`validate_schema()`].
pub fn migrate(
    conn: &mut Connection,
    db_path: Option<&Path>,
) -> Result<MigrationReport, MigrationError> {
    let report = migrate_with(conn, db_path, MIGRATIONS)?;
    validate_schema(conn)?;
    Ok(report)
}

pub(crate) fn migrate_with(
    conn: &mut Connection,
    db_path: Option<&Path>,
    migrations: &[Migration],
) -> Result<MigrationReport, MigrationError> {
    let latest = migrations.last().map(|m| m.version).unwrap_or(0);
    let has_schema = table_exists(conn, "alerts")?;

    let from = current_version(conn)?;
    if from > latest {
        return Err(MigrationError::TooNew {
            found: from,
            supported: latest,
        });
    }
    if from == latest {
        debug!("store: schema is current at version {}", from);
        return Ok(MigrationReport {
            from,
            to: from,
            backup: None,
        });
    }

    info!("store: migrating schema from version {} to {}", from, latest);
    let backup = match db_path {
        Some(path) if has_schema => Some(backup_database(conn, path, from)?),
        _ => None,
    };

    // after the backup, which must match the store as it was
    conn.execute_batch(VERSION_TABLE_SQL)?;

    let mut version = from;
    for step in migrations {
        if step.version <= version {
            continue;
        }
        apply_migration(conn, step)?;
        version = step.version;
    }

    Ok(MigrationReport {
        from,
        to: version,
        backup,
    })
}

/// Latest recorded schema version, or zero
pub fn current_version(conn: &Connection) -> Result<i64, MigrationError> {
    if !table_exists(conn, "schema_version")? {
        return Ok(0);
    }
    let version: Option<i64> =
        conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
    Ok(version.unwrap_or(0))
}

/// Check that the `alerts` table has every expected column
pub fn validate_schema(conn: &Connection) -> Result<(), MigrationError> {
    let present = table_columns(conn, "alerts")?;
    let missing: Vec<String> = EXPECTED_COLUMNS
        .iter()
        .filter(|col| !present.iter().any(|p| p == *col))
        .map(|col| col.to_string())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(MigrationError::Schema { missing })
    }
}

pub(crate) fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn backup_database(conn: &Connection, db_path: &Path, version: i64) -> Result<PathBuf, MigrationError> {
    let mut name = db_path.as_os_str().to_owned();
    name.push(format!(".v{}.bak", version));
    let path = PathBuf::from(name);

    // VACUUM INTO refuses to overwrite
    if path.exists() {
        warn!("store: replacing old backup \"{}\"", path.display());
        if let Err(e) = fs::remove_file(&path) {
            warn!("store: unable to remove old backup: {}", e);
        }
    }

    conn.execute("VACUUM INTO ?1", [path.to_string_lossy()])
        .map_err(|source| MigrationError::Backup {
            path: path.clone(),
            source,
        })?;

    info!("store: backed up version {} schema to \"{}\"", version, path.display());
    Ok(path)
}

fn apply_migration(conn: &mut Connection, step: &Migration) -> Result<(), MigrationError> {
    let wrap = |source| MigrationError::Step {
        version: step.version,
        description: step.description,
        source,
    };

    info!("store: applying migration {}: {}", step.version, step.description);
    let tx = conn.transaction().map_err(wrap)?;
    (step.apply)(&tx).map_err(wrap)?;
    tx.execute(
        "INSERT INTO schema_version (version, description) VALUES (?1, ?2)",
        params![step.version, step.description],
    )
    .map_err(wrap)?;
    tx.commit().map_err(wrap)
}

fn add_column_if_missing(
    tx: &Transaction,
    table: &str,
    column: &str,
    decl: &str,
) -> rusqlite::Result<()> {
    if table_columns(tx, table)?.iter().any(|c| c == column) {
        return Ok(());
    }
    tx.execute_batch(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl))
}

fn create_alerts(tx: &Transaction) -> rusqlite::Result<()> {
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS alerts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp_utc TEXT,
            originator TEXT,
            event TEXT,
            fips_codes TEXT,
            regions TEXT, -- region labels joined with '; '
            duration_minutes INTEGER,
            issued_code TEXT,
            source TEXT,
            raw_message TEXT
        )",
    )
}

fn add_event_code_and_indexes(tx: &Transaction) -> rusqlite::Result<()> {
    add_column_if_missing(tx, "alerts", "event_code", "TEXT")?;

    // ALTER TABLE cannot add a column with a non-constant default
    add_column_if_missing(tx, "alerts", "created_at", "DATETIME")?;
    tx.execute_batch(
        "UPDATE alerts SET created_at = CURRENT_TIMESTAMP WHERE created_at IS NULL;
         CREATE INDEX IF NOT EXISTS idx_alerts_timestamp ON alerts(timestamp_utc);
         CREATE INDEX IF NOT EXISTS idx_alerts_event_code ON alerts(event_code);
         CREATE INDEX IF NOT EXISTS idx_alerts_originator ON alerts(originator);
         CREATE INDEX IF NOT EXISTS idx_alerts_created_at ON alerts(created_at);",
    )
}

fn add_originator_name(tx: &Transaction) -> rusqlite::Result<()> {
    add_column_if_missing(tx, "alerts", "originator_name", "TEXT")
}
