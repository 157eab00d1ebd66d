//! Per-line ingestion state machine
//!
//! Every input line moves through a fixed sequence of states.
//! Each state is its own type, and each transition consumes the
//! previous state, so a line cannot be persisted without being
//! parsed and checked for duplicates first.
//!
//! ```txt
//!   line
//!    ||
//!    \/
//! +--------+  not ZCZC   +---------+
//! |  Read  | ==========> | Skipped |
//! +--------+             +---------+
//!    ||      bad header  +----------+
//!    || ===============> | Rejected |
//!    \/                  +----------+
//! +--------+  repeat     +------------+
//! | Parsed | ==========> | Suppressed |
//! +--------+             +------------+
//!    ||
//!    \/
//! +--------+  persist    +-----------+  publish  +-----------+
//! | Fresh  | ==========> | Committed | ========> | Stored(id) |
//! +--------+             +-----------+           +-----------+
//! ```
//!
//! Parse failures and duplicates end the line; the caller moves
//! on to the next one. Only persistence failures are errors.
//! A transient persistence failure is retried with exponential
//! backoff before it is reported.

use std::sync::Arc;
use std::thread;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use log::{error, info, trace, warn};
use thiserror::Error;

#[cfg(not(test))]
use log::debug;

#[cfg(test)]
use std::println as debug;

use crate::dedup::Deduplicator;
use crate::message::{BurstError, ParsedAlert, RolloverPolicy};
use crate::record::{AlertRecord, RecordId, StoredAlert};
use crate::reference::ReferenceTables;
use crate::snapshot::SnapshotPublisher;
use crate::store::{AlertStore, StoreError};

/// Default number of attempts to persist one alert
pub const DEFAULT_STORE_ATTEMPTS: u32 = 5;

/// Default delay after the first failed attempt
pub const DEFAULT_STORE_BACKOFF_MS: u64 = 100;

/// Default upper bound on the retry delay
pub const DEFAULT_STORE_MAX_BACKOFF_MS: u64 = 2_000;

/// Durable destination for alert records
///
/// Implemented by [`AlertStore`]. The ingestion loop calls
/// [`store()`](AlertSink::store) exactly once per attempt and
/// treats a successful return as a durable commit.
pub trait AlertSink {
    /// Persist `record` atomically
    fn store(&mut self, record: &AlertRecord) -> Result<RecordId, StoreError>;

    /// Records received at or after `since`
    ///
    /// Used to rebuild the duplicate window at startup. Sinks
    /// which cannot answer may return nothing.
    fn recent_since(&self, _since: &DateTime<Utc>) -> Result<Vec<StoredAlert>, StoreError> {
        Ok(Vec::new())
    }
}

impl AlertSink for AlertStore {
    fn store(&mut self, record: &AlertRecord) -> Result<RecordId, StoreError> {
        AlertStore::store(self, record)
    }

    fn recent_since(&self, since: &DateTime<Utc>) -> Result<Vec<StoredAlert>, StoreError> {
        AlertStore::recent_since(self, since)
    }
}

/// Exponential backoff for transient store failures
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: StdDuration,
    max_backoff: StdDuration,
}

impl RetryPolicy {
    /// Try up to `max_attempts` times
    ///
    /// The delay starts at `initial_backoff` and doubles after
    /// each failure, up to `max_backoff`. At least one attempt
    /// is always made.
    pub fn new(max_attempts: u32, initial_backoff: StdDuration, max_backoff: StdDuration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
        }
    }

    /// Maximum number of attempts
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after failed attempt number `attempt` (from 1)
    pub fn backoff(&self, attempt: u32) -> StdDuration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_STORE_ATTEMPTS,
            StdDuration::from_millis(DEFAULT_STORE_BACKOFF_MS),
            StdDuration::from_millis(DEFAULT_STORE_MAX_BACKOFF_MS),
        )
    }
}

/// What happened to one input line
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LineOutcome {
    /// Not a SAME header
    Skipped,

    /// A SAME header which failed to parse
    Rejected(BurstError),

    /// A repeat of a recently-stored alert
    Suppressed,

    /// A new alert, now durable
    Stored(RecordId),
}

/// Fatal ingestion error
#[derive(Error, Debug)]
pub enum IngestError {
    /// An alert could not be persisted
    #[error("unable to store alert after {attempts} attempt(s): {source}")]
    Persist {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    /// The duplicate window could not be rebuilt at startup
    #[error("unable to load recent alerts: {0}")]
    Seed(#[source] StoreError),
}

/// Running line counts
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub lines: u64,
    pub skipped: u64,
    pub rejected: u64,
    pub suppressed: u64,
    pub stored: u64,
    pub publish_failures: u64,
}

/// Drives lines through parse, dedup, persist, and publish
///
/// Create with [`IngestBuilder`](crate::IngestBuilder).
#[derive(Debug)]
pub struct Ingester<S> {
    tables: Arc<ReferenceTables>,
    rollover: RolloverPolicy,
    dedup: Deduplicator,
    sink: S,
    snapshot: Option<SnapshotPublisher>,
    retry: RetryPolicy,
    stats: IngestStats,
}

impl<S: AlertSink> Ingester<S> {
    pub(crate) fn new(
        tables: Arc<ReferenceTables>,
        rollover: RolloverPolicy,
        dedup: Deduplicator,
        sink: S,
        snapshot: Option<SnapshotPublisher>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            tables,
            rollover,
            dedup,
            sink,
            snapshot,
            retry,
            stats: IngestStats::default(),
        }
    }

    /// Ingest one line of decoder output, received at `received`
    ///
    /// Returns the line's outcome. Returns an error only if a new
    /// alert could not be persisted, after retries; the caller
    /// should stop.
    pub fn ingest_line(
        &mut self,
        line: &str,
        received: DateTime<Utc>,
    ) -> Result<LineOutcome, IngestError> {
        self.stats.lines += 1;

        let parsed = match Line::<Read>::new(line, received).parse(&self.rollover) {
            Ok(parsed) => parsed,
            Err(outcome) => return Ok(self.count(outcome)),
        };

        let fresh = match parsed.check(&self.dedup) {
            Ok(fresh) => fresh,
            Err(outcome) => return Ok(self.count(outcome)),
        };

        let committed = fresh.persist(&self.tables, &mut self.sink, &self.retry)?;
        self.dedup.remember(committed.state.record.alert(), &received);

        let outcome = committed.publish(self.snapshot.as_ref(), &mut self.stats);
        Ok(self.count(outcome))
    }

    /// Rebuild the duplicate window from the sink
    ///
    /// Loads records received within one window of `now`.
    pub fn seed(&mut self, now: &DateTime<Utc>) -> Result<usize, IngestError> {
        let since = *now - self.dedup.window();
        let recent = self.sink.recent_since(&since).map_err(IngestError::Seed)?;
        self.dedup.seed(recent.iter().map(|stored| &stored.record), now);
        Ok(recent.len())
    }

    /// Line counts so far
    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    /// The alert sink
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// The alert sink, mutably
    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// The duplicate window
    pub fn dedup(&self) -> &Deduplicator {
        &self.dedup
    }

    /// Consume, returning the sink
    pub fn into_sink(self) -> S {
        self.sink
    }

    fn count(&mut self, outcome: LineOutcome) -> LineOutcome {
        match &outcome {
            LineOutcome::Skipped => self.stats.skipped += 1,
            LineOutcome::Rejected(_) => self.stats.rejected += 1,
            LineOutcome::Suppressed => self.stats.suppressed += 1,
            LineOutcome::Stored(_) => self.stats.stored += 1,
        }
        outcome
    }
}

#[derive(Debug)]
struct Line<S> {
    received: DateTime<Utc>,
    state: S,
}

#[derive(Debug)]
struct Read<'l> {
    text: &'l str,
}

#[derive(Debug)]
struct Parsed {
    alert: ParsedAlert,
}

#[derive(Debug)]
struct Fresh {
    alert: ParsedAlert,
}

#[derive(Debug)]
struct Committed {
    record: AlertRecord,
    id: RecordId,
}

impl<'l> Line<Read<'l>> {
    fn new(text: &'l str, received: DateTime<Utc>) -> Self {
        Self {
            received,
            state: Read { text },
        }
    }

    fn parse(self, rollover: &RolloverPolicy) -> Result<Line<Parsed>, LineOutcome> {
        match ParsedAlert::parse(self.state.text, &self.received, rollover) {
            Ok(alert) => Ok(Line {
                received: self.received,
                state: Parsed { alert },
            }),
            Err(err) if err.is_skippable() => {
                trace!("skipped: \"{}\"", self.state.text.trim_end());
                Err(LineOutcome::Skipped)
            }
            Err(err) => {
                warn!("{}: \"{}\"", err, self.state.text.trim());
                Err(LineOutcome::Rejected(err))
            }
        }
    }
}

impl Line<Parsed> {
    fn check(self, dedup: &Deduplicator) -> Result<Line<Fresh>, LineOutcome> {
        if dedup.is_duplicate(&self.state.alert, &self.received) {
            debug!("suppressed duplicate: \"{}\"", self.state.alert);
            Err(LineOutcome::Suppressed)
        } else {
            Ok(self.into())
        }
    }
}

impl From<Line<Parsed>> for Line<Fresh> {
    fn from(line: Line<Parsed>) -> Self {
        debug!("new alert: \"{}\"", line.state.alert);
        Line {
            received: line.received,
            state: Fresh {
                alert: line.state.alert,
            },
        }
    }
}

impl Line<Fresh> {
    fn persist<S: AlertSink>(
        self,
        tables: &ReferenceTables,
        sink: &mut S,
        retry: &RetryPolicy,
    ) -> Result<Line<Committed>, IngestError> {
        let record = AlertRecord::resolve(self.state.alert, tables, self.received);

        let mut attempt = 1;
        let id = loop {
            match sink.store(&record) {
                Ok(id) => break id,
                Err(err) if err.is_transient() && attempt < retry.max_attempts() => {
                    let delay = retry.backoff(attempt);
                    warn!(
                        "store attempt {} of {} failed, retrying in {} ms: {}",
                        attempt,
                        retry.max_attempts(),
                        delay.as_millis(),
                        err
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => {
                    error!("unable to store alert \"{}\": {}", record.alert(), err);
                    return Err(IngestError::Persist {
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        };

        Ok(Line {
            received: self.received,
            state: Committed { record, id },
        })
    }
}

impl Line<Committed> {
    fn publish(self, snapshot: Option<&SnapshotPublisher>, stats: &mut IngestStats) -> LineOutcome {
        let Committed { record, id } = self.state;
        info!("stored alert {}: {}", id, record);

        if let Some(publisher) = snapshot {
            if let Err(err) = publisher.publish(&record) {
                error!("alert {} is stored but was not published: {}", id, err);
                stats.publish_failures += 1;
            }
        }

        LineOutcome::Stored(id)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use chrono::{Duration, TimeZone};
    use rusqlite::ffi;

    use super::*;
    use crate::builder::IngestBuilder;
    use crate::message::Field;
    use crate::store::AlertQuery;

    const TOR: &str = "ZCZC-EAS-TOR-048013+0030-2921845-KLOX/NWS-";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 18, 46, 2).unwrap()
    }

    fn tables() -> Arc<ReferenceTables> {
        Arc::new(
            ReferenceTables::from_readers(
                "code,description\nTOR,Tornado Warning\n".as_bytes(),
                "code,name\nEAS,Broadcast station or cable system\n".as_bytes(),
                "code,name\n48,Texas\n".as_bytes(),
                "fips,county\n48013,Atascosa County\n".as_bytes(),
            )
            .unwrap(),
        )
    }

    // sink which fails with queued errors before succeeding
    #[derive(Debug, Default)]
    struct FlakySink {
        failures: VecDeque<i32>,
        attempts: u32,
        stored: Vec<AlertRecord>,
    }

    impl AlertSink for FlakySink {
        fn store(&mut self, record: &AlertRecord) -> Result<RecordId, StoreError> {
            self.attempts += 1;
            if let Some(code) = self.failures.pop_front() {
                return Err(StoreError::Sqlite(rusqlite::Error::SqliteFailure(
                    ffi::Error::new(code),
                    None,
                )));
            }
            self.stored.push(record.clone());
            Ok(RecordId(self.stored.len() as i64))
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(3, StdDuration::from_millis(1), StdDuration::from_millis(2))
    }

    #[test]
    fn test_tornado_warning_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("last_message.json");
        let store = AlertStore::open_in_memory().unwrap();
        let mut ingester = IngestBuilder::new()
            .with_snapshot(&snapshot)
            .build(tables(), store);

        assert_eq!(
            LineOutcome::Skipped,
            ingester
                .ingest_line("samedec: reading standard input", t0())
                .unwrap()
        );
        let id = match ingester.ingest_line(TOR, t0()).unwrap() {
            LineOutcome::Stored(id) => id,
            other => panic!("expected Stored, got {:?}", other),
        };
        assert_eq!(
            LineOutcome::Suppressed,
            ingester
                .ingest_line(TOR, t0() + Duration::seconds(2))
                .unwrap()
        );
        assert_eq!(
            LineOutcome::Skipped,
            ingester.ingest_line("NNNN", t0()).unwrap()
        );

        let stored = ingester.sink().query(&AlertQuery::default()).unwrap();
        assert_eq!(1, stored.len());
        assert_eq!(id, stored[0].id);
        let rec = &stored[0].record;
        assert_eq!("TOR", rec.alert().event_code());
        assert_eq!("Tornado Warning", rec.event_name());
        assert_eq!(rec.regions(), &["Atascosa, Texas"]);
        assert_eq!(30, rec.alert().purge_minutes());
        assert_eq!("KLOX/NWS", rec.alert().station());

        let snap = SnapshotPublisher::new(&snapshot)
            .read()
            .unwrap()
            .expect("no snapshot");
        assert_eq!("Tornado Warning", snap.event);
        assert_eq!(vec!["Atascosa, Texas"], snap.regions);

        let stats = ingester.stats();
        assert_eq!(4, stats.lines);
        assert_eq!(2, stats.skipped);
        assert_eq!(1, stats.suppressed);
        assert_eq!(1, stats.stored);
    }

    #[test]
    fn test_three_bursts_one_record() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("last_message.json");
        let mut ingester = IngestBuilder::new()
            .with_snapshot(&snapshot)
            .build(tables(), FlakySink::default());

        assert!(matches!(
            ingester.ingest_line(TOR, t0()).unwrap(),
            LineOutcome::Stored(_)
        ));
        assert!(snapshot.exists());
        std::fs::remove_file(&snapshot).unwrap();

        // the repeats are neither stored nor published
        for i in 1..3 {
            assert_eq!(
                LineOutcome::Suppressed,
                ingester
                    .ingest_line(TOR, t0() + Duration::seconds(i))
                    .unwrap()
            );
        }
        assert_eq!(1, ingester.sink().stored.len());
        assert!(!snapshot.exists());

        // same alert, re-aired after the window
        assert_eq!(
            LineOutcome::Stored(RecordId(2)),
            ingester
                .ingest_line(TOR, t0() + Duration::minutes(6))
                .unwrap()
        );
        assert!(snapshot.exists());
        assert_eq!(0, ingester.stats().publish_failures);
    }

    #[test]
    fn test_rejected_line_continues() {
        let mut ingester = IngestBuilder::new()
            .build(tables(), FlakySink::default());

        match ingester
            .ingest_line("ZCZC-EAS-TOR-048013+0030-1234567-KLOX/NWS-", t0())
            .unwrap()
        {
            LineOutcome::Rejected(err) => assert_eq!(Some(Field::IssueTime), err.field()),
            other => panic!("expected Rejected, got {:?}", other),
        }
        assert!(ingester.sink().stored.is_empty());
        assert!(ingester.dedup().is_empty());

        assert!(matches!(
            ingester.ingest_line(TOR, t0()).unwrap(),
            LineOutcome::Stored(_)
        ));
    }

    #[test]
    fn test_transient_failures_retried() {
        let sink = FlakySink {
            failures: VecDeque::from(vec![ffi::SQLITE_BUSY, ffi::SQLITE_LOCKED]),
            ..Default::default()
        };
        let mut ingester = IngestBuilder::new()
            .with_store_retry(fast_retry())
            .build(tables(), sink);

        assert!(matches!(
            ingester.ingest_line(TOR, t0()).unwrap(),
            LineOutcome::Stored(_)
        ));
        assert_eq!(3, ingester.sink().attempts);
        assert_eq!(1, ingester.sink().stored.len());
    }

    #[test]
    fn test_retries_exhausted() {
        let sink = FlakySink {
            failures: VecDeque::from(vec![ffi::SQLITE_BUSY; 5]),
            ..Default::default()
        };
        let mut ingester = IngestBuilder::new()
            .with_store_retry(fast_retry())
            .build(tables(), sink);

        match ingester.ingest_line(TOR, t0()) {
            Err(IngestError::Persist { attempts, source }) => {
                assert_eq!(3, attempts);
                assert!(source.is_transient());
            }
            other => panic!("expected Persist error, got {:?}", other),
        }

        // not remembered, so a retransmission is not suppressed
        assert!(ingester.dedup().is_empty());
    }

    #[test]
    fn test_permanent_failure_not_retried() {
        let sink = FlakySink {
            failures: VecDeque::from(vec![ffi::SQLITE_CONSTRAINT]),
            ..Default::default()
        };
        let mut ingester = IngestBuilder::new()
            .with_store_retry(fast_retry())
            .build(tables(), sink);

        assert!(ingester.ingest_line(TOR, t0()).is_err());
        assert_eq!(1, ingester.sink().attempts);
    }

    #[test]
    fn test_publish_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut ingester = IngestBuilder::new()
            .with_snapshot(dir.path().join("missing").join("last_message.json"))
            .build(tables(), FlakySink::default());

        assert!(matches!(
            ingester.ingest_line(TOR, t0()).unwrap(),
            LineOutcome::Stored(_)
        ));
        assert_eq!(1, ingester.stats().publish_failures);
        assert_eq!(1, ingester.sink().stored.len());
    }

    #[test]
    fn test_seed_from_store() {
        let mut store = AlertStore::open_in_memory().unwrap();
        let alert = ParsedAlert::parse(TOR, &t0(), &RolloverPolicy::default()).unwrap();
        store
            .store(&AlertRecord::resolve(alert, &tables(), t0()))
            .unwrap();

        // restarted a minute later: the retransmission is suppressed
        let mut ingester = IngestBuilder::new().build(tables(), store);
        ingester.seed(&(t0() + Duration::minutes(1))).unwrap();
        assert_eq!(
            LineOutcome::Suppressed,
            ingester
                .ingest_line(TOR, t0() + Duration::minutes(1))
                .unwrap()
        );
    }

    #[test]
    fn test_retry_backoff() {
        let retry = RetryPolicy::default();
        assert_eq!(5, retry.max_attempts());
        assert_eq!(StdDuration::from_millis(100), retry.backoff(1));
        assert_eq!(StdDuration::from_millis(200), retry.backoff(2));
        assert_eq!(StdDuration::from_millis(800), retry.backoff(4));
        assert_eq!(StdDuration::from_millis(2000), retry.backoff(6));
        assert_eq!(StdDuration::from_millis(2000), retry.backoff(60));

        assert_eq!(1, RetryPolicy::new(0, StdDuration::ZERO, StdDuration::ZERO).max_attempts());
    }
}
