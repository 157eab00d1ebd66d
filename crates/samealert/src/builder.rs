use std::path::PathBuf;
use std::sync::Arc;

use chrono::Duration;

use crate::dedup::{Deduplicator, FingerprintFields, DEFAULT_CAPACITY, DEFAULT_WINDOW_SECONDS};
use crate::ingest::{AlertSink, Ingester, RetryPolicy};
use crate::message::RolloverPolicy;
use crate::reference::ReferenceTables;
use crate::snapshot::SnapshotPublisher;

/// Builds an alert ingestion pipeline
///
/// The builder comes with a sensible set of default options.
/// All you really need to provide, at
/// [`build()`](IngestBuilder::build) time, are the reference
/// tables and a place to store alerts.
///
/// The API specified by the builder is part of this crate's
/// API. The actual default values are *not*, however, and
/// are subject to revision in any minor release. If you
/// care very strongly about a setting, be sure to configure
/// it here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngestBuilder {
    rollover_tolerance: Duration,
    dedup_window: Duration,
    dedup_capacity: usize,
    fingerprint: FingerprintFields,
    store_retry: RetryPolicy,
    snapshot: Option<PathBuf>,
}

impl IngestBuilder {
    /// New pipeline with "sensible" defaults
    ///
    /// No snapshot file is written unless one is configured
    /// with [`with_snapshot()`](IngestBuilder::with_snapshot).
    pub fn new() -> Self {
        Self {
            rollover_tolerance: RolloverPolicy::default().future_tolerance(),
            dedup_window: Duration::seconds(DEFAULT_WINDOW_SECONDS),
            dedup_capacity: DEFAULT_CAPACITY,
            fingerprint: FingerprintFields::default(),
            store_retry: RetryPolicy::default(),
            snapshot: None,
        }
    }

    /// Build the pipeline
    ///
    /// The pipeline starts with an empty duplicate window. Call
    /// [`Ingester::seed()`] to rebuild it from alerts which were
    /// stored before a restart.
    pub fn build<S: AlertSink>(&self, tables: Arc<ReferenceTables>, sink: S) -> Ingester<S> {
        Ingester::new(
            tables,
            RolloverPolicy::new(self.rollover_tolerance),
            Deduplicator::new(self.dedup_window, self.dedup_capacity, self.fingerprint),
            sink,
            self.snapshot.as_ref().map(SnapshotPublisher::new),
            self.store_retry,
        )
    }

    /// Issue time rollover tolerance
    ///
    /// SAME issue times carry no year. The year is chosen so
    /// that the issue time is no later than `tolerance` after the
    /// time of receipt. A larger value tolerates clocks which
    /// run slow at the transmitter. Negative values are treated
    /// as zero.
    pub fn with_rollover_tolerance(&mut self, tolerance: Duration) -> &mut Self {
        self.rollover_tolerance = tolerance.max(Duration::zero());
        self
    }

    /// Duplicate suppression window
    ///
    /// Repeats of an alert are suppressed for `window` after the
    /// first copy is stored. A window of zero disables
    /// suppression.
    pub fn with_dedup_window(&mut self, window: Duration) -> &mut Self {
        self.dedup_window = window.max(Duration::zero());
        self
    }

    /// Maximum number of alerts remembered for suppression
    pub fn with_dedup_capacity(&mut self, capacity: usize) -> &mut Self {
        self.dedup_capacity = usize::max(capacity, 1);
        self
    }

    /// Fields which identify a repeat
    pub fn with_fingerprint(&mut self, fields: FingerprintFields) -> &mut Self {
        self.fingerprint = fields;
        self
    }

    /// Retry policy for transient store failures
    pub fn with_store_retry(&mut self, retry: RetryPolicy) -> &mut Self {
        self.store_retry = retry;
        self
    }

    /// Publish the latest alert to `path`
    pub fn with_snapshot<P: Into<PathBuf>>(&mut self, path: P) -> &mut Self {
        self.snapshot = Some(path.into());
        self
    }

    /// Do not publish snapshots
    pub fn without_snapshot(&mut self) -> &mut Self {
        self.snapshot = None;
        self
    }

    /// Issue time rollover tolerance
    pub fn rollover_tolerance(&self) -> Duration {
        self.rollover_tolerance
    }

    /// Duplicate suppression window
    pub fn dedup_window(&self) -> Duration {
        self.dedup_window
    }

    /// Maximum number of alerts remembered for suppression
    pub fn dedup_capacity(&self) -> usize {
        self.dedup_capacity
    }

    /// Fields which identify a repeat
    pub fn fingerprint(&self) -> &FingerprintFields {
        &self.fingerprint
    }

    /// Retry policy for transient store failures
    pub fn store_retry(&self) -> &RetryPolicy {
        &self.store_retry
    }

    /// Snapshot file, if any
    pub fn snapshot(&self) -> Option<&PathBuf> {
        self.snapshot.as_ref()
    }
}

impl std::default::Default for IngestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_clamping() {
        let mut builder = IngestBuilder::default();
        assert_eq!(Duration::seconds(300), builder.dedup_window());
        assert_eq!(Duration::days(3), builder.rollover_tolerance());
        assert_eq!(None, builder.snapshot());

        builder
            .with_dedup_window(Duration::seconds(-5))
            .with_dedup_capacity(0)
            .with_rollover_tolerance(Duration::hours(-1))
            .with_snapshot("/tmp/last_message.json");
        assert_eq!(Duration::zero(), builder.dedup_window());
        assert_eq!(1, builder.dedup_capacity());
        assert_eq!(Duration::zero(), builder.rollover_tolerance());
        assert!(builder.snapshot().is_some());

        builder.without_snapshot();
        assert_eq!(None, builder.snapshot());
    }

    #[test]
    fn test_build() {
        let ingester = IngestBuilder::new()
            .with_dedup_window(Duration::seconds(60))
            .with_dedup_capacity(4)
            .build(Arc::new(ReferenceTables::default()), crate::AlertStore::open_in_memory().unwrap());
        assert_eq!(Duration::seconds(60), ingester.dedup().window());
        assert_eq!(4, ingester.dedup().capacity());
        assert!(ingester.dedup().is_empty());
    }
}
