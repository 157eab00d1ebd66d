//! Suppression of retransmitted alerts
//!
//! Every SAME header is transmitted three times, and a decoder
//! may report one, two, or all three copies. Stations also
//! re-air the same alert. The [`Deduplicator`] remembers a
//! *fingerprint* of each accepted alert for a fixed window of
//! time and reports later alerts with the same fingerprint as
//! duplicates.
//!
//! The window is measured from the *first* acceptance: repeats
//! never extend it. Two identical alerts farther apart than the
//! window are both accepted.

use std::collections::{BTreeSet, VecDeque};

use chrono::{DateTime, Duration, Utc};

#[cfg(not(test))]
use log::debug;

#[cfg(test)]
use std::println as debug;

use crate::message::{LocationCode, ParsedAlert};
use crate::record::AlertRecord;

/// Default deduplication window
pub const DEFAULT_WINDOW_SECONDS: i64 = 300;

/// Default maximum number of remembered fingerprints
pub const DEFAULT_CAPACITY: usize = 64;

/// Which fields make up a fingerprint
///
/// All are enabled by default. The purge duration and the
/// station identifier never take part: a relay station
/// rebroadcasting an alert is still the same alert.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FingerprintFields {
    /// Compare event codes
    pub event: bool,

    /// Compare the set of location codes, ignoring order
    pub locations: bool,

    /// Compare resolved issue times
    pub issue_time: bool,
}

impl Default for FingerprintFields {
    fn default() -> Self {
        Self {
            event: true,
            locations: true,
            issue_time: true,
        }
    }
}

/// Identity of an alert, for duplicate detection
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    event: Option<String>,
    locations: Option<BTreeSet<LocationCode>>,
    issued_at: Option<DateTime<Utc>>,
}

impl Fingerprint {
    /// Fingerprint `alert` using the selected `fields`
    pub fn of(alert: &ParsedAlert, fields: &FingerprintFields) -> Self {
        Self {
            event: fields.event.then(|| alert.event_code().to_owned()),
            locations: fields
                .locations
                .then(|| alert.locations().iter().cloned().collect()),
            issued_at: fields.issue_time.then(|| alert.issued_at()),
        }
    }
}

/// Time-windowed fingerprint cache
#[derive(Clone, Debug)]
pub struct Deduplicator {
    fields: FingerprintFields,
    window: Duration,
    capacity: usize,
    history: VecDeque<WindowEntry>,
}

impl Deduplicator {
    /// New deduplicator
    ///
    /// Alerts are remembered for `window` after first acceptance.
    /// At most `capacity` fingerprints are held; the oldest are
    /// forgotten first. A `capacity` of zero is treated as one.
    pub fn new(window: Duration, capacity: usize, fields: FingerprintFields) -> Self {
        let capacity = capacity.max(1);
        Self {
            fields,
            window: window.max(Duration::zero()),
            capacity,
            history: VecDeque::with_capacity(capacity),
        }
    }

    /// Accept `alert` if it is not a duplicate
    ///
    /// Returns `true` and remembers the alert if it is new.
    /// Returns `false` if the alert duplicates one accepted
    /// within the window before `now`.
    pub fn accept(&mut self, alert: &ParsedAlert, now: &DateTime<Utc>) -> bool {
        if self.is_duplicate(alert, now) {
            false
        } else {
            self.remember(alert, now);
            true
        }
    }

    /// True if `alert` matches an unexpired fingerprint
    ///
    /// Does not change the window. Callers that must not lose an
    /// alert should check with this method, commit the alert, and
    /// only then [`remember()`](Self::remember) it.
    pub fn is_duplicate(&self, alert: &ParsedAlert, now: &DateTime<Utc>) -> bool {
        let fp = Fingerprint::of(alert, &self.fields);
        let dup = self
            .history
            .iter()
            .any(|entry| !entry.is_expired_at(now) && entry.fingerprint == fp);
        if dup {
            debug!("dedup: duplicate of recent alert: \"{}\"", alert);
        }
        dup
    }

    /// Remember `alert` as accepted at `now`
    ///
    /// If the alert is already remembered, its expiration time is
    /// left alone.
    pub fn remember(&mut self, alert: &ParsedAlert, now: &DateTime<Utc>) {
        self.remember_fingerprint(Fingerprint::of(alert, &self.fields), now);
    }

    /// Rebuild the window from stored records
    ///
    /// Each record is remembered as of its own receive time, so
    /// records older than the window before `now` have no effect.
    pub fn seed<'a, I>(&mut self, records: I, now: &DateTime<Utc>)
    where
        I: IntoIterator<Item = &'a AlertRecord>,
    {
        let mut records: Vec<&AlertRecord> = records.into_iter().collect();
        records.sort_by_key(|rec| rec.received_at());

        for rec in records {
            let fp = Fingerprint::of(rec.alert(), &self.fields);
            self.remember_fingerprint(fp, &rec.received_at());
        }
        prune_history(&mut self.history, now, self.capacity);

        debug!("dedup: seeded with {} recent alerts", self.history.len());
    }

    /// Number of remembered fingerprints, including expired ones
    pub fn len(&self) -> usize {
        self.history.len()
    }

    /// True if nothing is remembered
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.history.clear();
    }

    /// Deduplication window
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Maximum number of remembered fingerprints
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fields used in fingerprints
    pub fn fields(&self) -> &FingerprintFields {
        &self.fields
    }

    fn remember_fingerprint(&mut self, fingerprint: Fingerprint, now: &DateTime<Utc>) {
        prune_history(&mut self.history, now, self.capacity);

        let known = self
            .history
            .iter()
            .any(|entry| entry.fingerprint == fingerprint);
        if known {
            return;
        }

        if self.history.len() >= self.capacity {
            drop(self.history.pop_front());
        }
        self.history.push_back(WindowEntry {
            fingerprint,
            deadline: *now + self.window,
        });
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(
            Duration::seconds(DEFAULT_WINDOW_SECONDS),
            DEFAULT_CAPACITY,
            FingerprintFields::default(),
        )
    }
}

// A fingerprint and the time it stops suppressing
#[derive(Clone, Debug, PartialEq, Eq)]
struct WindowEntry {
    fingerprint: Fingerprint,
    deadline: DateTime<Utc>,
}

impl WindowEntry {
    #[inline]
    fn is_expired_at(&self, now: &DateTime<Utc>) -> bool {
        self.deadline <= *now
    }
}

// Remove expired fingerprints, then trim to capacity
#[inline]
fn prune_history(history: &mut VecDeque<WindowEntry>, now: &DateTime<Utc>, capacity: usize) {
    history.retain(|entry| !entry.is_expired_at(now));

    while history.len() > capacity {
        drop(history.pop_front());
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::message::RolloverPolicy;

    const TOR: &str = "ZCZC-EAS-TOR-048013-048029+0030-2921845-KLOX/NWS-";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 18, 46, 0).unwrap()
    }

    fn alert(line: &str) -> ParsedAlert {
        ParsedAlert::parse(line, &t0(), &RolloverPolicy::default()).expect("bad msg")
    }

    #[test]
    fn test_three_bursts_one_alert() {
        let mut dedup = Deduplicator::default();
        let msg = alert(TOR);

        assert!(dedup.accept(&msg, &t0()));
        assert!(!dedup.accept(&msg, &(t0() + Duration::seconds(1))));
        assert!(!dedup.accept(&msg, &(t0() + Duration::seconds(2))));
        assert_eq!(1, dedup.len());
    }

    #[test]
    fn test_window_expiry() {
        let mut dedup = Deduplicator::default();
        let msg = alert(TOR);

        assert!(dedup.accept(&msg, &t0()));
        assert!(!dedup.accept(&msg, &(t0() + Duration::seconds(299))));
        assert!(dedup.accept(&msg, &(t0() + Duration::seconds(300))));
    }

    #[test]
    fn test_repeats_do_not_extend_window() {
        let mut dedup = Deduplicator::default();
        let msg = alert(TOR);

        assert!(dedup.accept(&msg, &t0()));
        dedup.remember(&msg, &(t0() + Duration::seconds(200)));
        assert!(dedup.accept(&msg, &(t0() + Duration::seconds(301))));
    }

    #[test]
    fn test_fingerprint_fields() {
        let mut dedup = Deduplicator::default();
        assert!(dedup.accept(&alert(TOR), &t0()));

        // relayed by another station with a different purge time
        assert!(!dedup.accept(
            &alert("ZCZC-EAS-TOR-048029-048013+0100-2921845-WXYZ-"),
            &t0()
        ));

        // different event, locations, or issue time
        assert!(dedup.accept(
            &alert("ZCZC-EAS-SVR-048013-048029+0030-2921845-KLOX/NWS-"),
            &t0()
        ));
        assert!(dedup.accept(
            &alert("ZCZC-EAS-TOR-048013+0030-2921845-KLOX/NWS-"),
            &t0()
        ));
        assert!(dedup.accept(
            &alert("ZCZC-EAS-TOR-048013-048029+0030-2921846-KLOX/NWS-"),
            &t0()
        ));

        // with issue time disabled, the last one is a repeat
        let mut dedup = Deduplicator::new(
            Duration::minutes(5),
            8,
            FingerprintFields {
                issue_time: false,
                ..Default::default()
            },
        );
        assert!(dedup.accept(&alert(TOR), &t0()));
        assert!(!dedup.accept(
            &alert("ZCZC-EAS-TOR-048013-048029+0030-2921846-KLOX/NWS-"),
            &t0()
        ));
    }

    #[test]
    fn test_check_then_remember() {
        let mut dedup = Deduplicator::default();
        let msg = alert(TOR);

        assert!(!dedup.is_duplicate(&msg, &t0()));
        assert!(!dedup.is_duplicate(&msg, &t0()));
        assert!(dedup.is_empty());

        dedup.remember(&msg, &t0());
        assert!(dedup.is_duplicate(&msg, &t0()));
    }

    #[test]
    fn test_capacity() {
        let mut dedup = Deduplicator::new(Duration::minutes(5), 2, FingerprintFields::default());
        let a = alert("ZCZC-EAS-TOR-048013+0030-2921845-KLOX/NWS-");
        let b = alert("ZCZC-EAS-TOR-048029+0030-2921845-KLOX/NWS-");
        let c = alert("ZCZC-EAS-TOR-048113+0030-2921845-KLOX/NWS-");

        assert!(dedup.accept(&a, &t0()));
        assert!(dedup.accept(&b, &t0()));
        assert!(dedup.accept(&c, &t0()));
        assert_eq!(2, dedup.len());

        // oldest was forgotten
        assert!(dedup.accept(&a, &t0()));
        assert!(!dedup.accept(&c, &t0()));
    }

    #[test]
    fn test_seed() {
        let tables = crate::ReferenceTables::default();
        let old = AlertRecord::resolve(
            alert("ZCZC-EAS-TOR-048013+0030-2921845-KLOX/NWS-"),
            &tables,
            t0() - Duration::minutes(10),
        );
        let recent = AlertRecord::resolve(alert(TOR), &tables, t0() - Duration::minutes(1));

        let mut dedup = Deduplicator::default();
        dedup.seed([&recent, &old], &t0());
        assert_eq!(1, dedup.len());
        assert!(dedup.is_duplicate(recent.alert(), &t0()));
        assert!(!dedup.is_duplicate(old.alert(), &t0()));

        // seeded entries expire relative to their receive time
        assert!(!dedup.is_duplicate(recent.alert(), &(t0() + Duration::minutes(4))));
    }
}
