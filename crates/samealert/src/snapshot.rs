//! Latest-alert snapshot for display clients
//!
//! The most recent accepted alert is written as a single JSON
//! document. Readers never see a partial file: the document is
//! written to a temporary file in the same directory, synced,
//! and then renamed over the target.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, SecondsFormat, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::AlertRecord;

const LOCAL_TIME_FORMAT: &str = "%b %d %Y, %-I:%M %p";

/// Error writing or reading the snapshot
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("unable to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("unable to write snapshot \"{}\": {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unable to read snapshot \"{}\": {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Resolved fields of the latest alert
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Event description, like "`Tornado Warning`"
    pub event: String,

    /// Event code, like `TOR`
    pub event_code: String,

    /// Significance level name, like "`Warning`"
    pub significance: Option<String>,

    /// Originator description
    pub originator: String,

    /// Originator code, like `WXR`
    pub originator_code: String,

    /// Sending station
    pub source: String,

    /// Issue time, RFC 3339
    pub issued_utc: String,

    /// Issue time in the local time zone, for display
    pub issued_local: String,

    /// Purge time, RFC 3339
    pub expires_utc: String,

    /// Purge duration
    pub duration_minutes: u32,

    /// Location codes
    pub locations: Vec<String>,

    /// Region labels, one per location code
    pub regions: Vec<String>,

    /// When this snapshot was written, RFC 3339
    pub updated: String,
}

impl Snapshot {
    /// Snapshot of `record`, written at `now`
    pub fn new(record: &AlertRecord, now: &DateTime<Utc>) -> Self {
        let alert = record.alert();
        Self {
            event: record.event_name().to_owned(),
            event_code: alert.event_code().to_owned(),
            significance: alert.significance().map(|s| s.to_string()),
            originator: record.originator_name().to_owned(),
            originator_code: alert.originator().to_owned(),
            source: alert.station().to_owned(),
            issued_utc: alert.issued_at().to_rfc3339_opts(SecondsFormat::Secs, true),
            issued_local: alert
                .issued_at()
                .with_timezone(&Local)
                .format(LOCAL_TIME_FORMAT)
                .to_string(),
            expires_utc: alert.expires_at().to_rfc3339_opts(SecondsFormat::Secs, true),
            duration_minutes: alert.purge_minutes(),
            locations: alert
                .locations()
                .iter()
                .map(|l| l.as_str().to_owned())
                .collect(),
            regions: record.regions().to_vec(),
            updated: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// Publishes [`Snapshot`]s to a file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotPublisher {
    path: PathBuf,
}

impl SnapshotPublisher {
    /// Publish to `path`
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// Snapshot file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the snapshot with `record`
    pub fn publish(&self, record: &AlertRecord) -> Result<(), SnapshotError> {
        self.publish_at(record, &Utc::now())
    }

    /// Replace the snapshot with `record`, updated at `now`
    pub fn publish_at(&self, record: &AlertRecord, now: &DateTime<Utc>) -> Result<(), SnapshotError> {
        let content = serde_json::to_vec_pretty(&Snapshot::new(record, now))?;
        write_atomic(&self.path, &content)?;
        debug!("snapshot: wrote \"{}\"", self.path.display());
        Ok(())
    }

    /// Read the current snapshot
    ///
    /// Returns `None` if no alert has been published yet.
    pub fn read(&self) -> Result<Option<Snapshot>, SnapshotError> {
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SnapshotError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        Ok(Some(serde_json::from_slice(&content)?))
    }
}

// Write `content` to a sibling temp file, then rename over `path`
fn write_atomic(path: &Path, content: &[u8]) -> Result<(), SnapshotError> {
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("snapshot.json");
    let tmp_path = path.with_file_name(format!("{}.tmp.{}", file_name, std::process::id()));

    write_and_rename(&tmp_path, path, content).map_err(|source| {
        if let Err(e) = fs::remove_file(&tmp_path) {
            if e.kind() != io::ErrorKind::NotFound {
                debug!("snapshot: unable to remove \"{}\": {}", tmp_path.display(), e);
            }
        }
        SnapshotError::Write {
            path: path.to_owned(),
            source,
        }
    })
}

fn write_and_rename(tmp_path: &Path, path: &Path, content: &[u8]) -> io::Result<()> {
    let mut file = File::create(tmp_path)?;
    file.write_all(content)?;
    file.sync_all()?;
    drop(file);
    fs::rename(tmp_path, path)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::message::{ParsedAlert, RolloverPolicy};
    use crate::reference::ReferenceTables;

    fn record() -> AlertRecord {
        let rx = Utc.with_ymd_and_hms(2026, 10, 19, 18, 46, 2).unwrap();
        let tables = ReferenceTables::from_readers(
            "code,description\nTOR,Tornado Warning\n".as_bytes(),
            "code,name\nEAS,Broadcast station or cable system\n".as_bytes(),
            "code,name\n48,Texas\n".as_bytes(),
            "fips,county\n48013,Atascosa County\n".as_bytes(),
        )
        .unwrap();
        let alert = ParsedAlert::parse(
            "ZCZC-EAS-TOR-048013+0030-2921845-KLOX/NWS-",
            &rx,
            &RolloverPolicy::default(),
        )
        .unwrap();
        AlertRecord::resolve(alert, &tables, rx)
    }

    #[test]
    fn test_publish_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = SnapshotPublisher::new(dir.path().join("last_message.json"));
        assert_eq!(None, publisher.read().unwrap());

        let now = Utc.with_ymd_and_hms(2026, 10, 19, 18, 46, 3).unwrap();
        publisher.publish_at(&record(), &now).expect("publish");

        let snap = publisher.read().unwrap().expect("no snapshot");
        assert_eq!("Tornado Warning", snap.event);
        assert_eq!("TOR", snap.event_code);
        assert_eq!(Some("Warning".to_owned()), snap.significance);
        assert_eq!("Broadcast station or cable system", snap.originator);
        assert_eq!("EAS", snap.originator_code);
        assert_eq!("KLOX/NWS", snap.source);
        assert_eq!("2026-10-19T18:45:00Z", snap.issued_utc);
        assert_eq!("2026-10-19T19:15:00Z", snap.expires_utc);
        assert_eq!(30, snap.duration_minutes);
        assert_eq!(vec!["048013"], snap.locations);
        assert_eq!(vec!["Atascosa, Texas"], snap.regions);
        assert_eq!("2026-10-19T18:46:03Z", snap.updated);
        assert!(!snap.issued_local.is_empty());

        // no temporary files left behind
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("last_message.json")]);
    }

    #[test]
    fn test_publish_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last_message.json");
        fs::write(&path, b"{ not json").unwrap();

        let publisher = SnapshotPublisher::new(&path);
        assert!(matches!(publisher.read(), Err(SnapshotError::Encode(_))));

        publisher.publish(&record()).unwrap();
        assert_eq!("TOR", publisher.read().unwrap().unwrap().event_code);
    }

    #[test]
    fn test_publish_failure() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = SnapshotPublisher::new(dir.path().join("missing").join("last_message.json"));

        let err = publisher.publish(&record()).expect_err("should fail");
        assert!(matches!(err, SnapshotError::Write { .. }));
        assert_eq!(0, fs::read_dir(dir.path()).unwrap().count());
    }
}
