//! Resolved alert records

use std::fmt;

use chrono::{DateTime, Utc};

use crate::message::ParsedAlert;
use crate::reference::ReferenceTables;

/// Store-assigned identifier for a persisted alert
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(pub i64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A parsed alert with its codes resolved to names
///
/// This is what gets persisted and published. The `received_at`
/// time is when the burst arrived, which is also the record's
/// creation time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlertRecord {
    alert: ParsedAlert,
    event_name: String,
    originator_name: String,
    regions: Vec<String>,
    received_at: DateTime<Utc>,
}

impl AlertRecord {
    /// Resolve `alert` against the reference tables
    pub fn resolve(alert: ParsedAlert, tables: &ReferenceTables, received_at: DateTime<Utc>) -> Self {
        let event_name = tables.event_name(alert.event_code());
        let originator_name = tables.originator_name(alert.originator(), alert.station());
        let regions = tables.region_labels(alert.locations());
        Self::new(alert, event_name, originator_name, regions, received_at)
    }

    /// Assemble from already-resolved names
    pub fn new(
        alert: ParsedAlert,
        event_name: String,
        originator_name: String,
        regions: Vec<String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            alert,
            event_name,
            originator_name,
            regions,
            received_at,
        }
    }

    /// The underlying header
    pub fn alert(&self) -> &ParsedAlert {
        &self.alert
    }

    /// Event description, like "`Tornado Warning`"
    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    /// Originator description
    pub fn originator_name(&self) -> &str {
        &self.originator_name
    }

    /// Region labels, one per location code
    pub fn regions(&self) -> &[String] {
        &self.regions
    }

    /// Burst arrival time
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Comma-separated location codes, as persisted
    pub fn location_list(&self) -> String {
        self.alert
            .locations()
            .iter()
            .map(|l| l.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for AlertRecord {
    /// Multi-line human-readable summary
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let alert = &self.alert;
        writeln!(f, "{} ({})", self.event_name, alert.event_code())?;
        writeln!(f, "  from: {} ({})", self.originator_name, alert.station())?;
        writeln!(
            f,
            "  issued: {}",
            alert.issued_at().format("%Y-%m-%d %H:%M UTC")
        )?;
        writeln!(
            f,
            "  expires: {} ({} minutes)",
            alert.expires_at().format("%Y-%m-%d %H:%M UTC"),
            alert.purge_minutes()
        )?;
        write!(f, "  areas: {}", self.regions.join("; "))
    }
}

/// A record as read back from the store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredAlert {
    /// Store-assigned id
    pub id: RecordId,

    /// Record contents
    pub record: AlertRecord,
}
