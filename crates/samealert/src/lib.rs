//! # samealert: SAME/EAS Alert Logging
//!
//! This crate turns decoded
//! [Specific Area Message Encoding](https://en.wikipedia.org/wiki/Specific_Area_Message_Encoding)
//! (SAME) headers into a durable log of alerts. It accepts the text
//! lines printed by a SAME decoder, like
//! [samedec](https://crates.io/crates/samedec), and
//!
//! * validates each header, field by field;
//! * resolves event, originator, and location codes to
//!   human-readable names;
//! * suppresses the repeated copies which every SAME transmission
//!   contains;
//! * stores each new alert in a SQLite database; and
//! * publishes the most recent alert as a JSON snapshot.
//!
//! ## Disclaimer
//!
//! This crate is dual-licensed MIT and Apache 2.0. Read these licenses
//! carefully as they may affect your rights.
//!
//! This crate has not been certified as a weather radio receiver or for any
//! other purpose. The authors **strongly discourage** its use in any
//! safety-critical applications. Always have at least two methods available
//! for receiving weather alerts.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use chrono::{TimeZone, Utc};
//! use samealert::{AlertStore, IngestBuilder, LineOutcome, ReferenceTables};
//!
//! let tables = ReferenceTables::from_readers(
//!     "code,description\nTOR,Tornado Warning\n".as_bytes(),
//!     "code,name\nEAS,Broadcast station or cable system\n".as_bytes(),
//!     "code,name\n48,Texas\n".as_bytes(),
//!     "fips,county\n48013,Atascosa County\n".as_bytes(),
//! )
//! .expect("bad tables");
//!
//! let store = AlertStore::open_in_memory().expect("no store");
//! let mut ingester = IngestBuilder::new().build(Arc::new(tables), store);
//!
//! // each header arrives up to three times
//! let received = Utc.with_ymd_and_hms(2026, 10, 19, 18, 46, 2).unwrap();
//! let line = "ZCZC-EAS-TOR-048013+0030-2921845-KLOX/NWS-";
//! assert!(matches!(
//!     ingester.ingest_line(line, received),
//!     Ok(LineOutcome::Stored(_))
//! ));
//! assert_eq!(
//!     LineOutcome::Suppressed,
//!     ingester.ingest_line(line, received).unwrap()
//! );
//! ```
//!
//! Headers can also be parsed on their own. The year of the issue
//! time is inferred from the time of receipt.
//!
//! ```
//! use chrono::{TimeZone, Utc};
//! use samealert::{Originator, ParsedAlert, RolloverPolicy, SignificanceLevel};
//!
//! let received = Utc.with_ymd_and_hms(2026, 10, 19, 18, 46, 2).unwrap();
//! let alert = ParsedAlert::parse(
//!     "ZCZC-WXR-RWT-048013-048029+0015-2921800-KLOX/NWS-",
//!     &received,
//!     &RolloverPolicy::default(),
//! )
//! .expect("fail to parse");
//!
//! assert_eq!(Originator::NationalWeatherService, alert.originator_class());
//! assert_eq!("RWT", alert.event_code());
//! assert_eq!(Some(SignificanceLevel::Test), alert.significance());
//! assert_eq!("048029", alert.locations()[1].as_str());
//! assert_eq!(15, alert.purge_minutes());
//! ```
//!
//! ## Background
//!
//! SAME is commonly used to distribute weather alerts in the United States and
//! Canada. Alerts are carried by NOAA Weather Radio and by stations which
//! participate in the
//! [Emergency Alert System](https://en.wikipedia.org/wiki/Emergency_Alert_System).
//! Every alert begins with a digital header, sent three times:
//!
//! ```txt
//! ZCZC-ORG-EEE-PSSCCC-PSSCCC+TTTT-JJJHHMM-LLLLLLLL-
//! ```
//!
//! The header names the originator, the event, up to 31 affected
//! areas, how long the alert remains in effect, when it was
//! issued, and which station sent it.

mod builder;
mod dedup;
mod ingest;
mod message;
mod record;
mod reference;
mod samecodes;
mod snapshot;
mod store;

pub use builder::IngestBuilder;
pub use dedup::{Deduplicator, Fingerprint, FingerprintFields};
pub use ingest::{AlertSink, IngestError, IngestStats, Ingester, LineOutcome, RetryPolicy};
pub use message::{
    BurstError, Field, IssueCode, LocationCode, ParsedAlert, RolloverPolicy, MAX_LOCATIONS,
    MAX_MESSAGE_LENGTH,
};
pub use record::{AlertRecord, RecordId, StoredAlert};
pub use reference::{ReferenceError, ReferenceTables};
pub use samecodes::{Originator, SignificanceLevel};
pub use snapshot::{Snapshot, SnapshotError, SnapshotPublisher};
pub use store::{
    AlertQuery, AlertStore, MigrationError, MigrationReport, StoreError, StoreStats,
    DEFAULT_BUSY_TIMEOUT_MS, SCHEMA_VERSION,
};
