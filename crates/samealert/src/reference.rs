//! Reference tables for event, originator, and FIPS codes
//!
//! Four CSV files, each with a header row, are read once at
//! startup:
//!
//! | File               | Columns            |
//! |--------------------|--------------------|
//! | `eas_events.csv`   | `code,description` |
//! | `originators.csv`  | `code,name`        |
//! | `fips_states.csv`  | `code,name`        |
//! | `fips_counties.csv`| `fips,county`      |
//!
//! The loaded [`ReferenceTables`] are immutable. Share them
//! between consumers with an `Arc`.
//!
//! Lookups never fail. A code which is not in the tables is
//! logged and returned verbatim.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use log::warn;
use thiserror::Error;

use crate::message::LocationCode;
use crate::samecodes::Originator;

/// Event code table file name
pub const EVENTS_FILE: &str = "eas_events.csv";

/// Originator table file name
pub const ORIGINATORS_FILE: &str = "originators.csv";

/// State FIPS table file name
pub const STATES_FILE: &str = "fips_states.csv";

/// County FIPS table file name
pub const COUNTIES_FILE: &str = "fips_counties.csv";

// trailing tokens removed from county names for display
const COUNTY_SUFFIXES: &[&str] = &["County", "Parish", "Borough", "Census Area", "Municipality"];

const NATIONAL_LABEL: &str = "United States";

/// Error loading reference tables
#[derive(Error, Debug)]
pub enum ReferenceError {
    /// A table file could not be opened
    #[error("unable to open reference table \"{}\": {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A table's header row could not be read
    #[error("unable to read header of reference table \"{table}\": {source}")]
    Header {
        table: String,
        #[source]
        source: csv::Error,
    },

    /// A table's header row lacks a required column
    #[error("reference table \"{table}\" has no \"{column}\" column")]
    MissingColumn { table: String, column: &'static str },
}

/// Code-to-name lookup tables
///
/// ```
/// use samealert::{LocationCode, ReferenceTables};
///
/// let tables = ReferenceTables::from_readers(
///     "code,description\nTOR,Tornado Warning\n".as_bytes(),
///     "code,name\nEAS,Broadcast station or cable system\n".as_bytes(),
///     "code,name\n48,Texas\n".as_bytes(),
///     "fips,county\n48013,Atascosa County\n".as_bytes(),
/// ).unwrap();
///
/// assert_eq!("Tornado Warning", tables.event_name("TOR"));
/// let loc = LocationCode::new("048013").unwrap();
/// assert_eq!("Atascosa, Texas", tables.region_label(&loc));
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReferenceTables {
    events: HashMap<String, String>,
    originators: HashMap<String, String>,
    states: HashMap<String, String>,
    counties: HashMap<String, String>,
}

impl ReferenceTables {
    /// Load all four tables from the directory `dir`
    ///
    /// A missing or unreadable file is an error. Malformed rows
    /// are logged and skipped.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self, ReferenceError> {
        let dir = dir.as_ref();
        let open = |name: &str| {
            let path = dir.join(name);
            File::open(&path).map_err(|source| ReferenceError::Open { path, source })
        };

        Self::from_readers(
            open(EVENTS_FILE)?,
            open(ORIGINATORS_FILE)?,
            open(STATES_FILE)?,
            open(COUNTIES_FILE)?,
        )
    }

    /// Load tables from CSV readers
    pub fn from_readers<E, O, S, C>(
        events: E,
        originators: O,
        states: S,
        counties: C,
    ) -> Result<Self, ReferenceError>
    where
        E: io::Read,
        O: io::Read,
        S: io::Read,
        C: io::Read,
    {
        let events = read_table(EVENTS_FILE, events, ("code", "description"), |code| {
            Some(code.to_owned())
        })?;
        let originators = read_table(ORIGINATORS_FILE, originators, ("code", "name"), |code| {
            Some(code.to_owned())
        })?;
        let states = read_table(STATES_FILE, states, ("code", "name"), normalize_state)?;
        let counties = read_table(COUNTIES_FILE, counties, ("fips", "county"), normalize_county)?;

        Ok(Self {
            events,
            originators,
            states,
            counties,
        })
    }

    /// Human-readable event description, like "`Tornado Warning`"
    pub fn event_name(&self, code: &str) -> String {
        lookup_or_code(&self.events, code, "event")
    }

    /// Human-readable originator, like "`Civil authorities`"
    ///
    /// Weather service messages are refined by the station
    /// callsign into the National Weather Service or Environment
    /// Canada.
    pub fn originator_name(&self, code: &str, station: &str) -> String {
        match Originator::from((code, station)) {
            orig @ (Originator::NationalWeatherService | Originator::EnvironmentCanada) => {
                orig.as_display_str().to_owned()
            }
            orig => match self.originators.get(code) {
                Some(name) => name.clone(),
                None if orig != Originator::Unknown => orig.as_display_str().to_owned(),
                None => lookup_or_code(&self.originators, code, "originator"),
            },
        }
    }

    /// State name for a two-digit FIPS code
    pub fn state_name(&self, fips: &str) -> String {
        match normalize_state(fips) {
            Some(key) => lookup_or_code(&self.states, &key, "state"),
            None => lookup_or_code(&self.states, fips, "state"),
        }
    }

    /// County name for a five- or six-digit FIPS code
    ///
    /// Trailing administrative suffixes like "`County`" or
    /// "`Parish`" are removed.
    pub fn county_name(&self, fips: &str) -> String {
        let key = normalize_county(fips).unwrap_or_else(|| fips.to_owned());
        match self.counties.get(&key) {
            Some(name) => strip_county_suffix(name).to_owned(),
            None => lookup_or_code(&self.counties, &key, "county"),
        }
    }

    /// Display label for a location code
    ///
    /// | Code     | Label                              |
    /// |----------|------------------------------------|
    /// | `000000` | `United States`                    |
    /// | `048000` | `Texas`                            |
    /// | `048013` | `Atascosa, Texas`                  |
    /// | `748013` | `Southwest Atascosa, Texas`        |
    pub fn region_label(&self, location: &LocationCode) -> String {
        if location.is_national() {
            return NATIONAL_LABEL.to_owned();
        }

        let state = self.state_name(location.state_fips());
        if location.is_entire_state() {
            return state;
        }

        let county = self.county_name(location.county_fips());
        match subdivision_name(location.subdivision()) {
            Some(part) => format!("{} {}, {}", part, county, state),
            None => format!("{}, {}", county, state),
        }
    }

    /// Display labels for every location, in order
    pub fn region_labels<'a, I>(&self, locations: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a LocationCode>,
    {
        locations
            .into_iter()
            .map(|loc| self.region_label(loc))
            .collect()
    }

    /// Number of entries in each table
    ///
    /// Returns (events, originators, states, counties).
    pub fn len(&self) -> (usize, usize, usize, usize) {
        (
            self.events.len(),
            self.originators.len(),
            self.states.len(),
            self.counties.len(),
        )
    }

    /// True if every table is empty
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
            && self.originators.is_empty()
            && self.states.is_empty()
            && self.counties.is_empty()
    }
}

// Read a two-column table, by header name
//
// `columns` names the key and value columns. Keys are passed
// through `normalize`; rows with bad keys, missing cells, or
// empty values are skipped with a warning.
fn read_table<R, F>(
    table: &str,
    rdr: R,
    columns: (&'static str, &'static str),
    normalize: F,
) -> Result<HashMap<String, String>, ReferenceError>
where
    R: io::Read,
    F: Fn(&str) -> Option<String>,
{
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(rdr);

    let headers = rdr
        .headers()
        .map_err(|source| ReferenceError::Header {
            table: table.to_owned(),
            source,
        })?
        .clone();
    let column_index = |column: &'static str| {
        headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case(column))
            .ok_or_else(|| ReferenceError::MissingColumn {
                table: table.to_owned(),
                column,
            })
    };
    let key_idx = column_index(columns.0)?;
    let value_idx = column_index(columns.1)?;

    let mut out = HashMap::new();
    for (lineno, record) in rdr.records().enumerate() {
        // header is line 1
        let line = lineno + 2;
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                warn!("{}:{}: skipping unreadable row: {}", table, line, err);
                continue;
            }
        };

        let (key, value) = match (record.get(key_idx), record.get(value_idx)) {
            (Some(key), Some(value)) if !key.is_empty() && !value.is_empty() => (key, value),
            _ => {
                warn!("{}:{}: skipping malformed row", table, line);
                continue;
            }
        };

        match normalize(key) {
            Some(norm) => {
                out.insert(norm, value.to_owned());
            }
            None => warn!("{}:{}: skipping row with bad key \"{}\"", table, line, key),
        }
    }

    Ok(out)
}

fn lookup_or_code(table: &HashMap<String, String>, code: &str, what: &str) -> String {
    match table.get(code) {
        Some(name) => name.clone(),
        None => {
            warn!("no {} named \"{}\" in reference tables", what, code);
            code.to_owned()
        }
    }
}

// "8" → "08"; non-numeric is rejected
fn normalize_state(code: &str) -> Option<String> {
    match code.len() {
        1 | 2 if code.bytes().all(|b| b.is_ascii_digit()) => Some(format!("{:0>2}", code)),
        _ => None,
    }
}

// SSCCC, or PSSCCC with the subdivision dropped
fn normalize_county(fips: &str) -> Option<String> {
    if !fips.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match fips.len() {
        5 => Some(fips.to_owned()),
        6 => Some(fips[1..].to_owned()),
        _ => None,
    }
}

fn strip_county_suffix(name: &str) -> &str {
    for suffix in COUNTY_SUFFIXES {
        if let Some(stem) = name.strip_suffix(suffix) {
            if let Some(stem) = stem.strip_suffix(' ') {
                let stem = stem.trim_end();
                if !stem.is_empty() {
                    return stem;
                }
            }
        }
    }
    name
}

fn subdivision_name(part: u8) -> Option<&'static str> {
    match part {
        1 => Some("Northwest"),
        2 => Some("North"),
        3 => Some("Northeast"),
        4 => Some("West"),
        5 => Some("Central"),
        6 => Some("East"),
        7 => Some("Southwest"),
        8 => Some("South"),
        9 => Some("Southeast"),
        _ => None,
    }
}
