//! SAME header parsing
//!
//! A SAME header, as printed by a decoder, looks like
//!
//! ```txt
//! ZCZC-WXR-TOR-048013-048029+0030-2921845-KEWX/NWS-
//! ```
//!
//! The fields are, in order: the `ZCZC-` start marker, the
//! originator, the event code, one or more `PSSCCC` location
//! codes, the `+TTTT` purge time, the `JJJHHMM` issue time, the
//! sending station, and a terminating `-`.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

use crate::samecodes::{Originator, SignificanceLevel};

/// Maximum SAME/EAS frame length, in bytes
pub const MAX_MESSAGE_LENGTH: usize = 268;

/// Maximum number of location codes in one header
pub const MAX_LOCATIONS: usize = 31;

/// Maximum length of the sending station field
pub const MAX_STATION_LENGTH: usize = 8;

const PREFIX_MESSAGE_START: &str = "ZCZC-";
const SEPARATOR: char = '-';
const PURGE_MARKER: char = '+';

/// A header field, named in parse errors
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Field {
    Originator,
    Event,
    Location,
    PurgeDuration,
    IssueTime,
    Station,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::Originator => "originator",
            Field::Event => "event code",
            Field::Location => "location code",
            Field::PurgeDuration => "purge duration",
            Field::IssueTime => "issue time",
            Field::Station => "station identifier",
        };
        f.write_str(name)
    }
}

/// Error parsing a SAME header
///
/// [`BurstError::NotABurst`] is not really an error: it is how
/// the parser reports decoder chatter, blank lines, and
/// end-of-message markers. Use
/// [`is_skippable()`](BurstError::is_skippable) to tell it
/// apart from a damaged header.
#[derive(Error, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BurstError {
    /// Line does not begin with the `ZCZC-` start marker
    #[error("not a SAME header")]
    NotABurst,

    /// Header contains non-ASCII characters
    #[error("invalid SAME header: message contains non-ASCII characters")]
    NotAscii,

    /// Header is longer than any valid SAME header
    #[error("invalid SAME header: {0} bytes is longer than {max}", max = MAX_MESSAGE_LENGTH)]
    TooLong(usize),

    /// A required field is absent
    #[error("invalid SAME header: missing {0}")]
    Missing(Field),

    /// A field is present but malformed
    #[error("invalid SAME header: bad {field} \"{value}\": {reason}")]
    Invalid {
        field: Field,
        value: String,
        reason: &'static str,
    },
}

impl BurstError {
    /// True if the line was never a SAME header at all
    pub fn is_skippable(&self) -> bool {
        matches!(self, BurstError::NotABurst)
    }

    /// The offending field, if the error concerns one
    pub fn field(&self) -> Option<Field> {
        match self {
            BurstError::Missing(field) => Some(*field),
            BurstError::Invalid { field, .. } => Some(*field),
            _ => None,
        }
    }

    fn invalid(field: Field, value: &str, reason: &'static str) -> Self {
        BurstError::Invalid {
            field,
            value: value.to_owned(),
            reason,
        }
    }
}

/// Year-rollover rule for issue times
///
/// SAME issue times carry a day of the year but no year. The
/// issue time is projected into the previous, current, and next
/// year of the receive time; the latest of these which is not
/// more than `future_tolerance` after the receive time wins.
///
/// A message for day `001` received on 31 December therefore
/// lands in January of the next year, and a message whose day
/// would lie more than `future_tolerance` in the future is
/// taken to be from last year.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RolloverPolicy {
    future_tolerance: Duration,
}

impl RolloverPolicy {
    /// Permit issue times up to `future_tolerance` after receipt
    pub fn new(future_tolerance: Duration) -> Self {
        Self {
            future_tolerance: future_tolerance.max(Duration::zero()),
        }
    }

    /// How far in the future an issue time may lie
    pub fn future_tolerance(&self) -> Duration {
        self.future_tolerance
    }
}

impl Default for RolloverPolicy {
    fn default() -> Self {
        Self::new(Duration::days(3))
    }
}

/// A six-digit `PSSCCC` location code
///
/// - `P`: part of county, or zero for the entire county
/// - `SS`: FIPS state code
/// - `CCC`: FIPS county code, or `000` for the entire state
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocationCode(String);

impl LocationCode {
    /// Validate a location code
    ///
    /// Returns `None` unless `code` is exactly six ASCII digits.
    pub fn new(code: &str) -> Option<Self> {
        if is_digits(code, 6) {
            Some(Self(code.to_owned()))
        } else {
            None
        }
    }

    /// The full six-digit code
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// County subdivision digit (`P`), zero for the whole county
    pub fn subdivision(&self) -> u8 {
        self.0.as_bytes()[0] - b'0'
    }

    /// Two-digit FIPS state code (`SS`)
    pub fn state_fips(&self) -> &str {
        &self.0[1..3]
    }

    /// Five-digit FIPS county code (`SSCCC`)
    pub fn county_fips(&self) -> &str {
        &self.0[1..6]
    }

    /// True if the code covers an entire state
    pub fn is_entire_state(&self) -> bool {
        &self.0[3..6] == "000"
    }

    /// True for `000000`, the entire United States
    pub fn is_national(&self) -> bool {
        self.0 == "000000"
    }
}

impl fmt::Display for LocationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for LocationCode {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// The `JJJHHMM` issue time, as transmitted
///
/// - `JJJ`: ordinal day of the year, `001` to `366`
/// - `HHMM`: UTC time of day, 24-hour clock
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IssueCode {
    day_of_year: u16,
    hour: u8,
    minute: u8,
}

impl IssueCode {
    /// Build from fields, checking their ranges
    pub fn new(day_of_year: u16, hour: u8, minute: u8) -> Option<Self> {
        if (1..=366).contains(&day_of_year) && hour <= 23 && minute <= 59 {
            Some(Self {
                day_of_year,
                hour,
                minute,
            })
        } else {
            None
        }
    }

    /// Parse the seven-digit `JJJHHMM` form
    pub fn parse(code: &str) -> Result<Self, BurstError> {
        if !is_digits(code, 7) {
            return Err(BurstError::invalid(
                Field::IssueTime,
                code,
                "expected seven digits JJJHHMM",
            ));
        }

        let day_of_year = digits_value(&code[0..3]) as u16;
        if !(1..=366).contains(&day_of_year) {
            return Err(BurstError::invalid(
                Field::IssueTime,
                code,
                "day of year out of range",
            ));
        }

        let hour = digits_value(&code[3..5]) as u8;
        if hour > 23 {
            return Err(BurstError::invalid(
                Field::IssueTime,
                code,
                "hour out of range",
            ));
        }

        let minute = digits_value(&code[5..7]) as u8;
        if minute > 59 {
            return Err(BurstError::invalid(
                Field::IssueTime,
                code,
                "minute out of range",
            ));
        }

        Ok(Self {
            day_of_year,
            hour,
            minute,
        })
    }

    /// Ordinal day of year
    pub fn day_of_year(&self) -> u16 {
        self.day_of_year
    }

    /// UTC hour
    pub fn hour(&self) -> u8 {
        self.hour
    }

    /// UTC minute
    pub fn minute(&self) -> u8 {
        self.minute
    }

    /// Project into a calendar timestamp
    ///
    /// See [`RolloverPolicy`]. Returns `None` if the day does not
    /// exist in any candidate year, like day 366 near a run of
    /// non-leap years.
    pub fn resolve(
        &self,
        received: &DateTime<Utc>,
        policy: &RolloverPolicy,
    ) -> Option<DateTime<Utc>> {
        calculate_issue_time(*self, received, policy)
    }
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:03}{:02}{:02}",
            self.day_of_year, self.hour, self.minute
        )
    }
}

/// A fully-validated SAME header
///
/// Every field has been checked for width and character set,
/// and the issue time has been resolved to a calendar
/// timestamp. `ParsedAlert` implements `Display`, which
/// re-serializes the fields to the SAME wire layout.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ParsedAlert {
    originator: String,
    event_code: String,
    locations: Vec<LocationCode>,
    purge_minutes: u32,
    issue_code: IssueCode,
    issued_at: DateTime<Utc>,
    station: String,
    raw: String,
}

impl ParsedAlert {
    /// Parse one line of decoder output
    ///
    /// The `received` time is the local estimate of when the
    /// line arrived; it is needed only to choose the year of the
    /// issue time. Parsing is otherwise a pure function of `line`.
    ///
    /// Lines which do not start with `ZCZC-` fail with
    /// [`BurstError::NotABurst`].
    pub fn parse(
        line: &str,
        received: &DateTime<Utc>,
        rollover: &RolloverPolicy,
    ) -> Result<Self, BurstError> {
        let text = line.trim();
        if !text.starts_with(PREFIX_MESSAGE_START) {
            return Err(BurstError::NotABurst);
        }
        if !text.is_ascii() {
            return Err(BurstError::NotAscii);
        }
        if text.len() > MAX_MESSAGE_LENGTH {
            return Err(BurstError::TooLong(text.len()));
        }

        let body = &text[PREFIX_MESSAGE_START.len()..];
        let (head, tail) = body
            .split_once(PURGE_MARKER)
            .ok_or(BurstError::Missing(Field::PurgeDuration))?;

        let (originator, event_code, locations) = check_head(head)?;
        let (purge_minutes, issue_code, station) = check_tail(tail)?;

        let issued_at = issue_code.resolve(received, rollover).ok_or_else(|| {
            BurstError::invalid(
                Field::IssueTime,
                &issue_code.to_string(),
                "no such day near the receive time",
            )
        })?;

        Ok(Self {
            originator: originator.to_owned(),
            event_code: event_code.to_owned(),
            locations,
            purge_minutes,
            issue_code,
            issued_at,
            station: station.to_owned(),
            raw: text.to_owned(),
        })
    }

    /// Rebuild from previously-validated parts
    ///
    /// Used to load alerts back out of storage. The parts are
    /// checked with the same rules as [`parse()`](Self::parse),
    /// except that the issue time is taken as-is.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        originator: &str,
        event_code: &str,
        locations: &[&str],
        purge_minutes: u32,
        issue_code: &str,
        issued_at: DateTime<Utc>,
        station: &str,
        raw: &str,
    ) -> Result<Self, BurstError> {
        check_code(Field::Originator, originator)?;
        check_code(Field::Event, event_code)?;
        let locations = check_locations(locations)?;
        if purge_minutes == 0 || purge_minutes > 99 * 60 + 59 {
            return Err(BurstError::invalid(
                Field::PurgeDuration,
                &purge_minutes.to_string(),
                "purge duration out of range",
            ));
        }
        let issue_code = IssueCode::parse(issue_code)?;
        let station = check_station(station)?;

        Ok(Self {
            originator: originator.to_owned(),
            event_code: event_code.to_owned(),
            locations,
            purge_minutes,
            issue_code,
            issued_at,
            station: station.to_owned(),
            raw: raw.to_owned(),
        })
    }

    /// Originator code, like `WXR`
    pub fn originator(&self) -> &str {
        &self.originator
    }

    /// Originator, refined by the station callsign
    ///
    /// See [`Originator`].
    pub fn originator_class(&self) -> Originator {
        Originator::from((self.originator.as_str(), self.station.as_str()))
    }

    /// Event code, like `TOR`
    pub fn event_code(&self) -> &str {
        &self.event_code
    }

    /// Significance level implied by the event code
    pub fn significance(&self) -> Option<SignificanceLevel> {
        SignificanceLevel::from_event_code(&self.event_code)
    }

    /// Location codes, in transmitted order
    pub fn locations(&self) -> &[LocationCode] {
        &self.locations
    }

    /// Purge time, in minutes
    pub fn purge_minutes(&self) -> u32 {
        self.purge_minutes
    }

    /// Purge time, as a `Duration`
    pub fn purge_duration(&self) -> Duration {
        Duration::minutes(self.purge_minutes as i64)
    }

    /// The transmitted `JJJHHMM` issue time
    pub fn issue_code(&self) -> IssueCode {
        self.issue_code
    }

    /// Resolved issue time (UTC)
    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// Time after which the message should no longer be relayed
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.issued_at + self.purge_duration()
    }

    /// Sending station identifier
    pub fn station(&self) -> &str {
        &self.station
    }

    /// The line as received, whitespace-trimmed
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for ParsedAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}-{}", PREFIX_MESSAGE_START, self.originator, self.event_code)?;
        for loc in &self.locations {
            write!(f, "-{}", loc)?;
        }
        write!(
            f,
            "+{:02}{:02}-{}-{}-",
            self.purge_minutes / 60,
            self.purge_minutes % 60,
            self.issue_code,
            self.station
        )
    }
}

// Split and check everything before the `+`
//
// `head` is `ORG-EEE-PSSCCC-PSSCCC…`. When a field is absent,
// guess which one from what remains: location codes are all
// digits, and well-known originators are recognizable.
fn check_head(head: &str) -> Result<(&str, &str, Vec<LocationCode>), BurstError> {
    let fields: Vec<&str> = head.split(SEPARATOR).collect();
    match fields.as_slice() {
        [first] => {
            return Err(if Originator::is_known(first) {
                BurstError::Missing(Field::Event)
            } else if first.is_empty() {
                BurstError::Missing(Field::Originator)
            } else {
                BurstError::Missing(Field::Location)
            });
        }
        [first, second, ..] if looks_like_location(second) => {
            return Err(if Originator::is_known(first) {
                BurstError::Missing(Field::Event)
            } else {
                BurstError::Missing(Field::Originator)
            });
        }
        [_, _] => return Err(BurstError::Missing(Field::Location)),
        _ => {}
    }

    let originator = check_code(Field::Originator, fields[0])?;
    let event_code = check_code(Field::Event, fields[1])?;
    let locations = check_locations(&fields[2..])?;
    Ok((originator, event_code, locations))
}

// Split and check everything after the `+`
//
// `tail` is `TTTT-JJJHHMM-STATION-`, possibly followed by
// trailing garbage which is ignored.
fn check_tail(tail: &str) -> Result<(u32, IssueCode, &str), BurstError> {
    let fields: Vec<&str> = tail.splitn(4, SEPARATOR).collect();

    let purge = check_purge(fields[0])?;
    let (issue, station) = match fields.as_slice() {
        [_] | [_, ""] => return Err(BurstError::Missing(Field::IssueTime)),
        [_, _] => return Err(BurstError::Missing(Field::Station)),
        [_, issue, ""] if !is_digits(issue, issue.len()) => {
            return Err(BurstError::Missing(Field::IssueTime))
        }
        [_, _, ""] => return Err(BurstError::Missing(Field::Station)),
        [_, _, station] => {
            return Err(BurstError::invalid(
                Field::Station,
                station,
                "missing terminating '-'",
            ))
        }
        [_, "", _, _] => return Err(BurstError::Missing(Field::IssueTime)),
        [_, issue, station, _] => (*issue, *station),
        _ => unreachable!(),
    };

    let issue_code = IssueCode::parse(issue)?;
    let station = check_station(station)?;
    Ok((purge, issue_code, station))
}

fn check_code(field: Field, code: &str) -> Result<&str, BurstError> {
    lazy_static! {
        static ref RE: Regex = Regex::new(r"^[A-Z]{3}$").expect("bad SAME code regexp");
    }

    if code.is_empty() {
        Err(BurstError::Missing(field))
    } else if RE.is_match(code) {
        Ok(code)
    } else {
        Err(BurstError::invalid(
            field,
            code,
            "expected three uppercase letters",
        ))
    }
}

fn check_locations(codes: &[&str]) -> Result<Vec<LocationCode>, BurstError> {
    if codes.iter().all(|c| c.is_empty()) {
        return Err(BurstError::Missing(Field::Location));
    }
    if codes.len() > MAX_LOCATIONS {
        return Err(BurstError::invalid(
            Field::Location,
            &codes.len().to_string(),
            "more than 31 location codes",
        ));
    }

    let mut seen = HashSet::with_capacity(codes.len());
    let mut out = Vec::with_capacity(codes.len());
    for &code in codes {
        if code.is_empty() {
            return Err(BurstError::invalid(
                Field::Location,
                code,
                "empty element in location list",
            ));
        }
        let loc = LocationCode::new(code).ok_or_else(|| {
            BurstError::invalid(Field::Location, code, "expected six digits PSSCCC")
        })?;
        if !seen.insert(code) {
            return Err(BurstError::invalid(
                Field::Location,
                code,
                "duplicate location code",
            ));
        }
        out.push(loc);
    }

    Ok(out)
}

fn check_purge(purge: &str) -> Result<u32, BurstError> {
    if purge.is_empty() {
        return Err(BurstError::Missing(Field::PurgeDuration));
    }
    if !is_digits(purge, 4) {
        return Err(BurstError::invalid(
            Field::PurgeDuration,
            purge,
            "expected four digits HHMM",
        ));
    }

    let hours = digits_value(&purge[0..2]);
    let minutes = digits_value(&purge[2..4]);
    if minutes > 59 {
        return Err(BurstError::invalid(
            Field::PurgeDuration,
            purge,
            "minutes out of range",
        ));
    }

    match hours * 60 + minutes {
        0 => Err(BurstError::invalid(
            Field::PurgeDuration,
            purge,
            "purge duration is zero",
        )),
        total => Ok(total),
    }
}

fn check_station(station: &str) -> Result<&str, BurstError> {
    let station = station.trim();
    if station.is_empty() {
        Err(BurstError::Missing(Field::Station))
    } else if station.len() > MAX_STATION_LENGTH {
        Err(BurstError::invalid(
            Field::Station,
            station,
            "longer than eight characters",
        ))
    } else {
        Ok(station)
    }
}

#[inline]
fn is_digits(s: &str, len: usize) -> bool {
    !s.is_empty() && s.len() == len && s.bytes().all(|b| b.is_ascii_digit())
}

#[inline]
fn looks_like_location(s: &str) -> bool {
    is_digits(s, s.len())
}

// value of a short, already-checked run of ASCII digits
#[inline]
fn digits_value(s: &str) -> u32 {
    s.bytes().fold(0, |acc, b| acc * 10 + (b - b'0') as u32)
}

// Calculate message issuance time
//
// Projects the day-of-year into the year after, the year of,
// and the year before `received`, and keeps the latest
// projection that does not exceed the policy's tolerance.
fn calculate_issue_time(
    code: IssueCode,
    received: &DateTime<Utc>,
    policy: &RolloverPolicy,
) -> Option<DateTime<Utc>> {
    let latest = *received + policy.future_tolerance();
    let rx_year = received.year();

    [rx_year.saturating_add(1), rx_year, rx_year.saturating_sub(1)]
        .into_iter()
        .filter_map(|year| {
            let naive = NaiveDate::from_yo_opt(year, code.day_of_year as u32)?.and_hms_opt(
                code.hour as u32,
                code.minute as u32,
                0,
            )?;
            Some(Utc.from_utc_datetime(&naive))
        })
        .find(|issued| *issued <= latest)
}
