//! Originator and significance classification

use std::fmt;
use std::str::FromStr;

use strum::EnumMessage;

/// Class of sender
///
/// Derived from the three-letter originator code and, for
/// weather alerts, the station callsign. Any originator code is
/// accepted on the wire; codes which are not one of the four
/// standard ones become [`Originator::Unknown`].
///
/// ```
/// use samealert::Originator;
///
/// assert_eq!(Originator::CivilAuthority, Originator::from("CIV"));
/// assert_eq!(Originator::Unknown, Originator::from("XYZ"));
///
/// assert_eq!(
///     Originator::NationalWeatherService,
///     Originator::from(("WXR", "KLOX/NWS"))
/// );
/// assert_eq!(
///     Originator::EnvironmentCanada,
///     Originator::from(("WXR", "EC/GC/CA"))
/// );
/// ```
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, strum_macros::EnumMessage,
)]
pub enum Originator {
    /// Not one of the standard originator codes
    #[strum(serialize = "OOO", detailed_message = "Unknown Originator")]
    Unknown,

    /// Primary Entry Point station, for national activations
    #[strum(serialize = "PEP", detailed_message = "Primary Entry Point System")]
    PrimaryEntryPoint,

    /// Civil authorities
    #[strum(serialize = "CIV", detailed_message = "Civil authorities")]
    CivilAuthority,

    /// Weather service of unknown nationality
    #[strum(serialize = "WXR", detailed_message = "Weather Service")]
    WeatherService,

    /// `WXR` sent from a `/NWS` callsign
    #[strum(disabled, serialize = "WXR")]
    NationalWeatherService,

    /// `WXR` sent from an `EC/` callsign
    #[strum(disabled, serialize = "WXR")]
    EnvironmentCanada,

    /// EAS participant, usually a broadcast station
    #[strum(
        serialize = "EAS",
        detailed_message = "Broadcast station or cable system"
    )]
    BroadcastStation,
}

impl Originator {
    /// True if `code` is one of the standard originator codes
    pub fn is_known(code: &str) -> bool {
        !matches!(Originator::from(code), Originator::Unknown)
    }

    /// Human-readable name, like "`Civil authorities`"
    pub fn as_display_str(&self) -> &'static str {
        match self {
            Originator::NationalWeatherService => "National Weather Service",
            Originator::EnvironmentCanada => "Environment Canada",
            _ => self.get_detailed_message().unwrap_or("Unknown Originator"),
        }
    }

    /// Three-letter SAME code
    pub fn as_str(&self) -> &'static str {
        self.get_serializations()[0]
    }
}

impl FromStr for Originator {
    type Err = strum::ParseError;

    fn from_str(code: &str) -> Result<Originator, Self::Err> {
        match code {
            "OOO" => Ok(Originator::Unknown),
            "PEP" => Ok(Originator::PrimaryEntryPoint),
            "CIV" => Ok(Originator::CivilAuthority),
            "WXR" => Ok(Originator::WeatherService),
            "EAS" => Ok(Originator::BroadcastStation),
            _ => Err(strum::ParseError::VariantNotFound),
        }
    }
}

impl From<&str> for Originator {
    fn from(code: &str) -> Originator {
        Originator::from_str(code).unwrap_or(Originator::Unknown)
    }
}

impl From<(&str, &str)> for Originator {
    fn from((code, station): (&str, &str)) -> Originator {
        match Originator::from(code) {
            Originator::WeatherService if station.ends_with("/NWS") => {
                Originator::NationalWeatherService
            }
            Originator::WeatherService if station.starts_with("EC/") => {
                Originator::EnvironmentCanada
            }
            orig => orig,
        }
    }
}

impl AsRef<str> for Originator {
    fn as_ref(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for Originator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_display_str())
    }
}

/// Urgency implied by an event code
///
/// Most event codes end in a letter which gives their
/// significance: `T`est, `M`essage, `S`tatement, `E`mergency,
/// w`A`tch, or `W`arning. Several well-known codes break this
/// convention, and [`from_event_code()`](Self::from_event_code)
/// knows about them.
///
/// Levels are ordered from least to most urgent.
///
/// ```
/// use samealert::SignificanceLevel;
///
/// assert_eq!(Some(SignificanceLevel::Watch), SignificanceLevel::from_event_code("TOA"));
/// assert_eq!(Some(SignificanceLevel::Warning), SignificanceLevel::from_event_code("TOR"));
/// assert_eq!(None, SignificanceLevel::from_event_code("ADR"));
/// assert!(SignificanceLevel::Test < SignificanceLevel::Warning);
/// ```
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum_macros::EnumMessage,
    strum_macros::EnumString,
)]
#[repr(u8)]
pub enum SignificanceLevel {
    /// "This is only a test"
    #[strum(serialize = "T", detailed_message = "Test")]
    Test,

    /// A non-emergency message
    #[strum(serialize = "M", detailed_message = "Message")]
    Message,

    /// Follow-up information to a warning, watch, or emergency
    #[strum(serialize = "S", detailed_message = "Statement")]
    Statement,

    /// An indirect hazard, like a major utility outage
    #[strum(serialize = "E", detailed_message = "Emergency")]
    Emergency,

    /// Hazard possible, but onset, probability, or location uncertain
    #[strum(serialize = "A", detailed_message = "Watch")]
    Watch,

    /// Significant threat to life or property
    #[strum(serialize = "W", detailed_message = "Warning")]
    Warning,
}

impl SignificanceLevel {
    /// Significance of a three-letter event code
    ///
    /// Returns `None` when the code neither appears in the list of
    /// exceptions nor ends in a significance letter.
    pub fn from_event_code(code: &str) -> Option<Self> {
        let level = match code {
            "EAN" | "BLU" | "CEM" | "DMO" | "EVI" | "SVR" | "TOR" => "W",
            "NIC" => "S",
            "NMN" => "M",
            _ => code.get(code.len().checked_sub(1)?..)?,
        };
        SignificanceLevel::from_str(level).ok()
    }

    /// Human-readable name, like "`Warning`"
    pub fn as_display_str(&self) -> &'static str {
        self.get_detailed_message().unwrap_or("Warning")
    }

    /// One-letter SAME code
    pub fn as_code_str(&self) -> &'static str {
        self.get_serializations()[0]
    }
}

impl fmt::Display for SignificanceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_display_str())
    }
}
