use std::fmt;

use serde::{Deserialize, Serialize};

pub mod coerce;
pub mod event;
pub mod summary;
pub mod topic;

pub use event::{DecodeError, IngestEvent, decode};
pub use summary::Summary;
pub use topic::{TopicError, TopicPath};

/// Durable numeric identity of a device, assigned by the identity table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub i64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connectivity reported by a device in a `status` packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityStatus {
    Online,
    Offline,
}

impl ConnectivityStatus {
    /// Recognizes `online`/`offline` regardless of case and surrounding whitespace.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

impl fmt::Display for ConnectivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single uppercase drive letter `A`–`Z`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DriveLetter(char);

impl DriveLetter {
    /// Normalizes the drive identifiers devices send (`"C"`, `"c:"`, `"C:\\"`).
    ///
    /// Anything that does not reduce to exactly one ASCII letter is rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let mut chars = trimmed.chars();
        let first = chars.next()?;
        let rest = chars.as_str();

        if !rest.is_empty() && !rest.starts_with(':') {
            return None;
        }
        if !first.is_ascii_alphabetic() {
            return None;
        }

        Some(Self(first.to_ascii_uppercase()))
    }

    pub fn as_char(&self) -> char {
        self.0
    }
}

impl fmt::Display for DriveLetter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The moment an event is attributed to, in the two forms the stores persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTime {
    /// Whole seconds since the Unix epoch (floor of the millisecond value).
    pub epoch_seconds: i64,
    /// Full-precision UTC instant.
    pub at: jiff::Timestamp,
}

impl EventTime {
    pub fn from_millis(ms: i64) -> Option<Self> {
        let at = jiff::Timestamp::from_millisecond(ms).ok()?;
        Some(Self {
            epoch_seconds: ms.div_euclid(1000),
            at,
        })
    }

    pub fn now() -> Self {
        let at = jiff::Timestamp::now();
        Self {
            epoch_seconds: at.as_second(),
            at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drive_letters_normalize() {
        for raw in ["C", "c", "C:", "c:", "C:\\", " d: "] {
            let letter = DriveLetter::parse(raw).unwrap();
            assert!(letter.as_char().is_ascii_uppercase(), "{raw}");
        }
        assert_eq!(DriveLetter::parse("c:\\").unwrap().as_char(), 'C');
        assert_eq!(DriveLetter::parse(" d: ").unwrap().as_char(), 'D');
    }

    #[test]
    fn drive_letters_reject_garbage() {
        for raw in ["", "CC", "1", "1:", "é", "C/", ":", "  "] {
            assert_eq!(DriveLetter::parse(raw), None, "{raw:?}");
        }
    }

    #[test]
    fn connectivity_is_case_insensitive() {
        assert_eq!(
            ConnectivityStatus::parse(" OffLine "),
            Some(ConnectivityStatus::Offline)
        );
        assert_eq!(
            ConnectivityStatus::parse("ONLINE"),
            Some(ConnectivityStatus::Online)
        );
        assert_eq!(ConnectivityStatus::parse("sleeping"), None);
    }

    #[test]
    fn event_time_floors_negative_millis() {
        let t = EventTime::from_millis(-1).unwrap();
        assert_eq!(t.epoch_seconds, -1);

        let t = EventTime::from_millis(1_700_000_000_999).unwrap();
        assert_eq!(t.epoch_seconds, 1_700_000_000);
        assert_eq!(t.at.as_millisecond(), 1_700_000_000_999);
    }

    #[test]
    fn event_time_rejects_out_of_range() {
        assert_eq!(EventTime::from_millis(i64::MAX), None);
    }
}
