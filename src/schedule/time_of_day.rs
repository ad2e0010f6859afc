use std::fmt;
use std::str::FromStr;

use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

use super::Rejection;

/// A wall-clock time of day with minute precision, `00:00..=23:59`.
///
/// Only constructible through [`TimeOfDay::from_hm`] or by parsing `HH:MM`,
/// so a value in hand is always in range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    minutes: u16,
}

impl TimeOfDay {
    pub fn from_hm(hour: u32, minute: u32) -> Option<Self> {
        if hour > 23 || minute > 59 {
            return None;
        }
        Some(Self {
            minutes: (hour * 60 + minute) as u16,
        })
    }

    pub fn hour(self) -> u32 {
        (self.minutes / 60) as u32
    }

    pub fn minute(self) -> u32 {
        (self.minutes % 60) as u32
    }

    pub fn to_naive_time(self) -> NaiveTime {
        // Range is enforced at construction.
        NaiveTime::from_hms_opt(self.hour(), self.minute(), 0).unwrap_or(NaiveTime::MIN)
    }
}

impl FromStr for TimeOfDay {
    type Err = Rejection;

    /// Exactly two digits, a colon, two digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Rejection::InvalidTimeOfDay(s.to_string());
        let bytes = s.as_bytes();
        if bytes.len() != 5 || bytes[2] != b':' {
            return Err(invalid());
        }
        let digit = |b: u8| -> Result<u32, Rejection> {
            if b.is_ascii_digit() {
                Ok((b - b'0') as u32)
            } else {
                Err(invalid())
            }
        };
        let hour = digit(bytes[0])? * 10 + digit(bytes[1])?;
        let minute = digit(bytes[3])? * 10 + digit(bytes[4])?;
        Self::from_hm(hour, minute).ok_or_else(invalid)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = Rejection;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(t: TimeOfDay) -> Self {
        t.to_string()
    }
}

/// ISO weekday number, 1 = Monday .. 7 = Sunday.
pub fn iso_weekday(day: Weekday) -> u8 {
    day.number_from_monday() as u8
}

/// Validate an ISO weekday number coming from outside.
pub fn parse_iso_weekday(n: i64) -> Result<u8, Rejection> {
    if (1..=7).contains(&n) {
        Ok(n as u8)
    } else {
        Err(Rejection::InvalidWeekday(n))
    }
}
