use crate::db_types::Practice;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::time::SystemTime;
use time::OffsetDateTime;
use tracing::warn;

/// Mask a phone number down to its last four digits: `***-***-1234`.
pub fn mask_phone(phone: &str) -> String {
    let digits: Vec<char> = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 4 {
        return "***-***-****".to_string();
    }
    let last4: String = digits[digits.len() - 4..].iter().collect();
    format!("***-***-{last4}")
}

/// The practice's configured timezone, or UTC if it no longer parses.
pub fn practice_tz(practice: &Practice) -> Tz {
    practice.timezone.parse().unwrap_or_else(|_| {
        warn!(practice = %practice.id, timezone = %practice.timezone, "unknown timezone, using UTC");
        Tz::UTC
    })
}

/// "Tuesday, March 5 at 9:30 AM" in the given zone.
pub fn spoken_time(at: DateTime<Utc>, tz: Tz) -> String {
    at.with_timezone(&tz)
        .format("%A, %B %-d at %-I:%M %p")
        .to_string()
}

pub fn to_utc(at: OffsetDateTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(SystemTime::from(at))
}

pub fn to_offset(at: DateTime<Utc>) -> OffsetDateTime {
    OffsetDateTime::from(SystemTime::from(at))
}

/// Parse an RFC 3339 timestamp as sent by the records API.
pub fn parse_rfc3339(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
