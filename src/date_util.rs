use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};

/// Timestamps sent to the EFS service must look like
/// `YYYY-MM-DDTHH:MM:SS.mmm±HH:MM`. Milliseconds are truncated, not rounded.
pub trait ProtocolTimestamp {
    fn to_protocol_timestamp(&self) -> String;
}

fn render<Tz: TimeZone>(dt: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    let millis = (dt.nanosecond() / 1_000_000) % 1000;
    format!(
        "{}.{:03}{}",
        dt.format("%Y-%m-%dT%H:%M:%S"),
        millis,
        dt.format("%:z")
    )
}

impl ProtocolTimestamp for DateTime<FixedOffset> {
    fn to_protocol_timestamp(&self) -> String {
        render(self)
    }
}

impl ProtocolTimestamp for DateTime<Utc> {
    fn to_protocol_timestamp(&self) -> String {
        render(self)
    }
}

/// Naive datetimes are taken to be UTC.
impl ProtocolTimestamp for NaiveDateTime {
    fn to_protocol_timestamp(&self) -> String {
        render(&self.and_utc())
    }
}

/// Bare dates render at midnight UTC.
impl ProtocolTimestamp for NaiveDate {
    fn to_protocol_timestamp(&self) -> String {
        render(&midnight_utc(*self))
    }
}

pub fn midnight_utc(d: NaiveDate) -> DateTime<Utc> {
    d.and_time(NaiveTime::MIN).and_utc()
}

/// Parse a timestamp as the service returns it. Offset-bearing values are
/// converted to UTC; naive ones are assumed to already be UTC.
pub fn parse_protocol_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok().map(midnight_utc)
}

/// Canonical storage form: UTC with millisecond precision, sortable as text.
pub fn to_storage_timestamp(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

pub fn from_storage_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
