//! UTC storage and display-timezone conversion.
//!
//! Timestamps are stored as `YYYY-MM-DD HH:MM:SS` in UTC and shown in the
//! timezone named by the `timezone` setting.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

pub const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, thiserror::Error)]
pub enum DateError {
    #[error("Invalid timezone: {0}")]
    Timezone(String),

    #[error("Invalid date: {0}")]
    Parse(String),
}

pub fn timezone(name: &str) -> Result<Tz, DateError> {
    name.parse::<Tz>()
        .map_err(|_| DateError::Timezone(name.to_string()))
}

pub fn now_utc() -> String {
    Utc::now().format(FORMAT).to_string()
}

/// Parse the handful of shapes dates arrive in from forms and the API.
pub fn parse(value: &str) -> Result<NaiveDateTime, DateError> {
    let value = value.trim();
    for format in [FORMAT, "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(dt);
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.naive_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(dt) = date.and_hms_opt(0, 0, 0) {
            return Ok(dt);
        }
    }
    Err(DateError::Parse(value.to_string()))
}

pub fn utc_to_local(utc: &str, tz: Tz) -> Result<String, DateError> {
    let naive = parse(utc)?;
    Ok(Utc
        .from_utc_datetime(&naive)
        .with_timezone(&tz)
        .format(FORMAT)
        .to_string())
}

pub fn local_to_utc(local: &str, tz: Tz) -> Result<String, DateError> {
    let naive = parse(local)?;
    let resolved = tz
        .from_local_datetime(&naive)
        .earliest()
        // Times skipped by a DST jump resolve to the first valid instant after
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
        .ok_or_else(|| DateError::Parse(local.to_string()))?;
    Ok(resolved.with_timezone(&Utc).format(FORMAT).to_string())
}

/// Format a stored UTC timestamp with a strftime pattern in `tz`.
pub fn format(utc: &str, pattern: &str, tz: Tz) -> Result<String, DateError> {
    let naive = parse(utc)?;
    Ok(Utc
        .from_utc_datetime(&naive)
        .with_timezone(&tz)
        .format(pattern)
        .to_string())
}

/// RFC 2822 form for feeds.
pub fn rfc2822(utc: &str) -> Result<String, DateError> {
    let naive = parse(utc)?;
    Ok(Utc.from_utc_datetime(&naive).to_rfc2822())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_to_utc_inverts_utc_to_local() {
        let samples = [
            "2016-01-01 00:00:00",
            "2016-06-15 12:30:45",
            "2020-02-29 23:59:59",
            "1999-12-31 23:00:00",
        ];
        for tz_name in ["UTC", "Asia/Tokyo", "America/New_York", "Australia/Adelaide"] {
            let tz = timezone(tz_name).unwrap();
            for t in samples {
                let local = utc_to_local(t, tz).unwrap();
                assert_eq!(local_to_utc(&local, tz).unwrap(), t, "{} in {}", t, tz_name);
            }
        }
    }

    #[test]
    fn utc_to_local_applies_offset() {
        let tz = timezone("Asia/Tokyo").unwrap();
        assert_eq!(
            utc_to_local("2016-06-15 12:00:00", tz).unwrap(),
            "2016-06-15 21:00:00"
        );
    }

    #[test]
    fn skipped_local_time_resolves_forward() {
        let tz = timezone("America/New_York").unwrap();
        // 02:30 does not exist on 2016-03-13
        assert_eq!(
            local_to_utc("2016-03-13 02:30:00", tz).unwrap(),
            "2016-03-13 07:30:00"
        );
    }

    #[test]
    fn parse_accepts_form_shapes() {
        assert!(parse("2016-06-15").is_ok());
        assert!(parse("2016-06-15T10:20").is_ok());
        assert!(parse("2016-06-15T10:20:30Z").is_ok());
        assert!(parse("yesterday").is_err());
    }

    #[test]
    fn unknown_timezone_is_an_error() {
        assert!(matches!(timezone("Mars/Olympus"), Err(DateError::Timezone(_))));
    }
}
