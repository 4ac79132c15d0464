//! Source readers: turn heterogeneous inputs into canonical [`Document`]s.
//!
//! Each reader owns its input format end to end; the ingestion orchestrator
//! only ever sees validated documents.

pub mod chat;
pub mod csv;
pub mod markdown;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// Parse a date cell against the fixed format set, first match wins.
///
/// Order: `YYYY/MM/DD`, `YYYY-MM-DD` (both accept single-digit month/day),
/// RFC3339, then the two datetime variants with `HH:MM:SS`.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    for fmt in ["%Y/%m/%d", "%Y-%m-%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0)?));
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y/%m/%d %H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&dt));
        }
    }
    None
}

/// Replace path-hostile characters (space, dot, slashes) with underscores for
/// use inside document ids.
pub fn sanitize_id_component(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            ' ' | '.' | '/' | '\\' => '_',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    #[test]
    fn date_formats_in_order() {
        assert_eq!(parse_date("2024/03/05").unwrap().day(), 5);
        assert_eq!(parse_date("2024-03-05").unwrap().month(), 3);
        // Single-digit variants
        assert_eq!(parse_date("2024/3/5").unwrap().day(), 5);
        assert!(parse_date("2024-03-05T12:30:00+09:00").is_some());
        assert!(parse_date("2024/03/05 12:30:00").is_some());
        assert!(parse_date("2024-03-05 12:30:00").is_some());
        assert!(parse_date("not a date").is_none());
        assert!(parse_date("").is_none());
    }

    #[test]
    fn id_sanitization() {
        assert_eq!(sanitize_id_component("a b.c/d\\e"), "a_b_c_d_e");
        assert_eq!(sanitize_id_component("既存データ"), "既存データ");
    }
}
