//! `start_date` normalization for the date-violation guard.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value as JsonValue;

/// Calendar day (UTC) of a raw `start_date` value.
///
/// Digit-only values are epochs or `YYYYMMDD`: 13 digits are milliseconds,
/// 10 digits seconds, 8 digits a compact date. Other numbers count as
/// milliseconds above `1e11` and seconds otherwise. Text falls back to
/// RFC 3339 and a handful of common layouts.
pub fn normalize_start_date(raw: &JsonValue) -> Option<NaiveDate> {
    match raw {
        JsonValue::String(text) => normalize_text(text.trim()),
        JsonValue::Number(n) => match n.as_i64() {
            Some(int) => normalize_text(&int.to_string()),
            None => n.as_f64().and_then(from_numeric),
        },
        _ => None,
    }
}

fn normalize_text(text: &str) -> Option<NaiveDate> {
    if text.is_empty() {
        return None;
    }
    if text.bytes().all(|b| b.is_ascii_digit()) {
        match text.len() {
            13 => return text.parse().ok().and_then(from_millis),
            10 => return text.parse::<i64>().ok().and_then(|s| from_millis(s.checked_mul(1000)?)),
            8 => {
                if let Ok(date) = NaiveDate::parse_from_str(text, "%Y%m%d") {
                    return Some(date);
                }
            }
            _ => {}
        }
        return text.parse::<f64>().ok().and_then(from_numeric);
    }
    parse_date_text(text)
}

fn from_numeric(value: f64) -> Option<NaiveDate> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let millis = if value > 100_000_000_000.0 { value } else { value * 1000.0 };
    if millis > i64::MAX as f64 {
        return None;
    }
    from_millis(millis as i64)
}

fn from_millis(millis: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(millis).map(|dt| dt.date_naive())
}

fn parse_date_text(text: &str) -> Option<NaiveDate> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_utc().date());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(text) {
        return Some(dt.naive_utc().date());
    }
    for layout in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, layout) {
            return Some(dt.date());
        }
    }
    for layout in ["%Y-%m-%d", "%Y/%m/%d", "%b %d, %Y", "%d %b %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(text, layout) {
            return Some(date);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn day(y: i32, m: u32, d: u32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(y, m, d)
    }

    #[test]
    fn epoch_lengths_pick_their_unit() {
        // 2024-02-29T12:00:00Z
        assert_eq!(normalize_start_date(&json!("1709208000000")), day(2024, 2, 29));
        assert_eq!(normalize_start_date(&json!("1709208000")), day(2024, 2, 29));
        assert_eq!(normalize_start_date(&json!(1709208000)), day(2024, 2, 29));
        assert_eq!(normalize_start_date(&json!(1709208000000i64)), day(2024, 2, 29));
    }

    #[test]
    fn compact_dates_and_fallback_numbers() {
        assert_eq!(normalize_start_date(&json!("20240301")), day(2024, 3, 1));
        // not a valid calendar date: read as epoch seconds instead
        assert_eq!(normalize_start_date(&json!("20241399")), day(1970, 8, 23));
        assert_eq!(normalize_start_date(&json!(1709208000000.0)), day(2024, 2, 29));
    }

    #[test]
    fn text_layouts() {
        assert_eq!(normalize_start_date(&json!("2024-03-01")), day(2024, 3, 1));
        assert_eq!(normalize_start_date(&json!("2024-03-01T23:30:00-05:00")), day(2024, 3, 2));
        assert_eq!(normalize_start_date(&json!("2024-03-01 08:15:00")), day(2024, 3, 1));
        assert_eq!(normalize_start_date(&json!(" 2024/03/01 ")), day(2024, 3, 1));
    }

    #[test]
    fn unparseable_values_have_no_date() {
        assert_eq!(normalize_start_date(&json!(null)), None);
        assert_eq!(normalize_start_date(&json!("")), None);
        assert_eq!(normalize_start_date(&json!("soon")), None);
        assert_eq!(normalize_start_date(&json!(true)), None);
        assert_eq!(normalize_start_date(&json!({"ts": 1})), None);
    }
}
