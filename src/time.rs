//! Timestamp normalization.
//!
//! Upstream records mix epoch seconds, epoch millis, ISO strings with an
//! offset and naive wall-clock strings. Everything is converted to UTC
//! milliseconds here; naive strings are read in the business timezone.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone};
use chrono_tz::Tz;
use serde_json::Value;

use crate::model::{DateKey, Ms};

/// Numbers below this magnitude are epoch seconds, otherwise epoch millis.
pub const SECONDS_THRESHOLD: i64 = 1_000_000_000_000;

/// 2000-01-01T00:00:00Z. Anything earlier is treated as corrupt.
pub const SANITY_FLOOR_MS: Ms = 946_684_800_000;

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Convert any supported raw time representation to UTC milliseconds.
///
/// Returns `None` for null, empty, malformed or pre-2000 input. Callers on
/// aggregation paths must treat `None` as "unknown", never as "now".
pub fn to_utc_millis(raw: &Value, tz: &Tz) -> Option<Ms> {
    match raw {
        Value::Null => None,
        Value::Number(n) => match n.as_i64() {
            Some(v) => from_epoch(v),
            None => n.as_f64().and_then(from_epoch_f64),
        },
        Value::String(s) => parse_str(s, tz),
        _ => None,
    }
}

pub fn from_epoch(value: i64) -> Option<Ms> {
    let ms = if value.unsigned_abs() < SECONDS_THRESHOLD as u64 {
        value.checked_mul(1000)?
    } else {
        value
    };
    (ms >= SANITY_FLOOR_MS).then_some(ms)
}

fn from_epoch_f64(value: f64) -> Option<Ms> {
    if !value.is_finite() {
        return None;
    }
    let ms = if value.abs() < SECONDS_THRESHOLD as f64 {
        value * 1000.0
    } else {
        value
    };
    let ms = ms.round();
    (ms >= SANITY_FLOOR_MS as f64 && ms < i64::MAX as f64).then_some(ms as Ms)
}

/// String flavour of [`to_utc_millis`].
pub fn parse_str(raw: &str, tz: &Tz) -> Option<Ms> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if s.bytes().all(|b| b.is_ascii_digit()) {
        return s.parse::<i64>().ok().and_then(from_epoch);
    }
    if let Some((local, offset_ms)) = split_offset(s) {
        let naive = parse_naive(local)?;
        return Some(naive.and_utc().timestamp_millis() - offset_ms);
    }
    parse_naive(s).map(|naive| local_to_utc_millis(naive, tz))
}

/// Split an explicit UTC marker or numeric offset off the end of `s`.
/// Returns the remaining wall-clock part and the offset in milliseconds.
fn split_offset(s: &str) -> Option<(&str, Ms)> {
    for marker in ["utc", "gmt"] {
        if s.len() > marker.len()
            && let Some(tail) = s.get(s.len() - marker.len()..)
            && tail.eq_ignore_ascii_case(marker)
        {
            return Some((s[..s.len() - marker.len()].trim_end(), 0));
        }
    }
    if let Some(rest) = s.strip_suffix(['Z', 'z']) {
        return Some((rest, 0));
    }

    // The date part carries its own dashes; only look after it.
    let tail = s.get(10..)?;
    let idx = tail.rfind(|c| c == '+' || c == '-')? + 10;
    let (head, offset) = s.split_at(idx);
    let sign: Ms = if offset.starts_with('-') { -1 } else { 1 };
    let digits: String = offset[1..].chars().filter(|c| *c != ':').collect();
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let (hours, minutes) = match digits.len() {
        2 => (digits.parse::<Ms>().ok()?, 0),
        4 => (digits[..2].parse::<Ms>().ok()?, digits[2..].parse::<Ms>().ok()?),
        _ => return None,
    };
    if hours > 14 || minutes > 59 {
        return None;
    }
    Some((head.trim_end(), sign * (hours * 3_600_000 + minutes * 60_000)))
}

/// `YYYY-MM-DD[( |T)HH:mm[:ss[.fff]]]`; a missing time means midnight.
pub fn parse_naive(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .map(|d| d.and_time(NaiveTime::MIN))
        })
}

/// UTC offset of `tz` at the given instant, in milliseconds.
pub fn offset_ms_at(tz: &Tz, utc_ms: Ms) -> Ms {
    match DateTime::from_timestamp_millis(utc_ms) {
        Some(dt) => {
            tz.offset_from_utc_datetime(&dt.naive_utc())
                .fix()
                .local_minus_utc() as Ms
                * 1000
        }
        None => 0,
    }
}

/// Interpret a wall-clock time in `tz` and return the UTC instant.
///
/// The offset is first taken at the wall time read as if it were UTC, then
/// re-taken at the corrected instant. Near a transition the two differ and
/// the second one is authoritative. For wall times that do not exist
/// (spring-forward gap) the result lands one DST delta later, e.g. 02:30
/// becomes 03:30.
pub fn local_to_utc_millis(naive: NaiveDateTime, tz: &Tz) -> Ms {
    let wall = naive.and_utc().timestamp_millis();
    let first_offset = offset_ms_at(tz, wall);
    let first = wall - first_offset;
    let second_offset = offset_ms_at(tz, first);
    if second_offset == first_offset {
        return first;
    }
    let second = wall - second_offset;
    if offset_ms_at(tz, second) == second_offset {
        return second;
    }
    // Nonexistent wall time: read it with the pre-transition offset.
    wall - first_offset.min(second_offset)
}

/// Calendar date of an instant as seen in `tz`.
pub fn local_date(ms: Ms, tz: &Tz) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(ms).map(|dt| dt.with_timezone(tz).date_naive())
}

/// UTC instant of local midnight starting `date` in `tz`.
pub fn local_midnight(date: NaiveDate, tz: &Tz) -> Ms {
    local_to_utc_millis(date.and_time(NaiveTime::MIN), tz)
}

pub fn date_key(date: NaiveDate) -> DateKey {
    date.format("%Y-%m-%d").to_string()
}

pub fn format_local(ms: Ms, tz: &Tz, fmt: &str) -> Option<String> {
    DateTime::from_timestamp_millis(ms).map(|dt| dt.with_timezone(tz).format(fmt).to_string())
}

/// Collapse a participant breakdown to one count, floored at 1.
///
/// Accepts a number, an array of numbers or an object of category → number.
/// Numeric strings count; anything else counts as zero before the floor.
pub fn participant_count(raw: &Value) -> u32 {
    let total = match raw {
        Value::Array(items) => items
            .iter()
            .map(count_component)
            .fold(0u32, u32::saturating_add),
        Value::Object(map) => map
            .values()
            .map(count_component)
            .fold(0u32, u32::saturating_add),
        other => count_component(other),
    };
    total.max(1)
}

fn count_component(value: &Value) -> u32 {
    let n = match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f > 0.0).map(|f| f.round() as u64)),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    n.map_or(0, |n| n.min(u32::MAX as u64) as u32)
}

pub fn parse_tz(name: &str) -> Option<Tz> {
    name.trim().parse::<Tz>().ok()
}
