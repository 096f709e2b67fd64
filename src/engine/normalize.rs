use chrono::NaiveDate;
use chrono_tz::Tz;
use serde_json::Value;

use crate::model::*;
use crate::time::{participant_count, to_utc_millis};

/// Derive the normalized view of one upstream record.
///
/// Unreadable times become `None`; an end before the start is dropped
/// rather than trusted.
pub fn normalize(raw: &RawBookingRecord, tz: &Tz) -> NormalizedBookingEvent {
    let start = to_utc_millis(&raw.start, tz);
    let end = to_utc_millis(&raw.end, tz).filter(|end| start.is_none_or(|start| *end >= start));
    NormalizedBookingEvent {
        id: raw.id.clone(),
        product_id: raw.product_id.clone(),
        order_id: raw.order_id.clone(),
        start,
        end,
        participants: participant_count(&raw.person_counts),
        status: raw.status.clone(),
        customer: raw.customer.clone(),
        customer_id: raw.customer_id.clone(),
        resource_id: raw.resource_id.clone(),
        all_day: raw.all_day,
        meta_data: raw.meta_data.clone(),
        created_at: to_utc_millis(&raw.date_created, tz),
        modified_at: to_utc_millis(&raw.date_modified, tz),
        timezone: tz.name().to_string(),
    }
}

/// Assignment rows carry either a precise start or only a calendar date.
pub fn assigned_ref(raw: &RawAssignment, tz: &Tz) -> AssignedBookingRef {
    let date_only = match &raw.start {
        Value::String(s) => parse_date(s),
        _ => None,
    };
    let start = match date_only {
        Some(_) => None,
        None => to_utc_millis(&raw.start, tz),
    };
    AssignedBookingRef {
        booking_id: raw.booking_id.clone(),
        product_id: raw.product_id.clone(),
        start,
        date: date_only.or_else(|| raw.date.as_deref().and_then(parse_date)),
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if s.len() != 10 {
        return None;
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(v: Value) -> RawBookingRecord {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn normalizes_mixed_record() {
        let tz = chrono_tz::America::New_York;
        let event = normalize(
            &raw(json!({
                "id": 10,
                "product_id": 88,
                "start": "2024-06-01 09:00",
                "end": 1_717_250_400,
                "person_counts": [2, "3"],
                "status": "confirmed",
                "customer_id": 311,
                "date_created": "2024-05-20T10:00:00Z",
                "meta_data": [{"key": "boat", "value": "Manta"}]
            })),
            &tz,
        );
        assert_eq!(event.start, Some(1_717_246_800_000));
        assert_eq!(event.end, Some(1_717_250_400_000));
        assert_eq!(event.participants, 5);
        assert_eq!(event.created_at, Some(1_716_199_200_000));
        assert_eq!(event.timezone, "America/New_York");
        assert_eq!(event.customer_id.as_deref(), Some("311"));
        assert_eq!(event.meta_data[0]["value"], "Manta");
    }

    #[test]
    fn end_before_start_is_dropped() {
        let event = normalize(
            &raw(json!({"start": 1_717_250_400, "end": 1_717_246_800})),
            &chrono_tz::UTC,
        );
        assert_eq!(event.start, Some(1_717_250_400_000));
        assert_eq!(event.end, None);
    }

    #[test]
    fn unreadable_start_stays_unknown() {
        let event = normalize(&raw(json!({"start": "soon", "person_counts": null})), &chrono_tz::UTC);
        assert_eq!(event.start, None);
        assert_eq!(event.participants, 1);
    }

    #[test]
    fn assignment_date_only_start() {
        let a: RawAssignment =
            serde_json::from_value(json!({"booking_id": "", "product_id": 4, "start": "2024-06-02"}))
                .unwrap();
        let r = assigned_ref(&a, &chrono_tz::UTC);
        assert_eq!(r.booking_id, None);
        assert_eq!(r.start, None);
        assert_eq!(r.date, NaiveDate::from_ymd_opt(2024, 6, 2));

        let a: RawAssignment =
            serde_json::from_value(json!({"booking_id": 7, "start": "2024-06-02 10:00"})).unwrap();
        let r = assigned_ref(&a, &chrono_tz::UTC);
        assert_eq!(r.start, Some(1_717_322_400_000));
        assert_eq!(r.date, None);
    }
}
