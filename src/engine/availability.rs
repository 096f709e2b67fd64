use std::collections::{BTreeMap, HashMap};

use chrono_tz::Tz;
use tracing::debug;

use crate::model::*;
use crate::observability::RECORDS_EXCLUDED_TOTAL;
use crate::time::{date_key, local_date};

// ── Slot Aggregation ─────────────────────────────────────────────

/// Why an event does not take part in aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclusion {
    NoStart,
    NoProduct,
    Cancelled,
}

impl Exclusion {
    pub fn label(&self) -> &'static str {
        match self {
            Exclusion::NoStart => "no_start",
            Exclusion::NoProduct => "no_product",
            Exclusion::Cancelled => "cancelled",
        }
    }
}

/// Slot key of an event, or why it has none.
pub fn slot_key(event: &NormalizedBookingEvent) -> Result<(&str, Ms), Exclusion> {
    let start = event.start.ok_or(Exclusion::NoStart)?;
    let product = event.product_id.as_deref().ok_or(Exclusion::NoProduct)?;
    if !event.status.consumes_capacity() {
        return Err(Exclusion::Cancelled);
    }
    Ok((product, start))
}

struct SlotAccumulator {
    end: Ms,
    used: u32,
}

/// Group events on exact `(product, start)` and fold each group into a slot.
///
/// `used` sums participants, `end` is the latest end seen (the start when no
/// event carries one). Capacity and name come from `products`; a product
/// missing there gets an unknown capacity, not zero. Each product's slots
/// are ordered by start.
pub fn aggregate(
    events: &[NormalizedBookingEvent],
    products: &HashMap<ProductId, ProductMeta>,
) -> BTreeMap<ProductId, Vec<AvailabilitySlot>> {
    let mut groups: BTreeMap<(&str, Ms), SlotAccumulator> = BTreeMap::new();
    for event in events {
        let (product, start) = match slot_key(event) {
            Ok(key) => key,
            Err(reason) => {
                debug!(
                    "booking {:?} left out of availability: {}",
                    event.id,
                    reason.label()
                );
                metrics::counter!(RECORDS_EXCLUDED_TOTAL, "reason" => reason.label()).increment(1);
                continue;
            }
        };
        let end = event.end.unwrap_or(start).max(start);
        let acc = groups.entry((product, start)).or_insert(SlotAccumulator { end, used: 0 });
        acc.used = acc.used.saturating_add(event.participants);
        acc.end = acc.end.max(end);
    }

    let mut by_product: BTreeMap<ProductId, Vec<AvailabilitySlot>> = BTreeMap::new();
    for ((product, start), acc) in groups {
        let meta = products.get(product);
        let slot = AvailabilitySlot {
            product_id: product.to_string(),
            product_name: meta.map_or_else(
                || ProductMeta::unknown(product).display_name(),
                ProductMeta::display_name,
            ),
            start,
            end: acc.end,
            used: acc.used,
            total: meta.and_then(|m| m.capacity),
        };
        by_product.entry(slot.product_id.clone()).or_default().push(slot);
    }
    by_product
}

/// Display order: start, then product name, then product id.
pub fn sort_slots(slots: &mut [AvailabilitySlot]) {
    slots.sort_by(|a, b| {
        a.start
            .cmp(&b.start)
            .then_with(|| a.product_name.cmp(&b.product_name))
            .then_with(|| a.product_id.cmp(&b.product_id))
    });
}

/// Re-key slots by the local calendar date of their start.
pub fn index_by_date(
    slots: impl IntoIterator<Item = AvailabilitySlot>,
    tz: &Tz,
) -> BTreeMap<DateKey, Vec<AvailabilitySlot>> {
    let mut by_date: BTreeMap<DateKey, Vec<AvailabilitySlot>> = BTreeMap::new();
    for slot in slots {
        if let Some(date) = local_date(slot.start, tz) {
            by_date.entry(date_key(date)).or_default().push(slot);
        }
    }
    for day in by_date.values_mut() {
        sort_slots(day);
    }
    by_date
}

/// Events keyed by local calendar date, each day ordered by start then id.
/// Events without a start cannot be placed on a day and are left out.
pub fn group_events_by_date(
    events: Vec<NormalizedBookingEvent>,
    tz: &Tz,
) -> BTreeMap<DateKey, Vec<NormalizedBookingEvent>> {
    let mut by_date: BTreeMap<DateKey, Vec<NormalizedBookingEvent>> = BTreeMap::new();
    for event in events {
        let Some(date) = event.start.and_then(|s| local_date(s, tz)) else {
            metrics::counter!(RECORDS_EXCLUDED_TOTAL, "reason" => Exclusion::NoStart.label())
                .increment(1);
            continue;
        };
        by_date.entry(date_key(date)).or_default().push(event);
    }
    for day in by_date.values_mut() {
        sort_events(day);
    }
    by_date
}

pub fn sort_events(events: &mut [NormalizedBookingEvent]) {
    events.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.id.cmp(&b.id)));
}
