//! Matching bookings against an independently maintained assignment list.
//!
//! The two sources share no reliable foreign key, so each booking is tried
//! against the assignment list tier by tier and the first tier with any
//! match decides. No match is a normal outcome.

use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::Serialize;

use crate::model::*;
use crate::observability::RECONCILE_MATCHES_TOTAL;
use crate::time::local_date;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    ExactId,
    ProductNearTime,
    ProductSameDay,
    TimeOnly,
}

impl MatchTier {
    pub fn label(&self) -> &'static str {
        match self {
            MatchTier::ExactId => "exact_id",
            MatchTier::ProductNearTime => "product_near_time",
            MatchTier::ProductSameDay => "product_same_day",
            MatchTier::TimeOnly => "time_only",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilePolicy {
    /// Max start distance for a same-product match.
    pub near_window: Ms,
    /// Max start distance when no product linkage exists.
    pub time_only_window: Ms,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            near_window: 6 * HOUR_MS,
            time_only_window: 90 * MINUTE_MS,
        }
    }
}

struct MatchContext<'a> {
    policy: &'a ReconcilePolicy,
    tz: &'a Tz,
}

type Matcher = fn(&NormalizedBookingEvent, &AssignedBookingRef, &MatchContext<'_>) -> bool;

/// Evaluated top to bottom; the first tier with a match wins.
const TIERS: [(MatchTier, Matcher); 4] = [
    (MatchTier::ExactId, exact_id),
    (MatchTier::ProductNearTime, product_near_time),
    (MatchTier::ProductSameDay, product_same_day),
    (MatchTier::TimeOnly, time_only),
];

fn same_product(event: &NormalizedBookingEvent, assigned: &AssignedBookingRef) -> bool {
    matches!((&event.product_id, &assigned.product_id), (Some(a), Some(b)) if a == b)
}

fn start_distance(event: &NormalizedBookingEvent, assigned: &AssignedBookingRef) -> Option<Ms> {
    Some((event.start? - assigned.start?).abs())
}

fn exact_id(event: &NormalizedBookingEvent, assigned: &AssignedBookingRef, _: &MatchContext<'_>) -> bool {
    matches!((&event.id, &assigned.booking_id), (Some(a), Some(b)) if a == b)
}

fn product_near_time(
    event: &NormalizedBookingEvent,
    assigned: &AssignedBookingRef,
    ctx: &MatchContext<'_>,
) -> bool {
    same_product(event, assigned)
        && start_distance(event, assigned).is_some_and(|d| d <= ctx.policy.near_window)
}

fn product_same_day(
    event: &NormalizedBookingEvent,
    assigned: &AssignedBookingRef,
    ctx: &MatchContext<'_>,
) -> bool {
    if !same_product(event, assigned) {
        return false;
    }
    let event_day = event.start.and_then(|s| local_date(s, ctx.tz));
    let assigned_day: Option<NaiveDate> = assigned
        .date
        .or_else(|| assigned.start.and_then(|s| local_date(s, ctx.tz)));
    matches!((event_day, assigned_day), (Some(a), Some(b)) if a == b)
}

/// Last resort, only when one side carries no product at all.
fn time_only(event: &NormalizedBookingEvent, assigned: &AssignedBookingRef, ctx: &MatchContext<'_>) -> bool {
    (event.product_id.is_none() || assigned.product_id.is_none())
        && start_distance(event, assigned).is_some_and(|d| d <= ctx.policy.time_only_window)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub event: NormalizedBookingEvent,
    pub tier: MatchTier,
    /// Index into the assignment list of the ref that matched.
    pub assigned: usize,
}

/// Best tier and the first assignment matching it, if any.
pub fn match_event(
    event: &NormalizedBookingEvent,
    assigned: &[AssignedBookingRef],
    policy: &ReconcilePolicy,
    tz: &Tz,
) -> Option<(MatchTier, usize)> {
    let ctx = MatchContext { policy, tz };
    TIERS.iter().find_map(|(tier, matcher)| {
        assigned
            .iter()
            .position(|a| matcher(event, a, &ctx))
            .map(|idx| (*tier, idx))
    })
}

pub fn reconcile(
    events: Vec<NormalizedBookingEvent>,
    assigned: &[AssignedBookingRef],
    policy: &ReconcilePolicy,
    tz: &Tz,
) -> Vec<Reconciled> {
    if assigned.is_empty() {
        return Vec::new();
    }
    events
        .into_iter()
        .filter_map(|event| {
            let (tier, idx) = match_event(&event, assigned, policy, tz)?;
            metrics::counter!(RECONCILE_MATCHES_TOTAL, "tier" => tier.label()).increment(1);
            Some(Reconciled {
                event,
                tier,
                assigned: idx,
            })
        })
        .collect()
}

/// Events that belong to the assignment list. Order follows the input.
pub fn filter_by_assignment(
    events: Vec<NormalizedBookingEvent>,
    assigned: &[AssignedBookingRef],
    policy: &ReconcilePolicy,
    tz: &Tz,
) -> Vec<NormalizedBookingEvent> {
    reconcile(events, assigned, policy, tz)
        .into_iter()
        .map(|r| r.event)
        .collect()
}
