use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use chrono::NaiveDate;
use chrono_tz::Tz;
use tracing::debug;

use crate::limits::*;
use crate::model::*;
use crate::observability::{PREFETCH_TOTAL, QUERIES_TOTAL, QUERY_DURATION_SECONDS, status_label};
use crate::reconcile::filter_by_assignment;
use crate::time::local_midnight;
use crate::timezone::TimezoneContext;
use crate::upstream::BookingQuery;

use super::availability::{aggregate, group_events_by_date, index_by_date, slot_key, sort_events};
use super::normalize::{assigned_ref, normalize};
use super::{Core, Engine, EngineError};

pub type AvailabilityByDate = BTreeMap<DateKey, Vec<AvailabilitySlot>>;
pub type BookingsByDate = BTreeMap<DateKey, Vec<NormalizedBookingEvent>>;

/// A built availability answer with the completeness of the bookings
/// behind it, so caching follows the same rule as the booking store.
#[derive(Debug, Clone)]
pub(crate) struct BuiltAvailability {
    pub(crate) envelope: Envelope<AvailabilityByDate>,
    pub(crate) completeness: Completeness,
}

const NOT_CONFIGURED: &str = "booking store not configured";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct AvailabilityKey {
    query: BookingQuery,
    timezone: String,
    /// Sorted, de-duplicated.
    products: Vec<ProductId>,
}

pub(super) fn validate_window(start: NaiveDate, end: NaiveDate) -> Result<DateWindow, EngineError> {
    if start > end {
        return Err(EngineError::InvalidRange { start, end });
    }
    let window = DateWindow::new(start, end);
    if window.days() > MAX_QUERY_DAYS {
        return Err(EngineError::LimitExceeded("date range longer than 93 days"));
    }
    Ok(window)
}

/// UTC window `[start 00:00, end+1 00:00)` of local dates in `tz`.
pub(super) fn window_query(window: &DateWindow, tz: &Tz) -> BookingQuery {
    let from = local_midnight(window.start, tz);
    let to = match window.end.succ_opt() {
        Some(next) => local_midnight(next, tz),
        None => from + window.days() * DAY_MS,
    };
    BookingQuery::new(from, to)
}

/// Normalize and keep events starting inside the window. Events with an
/// unknown start are kept for the caller to exclude.
fn normalize_in_window(
    records: &[RawBookingRecord],
    query: &BookingQuery,
    tz: &Tz,
) -> Vec<NormalizedBookingEvent> {
    records
        .iter()
        .map(|raw| normalize(raw, tz))
        .filter(|event| event.start.is_none_or(|start| query.contains(start)))
        .collect()
}

async fn build_availability(
    core: Core,
    query: BookingQuery,
    tz: Tz,
    filter: BTreeSet<ProductId>,
) -> BuiltAvailability {
    let paged = core.load_bookings(query.clone()).await;
    let events: Vec<_> = normalize_in_window(&paged.records, &query, &tz)
        .into_iter()
        .filter(|event| {
            filter.is_empty() || event.product_id.as_ref().is_some_and(|p| filter.contains(p))
        })
        .collect();

    let ids: BTreeSet<ProductId> = events
        .iter()
        .filter_map(|event| slot_key(event).ok())
        .map(|(product, _)| product.to_string())
        .collect();
    let products = core.load_products(ids).await;

    let slots = aggregate(&events, &products);
    let by_date = index_by_date(slots.into_values().flatten(), &tz);
    BuiltAvailability {
        envelope: Envelope::from_completeness(by_date, &paged.completeness),
        completeness: paged.completeness,
    }
}

fn record<T>(operation: &'static str, started: Instant, result: &Result<Envelope<T>, EngineError>) {
    let status = match result {
        Ok(env) => status_label(env.unavailable, env.partial),
        Err(_) => "invalid",
    };
    metrics::counter!(QUERIES_TOTAL, "operation" => operation, "status" => status).increment(1);
    metrics::histogram!(QUERY_DURATION_SECONDS, "operation" => operation)
        .record(started.elapsed().as_secs_f64());
}

impl Engine {
    /// The business timezone currently in effect.
    pub async fn timezone(&self) -> TimezoneContext {
        self.timezone.current().await
    }

    /// Slots per local date for `[start, end]`, optionally limited to some
    /// products. Served stale-while-revalidate.
    pub async fn get_availability(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        product_ids: &[ProductId],
    ) -> Result<Envelope<AvailabilityByDate>, EngineError> {
        let started = Instant::now();
        let result = self.availability_inner(start, end, product_ids).await;
        record("availability", started, &result);
        result
    }

    async fn availability_inner(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        product_ids: &[ProductId],
    ) -> Result<Envelope<AvailabilityByDate>, EngineError> {
        let window = validate_window(start, end)?;
        if product_ids.len() > MAX_PRODUCT_FILTER {
            return Err(EngineError::LimitExceeded("more than 100 product ids"));
        }
        let filter: BTreeSet<ProductId> = product_ids
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();

        let Some(core) = &self.core else {
            return Ok(Envelope::unavailable(BTreeMap::new(), NOT_CONFIGURED));
        };
        let ctx = self.timezone.current().await;
        let query = window_query(&window, &ctx.tz);
        let key = AvailabilityKey {
            query: query.clone(),
            timezone: ctx.name.clone(),
            products: filter.iter().cloned().collect(),
        };

        let core = core.clone();
        let tz = ctx.tz;
        let built = self
            .availability
            .get_or_refresh(key, move || build_availability(core, query, tz, filter))
            .await;
        self.queue_prefetch(&window, &tz);
        Ok(built.envelope)
    }

    /// Every booking in `[start, end]`, cancelled ones included, keyed by
    /// local date.
    pub async fn get_aggregated_bookings(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Envelope<BookingsByDate>, EngineError> {
        let started = Instant::now();
        let result = self.bookings_inner(start, end).await;
        record("bookings", started, &result);
        result
    }

    async fn bookings_inner(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Envelope<BookingsByDate>, EngineError> {
        let window = validate_window(start, end)?;
        let Some(core) = &self.core else {
            return Ok(Envelope::unavailable(BTreeMap::new(), NOT_CONFIGURED));
        };
        let ctx = self.timezone.current().await;
        let query = window_query(&window, &ctx.tz);
        let paged = core.load_bookings(query.clone()).await;
        let events = normalize_in_window(&paged.records, &query, &ctx.tz);
        self.queue_prefetch(&window, &ctx.tz);
        Ok(Envelope::from_completeness(
            group_events_by_date(events, &ctx.tz),
            &paged.completeness,
        ))
    }

    /// Non-cancelled bookings in `[start, end]` that the assignment source
    /// links to `subject_id`, ordered by start.
    pub async fn get_assigned_bookings(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        subject_id: &str,
    ) -> Result<Envelope<Vec<NormalizedBookingEvent>>, EngineError> {
        let started = Instant::now();
        let result = self.assigned_inner(start, end, subject_id).await;
        record("assigned", started, &result);
        result
    }

    async fn assigned_inner(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        subject_id: &str,
    ) -> Result<Envelope<Vec<NormalizedBookingEvent>>, EngineError> {
        let window = validate_window(start, end)?;
        let subject = subject_id.trim();
        if subject.is_empty() {
            return Err(EngineError::InvalidSubject);
        }
        if subject.len() > MAX_SUBJECT_ID_LEN {
            return Err(EngineError::LimitExceeded("subject id too long"));
        }
        let Some(core) = &self.core else {
            return Ok(Envelope::unavailable(Vec::new(), NOT_CONFIGURED));
        };

        let ctx = self.timezone.current().await;
        let query = window_query(&window, &ctx.tz);
        let (bookings, assignments) = tokio::join!(
            core.load_bookings(query.clone()),
            core.load_assignments(subject, query.clone()),
        );

        let refs: Vec<AssignedBookingRef> = assignments
            .records
            .iter()
            .map(|raw| assigned_ref(raw, &ctx.tz))
            .collect();
        let events: Vec<_> = normalize_in_window(&bookings.records, &query, &ctx.tz)
            .into_iter()
            .filter(|event| event.status.consumes_capacity())
            .collect();
        let mut matched = filter_by_assignment(events, &refs, &self.reconcile, &ctx.tz);
        sort_events(&mut matched);

        let completeness = bookings.completeness.worst(assignments.completeness);
        Ok(Envelope::from_completeness(matched, &completeness))
    }

    /// Queue the equal-length windows on either side of a long query.
    fn queue_prefetch(&self, window: &DateWindow, tz: &Tz) {
        let Some(tx) = &self.prefetch_tx else { return };
        if window.days() < PREFETCH_MIN_DAYS {
            return;
        }
        for neighbour in [window.preceding(), window.following()].into_iter().flatten() {
            if let Err(e) = tx.try_send(window_query(&neighbour, tz)) {
                debug!("prefetch request dropped: {e}");
                metrics::counter!(PREFETCH_TOTAL, "outcome" => "dropped").increment(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn window_validation() {
        assert!(validate_window(d("2024-06-01"), d("2024-06-01")).is_ok());
        assert_eq!(
            validate_window(d("2024-06-02"), d("2024-06-01")),
            Err(EngineError::InvalidRange {
                start: d("2024-06-02"),
                end: d("2024-06-01")
            })
        );
        assert!(validate_window(d("2024-01-01"), d("2024-04-02")).is_ok());
        assert!(matches!(
            validate_window(d("2024-01-01"), d("2024-04-03")),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn window_spans_local_midnights() {
        let window = DateWindow::new(d("2024-03-09"), d("2024-03-10"));
        let q = window_query(&window, &chrono_tz::America::New_York);
        // 2024-03-09T05:00Z (EST) to 2024-03-11T04:00Z (EDT): one hour short
        // of two days across spring-forward.
        assert_eq!(q.from, 1_709_960_400_000);
        assert_eq!(q.to, 1_710_129_600_000);
        assert_eq!(q.to - q.from, 2 * DAY_MS - HOUR_MS);
    }
}
