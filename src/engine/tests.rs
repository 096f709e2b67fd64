use super::*;

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{Value, json};

use crate::clock::{Clock, ManualClock, SystemClock};
use crate::fetch::Page;
use crate::model::*;
use crate::reconcile::ReconcilePolicy;

const JUNE1_13H: Ms = 1_717_246_800_000;
const JUNE1_15H: Ms = 1_717_254_000_000;
const JUNE1_18H: Ms = 1_717_264_800_000;
const JUNE2_20H: Ms = 1_717_358_400_000;

// ── In-memory upstream ───────────────────────────────────

#[derive(Default)]
struct MockStore {
    bookings: Vec<Value>,
    products: HashMap<String, ProductMeta>,
    assignments: Vec<Value>,
    /// This page answers 502.
    failing_page: Option<u32>,
    delay: Duration,
    booking_calls: AtomicUsize,
    product_calls: AtomicUsize,
    assignment_calls: AtomicUsize,
    queries: Mutex<Vec<BookingQuery>>,
}

fn page_of<T: serde::de::DeserializeOwned>(items: &[Value], page: u32, per_page: u32) -> Page<T> {
    let slice: Vec<&Value> = items
        .iter()
        .skip(((page - 1) * per_page) as usize)
        .take(per_page as usize)
        .collect();
    Page {
        raw_len: slice.len(),
        records: slice
            .into_iter()
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
            .collect(),
    }
}

#[async_trait]
impl BookingSource for MockStore {
    async fn bookings_page(
        &self,
        query: &BookingQuery,
        page: u32,
        per_page: u32,
    ) -> Result<Page<RawBookingRecord>, UpstreamError> {
        self.booking_calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(query.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing_page == Some(page) {
            return Err(UpstreamError::Status(502));
        }
        Ok(page_of(&self.bookings, page, per_page))
    }
}

#[async_trait]
impl CatalogSource for MockStore {
    async fn product(&self, product_id: &str) -> Result<Option<ProductMeta>, UpstreamError> {
        self.product_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.products.get(product_id).cloned())
    }
}

#[async_trait]
impl AssignmentSource for MockStore {
    async fn assignments_page(
        &self,
        _subject_id: &str,
        _query: &BookingQuery,
        page: u32,
        per_page: u32,
    ) -> Result<Page<RawAssignment>, UpstreamError> {
        self.assignment_calls.fetch_add(1, Ordering::SeqCst);
        Ok(page_of(&self.assignments, page, per_page))
    }
}

fn june_bookings() -> Vec<Value> {
    vec![
        json!({"id": 1, "product_id": 88, "start": "2024-06-01 09:00", "end": "2024-06-01 11:00",
               "person_counts": {"adult": 2}, "status": "confirmed"}),
        json!({"id": 2, "product_id": 88, "start": 1_717_246_800, "end": 1_717_254_000,
               "person_counts": 3, "status": "paid"}),
        json!({"id": 3, "product_id": 91, "start": "2024-06-01T14:00:00-04:00",
               "person_counts": [1, 1], "status": "pending"}),
        json!({"id": 4, "product_id": 88, "start": "2024-06-02 09:00", "person_counts": 4,
               "status": "cancelled"}),
        json!({"id": 5, "product_id": 88, "start": "not a date", "person_counts": 1}),
        json!({"id": 6, "product_id": 91, "start": "2024-06-02 16:00", "person_counts": "2",
               "status": "complete"}),
        json!({"id": 7, "product_id": 88, "start": "2024-06-05 09:00", "person_counts": 1}),
    ]
}

fn store() -> MockStore {
    MockStore {
        bookings: june_bookings(),
        products: HashMap::from([(
            "88".to_string(),
            ProductMeta {
                id: "88".into(),
                name: Some("Reef Dive".into()),
                capacity: Some(10),
            },
        )]),
        ..MockStore::default()
    }
}

fn options() -> EngineOptions {
    EngineOptions {
        prefetch: false,
        ..EngineOptions::default()
    }
}

fn engine_with_clock(store: Arc<MockStore>, options: EngineOptions, clock: Arc<dyn Clock>) -> Arc<Engine> {
    let upstreams = Upstreams {
        bookings: store.clone(),
        catalog: store.clone(),
        assignments: store,
    };
    let timezone = Arc::new(TimezoneResolver::fixed(
        chrono_tz::America::New_York,
        clock.clone(),
    ));
    Engine::new(Some(upstreams), timezone, options, clock)
}

fn engine(store: Arc<MockStore>, options: EngineOptions) -> Arc<Engine> {
    engine_with_clock(store, options, Arc::new(SystemClock))
}

fn d(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn ids(events: &[NormalizedBookingEvent]) -> Vec<&str> {
    events.iter().map(|e| e.id.as_deref().unwrap()).collect()
}

// ── Availability ─────────────────────────────────────────

#[tokio::test]
async fn availability_groups_slots_by_local_date() {
    let store = Arc::new(store());
    let engine = engine(store.clone(), options());

    let env = engine.get_availability(d("2024-06-01"), d("2024-06-02"), &[]).await.unwrap();
    assert!(env.success && !env.unavailable && !env.partial);
    assert_eq!(env.data.len(), 2);

    let june1 = &env.data["2024-06-01"];
    assert_eq!(june1.len(), 2);
    assert_eq!(
        june1[0],
        AvailabilitySlot {
            product_id: "88".into(),
            product_name: "Reef Dive".into(),
            start: JUNE1_13H,
            end: JUNE1_15H,
            used: 5,
            total: Some(10),
        }
    );
    assert_eq!(june1[1].start, JUNE1_18H);
    assert_eq!(june1[1].used, 2);

    // Cancelled #4 leaves nothing for product 88 on June 2nd.
    let june2 = &env.data["2024-06-02"];
    assert_eq!(june2.len(), 1);
    assert_eq!(june2[0].product_id, "91");
    assert_eq!(june2[0].start, JUNE2_20H);
}

#[tokio::test]
async fn missing_capacity_yields_null_total() {
    let engine = engine(Arc::new(store()), options());
    let env = engine.get_availability(d("2024-06-01"), d("2024-06-02"), &[]).await.unwrap();
    let slot = &env.data["2024-06-01"][1];
    assert_eq!(slot.product_id, "91");
    assert_eq!(slot.product_name, "Product 91");
    assert_eq!(slot.total, None);
    assert_eq!(slot.used, 2);
}

#[tokio::test]
async fn product_filter_limits_slots() {
    let engine = engine(Arc::new(store()), options());
    let env = engine
        .get_availability(d("2024-06-01"), d("2024-06-02"), &["91".to_string()])
        .await
        .unwrap();
    let products: Vec<_> = env.data.values().flatten().map(|s| s.product_id.as_str()).collect();
    assert_eq!(products, vec!["91", "91"]);
}

#[tokio::test]
async fn concurrent_identical_queries_fetch_once() {
    let store = Arc::new(MockStore {
        delay: Duration::from_millis(50),
        ..store()
    });
    let engine = engine(store.clone(), options());

    let (a, b) = tokio::join!(
        engine.get_availability(d("2024-06-01"), d("2024-06-02"), &[]),
        engine.get_availability(d("2024-06-01"), d("2024-06-02"), &[]),
    );
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(store.booking_calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.product_calls.load(Ordering::SeqCst), 2);

    engine.get_availability(d("2024-06-01"), d("2024-06-02"), &[]).await.unwrap();
    assert_eq!(store.booking_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn bookings_view_reuses_the_availability_fetch() {
    let store = Arc::new(store());
    let engine = engine(store.clone(), options());

    engine.get_availability(d("2024-06-01"), d("2024-06-02"), &[]).await.unwrap();
    let env = engine.get_aggregated_bookings(d("2024-06-01"), d("2024-06-02")).await.unwrap();
    assert_eq!(store.booking_calls.load(Ordering::SeqCst), 1);

    assert_eq!(ids(&env.data["2024-06-01"]), vec!["1", "2", "3"]);
    // Cancelled bookings stay visible here; the undated one does not.
    assert_eq!(ids(&env.data["2024-06-02"]), vec!["4", "6"]);
    assert_eq!(env.data["2024-06-02"][0].status, BookingStatus::Cancelled);
    assert_eq!(env.data["2024-06-01"][0].timezone, "America/New_York");
}

#[tokio::test]
async fn later_page_failure_is_partial_and_not_cached() {
    let store = Arc::new(MockStore {
        failing_page: Some(2),
        ..store()
    });
    let mut opts = options();
    opts.fetch.page_size = 2;
    let engine = engine(store.clone(), opts);

    let env = engine.get_availability(d("2024-06-01"), d("2024-06-02"), &[]).await.unwrap();
    assert!(env.success && env.partial && !env.unavailable);
    assert!(env.message.is_some());
    // Page 1 (#1 and #2) survives.
    assert_eq!(env.data["2024-06-01"].len(), 1);
    assert_eq!(env.data["2024-06-01"][0].used, 5);
    assert_eq!(store.booking_calls.load(Ordering::SeqCst), 2);

    engine.get_availability(d("2024-06-01"), d("2024-06-02"), &[]).await.unwrap();
    assert_eq!(store.booking_calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn truncated_availability_is_cached_like_bookings() {
    let mut opts = options();
    opts.fetch.page_size = 2;
    opts.fetch.max_pages = 1;
    let store = Arc::new(store());
    let engine = engine(store.clone(), opts);

    let env = engine.get_availability(d("2024-06-01"), d("2024-06-02"), &[]).await.unwrap();
    assert!(env.success && env.partial && !env.unavailable);
    assert!(env.message.as_deref().unwrap().contains("truncated"));
    assert_eq!(engine.availability.len(), 1);

    let again = engine.get_availability(d("2024-06-01"), d("2024-06-02"), &[]).await.unwrap();
    assert_eq!(again, env);
    assert_eq!(store.booking_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn first_page_failure_is_unavailable() {
    let store = Arc::new(MockStore {
        failing_page: Some(1),
        ..store()
    });
    let engine = engine(store.clone(), options());

    let env = engine.get_aggregated_bookings(d("2024-06-01"), d("2024-06-02")).await.unwrap();
    assert!(env.success && env.unavailable);
    assert!(env.data.is_empty());
    // One immediate retry of the first page.
    assert_eq!(store.booking_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn not_configured_reports_unavailable() {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let timezone = Arc::new(TimezoneResolver::fixed(chrono_tz::UTC, clock.clone()));
    let engine = Engine::new(None, timezone, EngineOptions::default(), clock);
    assert!(!engine.is_configured());

    let env = engine.get_availability(d("2024-06-01"), d("2024-06-30"), &[]).await.unwrap();
    assert!(env.success && env.unavailable && env.data.is_empty());

    let env = engine.get_aggregated_bookings(d("2024-06-01"), d("2024-06-30")).await.unwrap();
    assert!(env.unavailable && env.data.is_empty());

    let env = engine
        .get_assigned_bookings(d("2024-06-01"), d("2024-06-30"), "17")
        .await
        .unwrap();
    assert!(env.unavailable && env.data.is_empty());
}

#[tokio::test]
async fn invalid_queries_are_errors() {
    let engine = engine(Arc::new(store()), options());

    assert!(matches!(
        engine.get_availability(d("2024-06-02"), d("2024-06-01"), &[]).await,
        Err(EngineError::InvalidRange { .. })
    ));
    assert!(matches!(
        engine.get_aggregated_bookings(d("2024-01-01"), d("2024-12-31")).await,
        Err(EngineError::LimitExceeded(_))
    ));
    let many: Vec<ProductId> = (0..101).map(|i| i.to_string()).collect();
    assert!(matches!(
        engine.get_availability(d("2024-06-01"), d("2024-06-01"), &many).await,
        Err(EngineError::LimitExceeded(_))
    ));
    assert_eq!(
        engine.get_assigned_bookings(d("2024-06-01"), d("2024-06-01"), "  ").await,
        Err(EngineError::InvalidSubject)
    );
}

#[tokio::test]
async fn availability_refreshes_after_ttl() {
    let clock = Arc::new(ManualClock::new(JUNE1_13H));
    let store = Arc::new(store());
    let engine = engine_with_clock(store.clone(), options(), clock.clone());

    engine.get_availability(d("2024-06-01"), d("2024-06-02"), &[]).await.unwrap();
    clock.advance(Duration::from_secs(299));
    engine.get_availability(d("2024-06-01"), d("2024-06-02"), &[]).await.unwrap();
    assert_eq!(store.booking_calls.load(Ordering::SeqCst), 1);

    // Inside the stale grace: served at once, refreshed behind the caller.
    clock.advance(Duration::from_secs(10));
    let env = engine.get_availability(d("2024-06-01"), d("2024-06-02"), &[]).await.unwrap();
    assert_eq!(env.data.len(), 2);
    for _ in 0..100 {
        if store.booking_calls.load(Ordering::SeqCst) == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(store.booking_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn invalidate_forces_refetch() {
    let store = Arc::new(store());
    let engine = engine(store.clone(), options());
    engine.get_aggregated_bookings(d("2024-06-01"), d("2024-06-02")).await.unwrap();
    engine.invalidate();
    engine.get_aggregated_bookings(d("2024-06-01"), d("2024-06-02")).await.unwrap();
    assert_eq!(store.booking_calls.load(Ordering::SeqCst), 2);
}

// ── Assignments ──────────────────────────────────────────

#[tokio::test]
async fn assigned_bookings_are_reconciled() {
    let store = Arc::new(MockStore {
        assignments: vec![
            json!({"booking_id": 3}),
            json!({"product_id": 91, "start": "2024-06-02"}),
            json!({"booking_id": 4}),
        ],
        ..store()
    });
    let engine = engine(store.clone(), options());

    let env = engine
        .get_assigned_bookings(d("2024-06-01"), d("2024-06-02"), "17")
        .await
        .unwrap();
    assert!(env.success && !env.is_degraded());
    // #4 matches by id but is cancelled.
    assert_eq!(ids(&env.data), vec!["3", "6"]);
    assert_eq!(store.assignment_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn assignment_windows_follow_options() {
    let store = Arc::new(MockStore {
        assignments: vec![json!({"start": "2024-06-01 10:00"})],
        ..store()
    });
    let mut opts = options();
    opts.reconcile = ReconcilePolicy {
        near_window: HOUR_MS,
        time_only_window: 30 * MINUTE_MS,
    };
    let engine = engine(store, opts);

    // 09:00 bookings are an hour away: outside the 30 minute time-only window.
    let env = engine
        .get_assigned_bookings(d("2024-06-01"), d("2024-06-01"), "17")
        .await
        .unwrap();
    assert!(env.data.is_empty());
}

// ── Prefetch ─────────────────────────────────────────────

#[tokio::test]
async fn long_queries_prefetch_neighbouring_windows() {
    let store = Arc::new(store());
    let engine = engine(
        store.clone(),
        EngineOptions {
            prefetch: true,
            ..EngineOptions::default()
        },
    );

    engine.get_aggregated_bookings(d("2024-06-01"), d("2024-06-07")).await.unwrap();
    for _ in 0..100 {
        if store.booking_calls.load(Ordering::SeqCst) >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let tz = chrono_tz::America::New_York;
    let mut seen: Vec<Ms> = store.queries.lock().unwrap().iter().map(|q| q.from).collect();
    seen.sort();
    assert_eq!(
        seen,
        vec![
            crate::time::local_midnight(d("2024-05-25"), &tz),
            crate::time::local_midnight(d("2024-06-01"), &tz),
            crate::time::local_midnight(d("2024-06-08"), &tz),
        ]
    );
}

#[tokio::test]
async fn short_queries_do_not_prefetch() {
    let store = Arc::new(store());
    let engine = engine(
        store.clone(),
        EngineOptions {
            prefetch: true,
            ..EngineOptions::default()
        },
    );
    engine.get_aggregated_bookings(d("2024-06-01"), d("2024-06-06")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(store.booking_calls.load(Ordering::SeqCst), 1);
}
