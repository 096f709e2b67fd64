mod availability;
mod error;
mod normalize;
mod queries;
#[cfg(test)]
mod tests;

pub use availability::{
    Exclusion, aggregate, group_events_by_date, index_by_date, slot_key, sort_events, sort_slots,
};
pub use error::EngineError;
pub use normalize::{assigned_ref, normalize};
pub use queries::{AvailabilityByDate, BookingsByDate};

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::cache::CacheLayer;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::fetch::{FetchPolicy, Paged, PagedFetcher};
use crate::limits::PREFETCH_QUEUE;
use crate::model::*;
use crate::prefetch::run_prefetcher;
use crate::reconcile::ReconcilePolicy;
use crate::timezone::{TimezoneResolver, http_chain};
use crate::upstream::{
    AssignmentSource, BookingQuery, BookingSource, CatalogSource, CommerceClient, UpstreamError,
};

/// The three upstream roles. One HTTP client usually plays all of them.
#[derive(Clone)]
pub struct Upstreams {
    pub bookings: Arc<dyn BookingSource>,
    pub catalog: Arc<dyn CatalogSource>,
    pub assignments: Arc<dyn AssignmentSource>,
}

impl Upstreams {
    pub fn from_client(client: CommerceClient) -> Self {
        let client = Arc::new(client);
        Self {
            bookings: client.clone(),
            catalog: client.clone(),
            assignments: client,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub fetch: FetchPolicy,
    pub booking_ttl: Duration,
    pub product_ttl: Duration,
    pub stale_grace: Duration,
    pub reconcile: ReconcilePolicy,
    pub prefetch: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            fetch: FetchPolicy::default(),
            booking_ttl: Duration::from_secs(300),
            product_ttl: Duration::from_secs(86_400),
            stale_grace: Duration::from_secs(60),
            reconcile: ReconcilePolicy::default(),
            prefetch: true,
        }
    }
}

type ProductLookup = Result<Option<ProductMeta>, UpstreamError>;
type AssignmentKey = (String, BookingQuery);

/// Cached access to the upstreams. Cheap to clone; clones share caches.
#[derive(Clone)]
pub(crate) struct Core {
    upstreams: Upstreams,
    fetcher: PagedFetcher,
    pub(crate) bookings: CacheLayer<BookingQuery, Paged<RawBookingRecord>>,
    products: CacheLayer<ProductId, ProductLookup>,
    assignments: CacheLayer<AssignmentKey, Paged<RawAssignment>>,
}

impl Core {
    fn new(upstreams: Upstreams, options: &EngineOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            upstreams,
            fetcher: PagedFetcher::new(options.fetch),
            bookings: CacheLayer::new("bookings", options.booking_ttl, clock.clone())
                .with_admission(|paged: &Paged<RawBookingRecord>| paged.completeness.is_cacheable()),
            products: CacheLayer::new("products", options.product_ttl, clock.clone())
                .with_admission(|lookup: &ProductLookup| lookup.is_ok()),
            assignments: CacheLayer::new("assignments", options.booking_ttl, clock)
                .with_admission(|paged: &Paged<RawAssignment>| paged.completeness.is_cacheable()),
        }
    }

    /// Every booking in the window, any status.
    pub(crate) async fn load_bookings(&self, query: BookingQuery) -> Paged<RawBookingRecord> {
        let source = Arc::clone(&self.upstreams.bookings);
        let fetcher = self.fetcher;
        let q = query.clone();
        self.bookings
            .get_or_load(query, move || async move {
                fetcher
                    .fetch_all("bookings", |page, per_page| {
                        let source = Arc::clone(&source);
                        let q = q.clone();
                        async move { source.bookings_page(&q, page, per_page).await }
                    })
                    .await
            })
            .await
    }

    async fn load_assignments(&self, subject_id: &str, query: BookingQuery) -> Paged<RawAssignment> {
        let source = Arc::clone(&self.upstreams.assignments);
        let fetcher = self.fetcher;
        let subject = subject_id.to_string();
        let key = (subject.clone(), query.clone());
        self.assignments
            .get_or_load(key, move || async move {
                fetcher
                    .fetch_all("assignments", |page, per_page| {
                        let source = Arc::clone(&source);
                        let subject = subject.clone();
                        let q = query.clone();
                        async move { source.assignments_page(&subject, &q, page, per_page).await }
                    })
                    .await
            })
            .await
    }

    /// Metadata for each id. Lookups that fail or find nothing yield an
    /// unknown capacity; failures are retried by the next caller.
    async fn load_products(&self, ids: BTreeSet<ProductId>) -> HashMap<ProductId, ProductMeta> {
        let lookups = ids.into_iter().map(|id| {
            let source = Arc::clone(&self.upstreams.catalog);
            let wanted = id.clone();
            async move {
                let lookup = self
                    .products
                    .get_or_load(id.clone(), move || async move { source.product(&wanted).await })
                    .await;
                (id, lookup)
            }
        });
        join_all(lookups)
            .await
            .into_iter()
            .map(|(id, lookup)| {
                let meta = match lookup {
                    Ok(Some(meta)) => meta,
                    Ok(None) => ProductMeta::unknown(&id),
                    Err(e) => {
                        debug!("product {id} lookup failed: {e}");
                        ProductMeta::unknown(&id)
                    }
                };
                (id, meta)
            })
            .collect()
    }
}

pub struct Engine {
    /// `None` when no booking store is configured; every read then answers
    /// an empty, unavailable envelope.
    pub(super) core: Option<Core>,
    pub(super) availability: CacheLayer<queries::AvailabilityKey, queries::BuiltAvailability>,
    pub(super) timezone: Arc<TimezoneResolver>,
    pub(super) reconcile: ReconcilePolicy,
    pub(super) prefetch_tx: Option<mpsc::Sender<BookingQuery>>,
}

impl Engine {
    /// Build the engine. With prefetch enabled a background worker is
    /// spawned, so this must run inside a tokio runtime.
    pub fn new(
        upstreams: Option<Upstreams>,
        timezone: Arc<TimezoneResolver>,
        options: EngineOptions,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let core = upstreams.map(|u| Core::new(u, &options, clock.clone()));

        let prefetch_tx = match (&core, options.prefetch) {
            (Some(core), true) => {
                let (tx, rx) = mpsc::channel(PREFETCH_QUEUE);
                tokio::spawn(run_prefetcher(core.clone(), rx));
                Some(tx)
            }
            _ => None,
        };

        let availability = CacheLayer::new("availability", options.booking_ttl, clock)
            .with_stale_grace(options.stale_grace)
            .with_admission(|built: &queries::BuiltAvailability| {
                built.completeness.is_cacheable()
            });

        Arc::new(Self {
            core,
            availability,
            timezone,
            reconcile: options.reconcile,
            prefetch_tx,
        })
    }

    /// Wire the HTTP upstreams and timezone chain described by `config`.
    pub fn from_config(config: &Config) -> Arc<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let client = reqwest::Client::builder()
            .timeout(config.fetch.page_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let upstreams = config.commerce_url.as_deref().map(|url| {
            Upstreams::from_client(CommerceClient::with_client(
                client.clone(),
                url,
                config.credentials.clone(),
            ))
        });
        if upstreams.is_none() {
            info!("no booking store configured; queries will report unavailable");
        }

        let commerce = match (&config.commerce_url, &config.credentials) {
            (Some(url), Some(credentials)) => Some((url.as_str(), credentials)),
            _ => None,
        };
        let sources = http_chain(
            &client,
            config.timezone_override.as_deref(),
            config.content_url.as_deref(),
            commerce,
        );
        let timezone = Arc::new(TimezoneResolver::new(
            sources,
            config.default_timezone,
            config.timezone_ttl,
            config.timezone_timeout,
            clock.clone(),
        ));

        Self::new(upstreams, timezone, config.engine_options(), clock)
    }

    pub fn is_configured(&self) -> bool {
        self.core.is_some()
    }

    /// Forget cached bookings, availability and the resolved timezone.
    /// Product metadata is kept.
    pub fn invalidate(&self) {
        if let Some(core) = &self.core {
            core.bookings.clear();
            core.assignments.clear();
        }
        self.availability.clear();
        self.timezone.invalidate();
    }
}
