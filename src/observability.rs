use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: downstream operations served. Labels: operation, status.
pub const QUERIES_TOTAL: &str = "tideslot_queries_total";

/// Histogram: downstream operation latency in seconds. Labels: operation.
pub const QUERY_DURATION_SECONDS: &str = "tideslot_query_duration_seconds";

// ── Upstream ─────────────────────────────────────────────────────

/// Counter: upstream HTTP requests. Labels: endpoint, outcome.
pub const UPSTREAM_REQUESTS_TOTAL: &str = "tideslot_upstream_requests_total";

/// Histogram: upstream page latency in seconds.
pub const UPSTREAM_PAGE_DURATION_SECONDS: &str = "tideslot_upstream_page_duration_seconds";

/// Counter: fetches that stopped early. Labels: reason (ceiling, failure).
pub const FETCH_INCOMPLETE_TOTAL: &str = "tideslot_fetch_incomplete_total";

// ── Cache ────────────────────────────────────────────────────────

/// Counter: fresh cache hits. Labels: cache.
pub const CACHE_HITS_TOTAL: &str = "tideslot_cache_hits_total";

/// Counter: misses that started a load. Labels: cache.
pub const CACHE_MISSES_TOTAL: &str = "tideslot_cache_misses_total";

/// Counter: misses that joined a load already in flight. Labels: cache.
pub const CACHE_INFLIGHT_JOINS_TOTAL: &str = "tideslot_cache_inflight_joins_total";

/// Counter: stale entries served during revalidation. Labels: cache.
pub const CACHE_STALE_SERVED_TOTAL: &str = "tideslot_cache_stale_served_total";

// ── Domain ───────────────────────────────────────────────────────

/// Counter: timezone resolutions. Labels: source.
pub const TIMEZONE_RESOLUTIONS_TOTAL: &str = "tideslot_timezone_resolutions_total";

/// Counter: reconciled bookings. Labels: tier.
pub const RECONCILE_MATCHES_TOTAL: &str = "tideslot_reconcile_matches_total";

/// Counter: speculative prefetches. Labels: outcome.
pub const PREFETCH_TOTAL: &str = "tideslot_prefetch_total";

/// Counter: records left out of aggregation. Labels: reason.
pub const RECORDS_EXCLUDED_TOTAL: &str = "tideslot_records_excluded_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map an envelope to the `status` label of [`QUERIES_TOTAL`].
pub fn status_label(unavailable: bool, partial: bool) -> &'static str {
    if unavailable {
        "unavailable"
    } else if partial {
        "partial"
    } else {
        "ok"
    }
}
