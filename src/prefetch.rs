use tokio::sync::mpsc;
use tracing::debug;

use crate::engine::Core;
use crate::model::Completeness;
use crate::observability::PREFETCH_TOTAL;
use crate::upstream::BookingQuery;

/// Background task that warms the bookings cache for windows next to the
/// ones users are browsing. Exits when the engine, which owns the only
/// sender, is dropped. Failures are counted and otherwise ignored.
pub(crate) async fn run_prefetcher(core: Core, mut rx: mpsc::Receiver<BookingQuery>) {
    while let Some(query) = rx.recv().await {
        let outcome = prefetch_one(&core, query).await;
        metrics::counter!(PREFETCH_TOTAL, "outcome" => outcome).increment(1);
    }
    debug!("prefetch worker stopped");
}

async fn prefetch_one(core: &Core, query: BookingQuery) -> &'static str {
    if core.bookings.get(&query).is_some() {
        return "cached";
    }
    let (from, to) = (query.from, query.to);
    let paged = core.load_bookings(query).await;
    match paged.completeness {
        Completeness::Complete | Completeness::Truncated { .. } => "fetched",
        Completeness::Partial { reason, .. } | Completeness::Unavailable { reason } => {
            debug!("prefetch of [{from}, {to}) incomplete: {reason}");
            "failed"
        }
    }
}
