/// Longest date range a single query may cover, in days.
pub const MAX_QUERY_DAYS: i64 = 93;

/// Most product ids accepted in one availability filter.
pub const MAX_PRODUCT_FILTER: usize = 100;

pub const MAX_SUBJECT_ID_LEN: usize = 128;

/// Queries at least this long queue their neighbouring windows for prefetch.
pub const PREFETCH_MIN_DAYS: i64 = 7;

/// Pending prefetch requests; further requests are dropped while full.
pub const PREFETCH_QUEUE: usize = 16;
