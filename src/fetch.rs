//! Bounded pagination over an upstream listing.
//!
//! Pages are requested until one comes back short or the page ceiling is
//! reached. A failing page ends the walk and whatever was read so far is
//! returned with its [`Completeness`].

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::model::Completeness;
use crate::observability::FETCH_INCOMPLETE_TOTAL;
use crate::upstream::UpstreamError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPolicy {
    pub page_size: u32,
    /// Hard ceiling against a misbehaving upstream; results past it are dropped.
    pub max_pages: u32,
    pub page_timeout: Duration,
    /// One immediate retry of page 1 on a transient error.
    pub retry_first_page: bool,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_pages: 5,
            page_timeout: Duration::from_secs(5),
            retry_first_page: true,
        }
    }
}

/// One upstream page. `raw_len` counts the items the upstream sent,
/// including any that failed to decode.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub raw_len: usize,
    pub records: Vec<T>,
}

impl<T> Page<T> {
    pub fn from_records(records: Vec<T>) -> Self {
        Self {
            raw_len: records.len(),
            records,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Paged<T> {
    pub records: Vec<T>,
    /// Pages that succeeded.
    pub pages: u32,
    pub completeness: Completeness,
}

impl<T> Paged<T> {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            records: Vec::new(),
            pages: 0,
            completeness: Completeness::Unavailable {
                reason: reason.into(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PagedFetcher {
    policy: FetchPolicy,
}

impl PagedFetcher {
    pub fn new(policy: FetchPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Walk pages `1..=max_pages` through `fetch_page(page, per_page)`.
    /// A page is the last one when the upstream sent fewer than `per_page`
    /// items, whatever survived decoding.
    pub async fn fetch_all<T, F, Fut>(&self, label: &str, mut fetch_page: F) -> Paged<T>
    where
        F: FnMut(u32, u32) -> Fut,
        Fut: Future<Output = Result<Page<T>, UpstreamError>>,
    {
        let per_page = self.policy.page_size.max(1);
        let mut records = Vec::new();

        for page in 1..=self.policy.max_pages.max(1) {
            let mut result = self.timed(fetch_page(page, per_page)).await;
            if page == 1
                && self.policy.retry_first_page
                && let Err(e) = &result
                && e.is_transient()
            {
                debug!("{label}: retrying first page after {e}");
                result = self.timed(fetch_page(page, per_page)).await;
            }

            match result {
                Ok(batch) => {
                    let short = batch.raw_len < per_page as usize;
                    records.extend(batch.records);
                    if short {
                        return Paged {
                            records,
                            pages: page,
                            completeness: Completeness::Complete,
                        };
                    }
                }
                Err(e) => {
                    warn!("{label}: page {page} failed ({e}); keeping {} records", records.len());
                    metrics::counter!(FETCH_INCOMPLETE_TOTAL, "reason" => "failure").increment(1);
                    let completeness = if page == 1 {
                        Completeness::Unavailable {
                            reason: e.to_string(),
                        }
                    } else {
                        Completeness::Partial {
                            failed_page: page,
                            reason: e.to_string(),
                        }
                    };
                    return Paged {
                        records,
                        pages: page - 1,
                        completeness,
                    };
                }
            }
        }

        let pages = self.policy.max_pages.max(1);
        warn!("{label}: stopped at the {pages}-page ceiling; results may be truncated");
        metrics::counter!(FETCH_INCOMPLETE_TOTAL, "reason" => "ceiling").increment(1);
        Paged {
            records,
            pages,
            completeness: Completeness::Truncated { pages },
        }
    }

    async fn timed<T, Fut>(&self, fut: Fut) -> Result<T, UpstreamError>
    where
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        tokio::time::timeout(self.policy.page_timeout, fut)
            .await
            .unwrap_or(Err(UpstreamError::Timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> FetchPolicy {
        FetchPolicy {
            page_size: 3,
            max_pages: 4,
            page_timeout: Duration::from_millis(50),
            retry_first_page: true,
        }
    }

    fn page_of(page: u32, n: usize) -> Page<u32> {
        Page::from_records((0..n as u32).map(|i| page * 100 + i).collect())
    }

    #[tokio::test]
    async fn stops_on_short_page() {
        let fetcher = PagedFetcher::new(policy());
        let calls = Arc::new(AtomicU32::new(0));
        let paged = fetcher
            .fetch_all("t", |page, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok(page_of(page, if page < 2 { 3 } else { 1 })) }
            })
            .await;
        assert_eq!(paged.records, vec![100, 101, 102, 200]);
        assert_eq!(paged.pages, 2);
        assert_eq!(paged.completeness, Completeness::Complete);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn undecodable_items_do_not_shorten_a_full_page() {
        let fetcher = PagedFetcher::new(policy());
        let calls = Arc::new(AtomicU32::new(0));
        let paged = fetcher
            .fetch_all("t", |page, per| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if page == 1 {
                        // Three items sent, one lost in decoding.
                        Ok(Page {
                            raw_len: per as usize,
                            records: vec![100, 102],
                        })
                    } else {
                        Ok(page_of(page, 1))
                    }
                }
            })
            .await;
        assert_eq!(paged.records, vec![100, 102, 200]);
        assert_eq!(paged.pages, 2);
        assert_eq!(paged.completeness, Completeness::Complete);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn empty_first_page_is_complete() {
        let fetcher = PagedFetcher::new(policy());
        let paged: Paged<u32> = tokio_test::block_on(
            fetcher.fetch_all("t", |_, _| async { Ok(Page::from_records(vec![])) }),
        );
        assert!(paged.records.is_empty());
        assert_eq!(paged.completeness, Completeness::Complete);
        assert_eq!(paged.pages, 1);
    }

    #[tokio::test]
    async fn ceiling_flags_truncation() {
        let fetcher = PagedFetcher::new(policy());
        let paged = fetcher
            .fetch_all("t", |page, per| async move { Ok(page_of(page, per as usize)) })
            .await;
        assert_eq!(paged.records.len(), 12);
        assert_eq!(paged.completeness, Completeness::Truncated { pages: 4 });
    }

    #[tokio::test]
    async fn timeout_on_second_page_keeps_first() {
        let fetcher = PagedFetcher::new(policy());
        let paged = fetcher
            .fetch_all("t", |page, per| async move {
                if page == 2 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok(page_of(page, per as usize))
            })
            .await;
        assert_eq!(paged.records, vec![100, 101, 102]);
        assert_eq!(paged.pages, 1);
        assert!(matches!(
            paged.completeness,
            Completeness::Partial { failed_page: 2, .. }
        ));
    }

    #[tokio::test]
    async fn server_error_on_later_page_keeps_earlier() {
        let fetcher = PagedFetcher::new(policy());
        let paged = fetcher
            .fetch_all("t", |page, per| async move {
                if page == 3 {
                    Err(UpstreamError::Status(502))
                } else {
                    Ok(page_of(page, per as usize))
                }
            })
            .await;
        assert_eq!(paged.records.len(), 6);
        assert!(matches!(paged.completeness, Completeness::Partial { failed_page: 3, .. }));
    }

    #[tokio::test]
    async fn first_page_retried_once() {
        let fetcher = PagedFetcher::new(policy());
        let calls = Arc::new(AtomicU32::new(0));
        let paged = fetcher
            .fetch_all("t", |page, _| {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(UpstreamError::Transport("reset".into()))
                    } else {
                        Ok(page_of(page, 1))
                    }
                }
            })
            .await;
        assert_eq!(paged.records, vec![100]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn first_page_failure_is_unavailable() {
        let fetcher = PagedFetcher::new(policy());
        let calls = Arc::new(AtomicU32::new(0));
        let paged: Paged<u32> = fetcher
            .fetch_all("t", |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(UpstreamError::Status(401)) }
            })
            .await;
        assert!(paged.records.is_empty());
        assert!(matches!(paged.completeness, Completeness::Unavailable { .. }));
        // 401 is not transient: no retry.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
