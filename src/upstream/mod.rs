//! Boundary to the external booking store.
//!
//! The engine only talks to these traits; `http` holds the REST client
//! used in production and tests substitute in-memory sources.

pub mod http;

use async_trait::async_trait;

use crate::fetch::Page;
use crate::model::*;

pub use http::{CommerceClient, Credentials};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    Timeout,
    Status(u16),
    Transport(String),
    Decode(String),
}

impl UpstreamError {
    /// Worth one immediate retry.
    pub fn is_transient(&self) -> bool {
        match self {
            UpstreamError::Timeout | UpstreamError::Transport(_) => true,
            UpstreamError::Status(code) => *code >= 500,
            UpstreamError::Decode(_) => false,
        }
    }
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamError::Timeout => write!(f, "upstream timed out"),
            UpstreamError::Status(code) => write!(f, "upstream returned HTTP {code}"),
            UpstreamError::Transport(e) => write!(f, "upstream transport error: {e}"),
            UpstreamError::Decode(e) => write!(f, "upstream payload malformed: {e}"),
        }
    }
}

impl std::error::Error for UpstreamError {}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            UpstreamError::Timeout
        } else if e.is_decode() {
            UpstreamError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            UpstreamError::Status(status.as_u16())
        } else {
            UpstreamError::Transport(e.to_string())
        }
    }
}

/// Half-open UTC window `[from, to)` plus an optional status filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BookingQuery {
    pub from: Ms,
    pub to: Ms,
    /// Empty means every status.
    pub statuses: Vec<BookingStatus>,
}

impl BookingQuery {
    pub fn new(from: Ms, to: Ms) -> Self {
        Self {
            from,
            to,
            statuses: Vec::new(),
        }
    }

    pub fn contains(&self, instant: Ms) -> bool {
        self.from <= instant && instant < self.to
    }
}

#[async_trait]
pub trait BookingSource: Send + Sync {
    /// One page (1-based) of bookings overlapping the query window.
    async fn bookings_page(
        &self,
        query: &BookingQuery,
        page: u32,
        per_page: u32,
    ) -> Result<Page<RawBookingRecord>, UpstreamError>;
}

#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// `Ok(None)` when the product does not exist upstream.
    async fn product(&self, product_id: &str) -> Result<Option<ProductMeta>, UpstreamError>;
}

#[async_trait]
pub trait AssignmentSource: Send + Sync {
    /// One page (1-based) of bookings `subject_id` is assigned to.
    async fn assignments_page(
        &self,
        subject_id: &str,
        query: &BookingQuery,
        page: u32,
        per_page: u32,
    ) -> Result<Page<RawAssignment>, UpstreamError>;
}
