use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Unix milliseconds. The only instant type.
pub type Ms = i64;

/// Upstream product identifier, normalized to its string form.
pub type ProductId = String;

/// Local calendar date rendered as `YYYY-MM-DD`.
pub type DateKey = String;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 86_400_000;

// ── Upstream (raw) shapes ────────────────────────────────────────

/// Booking lifecycle state as reported by the upstream store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BookingStatus {
    Confirmed,
    #[default]
    Pending,
    Cancelled,
    Completed,
    Other(String),
}

impl BookingStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "confirmed" | "paid" => BookingStatus::Confirmed,
            "pending" | "unpaid" | "pending-confirmation" | "in-cart" => BookingStatus::Pending,
            "cancelled" | "canceled" => BookingStatus::Cancelled,
            "complete" | "completed" => BookingStatus::Completed,
            other => BookingStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Pending => "pending",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
            BookingStatus::Other(s) => s,
        }
    }

    /// Whether a booking in this state occupies capacity.
    pub fn consumes_capacity(&self) -> bool {
        !matches!(self, BookingStatus::Cancelled)
    }
}

impl From<String> for BookingStatus {
    fn from(raw: String) -> Self {
        BookingStatus::parse(&raw)
    }
}

impl From<BookingStatus> for String {
    fn from(status: BookingStatus) -> Self {
        status.as_str().to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerSnippet {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

/// One booking exactly as the upstream listing returned it.
///
/// Time fields stay as raw JSON: the same upstream may send epoch seconds,
/// epoch millis, naive local strings or ISO strings with an offset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawBookingRecord {
    #[serde(default, deserialize_with = "loose_id")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "loose_id")]
    pub product_id: Option<ProductId>,
    #[serde(default, deserialize_with = "loose_id")]
    pub order_id: Option<String>,
    #[serde(default)]
    pub start: Value,
    #[serde(default)]
    pub end: Value,
    /// Number, array of numbers, or category → number object.
    #[serde(default)]
    pub person_counts: Value,
    #[serde(default, deserialize_with = "loose_status")]
    pub status: BookingStatus,
    #[serde(default, deserialize_with = "loose_customer")]
    pub customer: Option<CustomerSnippet>,
    #[serde(default, deserialize_with = "loose_id")]
    pub customer_id: Option<String>,
    #[serde(default, deserialize_with = "loose_id")]
    pub resource_id: Option<String>,
    #[serde(default, deserialize_with = "loose_bool")]
    pub all_day: bool,
    #[serde(default)]
    pub date_created: Value,
    #[serde(default)]
    pub date_modified: Value,
    #[serde(default)]
    pub meta_data: Value,
}

/// One row from the staff assignment source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawAssignment {
    #[serde(default, deserialize_with = "loose_id")]
    pub booking_id: Option<String>,
    #[serde(default, deserialize_with = "loose_id")]
    pub product_id: Option<ProductId>,
    #[serde(default)]
    pub start: Value,
    #[serde(default, deserialize_with = "loose_text")]
    pub date: Option<String>,
}

/// Identifiers arrive as numbers or strings; `0` and `""` mean "none".
fn loose_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty() && s != "0").then(|| s.to_string())
        }
        Value::Number(n) => (n.as_i64() != Some(0)).then(|| n.to_string()),
        _ => None,
    })
}

/// A missing or null status reads as pending; a non-string one is kept verbatim.
fn loose_status<'de, D>(deserializer: D) -> Result<BookingStatus, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => BookingStatus::parse(&s),
        Value::Null => BookingStatus::default(),
        other => BookingStatus::Other(other.to_string()),
    })
}

/// Trimmed string, or `None` for blanks and any non-string value.
fn loose_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        _ => None,
    })
}

fn loose_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Bool(b) => b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        _ => false,
    })
}

/// A customer that is not an object (a bare name, an id) degrades to a name-only snippet.
fn loose_customer<'de, D>(deserializer: D) -> Result<Option<CustomerSnippet>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Object(_) => serde_json::from_value(value).ok(),
        Value::String(name) if !name.trim().is_empty() => Some(CustomerSnippet {
            name: Some(name.trim().to_string()),
            ..CustomerSnippet::default()
        }),
        _ => None,
    })
}

// ── Derived shapes ───────────────────────────────────────────────

/// Immutable, normalized view of one [`RawBookingRecord`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedBookingEvent {
    pub id: Option<String>,
    pub product_id: Option<ProductId>,
    pub order_id: Option<String>,
    /// `None` when the upstream start could not be interpreted.
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    /// Always ≥ 1.
    pub participants: u32,
    pub status: BookingStatus,
    pub customer: Option<CustomerSnippet>,
    pub customer_id: Option<String>,
    pub resource_id: Option<String>,
    pub all_day: bool,
    /// Upstream metadata, passed through untouched.
    #[serde(skip_serializing_if = "Value::is_null")]
    pub meta_data: Value,
    pub created_at: Option<Ms>,
    pub modified_at: Option<Ms>,
    /// IANA name of the zone the event should be displayed in.
    pub timezone: String,
}

/// Aggregate over every event sharing `(product_id, start)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailabilitySlot {
    pub product_id: ProductId,
    pub product_name: String,
    pub start: Ms,
    pub end: Ms,
    pub used: u32,
    /// Product capacity; `None` when unknown, never a fabricated zero.
    pub total: Option<u32>,
}

impl AvailabilitySlot {
    pub fn remaining(&self) -> Option<u32> {
        self.total.map(|total| total.saturating_sub(self.used))
    }
}

/// Minimal descriptor of a booking someone is assigned to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignedBookingRef {
    pub booking_id: Option<String>,
    pub product_id: Option<ProductId>,
    pub start: Option<Ms>,
    /// Set when the source only carried a calendar date.
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductMeta {
    pub id: ProductId,
    pub name: Option<String>,
    pub capacity: Option<u32>,
}

impl ProductMeta {
    pub fn unknown(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            capacity: None,
        }
    }

    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => format!("Product {}", self.id),
        }
    }
}

// ── Queries and responses ────────────────────────────────────────

/// Inclusive range of local calendar dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// Number of calendar days covered, counting both ends.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// The window of equal length immediately before this one.
    pub fn preceding(&self) -> Option<Self> {
        let len = chrono::Days::new(self.days().max(1) as u64);
        Some(Self::new(
            self.start.checked_sub_days(len)?,
            self.end.checked_sub_days(len)?,
        ))
    }

    /// The window of equal length immediately after this one.
    pub fn following(&self) -> Option<Self> {
        let len = chrono::Days::new(self.days().max(1) as u64);
        Some(Self::new(
            self.start.checked_add_days(len)?,
            self.end.checked_add_days(len)?,
        ))
    }
}

/// How much of the upstream data a result reflects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completeness {
    Complete,
    /// The page ceiling was hit while pages were still full.
    Truncated { pages: u32 },
    /// A page after the first failed; earlier pages are kept.
    Partial { failed_page: u32, reason: String },
    /// Nothing could be read at all.
    Unavailable { reason: String },
}

impl Completeness {
    fn severity(&self) -> u8 {
        match self {
            Completeness::Complete => 0,
            Completeness::Truncated { .. } => 1,
            Completeness::Partial { .. } => 2,
            Completeness::Unavailable { .. } => 3,
        }
    }

    /// Safe to keep in a cache for the full TTL.
    pub fn is_cacheable(&self) -> bool {
        matches!(self, Completeness::Complete | Completeness::Truncated { .. })
    }

    /// The more degraded of the two.
    pub fn worst(self, other: Completeness) -> Completeness {
        if other.severity() > self.severity() { other } else { self }
    }
}

/// Response wrapper for every downstream operation.
///
/// `unavailable` and `partial` describe degraded-but-valid data; only
/// `success: false` is a hard error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub data: T,
    pub unavailable: bool,
    pub partial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            unavailable: false,
            partial: false,
            message: None,
        }
    }

    pub fn unavailable(data: T, reason: impl Into<String>) -> Self {
        Self {
            success: true,
            data,
            unavailable: true,
            partial: false,
            message: Some(reason.into()),
        }
    }

    pub fn failure(data: T, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data,
            unavailable: false,
            partial: false,
            message: Some(message.into()),
        }
    }

    pub fn from_completeness(data: T, completeness: &Completeness) -> Self {
        match completeness {
            Completeness::Complete => Self::ok(data),
            Completeness::Truncated { pages } => Self {
                partial: true,
                message: Some(format!("upstream results truncated after {pages} pages")),
                ..Self::ok(data)
            },
            Completeness::Partial { failed_page, reason } => Self {
                partial: true,
                message: Some(format!("upstream page {failed_page} failed: {reason}")),
                ..Self::ok(data)
            },
            Completeness::Unavailable { reason } => Self::unavailable(data, reason.clone()),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.unavailable || self.partial
    }
}
