//! REST client for the e-commerce booking store.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::debug;

use crate::fetch::Page;
use crate::model::*;
use crate::observability::{UPSTREAM_PAGE_DURATION_SECONDS, UPSTREAM_REQUESTS_TOTAL};

use super::{AssignmentSource, BookingQuery, BookingSource, CatalogSource, UpstreamError};

pub const BOOKINGS_PATH: &str = "/wp-json/wc-bookings/v1/bookings";
pub const PRODUCTS_PATH: &str = "/wp-json/wc/v3/products";
pub const ASSIGNMENTS_PATH: &str = "/wp-json/tideslot/v1/assignments";
pub const SYSTEM_STATUS_PATH: &str = "/wp-json/wc/v3/system_status";

/// Consumer key/secret pair sent as HTTP basic auth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub key: String,
    pub secret: String,
}

#[derive(Clone)]
pub struct CommerceClient {
    client: Client,
    base_url: String,
    credentials: Option<Credentials>,
}

impl CommerceClient {
    pub fn new(base_url: &str, credentials: Option<Credentials>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self::with_client(client, base_url, credentials)
    }

    pub fn with_client(client: Client, base_url: &str, credentials: Option<Credentials>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// GET `url` and decode the body as JSON. Non-2xx maps to `Status`.
pub async fn get_json(
    client: &Client,
    endpoint: &'static str,
    url: &str,
    params: &[(&str, String)],
    credentials: Option<&Credentials>,
) -> Result<Value, UpstreamError> {
    let mut request = client.get(url).query(params);
    if let Some(c) = credentials {
        request = request.basic_auth(&c.key, Some(&c.secret));
    }

    let started = Instant::now();
    let result: Result<Value, UpstreamError> = async {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status(status.as_u16()));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| UpstreamError::Decode(e.to_string()))
    }
    .await;

    let outcome = match &result {
        Ok(_) => "ok",
        Err(UpstreamError::Timeout) => "timeout",
        Err(UpstreamError::Status(_)) => "status",
        Err(UpstreamError::Decode(_)) => "decode",
        Err(_) => "transport",
    };
    metrics::counter!(UPSTREAM_REQUESTS_TOTAL, "endpoint" => endpoint, "outcome" => outcome)
        .increment(1);
    metrics::histogram!(UPSTREAM_PAGE_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    result
}

fn iso(ms: Ms) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

/// Pull the record list out of a listing body: a bare array, or an object
/// wrapping one under `data`, `bookings` or `items`.
fn listing_items(body: Value) -> Result<Vec<Value>, UpstreamError> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => ["data", "bookings", "items"]
            .iter()
            .find_map(|k| match map.remove(*k) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            })
            .ok_or_else(|| UpstreamError::Decode("listing body has no record array".into())),
        other => Err(UpstreamError::Decode(format!(
            "expected a record array, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Decode each item on its own; one malformed record does not sink the page.
/// The page keeps the upstream item count for end-of-data detection.
fn decode_items<T: serde::de::DeserializeOwned>(items: Vec<Value>, what: &str) -> Page<T> {
    let raw_len = items.len();
    let records: Vec<T> = items
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect();
    if records.len() < raw_len {
        debug!("dropped {} undecodable {what} records", raw_len - records.len());
    }
    Page { raw_len, records }
}

fn positive_u32(v: &Value) -> Option<u32> {
    let n = match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }?;
    (n > 0).then(|| n.min(u32::MAX as u64) as u32)
}

/// Product name and capacity from a product body. Zero or absent capacity is unknown.
pub fn parse_product(id: &str, body: &Value) -> ProductMeta {
    let name = body
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let capacity = ["max_persons", "max_persons_group", "capacity"]
        .iter()
        .find_map(|k| body.get(*k).and_then(positive_u32))
        .or_else(|| {
            body.get("meta_data")?
                .as_array()?
                .iter()
                .find(|e| e.get("key").and_then(Value::as_str) == Some("_wc_booking_max_persons_group"))?
                .get("value")
                .and_then(positive_u32)
        });
    ProductMeta {
        id: id.to_string(),
        name,
        capacity,
    }
}

fn window_params(query: &BookingQuery, page: u32, per_page: u32) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("page", page.to_string()),
        ("per_page", per_page.to_string()),
        ("date_min", iso(query.from)),
        ("date_max", iso(query.to)),
    ];
    if !query.statuses.is_empty() {
        let statuses: Vec<&str> = query.statuses.iter().map(BookingStatus::as_str).collect();
        params.push(("status", statuses.join(",")));
    }
    params
}

#[async_trait]
impl BookingSource for CommerceClient {
    async fn bookings_page(
        &self,
        query: &BookingQuery,
        page: u32,
        per_page: u32,
    ) -> Result<Page<RawBookingRecord>, UpstreamError> {
        let params = window_params(query, page, per_page);
        let body = get_json(
            &self.client,
            "bookings",
            &self.url(BOOKINGS_PATH),
            &params,
            self.credentials.as_ref(),
        )
        .await?;
        Ok(decode_items(listing_items(body)?, "booking"))
    }
}

#[async_trait]
impl CatalogSource for CommerceClient {
    async fn product(&self, product_id: &str) -> Result<Option<ProductMeta>, UpstreamError> {
        let url = self.url(&format!("{PRODUCTS_PATH}/{product_id}"));
        match get_json(&self.client, "product", &url, &[], self.credentials.as_ref()).await {
            Ok(body) => Ok(Some(parse_product(product_id, &body))),
            Err(UpstreamError::Status(code)) if code == StatusCode::NOT_FOUND.as_u16() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl AssignmentSource for CommerceClient {
    async fn assignments_page(
        &self,
        subject_id: &str,
        query: &BookingQuery,
        page: u32,
        per_page: u32,
    ) -> Result<Page<RawAssignment>, UpstreamError> {
        let mut params = window_params(query, page, per_page);
        params.push(("staff_id", subject_id.to_string()));
        let body = get_json(
            &self.client,
            "assignments",
            &self.url(ASSIGNMENTS_PATH),
            &params,
            self.credentials.as_ref(),
        )
        .await?;
        Ok(decode_items(listing_items(body)?, "assignment"))
    }
}
