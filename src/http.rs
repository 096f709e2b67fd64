//! JSON surface over the engine's read operations.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::engine::{Engine, EngineError};
use crate::model::{Envelope, ProductId};
use crate::timezone::TimezoneContext;

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/timezone", get(timezone))
        .route("/availability", get(availability))
        .route("/bookings", get(bookings))
        .route("/staff/{subject}/bookings", get(assigned_bookings))
        .with_state(engine)
}

#[derive(Debug, Deserialize)]
struct RangeParams {
    start: NaiveDate,
    end: NaiveDate,
    /// Comma-separated product ids.
    #[serde(default)]
    products: Option<String>,
}

fn product_filter(raw: Option<&str>) -> Vec<ProductId> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

fn respond<T: Serialize>(result: Result<Envelope<T>, EngineError>) -> Response {
    match result {
        Ok(envelope) => Json(envelope).into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(Envelope::failure(Value::Null, e.to_string())),
        )
            .into_response(),
    }
}

async fn health(State(engine): State<Arc<Engine>>) -> Json<Value> {
    Json(json!({ "status": "ok", "configured": engine.is_configured() }))
}

async fn timezone(State(engine): State<Arc<Engine>>) -> Json<TimezoneContext> {
    Json(engine.timezone().await)
}

async fn availability(
    State(engine): State<Arc<Engine>>,
    Query(params): Query<RangeParams>,
) -> Response {
    let products = product_filter(params.products.as_deref());
    respond(engine.get_availability(params.start, params.end, &products).await)
}

async fn bookings(State(engine): State<Arc<Engine>>, Query(params): Query<RangeParams>) -> Response {
    respond(engine.get_aggregated_bookings(params.start, params.end).await)
}

async fn assigned_bookings(
    State(engine): State<Arc<Engine>>,
    Path(subject): Path<String>,
    Query(params): Query<RangeParams>,
) -> Response {
    respond(
        engine
            .get_assigned_bookings(params.start, params.end, &subject)
            .await,
    )
}
