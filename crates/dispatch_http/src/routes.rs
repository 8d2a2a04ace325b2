//! Route table, request/response DTOs, and the error-to-status mapping.
//!
//! Every inbound request gets a correlation id (honored from the
//! `x-correlation-id` header, minted otherwise) that rides along into the
//! engine and comes back on the response.

use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;

use dispatch_core::engine::{DispatchRequest, Engine};
use dispatch_core::error::EngineError;
use dispatch_core::geoindex::GridDriverIndex;
use dispatch_core::model::{
    Availability, CorrelationId, Dispatch, DispatchId, DriverId, DriverSnapshot, PushAddress,
    Ride, RideId, VehicleType,
};
use dispatch_core::spatial::GeoPoint;

const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub index: Arc<GridDriverIndex>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/dispatch", post(start_dispatch))
        .route("/dispatch/:id", get(dispatch_status))
        .route("/dispatch/:id/ack", post(ack_offer))
        .route("/dispatch/:id/cancel", post(cancel_dispatch))
        .route("/ride/:id", get(ride_status))
        .route("/ride/:id/start", post(start_ride))
        .route("/ride/:id/end", post(end_ride))
        .route("/ride/:id/cancel", post(cancel_ride))
        .route("/drivers", post(upsert_driver))
        .layer(middleware::from_fn(correlation_layer))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn correlation_layer(mut request: Request, next: Next) -> Response {
    let correlation = correlation_from(request.headers());
    request.extensions_mut().insert(correlation.clone());
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&correlation.0) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}

fn correlation_from(headers: &HeaderMap) -> CorrelationId {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(CorrelationId::from_raw)
        .unwrap_or_else(CorrelationId::generate)
}

// ── Error mapping ──────────────────────────────────────────────────

struct ApiError(EngineError);

type ApiResult<T> = Result<T, ApiError>;

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::BadInput(_) => StatusCode::BAD_REQUEST,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Conflict(_) => StatusCode::CONFLICT,
        EngineError::Gone(_) => StatusCode::GONE,
        EngineError::Unavailable(_) => StatusCode::BAD_GATEWAY,
        EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "internal fault");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

fn parse_dispatch_id(raw: &str) -> Result<DispatchId, ApiError> {
    DispatchId::parse(raw)
        .ok_or_else(|| ApiError(EngineError::bad_input(format!("malformed dispatch id {raw:?}"))))
}

fn parse_ride_id(raw: &str) -> Result<RideId, ApiError> {
    RideId::parse(raw)
        .ok_or_else(|| ApiError(EngineError::bad_input(format!("malformed ride id {raw:?}"))))
}

// ── DTOs ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartDispatchBody {
    rider: String,
    pickup: String,
    destination: String,
    vehicle_type: Option<String>,
    radius_km: Option<f64>,
    limit: Option<usize>,
    bound_sec: Option<u32>,
    ack_sec: Option<u64>,
    idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartDispatchResponse {
    dispatch_id: DispatchId,
    candidates: usize,
    cursor: usize,
    ack_sec: u64,
    fare_minor: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AckBody {
    driver_id: String,
    accepted: bool,
}

#[derive(Debug, Serialize)]
struct OkBody {
    ok: bool,
}

#[derive(Debug, Deserialize)]
struct StartRideBody {
    otp: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpsertDriverBody {
    id: String,
    lat: f64,
    lon: f64,
    vehicle_type: String,
    availability: Option<Availability>,
    push_address: Option<String>,
}

// ── Handlers ───────────────────────────────────────────────────────

async fn start_dispatch(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Json(body): Json<StartDispatchBody>,
) -> ApiResult<(StatusCode, Json<StartDispatchResponse>)> {
    let receipt = state
        .engine
        .start_dispatch(
            DispatchRequest {
                rider: dispatch_core::model::RiderId(body.rider),
                pickup: body.pickup,
                destination: body.destination,
                vehicle: body.vehicle_type,
                radius_km: body.radius_km,
                limit: body.limit,
                bound_secs: body.bound_sec,
                ack_seconds: body.ack_sec,
                idempotency_key: body.idempotency_key,
            },
            correlation,
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(StartDispatchResponse {
            dispatch_id: receipt.dispatch_id,
            candidates: receipt.candidate_count,
            cursor: receipt.cursor,
            ack_sec: receipt.ack_seconds,
            fare_minor: receipt.fare_minor,
        }),
    ))
}

async fn dispatch_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Dispatch>> {
    let id = parse_dispatch_id(&id)?;
    Ok(Json(state.engine.dispatch_status(&id)?))
}

async fn ack_offer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AckBody>,
) -> ApiResult<Json<OkBody>> {
    let id = parse_dispatch_id(&id)?;
    state
        .engine
        .ack_offer(&id, &DriverId(body.driver_id), body.accepted)
        .await?;
    Ok(Json(OkBody { ok: true }))
}

async fn cancel_dispatch(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<OkBody>> {
    let id = parse_dispatch_id(&id)?;
    state.engine.cancel_dispatch(&id).await?;
    Ok(Json(OkBody { ok: true }))
}

async fn ride_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Ride>> {
    let id = parse_ride_id(&id)?;
    Ok(Json(state.engine.ride_status(&id)?))
}

async fn start_ride(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Extension(correlation): Extension<CorrelationId>,
    Json(body): Json<StartRideBody>,
) -> ApiResult<Json<Ride>> {
    let id = parse_ride_id(&id)?;
    Ok(Json(state.engine.start_ride(&id, &body.otp, &correlation).await?))
}

async fn end_ride(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Extension(correlation): Extension<CorrelationId>,
) -> ApiResult<Json<Ride>> {
    let id = parse_ride_id(&id)?;
    Ok(Json(state.engine.end_ride(&id, &correlation).await?))
}

async fn cancel_ride(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Ride>> {
    let id = parse_ride_id(&id)?;
    Ok(Json(state.engine.cancel_ride(&id).await?))
}

/// Driver position/availability upsert, fed by the location pipeline (and
/// the seed tooling in development).
async fn upsert_driver(
    State(state): State<AppState>,
    Json(body): Json<UpsertDriverBody>,
) -> ApiResult<Json<OkBody>> {
    let vehicle = VehicleType::normalize(&body.vehicle_type).ok_or_else(|| {
        ApiError(EngineError::bad_input(format!(
            "unknown vehicle type {:?}",
            body.vehicle_type
        )))
    })?;
    let position = GeoPoint::new(body.lat, body.lon).map_err(ApiError::from)?;
    state
        .index
        .upsert(DriverSnapshot {
            id: DriverId(body.id),
            position,
            vehicle,
            availability: body.availability.unwrap_or(Availability::Active),
            push_address: body.push_address.map(PushAddress),
        })
        .map_err(ApiError::from)?;
    Ok(Json(OkBody { ok: true }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_http_statuses() {
        assert_eq!(status_for(&EngineError::bad_input("x")), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&EngineError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&EngineError::Conflict("x".into())), StatusCode::CONFLICT);
        assert_eq!(status_for(&EngineError::Gone("x".into())), StatusCode::GONE);
        assert_eq!(status_for(&EngineError::Unavailable("x".into())), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status_for(&EngineError::Internal("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn correlation_header_is_honored_or_minted() {
        let mut headers = HeaderMap::new();
        headers.insert(CORRELATION_HEADER, HeaderValue::from_static("req-42"));
        assert_eq!(correlation_from(&headers).0, "req-42");

        let minted = correlation_from(&HeaderMap::new());
        assert!(!minted.0.is_empty());
    }

    #[test]
    fn start_dispatch_body_accepts_wire_field_names() {
        let body: StartDispatchBody = serde_json::from_str(
            r#"{
                "rider": "r-1",
                "pickup": "52.52,13.40",
                "destination": "52.49,13.42",
                "vehicleType": "moto",
                "radiusKm": 3.5,
                "limit": 5,
                "boundSec": 300,
                "ackSec": 20,
                "idempotencyKey": "booking-7"
            }"#,
        )
        .expect("wire body parses");
        assert_eq!(body.vehicle_type.as_deref(), Some("moto"));
        assert_eq!(body.bound_sec, Some(300));
        assert_eq!(body.ack_sec, Some(20));

        let minimal: StartDispatchBody = serde_json::from_str(
            r#"{"rider": "r-1", "pickup": "a", "destination": "b"}"#,
        )
        .expect("optional fields default");
        assert!(minimal.vehicle_type.is_none());
        assert!(minimal.idempotency_key.is_none());
    }

    #[test]
    fn ack_body_requires_driver_and_decision() {
        let body: AckBody =
            serde_json::from_str(r#"{"driverId": "d-1", "accepted": false}"#).expect("parses");
        assert_eq!(body.driver_id, "d-1");
        assert!(!body.accepted);
    }
}
