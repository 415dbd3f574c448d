//! HTTP handlers. Each one extracts the request, calls the orchestrator and
//! maps the typed outcome onto a status code.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        ConnectInfo, Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use axum_extra::{headers::UserAgent, TypedHeader};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, warn};

use super::error::ApiError;
use super::routes::AppState;
use crate::attribution::{ConversionOutcome, RejectReason};
use crate::models::{AdRequest, BidModel, BudgetState, Creative, EventContext, RankedCampaign};
use crate::matching::ImpressionOutcome;
use crate::store::IvtReport;
use crate::viewability::{ViewabilityMeasurement, ViewabilityResult};

/// Transparent 1x1 GIF.
const PIXEL_GIF: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

// ===== Request/Response Types =====

#[derive(Debug, Default, Deserialize)]
pub struct ServeQuery {
    #[serde(default)]
    publisher_id: String,
    #[serde(default)]
    slot_id: String,
    #[serde(default)]
    format: String,
    geo: Option<String>,
    device: Option<String>,
}

/// Placement and audience fields shared by the impression body and the
/// pixel/click query strings.
#[derive(Debug, Default, Deserialize)]
pub struct EventParams {
    #[serde(default)]
    campaign_id: String,
    #[serde(default)]
    publisher_id: String,
    #[serde(default)]
    slot_id: String,
    geo: Option<String>,
    device: Option<String>,
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConversionBody {
    #[serde(default)]
    conversion_type: String,
    conversion_value: Option<f64>,
    attribution_window_days: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ReportQuery {
    date: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ServedAd {
    campaign_id: String,
    advertiser_id: String,
    bid_model: BidModel,
    ecpm: f64,
    creative: Creative,
    landing_url: String,
}

impl From<RankedCampaign> for ServedAd {
    fn from(ranked: RankedCampaign) -> Self {
        let c = ranked.campaign;
        Self {
            campaign_id: c.id,
            advertiser_id: c.advertiser_id,
            bid_model: c.bid_model,
            ecpm: ranked.ecpm,
            creative: c.creative,
            landing_url: c.landing_url,
        }
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

// ===== Request helpers =====

/// First `X-Forwarded-For` hop, else the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|first| first.trim().parse().ok())
        .or_else(|| peer.map(|addr| addr.ip()))
}

fn event_context(
    params: EventParams,
    headers: &HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
    user_agent: Option<TypedHeader<UserAgent>>,
) -> EventContext {
    EventContext {
        campaign_id: params.campaign_id,
        publisher_id: params.publisher_id,
        slot_id: params.slot_id,
        geo: params.geo,
        device: params.device,
        session_id: params.session_id,
        ip: client_ip(headers, connect.map(|ConnectInfo(addr)| addr)),
        user_agent: user_agent.map(|TypedHeader(ua)| ua.as_str().to_string()),
    }
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

fn query<T>(params: Result<Query<T>, QueryRejection>) -> Result<T, ApiError> {
    params
        .map(|Query(q)| q)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

// ===== Handlers =====

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder not installed",
        )
            .into_response(),
    }
}

pub async fn serve_ads(
    State(state): State<AppState>,
    params: Result<Query<ServeQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let q = query(params)?;
    let request = AdRequest {
        publisher_id: q.publisher_id,
        slot_id: q.slot_id,
        format: q.format,
        geo: q.geo,
        device: q.device,
    };

    let ranked = state.orchestrator.serve_ad(&request, Utc::now()).await?;
    if ranked.is_empty() {
        return Err(ApiError::NotFound("no eligible ads".to_string()));
    }
    let ads: Vec<ServedAd> = ranked.into_iter().map(ServedAd::from).collect();
    Ok(Json(json!({ "ads": ads })).into_response())
}

pub async fn track_impression(
    State(state): State<AppState>,
    Path(impression_id): Path<String>,
    connect: Option<ConnectInfo<SocketAddr>>,
    user_agent: Option<TypedHeader<UserAgent>>,
    headers: HeaderMap,
    payload: Result<Json<EventParams>, JsonRejection>,
) -> Result<Response, ApiError> {
    let ctx = event_context(json_body(payload)?, &headers, connect, user_agent);
    let outcome = state
        .orchestrator
        .log_impression(&impression_id, &ctx, Utc::now())
        .await?;

    let response = match outcome {
        ImpressionOutcome::Logged(receipt) => (
            StatusCode::OK,
            Json(json!({
                "status": "logged",
                "impression_id": receipt.impression_id,
                "fraud_status": receipt.fraud_status,
                "revenue": receipt.revenue,
            })),
        ),
        ImpressionOutcome::AlreadyLogged => (
            StatusCode::OK,
            Json(json!({ "status": "already_logged", "impression_id": impression_id })),
        ),
        ImpressionOutcome::BudgetExceeded => (
            StatusCode::PAYMENT_REQUIRED,
            Json(json!({ "error": "campaign budget exhausted" })),
        ),
        ImpressionOutcome::Blocked => (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "invalid traffic" })),
        ),
        ImpressionOutcome::UnknownCampaign => {
            return Err(ApiError::NotFound(format!("campaign {}", ctx.campaign_id)))
        }
    };
    Ok(response.into_response())
}

/// Always answers with the pixel; tracking failures are only logged.
pub async fn tracking_pixel(
    State(state): State<AppState>,
    Path(impression_id): Path<String>,
    connect: Option<ConnectInfo<SocketAddr>>,
    user_agent: Option<TypedHeader<UserAgent>>,
    headers: HeaderMap,
    params: Option<Query<EventParams>>,
) -> Response {
    let params = params.map(|Query(p)| p).unwrap_or_default();
    let ctx = event_context(params, &headers, connect, user_agent);

    match state
        .orchestrator
        .log_impression(&impression_id, &ctx, Utc::now())
        .await
    {
        Ok(outcome) => debug!(impression_id, ?outcome, "pixel impression"),
        Err(e) => warn!("Pixel impression {} not logged: {}", impression_id, e),
    }

    (
        [
            (header::CONTENT_TYPE, "image/gif"),
            (header::CACHE_CONTROL, "no-store, no-cache, must-revalidate"),
        ],
        PIXEL_GIF,
    )
        .into_response()
}

pub async fn track_click(
    State(state): State<AppState>,
    Path(impression_id): Path<String>,
    connect: Option<ConnectInfo<SocketAddr>>,
    user_agent: Option<TypedHeader<UserAgent>>,
    headers: HeaderMap,
    params: Result<Query<EventParams>, QueryRejection>,
) -> Result<Redirect, ApiError> {
    let ctx = event_context(query(params)?, &headers, connect, user_agent);
    let outcome = state
        .orchestrator
        .log_click(&impression_id, &ctx, Utc::now())
        .await?;

    match outcome.redirect_url {
        Some(url) => {
            debug!(impression_id, status = ?outcome.status, "click redirect");
            Ok(Redirect::to(&url))
        }
        None => Err(ApiError::NotFound(format!("campaign {}", ctx.campaign_id))),
    }
}

pub async fn track_viewability(
    State(state): State<AppState>,
    Path(impression_id): Path<String>,
    payload: Result<Json<ViewabilityMeasurement>, JsonRejection>,
) -> Result<Json<ViewabilityResult>, ApiError> {
    let measurement = json_body(payload)?;
    let result = state
        .orchestrator
        .confirm_viewability(&impression_id, &measurement, Utc::now())
        .await?;
    Ok(Json(result))
}

pub async fn track_conversion(
    State(state): State<AppState>,
    Path(impression_id): Path<String>,
    payload: Result<Json<ConversionBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let body = json_body(payload)?;
    let outcome = state
        .orchestrator
        .track_conversion(
            &impression_id,
            &body.conversion_type,
            body.conversion_value,
            body.attribution_window_days,
            Utc::now(),
        )
        .await?;

    match outcome {
        ConversionOutcome::Created(result) => Ok(Json(result).into_response()),
        ConversionOutcome::AlreadyExists => Err(ApiError::Conflict(format!(
            "{} conversion already recorded for impression {}",
            body.conversion_type, impression_id
        ))),
        ConversionOutcome::Rejected(RejectReason::NoClick) => Err(ApiError::NotFound(format!(
            "no click recorded for impression {}",
            impression_id
        ))),
    }
}

pub async fn campaign_budget(
    State(state): State<AppState>,
    Path(campaign_id): Path<String>,
) -> Result<Json<BudgetState>, ApiError> {
    Ok(Json(state.orchestrator.budget_state(&campaign_id).await?))
}

pub async fn ivt_report(
    State(state): State<AppState>,
    params: Result<Query<ReportQuery>, QueryRejection>,
) -> Result<Json<IvtReport>, ApiError> {
    let date = match query(params)?.date {
        Some(raw) => NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
            .map_err(|_| ApiError::BadRequest(format!("invalid date '{}', expected YYYY-MM-DD", raw)))?,
        None => Utc::now().date_naive(),
    };
    Ok(Json(state.orchestrator.store().ivt_report(date).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let peer: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, Some(peer)), Some(peer.ip()));
        assert_eq!(client_ip(&headers, None), None);

        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.2".parse().unwrap());
        assert_eq!(
            client_ip(&headers, Some(peer)),
            Some("203.0.113.9".parse().unwrap())
        );

        headers.insert("x-forwarded-for", "garbage".parse().unwrap());
        assert_eq!(client_ip(&headers, Some(peer)), Some(peer.ip()));
    }

    #[test]
    fn test_pixel_is_a_gif() {
        assert_eq!(&PIXEL_GIF[..6], b"GIF89a");
        assert_eq!(PIXEL_GIF.len(), 43);
    }
}
