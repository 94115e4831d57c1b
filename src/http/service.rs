//! JSON decision API for routers that run out of process.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::{apply_headers, has_duplicates};
use crate::ratelimit::{
    headers, IdentityExtractor, IdentitySource, LimiterStats, Rejection, ReleaseToken, Tier,
    TierRegistry,
};

/// Shared state for the decision API.
#[derive(Clone)]
pub struct DecisionService {
    registry: Arc<TierRegistry>,
    extractor: Arc<IdentityExtractor>,
}

impl DecisionService {
    pub fn new(registry: Arc<TierRegistry>, extractor: Arc<IdentityExtractor>) -> Self {
        Self {
            registry,
            extractor,
        }
    }
}

/// A request to throttle, as described by the router.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EvaluateRequest {
    /// Tiers that apply to the route, evaluated in order
    pub tiers: Vec<Tier>,
    /// Client address metadata
    #[serde(flatten)]
    pub source: IdentitySource,
}

/// Decision returned to the router.
#[derive(Debug, Serialize)]
pub struct EvaluateResponse {
    pub admitted: bool,
    pub key: String,
    pub tier: Tier,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    /// Headers the router should attach to its response
    pub headers: BTreeMap<&'static str, String>,
    /// Tokens to post back to `/v1/release` if the request succeeds
    pub release_tokens: Vec<ReleaseToken>,
    #[serde(flatten)]
    pub rejection: Option<Rejection>,
}

/// Build the decision API router.
pub fn router(service: DecisionService) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/evaluate", post(evaluate))
        .route("/v1/release", post(release))
        .route("/v1/stats", get(stats))
        .with_state(service)
}

async fn healthz() -> &'static str {
    "ok"
}

#[instrument(skip_all, fields(tiers = ?request.tiers))]
async fn evaluate(
    State(service): State<DecisionService>,
    request: Json<EvaluateRequest>,
) -> Response {
    let Json(request) = request;

    if request.tiers.is_empty() {
        warn!("Received evaluate request with no tiers");
        return bad_request("at least one tier is required");
    }
    if has_duplicates(&request.tiers) {
        warn!("Received evaluate request with duplicate tiers");
        return bad_request("tiers must not repeat");
    }

    let key = service.extractor.extract(&request.source);
    let Some(outcome) = service.registry.evaluate(&request.tiers, key.as_str()) else {
        return bad_request("at least one tier is required");
    };
    let now = service.registry.now();

    let mut header_map = HeaderMap::new();
    apply_headers(&mut header_map, &outcome.decision, now);

    let status = if outcome.admitted() {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };

    debug!(key = %key, admitted = outcome.admitted(), "Decision made");

    let body = EvaluateResponse {
        admitted: outcome.admitted(),
        key: key.to_string(),
        tier: outcome.decision.tier,
        limit: outcome.decision.limit,
        remaining: outcome.decision.remaining,
        reset_at: outcome.decision.reset_at,
        headers: headers::render(&outcome.decision, now).into_iter().collect(),
        release_tokens: outcome.release_tokens,
        rejection: outcome.rejection,
    };

    (status, header_map, Json(body)).into_response()
}

#[instrument(skip_all, fields(tier = %token.tier))]
async fn release(State(service): State<DecisionService>, token: Json<ReleaseToken>) -> StatusCode {
    let Json(token) = token;
    let released = service.registry.release(token);
    info!(released = released, "Release processed");
    StatusCode::NO_CONTENT
}

async fn stats(State(service): State<DecisionService>) -> Json<Vec<LimiterStats>> {
    Json(service.registry.stats())
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(Rejection::new(message))).into_response()
}
