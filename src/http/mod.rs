//! HTTP adapters: in-process middleware and the standalone decision API.

mod middleware;
mod server;
mod service;

pub use middleware::{throttle, ThrottleState};
pub use server::HttpServer;
pub use service::{router, DecisionService, EvaluateRequest, EvaluateResponse};

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};

use crate::ratelimit::{headers, Decision, Rejection, Tier};

/// Set the rate limit headers for `decision` on `map`.
pub(crate) fn apply_headers(map: &mut HeaderMap, decision: &Decision, now: DateTime<Utc>) {
    for (name, value) in headers::render(decision, now) {
        if let Ok(value) = HeaderValue::from_str(&value) {
            map.insert(HeaderName::from_static(name), value);
        }
    }
}

/// Build the 429 response for a rejected request.
pub(crate) fn throttled_response(
    decision: &Decision,
    rejection: Rejection,
    now: DateTime<Utc>,
) -> Response {
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(rejection)).into_response();
    apply_headers(response.headers_mut(), decision, now);
    response
}

/// Whether any tier appears more than once.
pub(crate) fn has_duplicates(tiers: &[Tier]) -> bool {
    tiers
        .iter()
        .enumerate()
        .any(|(i, tier)| tiers[..i].contains(tier))
}
