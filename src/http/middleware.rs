//! Axum middleware that throttles requests in-process.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, error};

use super::{apply_headers, has_duplicates, throttled_response};
use crate::error::{Result, TurnstileError};
use crate::ratelimit::{IdentityExtractor, IdentitySource, Tier, TierRegistry};

/// State for [`throttle`]: the tiers that guard one group of routes.
#[derive(Clone)]
pub struct ThrottleState {
    registry: Arc<TierRegistry>,
    extractor: Arc<IdentityExtractor>,
    tiers: Arc<[Tier]>,
}

impl ThrottleState {
    /// Guard routes with `tiers`, evaluated in order.
    ///
    /// Fails if `tiers` is empty or repeats a tier.
    pub fn new(
        registry: Arc<TierRegistry>,
        extractor: Arc<IdentityExtractor>,
        tiers: &[Tier],
    ) -> Result<Self> {
        if tiers.is_empty() {
            return Err(TurnstileError::Config(
                "throttled routes need at least one tier".to_string(),
            ));
        }
        if has_duplicates(tiers) {
            return Err(TurnstileError::Config(format!(
                "throttled route repeats a tier: {:?}",
                tiers
            )));
        }

        Ok(Self {
            registry,
            extractor,
            tiers: Arc::from(tiers),
        })
    }
}

/// Throttle a request against the state's tiers.
///
/// Use with `axum::middleware::from_fn_with_state`. Rejected requests get a
/// 429 JSON body. Admitted requests get rate limit headers, and a response
/// status below 400 counts as success for exemption tiers.
pub async fn throttle(State(state): State<ThrottleState>, request: Request, next: Next) -> Response {
    let source = identity_source(&request, &state.extractor);
    let key = state.extractor.extract(&source);

    let Some(outcome) = state.registry.evaluate(&state.tiers, key.as_str()) else {
        error!(key = %key, "No tiers evaluated; refusing request");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    let now = state.registry.now();

    if let Some(rejection) = outcome.rejection {
        return throttled_response(&outcome.decision, rejection, now);
    }

    let mut response = next.run(request).await;
    apply_headers(response.headers_mut(), &outcome.decision, now);

    if response.status().as_u16() < 400 {
        for token in outcome.release_tokens {
            state.registry.release(token);
        }
    } else if !outcome.release_tokens.is_empty() {
        debug!(
            key = %key,
            status = response.status().as_u16(),
            "Counting failed request against exemption tiers"
        );
    }

    response
}

/// Collect the peer address and the trusted forwarded header, if any.
fn identity_source(request: &Request, extractor: &IdentityExtractor) -> IdentitySource {
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string());

    let forwarded = extractor.forwarded_header().and_then(|name| {
        let values: Vec<&str> = request
            .headers()
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect();
        (!values.is_empty()).then(|| values.join(","))
    });

    IdentitySource {
        remote_addr,
        forwarded,
    }
}
