//! HTTP surface: service info, health, and the push-hub callback endpoint.

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path as AxumPath, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::collections::BTreeMap;
use url::Url;

use crate::aggregator::{AggregatorManager, AggregatorState, PushError, VerifyRequest};
use crate::feed::MAX_FEED_SIZE;

pub const SERVICE_NAME: &str = env!("CARGO_PKG_NAME");
pub const SERVICE_DESC: &str = env!("CARGO_PKG_DESCRIPTION");

#[derive(Clone)]
struct AppState {
    aggregator: AggregatorManager,
    public_url: Option<Url>,
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: u16,
    message: String,
}

impl IntoResponse for PushError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorEnvelope {
            error: ErrorBody {
                code: status.as_u16(),
                message: self.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
struct HalLink {
    href: String,
}

#[derive(Debug, Serialize)]
struct Info {
    name: &'static str,
    desc: &'static str,
    version: &'static str,
    #[serde(rename = "_links")]
    links: BTreeMap<&'static str, HalLink>,
}

#[derive(Debug, Serialize)]
struct Health {
    state: String,
}

/// Build the router. The push callback routes exist only when the service
/// has a public URL to hand out to hubs.
pub fn router(aggregator: AggregatorManager) -> Router {
    let public_url = aggregator.settings().public_url.clone();
    let state = AppState {
        aggregator,
        public_url,
    };

    let mut router = Router::new()
        .route("/", get(info))
        .route("/healthz", get(health));
    if state.public_url.is_some() {
        router = router
            .route("/v1/pshb/:feed_id", get(verify).post(push))
            .layer(DefaultBodyLimit::max(MAX_FEED_SIZE));
    }
    router.with_state(state)
}

fn href(base: Option<&Url>, path: &str) -> String {
    match base {
        Some(base) => format!("{}{}", base.as_str().trim_end_matches('/'), path),
        None => path.to_string(),
    }
}

async fn info(State(state): State<AppState>) -> Json<Info> {
    let base = state.public_url.as_ref();
    let mut links = BTreeMap::new();
    links.insert("self", HalLink { href: href(base, "/") });
    links.insert("health", HalLink { href: href(base, "/healthz") });
    if base.is_some() {
        links.insert("pshb", HalLink { href: href(base, "/v1/pshb/{feed_id}") });
    }

    Json(Info {
        name: SERVICE_NAME,
        desc: SERVICE_DESC,
        version: env!("CARGO_PKG_VERSION"),
        links,
    })
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<Health>) {
    let current = state.aggregator.state();
    let status = if current == AggregatorState::Running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(Health {
            state: current.to_string(),
        }),
    )
}

async fn verify(
    State(state): State<AppState>,
    AxumPath(feed_id): AxumPath<i64>,
    Query(request): Query<VerifyRequest>,
) -> Result<String, PushError> {
    state.aggregator.verify_subscription(feed_id, &request).await
}

async fn push(
    State(state): State<AppState>,
    AxumPath(feed_id): AxumPath<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, PushError> {
    let signature = headers
        .get("x-hub-signature")
        .and_then(|v| v.to_str().ok());
    state
        .aggregator
        .receive_push(feed_id, signature, &body)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
