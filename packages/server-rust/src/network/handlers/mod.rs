//! HTTP and `WebSocket` handlers.
//!
//! [`AppState`] is the shared state carried through axum extractors. Handlers
//! for asynchronously processed requests go through [`await_outcome`], which
//! hands the request to a pool and waits for its completion.

pub mod chat;
pub mod health;
pub mod listing;
pub mod save_query;

pub use chat::chat_upgrade_handler;
pub use health::{health_handler, liveness_handler, readiness_handler};
pub use listing::{chat_log_handler, query_list_handler};
pub use save_query::save_query_handler;

use std::sync::Arc;
use std::time::Instant;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use handoff_core::Outcome;

use super::{ConnectionRegistry, NetworkConfig, ShutdownController};
use crate::service::completion::{start_async, CompletionHandle};
use crate::service::domain::DomainServices;
use crate::service::registry::ResourceRegistry;

/// Header carrying the request identity, set by the middleware stack.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Shared application state passed to all axum handlers via `State`.
#[derive(Clone)]
pub struct AppState {
    pub services: Arc<DomainServices>,
    /// Resource groups, reported by `/health`.
    pub resources: Arc<ResourceRegistry>,
    /// Live chat connections.
    pub connections: Arc<ConnectionRegistry>,
    pub shutdown: Arc<ShutdownController>,
    pub config: Arc<NetworkConfig>,
    /// Process start time, used for uptime.
    pub start_time: Instant,
}

/// The request identity from `X-Request-Id`, or a fresh UUID.
pub(crate) fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_owned)
}

/// Starts an asynchronous flow through `dispatch` and waits for its outcome.
///
/// The request counts as in flight until it completes. A flow that is
/// rejected by its pool has already been completed by the time `dispatch`
/// returns.
pub(crate) async fn await_outcome(
    state: &AppState,
    headers: &HeaderMap,
    dispatch: impl FnOnce(&DomainServices, &CompletionHandle) -> bool,
) -> Response {
    let _in_flight = state.shutdown.in_flight_guard();
    let (completion, pending) =
        start_async(request_id(headers), state.services.request_timeout());
    dispatch(&state.services, &completion);
    drop(completion);
    outcome_response(pending.wait().await)
}

/// Maps a completed outcome onto an HTTP response.
pub(crate) fn outcome_response(outcome: Outcome) -> Response {
    match outcome {
        Outcome::Json(value) => Json(value).into_response(),
        Outcome::SeeOther { location } => Redirect::to(&location).into_response(),
        Outcome::ServerError { message } => {
            (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
        }
        Outcome::Unavailable { message } => {
            (StatusCode::SERVICE_UNAVAILABLE, message).into_response()
        }
    }
}


#[cfg(test)]
mod tests {
    use axum::http::header::LOCATION;
    use axum::http::HeaderValue;
    use serde_json::json;

    use super::*;

    #[test]
    fn request_id_prefers_the_header() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("req-42"));
        assert_eq!(request_id(&headers), "req-42");
    }

    #[test]
    fn request_id_falls_back_to_uuid() {
        let id = request_id(&HeaderMap::new());
        assert!(uuid::Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn outcomes_map_to_statuses() {
        assert_eq!(
            outcome_response(Outcome::Json(json!([]))).status(),
            StatusCode::OK
        );

        let redirect = outcome_response(Outcome::see_other("/queryList"));
        assert_eq!(redirect.status(), StatusCode::SEE_OTHER);
        assert_eq!(redirect.headers()[LOCATION], "/queryList");

        assert_eq!(
            outcome_response(Outcome::server_error("boom")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            outcome_response(Outcome::unavailable("busy")).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
