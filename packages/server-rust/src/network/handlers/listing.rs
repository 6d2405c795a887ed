//! `GET /queryList` and `GET /chatLog`.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;

use super::{await_outcome, AppState};

/// Every query record as a JSON array.
pub async fn query_list_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    await_outcome(&state, &headers, |services, completion| {
        services.list_query_records(completion)
    })
    .await
}

/// Every chat log entry as a JSON array.
pub async fn chat_log_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    await_outcome(&state, &headers, |services, completion| {
        services.list_chat_log(completion)
    })
    .await
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use handoff_core::{QueryRecord, Session, SessionFactory};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::network::handlers::test_support::{test_lifecycle, test_state};
    use crate::service::config::QUERY_RECORD_DB;
    use crate::storage::MemorySessionFactory;

    fn app(state: AppState) -> Router {
        Router::new()
            .route("/queryList", get(query_list_handler))
            .route("/chatLog", get(chat_log_handler))
            .with_state(state)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn query_list_returns_stored_records() {
        let lifecycle = test_lifecycle();
        let factory = lifecycle
            .resources()
            .provider::<MemorySessionFactory>(QUERY_RECORD_DB)
            .unwrap()
            .factory()
            .clone();
        {
            let session = factory.create_session().unwrap();
            session.begin().unwrap();
            session
                .insert_query(&mut QueryRecord::new("select 1"))
                .unwrap();
            session.commit().unwrap();
            session.close().unwrap();
        }

        let request = Request::get("/queryList").body(Body::empty()).unwrap();
        let response = app(test_state(&lifecycle)).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!([{ "id": 1, "query": "select 1", "result": null }])
        );
        lifecycle.shutdown().await;
    }

    #[tokio::test]
    async fn empty_chat_log_is_an_empty_array() {
        let lifecycle = test_lifecycle();
        let request = Request::get("/chatLog").body(Body::empty()).unwrap();
        let response = app(test_state(&lifecycle)).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!([]));
        lifecycle.shutdown().await;
    }
}
