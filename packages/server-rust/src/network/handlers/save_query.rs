//! `POST /saveQuery`: runs the save-and-enrich pipeline.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Form;
use handoff_core::RecordId;
use serde::Deserialize;

use super::{await_outcome, AppState};
use crate::service::domain::SaveQueryRequest;

/// Form body of `/saveQuery`. An empty `id` means a new record.
#[derive(Debug, Deserialize)]
pub struct SaveQueryForm {
    #[serde(default)]
    pub id: Option<String>,
    pub query: String,
}

impl SaveQueryForm {
    fn into_request(self) -> Result<SaveQueryRequest, String> {
        let id = match self.id.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(RecordId(
                raw.parse()
                    .map_err(|_| format!("invalid record id '{raw}'"))?,
            )),
        };
        Ok(SaveQueryRequest {
            id,
            query: self.query,
        })
    }
}

/// Answers `303 See Other` to `/queryList` on success, `500` on a failed
/// stage and `503` when a pool is shut down or the request times out.
pub async fn save_query_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<SaveQueryForm>,
) -> Response {
    let request = match form.into_request() {
        Ok(request) => request,
        Err(message) => return (StatusCode::BAD_REQUEST, message).into_response(),
    };
    await_outcome(&state, &headers, move |services, completion| {
        services.save_query(request, completion)
    })
    .await
}
