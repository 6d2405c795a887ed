//! Single-hop listing flows: one read on the group's pool in a fresh request scope.

use std::sync::Arc;

use handoff_core::{Outcome, SessionFactory};

use crate::service::completion::CompletionHandle;
use crate::service::dispatch::dispatch_in_session;
use crate::service::pool::WorkerPool;
use crate::storage::{ChatLogDao, QueryRecordDao, SessionProvider};

/// Lists every query record as JSON.
///
/// Returns `false` if `pool` rejected the request.
pub fn list_query_records<F: SessionFactory>(
    pool: &WorkerPool,
    provider: SessionProvider<F>,
    dao: Arc<dyn QueryRecordDao>,
    completion: &CompletionHandle,
) -> bool {
    dispatch_in_session(pool, provider, completion, move || {
        let records = dao.find_all()?;
        Ok(Outcome::Json(serde_json::to_value(records)?))
    })
}

/// Lists every chat log entry as JSON.
///
/// Returns `false` if `pool` rejected the request.
pub fn list_chat_log<F: SessionFactory>(
    pool: &WorkerPool,
    provider: SessionProvider<F>,
    dao: Arc<dyn ChatLogDao>,
    completion: &CompletionHandle,
) -> bool {
    dispatch_in_session(pool, provider, completion, move || {
        let entries = dao.find_all()?;
        Ok(Outcome::Json(serde_json::to_value(entries)?))
    })
}
