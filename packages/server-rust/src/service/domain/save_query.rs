//! Save-and-enrich pipeline for query records.
//!
//! One request runs as three stages on two pools:
//!
//! 1. **persist** (database pool): insert or update the record in a unit of
//!    work, then close the session and remove it from scope so the connection
//!    is free while the slow call runs. An update that hits no row completes
//!    the request with a redirect and ends the pipeline.
//! 2. **enrich** (external pool): call the external service outside of any
//!    transaction.
//! 3. **finalize** (database pool): store the result with a new session in a
//!    second unit of work, close it, and redirect to the listing.
//!
//! The record is persisted in two separate transactions. No transaction spans
//! the external call, so the insert stays committed if enrichment fails.

use std::sync::Arc;

use handoff_core::{ExternalService, Outcome, QueryRecord, RecordId, RequestContext, SessionFactory};
use tracing::{debug, warn};

use crate::service::completion::CompletionHandle;
use crate::service::dispatch::{failure_outcome, submit_stage};
use crate::service::error::StageError;
use crate::service::pool::WorkerPool;
use crate::storage::{QueryRecordDao, SessionProvider, UnitOfWork};

/// Where a finished save redirects the caller.
pub const QUERY_LIST_LOCATION: &str = "/queryList";

/// Progress of one request through the pipeline.
///
/// State machine: Received -> Persisted -> Enriched -> Finalized, with
/// Failed reachable from every non-final state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Received,
    Persisted,
    Enriched,
    Finalized,
    Failed,
}

impl PipelineState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Persisted => "persisted",
            Self::Enriched => "enriched",
            Self::Finalized => "finalized",
            Self::Failed => "failed",
        }
    }
}

/// A request to save a query: `id` is set when an existing record is edited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveQueryRequest {
    pub id: Option<RecordId>,
    pub query: String,
}

/// The three-stage save pipeline. Cheap to clone.
pub struct SaveQueryPipeline<F: SessionFactory> {
    db_pool: Arc<WorkerPool>,
    external_pool: Arc<WorkerPool>,
    provider: SessionProvider<F>,
    dao: Arc<dyn QueryRecordDao>,
    external: Arc<dyn ExternalService>,
}

impl<F: SessionFactory> SaveQueryPipeline<F> {
    #[must_use]
    pub fn new(
        db_pool: Arc<WorkerPool>,
        external_pool: Arc<WorkerPool>,
        provider: SessionProvider<F>,
        dao: Arc<dyn QueryRecordDao>,
        external: Arc<dyn ExternalService>,
    ) -> Self {
        Self {
            db_pool,
            external_pool,
            provider,
            dao,
            external,
        }
    }

    /// Starts the pipeline for `request` and returns without waiting.
    ///
    /// `completion` is completed exactly once by whichever stage ends the
    /// pipeline. Returns `false` if the database pool rejected the first
    /// stage.
    pub fn submit(&self, request: SaveQueryRequest, completion: &CompletionHandle) -> bool {
        let context = RequestContext::new(completion.request_id());
        transition(completion, PipelineState::Received);
        let pipeline = self.clone();
        let stage_completion = completion.clone();
        submit_stage(&self.db_pool, Some(context), completion, "persist", move || {
            pipeline.persist(request, stage_completion);
        })
    }

    fn persist(self, request: SaveQueryRequest, completion: CompletionHandle) {
        let mut record = match request.id {
            Some(id) => QueryRecord::with_id(id, request.query),
            None => QueryRecord::new(request.query),
        };

        let stored = self.store(&mut record);
        let closed = self.provider.close_and_remove();

        match stored {
            Err(err) => return fail(&completion, &err),
            Ok(false) => {
                debug!(
                    request_id = completion.request_id(),
                    id = ?record.id,
                    "record to update no longer exists"
                );
                if let Err(err) = closed {
                    warn!(
                        request_id = completion.request_id(),
                        group = self.provider.group(),
                        error = %err,
                        "failed to close session"
                    );
                }
                completion.complete(Outcome::see_other(QUERY_LIST_LOCATION));
                return;
            }
            Ok(true) => {}
        }
        if let Err(err) = closed {
            return fail(&completion, &err.into());
        }
        transition(&completion, PipelineState::Persisted);

        // The session was removed above, so the snapshot carries none.
        let context = RequestContext::current();
        let pool = Arc::clone(&self.external_pool);
        let stage_completion = completion.clone();
        submit_stage(&pool, context, &completion, "enrich", move || {
            self.enrich(record, stage_completion);
        });
    }

    /// Inserts or updates `record`. Returns `false` if an update hit no row.
    fn store(&self, record: &mut QueryRecord) -> Result<bool, StageError> {
        let unit = UnitOfWork::new(&self.provider);
        if record.id.is_some() {
            Ok(unit.run(|| self.dao.update(record))?)
        } else {
            unit.run(|| self.dao.persist(record))?;
            Ok(true)
        }
    }

    fn enrich(self, mut record: QueryRecord, completion: CompletionHandle) {
        match self.external.get_link(&record.query) {
            Ok(link) => record.result = Some(link),
            Err(err) => return fail(&completion, &err.into()),
        }
        transition(&completion, PipelineState::Enriched);

        let context = RequestContext::current();
        let pool = Arc::clone(&self.db_pool);
        let stage_completion = completion.clone();
        submit_stage(&pool, context, &completion, "finalize", move || {
            self.finalize(&record, &stage_completion);
        });
    }

    fn finalize(&self, record: &QueryRecord, completion: &CompletionHandle) {
        let updated: Result<bool, StageError> = UnitOfWork::new(&self.provider)
            .run(|| self.dao.update(record))
            .map_err(StageError::from);
        let closed = self.provider.close_and_remove();

        let result = updated.and_then(|_| closed.map_err(StageError::from));
        match result {
            Ok(()) => {
                transition(completion, PipelineState::Finalized);
                completion.complete(Outcome::see_other(QUERY_LIST_LOCATION));
            }
            Err(err) => fail(completion, &err),
        }
    }
}

impl<F: SessionFactory> Clone for SaveQueryPipeline<F> {
    fn clone(&self) -> Self {
        Self {
            db_pool: Arc::clone(&self.db_pool),
            external_pool: Arc::clone(&self.external_pool),
            provider: self.provider.clone(),
            dao: Arc::clone(&self.dao),
            external: Arc::clone(&self.external),
        }
    }
}

fn transition(completion: &CompletionHandle, state: PipelineState) {
    debug!(request_id = completion.request_id(), state = state.as_str(), "pipeline transition");
}

fn fail(completion: &CompletionHandle, err: &StageError) {
    transition(completion, PipelineState::Failed);
    completion.complete(failure_outcome(err));
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
