//! Stage boundaries and the single-hop session dispatcher.
//!
//! Every stage of a pipeline runs through [`submit_stage`], which hands the
//! stage body to a worker pool together with the request context snapshot it
//! must run under, and wraps the body in [`run_stage`]: a panic is logged,
//! the request is completed with a server error, and the unwind continues so
//! the failure is never swallowed.

use std::panic::{self, AssertUnwindSafe};

use handoff_core::{Outcome, RequestContext, SessionFactory};
use tracing::{debug, error, info_span, warn};

use super::completion::CompletionHandle;
use super::error::StageError;
use super::pool::{panic_message, WorkerPool};
use crate::storage::SessionProvider;

/// Runs `body` as stage `stage` of the request `completion` belongs to.
///
/// If `body` panics, the request is completed with a server error and the
/// panic is resumed.
pub fn run_stage<R>(
    stage: &'static str,
    completion: &CompletionHandle,
    body: impl FnOnce() -> R,
) -> R {
    let span = info_span!("stage", request_id = completion.request_id(), stage);
    let _entered = span.enter();
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(value) => value,
        Err(payload) => {
            error!(panic = panic_message(payload.as_ref()), "stage panicked");
            completion.complete(Outcome::server_error("internal server error"));
            panic::resume_unwind(payload)
        }
    }
}

/// Submits `body` to `pool` as the next stage of a request.
///
/// `context` is the snapshot the stage runs under. If the pool no longer
/// accepts tasks the request is completed as unavailable and `false` is
/// returned.
pub fn submit_stage(
    pool: &WorkerPool,
    context: Option<RequestContext>,
    completion: &CompletionHandle,
    stage: &'static str,
    body: impl FnOnce() + Send + 'static,
) -> bool {
    let task_completion = completion.clone();
    let submitted = pool.submit_with_context(context, move || {
        run_stage(stage, &task_completion, body);
    });
    match submitted {
        Ok(()) => {
            debug!(request_id = completion.request_id(), pool = pool.name(), stage, "stage submitted");
            true
        }
        Err(err) => {
            warn!(request_id = completion.request_id(), stage, error = %err, "stage rejected");
            completion.complete(Outcome::unavailable(err.to_string()));
            false
        }
    }
}

/// Logs a stage failure and converts it into the caller-visible outcome.
///
/// A caller that went away is not a stage failure: [`CompletionHandle::complete`]
/// logs it at `debug` when the transport no longer accepts the outcome.
pub fn failure_outcome(err: &StageError) -> Outcome {
    error!(error = %err, "stage failed");
    Outcome::server_error(err.to_string())
}

/// Runs `operation` on `pool` in a fresh context for request
/// `completion`, then closes and removes the group's session and completes
/// the request exactly once.
///
/// Returns `false` if the pool rejected the task (the request has then been
/// completed as unavailable).
pub fn dispatch_in_session<F, Op>(
    pool: &WorkerPool,
    provider: SessionProvider<F>,
    completion: &CompletionHandle,
    operation: Op,
) -> bool
where
    F: SessionFactory,
    Op: FnOnce() -> Result<Outcome, StageError> + Send + 'static,
{
    let context = RequestContext::new(completion.request_id());
    let task_completion = completion.clone();
    submit_stage(pool, Some(context), completion, "dispatch", move || {
        let outcome = operation().unwrap_or_else(|err| failure_outcome(&err));
        if let Err(err) = provider.close_and_remove() {
            warn!(group = provider.group(), error = %err, "failed to close session");
        }
        task_completion.complete(outcome);
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use handoff_core::Session;

    use super::*;
    use crate::service::completion::test_support::recording;
    use crate::storage::{MemoryDatabase, MemorySessionFactory};

    const WAIT: Duration = Duration::from_secs(5);

    fn provider() -> SessionProvider<MemorySessionFactory> {
        let factory = MemorySessionFactory::new(
            "queryRecordDb",
            Arc::new(MemoryDatabase::new()),
            1,
            Duration::from_millis(50),
        );
        SessionProvider::new("queryRecordDb", Arc::new(factory))
    }

    #[test]
    fn run_stage_completes_and_resumes_on_panic() {
        let (completion, recorder, _rx) = recording("req");

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            run_stage("save", &completion, || panic!("fatal"));
        }));

        assert!(result.is_err(), "panic must not be swallowed");
        assert_eq!(
            recorder.outcomes(),
            vec![Outcome::server_error("internal server error")]
        );
    }

    #[test]
    fn run_stage_passes_through_normal_results() {
        let (completion, recorder, _rx) = recording("req");
        assert_eq!(run_stage("save", &completion, || 5), 5);
        assert!(recorder.outcomes().is_empty());
    }

    #[test]
    fn rejected_stage_completes_as_unavailable() {
        let pool = WorkerPool::new("closed", 1).unwrap();
        assert!(pool.shutdown_gracefully(WAIT));
        let (completion, recorder, _rx) = recording("req");

        assert!(!submit_stage(&pool, None, &completion, "save", || {}));
        assert!(matches!(recorder.outcomes()[..], [Outcome::Unavailable { .. }]));
    }

    #[test]
    fn dispatch_closes_session_and_completes_once() {
        let pool = WorkerPool::new("db", 1).unwrap();
        let provider = provider();
        let factory = Arc::clone(provider.factory());
        let (completion, recorder, rx) = recording("req-1");

        let op_provider = provider.clone();
        assert!(dispatch_in_session(&pool, provider, &completion, move || {
            let session = op_provider.get()?;
            assert!(session.is_open());
            assert_eq!(RequestContext::current().unwrap().request_id(), "req-1");
            Ok(Outcome::Json(serde_json::json!({ "ok": true })))
        }));
        drop(completion);

        let outcome = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(outcome, Outcome::Json(serde_json::json!({ "ok": true })));
        assert!(pool.shutdown_gracefully(WAIT));
        assert_eq!(recorder.outcomes().len(), 1);
        assert_eq!(factory.connections_in_use(), 0);
    }

    #[test]
    fn dispatch_converts_errors_to_server_error() {
        let pool = WorkerPool::new("db", 1).unwrap();
        let (completion, _recorder, rx) = recording("req");

        dispatch_in_session(&pool, provider(), &completion, || {
            Err(StageError::Session(handoff_core::SessionError::Closed))
        });

        let outcome = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(outcome, Outcome::server_error("session is closed"));
    }

    #[test]
    fn dispatch_completes_once_when_operation_panics() {
        let pool = WorkerPool::new("db", 1).unwrap();
        let provider = provider();
        let factory = Arc::clone(provider.factory());
        let (completion, recorder, rx) = recording("req");

        let op_provider = provider.clone();
        dispatch_in_session(&pool, provider, &completion, move || {
            op_provider.get()?;
            panic!("fatal failure in operation");
        });
        drop(completion);

        assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Outcome::ServerError { .. }));
        assert!(pool.shutdown_gracefully(WAIT));
        assert_eq!(recorder.outcomes().len(), 1);
        assert_eq!(factory.connections_in_use(), 0, "context drop releases the session");
    }
}
