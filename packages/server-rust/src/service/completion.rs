//! Exactly-once completion of asynchronously processed requests.
//!
//! A [`CompletionHandle`] travels with a request through every stage. The
//! first [`complete`](CompletionHandle::complete) call delivers the outcome to
//! the transport; later calls are ignored. If every clone is dropped without
//! completing (a stage task discarded by a pool that was shut down), the
//! caller is answered with [`Outcome::Unavailable`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use handoff_core::{AsyncHandle, Outcome};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

struct Inner {
    request_id: Arc<str>,
    handle: Arc<dyn AsyncHandle>,
    completed: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if !self.completed.swap(true, Ordering::AcqRel) {
            warn!(request_id = %self.request_id, "request abandoned before completion");
            self.handle
                .complete_with(Outcome::unavailable("request was abandoned"));
        }
    }
}

/// Shared, clonable completion of one request.
#[derive(Clone)]
pub struct CompletionHandle {
    inner: Arc<Inner>,
}

impl CompletionHandle {
    #[must_use]
    pub fn new(request_id: impl Into<Arc<str>>, handle: Arc<dyn AsyncHandle>) -> Self {
        Self {
            inner: Arc::new(Inner {
                request_id: request_id.into(),
                handle,
                completed: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.inner.request_id
    }

    /// Delivers `outcome` unless the request was already completed.
    ///
    /// Returns `true` if this call was the one that completed the request,
    /// whether or not the caller was still waiting for it.
    pub fn complete(&self, outcome: Outcome) -> bool {
        if self.inner.completed.swap(true, Ordering::AcqRel) {
            debug!(request_id = %self.inner.request_id, "duplicate completion ignored");
            return false;
        }
        let status = outcome.status_code();
        if !self.inner.handle.complete_with(outcome) {
            debug!(
                request_id = %self.inner.request_id,
                status,
                "caller no longer waiting for completion"
            );
        }
        true
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.inner.completed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("request_id", &self.inner.request_id)
            .field("completed", &self.is_completed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Oneshot-backed transport handle
// ---------------------------------------------------------------------------

/// [`AsyncHandle`] that forwards the outcome to an awaiting transport task.
#[derive(Debug)]
pub struct OneshotHandle {
    tx: Mutex<Option<oneshot::Sender<Outcome>>>,
}

impl AsyncHandle for OneshotHandle {
    fn complete_with(&self, outcome: Outcome) -> bool {
        self.tx
            .lock()
            .take()
            .is_some_and(|tx| tx.send(outcome).is_ok())
    }
}

/// The transport side of a request started with [`start_async`].
#[derive(Debug)]
pub struct PendingOutcome {
    rx: oneshot::Receiver<Outcome>,
    timeout: Duration,
}

impl PendingOutcome {
    /// Waits for the pipeline to complete the request.
    ///
    /// Resolves to [`Outcome::Unavailable`] when the timeout expires first.
    /// Stages still running keep running; their completion is then dropped.
    pub async fn wait(self) -> Outcome {
        match tokio::time::timeout(self.timeout, self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Outcome::server_error("request completion was lost"),
            Err(_) => Outcome::unavailable("request timed out"),
        }
    }
}

/// Starts asynchronous processing of one request with a completion timeout.
#[must_use]
pub fn start_async(
    request_id: impl Into<Arc<str>>,
    timeout: Duration,
) -> (CompletionHandle, PendingOutcome) {
    let (tx, rx) = oneshot::channel();
    let handle = Arc::new(OneshotHandle {
        tx: Mutex::new(Some(tx)),
    });
    (
        CompletionHandle::new(request_id, handle),
        PendingOutcome { rx, timeout },
    )
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use super::test_support::recording;
    use super::*;

    #[test]
    fn first_completion_wins() {
        let (completion, recorder, _rx) = recording("req");
        let clone = completion.clone();

        assert!(completion.complete(Outcome::see_other("/queryList")));
        assert!(!clone.complete(Outcome::server_error("late")));
        assert!(clone.is_completed());

        assert_eq!(recorder.outcomes(), vec![Outcome::see_other("/queryList")]);
    }

    #[test]
    fn dropping_all_clones_without_completing_answers_unavailable() {
        let (completion, recorder, _rx) = recording("req");
        let clone = completion.clone();
        drop(completion);
        assert!(recorder.outcomes().is_empty());
        drop(clone);

        assert_eq!(
            recorder.outcomes(),
            vec![Outcome::unavailable("request was abandoned")]
        );
    }

    #[test]
    fn completed_handle_does_not_complete_again_on_drop() {
        let (completion, recorder, _rx) = recording("req");
        completion.complete(Outcome::Json(serde_json::json!([])));
        drop(completion);
        assert_eq!(recorder.outcomes().len(), 1);
    }

    #[tokio::test]
    async fn pending_outcome_receives_completion() {
        let (completion, pending) = start_async("req", Duration::from_secs(5));
        std::thread::spawn(move || completion.complete(Outcome::see_other("/queryList")));
        assert_eq!(pending.wait().await, Outcome::see_other("/queryList"));
    }

    #[tokio::test(start_paused = true)]
    async fn pending_outcome_times_out() {
        let (completion, pending) = start_async("req", Duration::from_millis(100));
        assert_eq!(pending.wait().await, Outcome::unavailable("request timed out"));

        // The caller has moved on; completing is still accepted.
        assert!(completion.complete(Outcome::see_other("/queryList")));
    }
}
