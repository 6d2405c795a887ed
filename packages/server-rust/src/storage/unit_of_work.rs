//! Transactional unit-of-work runner.
//!
//! [`UnitOfWork::run`] wraps an operation in a transaction on the session of
//! the current request context:
//!
//! 1. Begin a transaction unless one is already active.
//! 2. Run the operation.
//! 3. Commit if it returned `Ok` and the transaction is not rollback-only;
//!    otherwise roll back and return the failure.
//!
//! Exactly one of commit or rollback is performed per outermost run. A run
//! nested inside an active transaction joins it and leaves the terminal
//! action to the outer run; a nested failure marks the transaction
//! rollback-only so the outer run cannot commit it.

use handoff_core::{Session, SessionError, SessionFactory};
use tracing::{debug, warn};

use super::provider::{ProviderError, SessionProvider};

/// Errors produced by the transaction machinery itself, as opposed to the
/// wrapped operation.
#[derive(Debug, thiserror::Error)]
pub enum TxError {
    /// The operation returned normally but the transaction was marked
    /// rollback-only, so it was rolled back instead of committed.
    #[error("transaction was marked rollback-only and has been rolled back")]
    RollbackOnly,
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Runs operations inside transactions on one resource group's session.
#[derive(Debug)]
pub struct UnitOfWork<'a, F: SessionFactory> {
    provider: &'a SessionProvider<F>,
}

impl<'a, F: SessionFactory> UnitOfWork<'a, F> {
    #[must_use]
    pub fn new(provider: &'a SessionProvider<F>) -> Self {
        Self { provider }
    }

    /// Runs `operation` inside a transaction.
    ///
    /// The operation's own error is returned unchanged after rollback.
    ///
    /// # Errors
    ///
    /// Returns the operation's error, or a [`TxError`] converted into `E` when
    /// the session cannot be obtained, the transaction cannot begin, the
    /// transaction was marked rollback-only, or the commit fails.
    pub fn run<T, E>(&self, operation: impl FnOnce() -> Result<T, E>) -> Result<T, E>
    where
        E: From<TxError>,
    {
        let session = self.provider.get().map_err(TxError::from)?;

        if session.is_transaction_active() {
            return operation().inspect_err(|_| {
                if let Err(err) = session.set_rollback_only() {
                    warn!(group = self.provider.group(), error = %err, "could not mark transaction rollback-only");
                }
            });
        }

        session.begin().map_err(TxError::from)?;
        let guard = RollbackOnUnwind {
            session: Some(&*session),
            group: self.provider.group(),
        };
        let result = operation();
        guard.disarm();

        match result {
            Ok(_) if session.is_rollback_only() => {
                self.rollback(&*session);
                Err(TxError::RollbackOnly.into())
            }
            Ok(value) => match session.commit() {
                Ok(()) => Ok(value),
                Err(err) => {
                    if session.is_transaction_active() {
                        self.rollback(&*session);
                    }
                    Err(TxError::Session(err).into())
                }
            },
            Err(err) => {
                if session.is_transaction_active() {
                    self.rollback(&*session);
                }
                Err(err)
            }
        }
    }

    fn rollback(&self, session: &F::Session) {
        match session.rollback() {
            Ok(()) => debug!(group = self.provider.group(), "transaction rolled back"),
            Err(err) => {
                warn!(group = self.provider.group(), error = %err, "rollback failed");
            }
        }
    }
}

/// Rolls back the transaction if the operation unwinds.
struct RollbackOnUnwind<'s, S: Session> {
    session: Option<&'s S>,
    group: &'s str,
}

impl<S: Session> RollbackOnUnwind<'_, S> {
    fn disarm(mut self) {
        self.session = None;
    }
}

impl<S: Session> Drop for RollbackOnUnwind<'_, S> {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        if session.is_transaction_active() {
            warn!(group = self.group, "operation panicked; rolling back transaction");
            if let Err(err) = session.rollback() {
                warn!(group = self.group, error = %err, "rollback after panic failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
