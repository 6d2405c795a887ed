//! Interfaces of the collaborators the server consumes but does not own:
//! the session backend, the external enrichment service, and the transport's
//! asynchronous completion handle.

use serde_json::Value;

// ---------------------------------------------------------------------------
// Session backend
// ---------------------------------------------------------------------------

/// Errors raised by a [`Session`] or [`SessionFactory`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("cannot close a session while its transaction is active")]
    TransactionActive,
    #[error("no transaction is active on this session")]
    NoTransaction,
    #[error("a transaction is already active on this session")]
    TransactionAlreadyActive,
    #[error("timed out after {waited_ms}ms waiting for a free connection")]
    ConnectionTimeout { waited_ms: u64 },
    #[error("session factory has been closed")]
    FactoryClosed,
    #[error("backend error: {0}")]
    Backend(String),
}

/// A handle to one stateful backing-store connection plus its transaction.
///
/// Implementations synchronize internally; every method takes `&self` so a
/// handle can be shared through `Arc` by the request context that owns it.
pub trait Session: Send + Sync + 'static {
    /// Begins a transaction. Fails if one is already active.
    fn begin(&self) -> Result<(), SessionError>;

    /// Whether a transaction is currently active.
    fn is_transaction_active(&self) -> bool;

    /// Marks the active transaction so that it can only be rolled back.
    fn set_rollback_only(&self) -> Result<(), SessionError>;

    /// Whether the active transaction was marked rollback-only.
    fn is_rollback_only(&self) -> bool;

    /// Commits the active transaction.
    fn commit(&self) -> Result<(), SessionError>;

    /// Rolls back the active transaction, discarding its writes.
    fn rollback(&self) -> Result<(), SessionError>;

    /// Closes the session and releases its connection.
    ///
    /// Fails with [`SessionError::TransactionActive`] while a transaction is
    /// still active. Closing twice is a no-op.
    fn close(&self) -> Result<(), SessionError>;

    /// Whether [`Session::close`] has not been called yet.
    fn is_open(&self) -> bool;
}

/// Creates sessions for one resource group.
pub trait SessionFactory: Send + Sync + 'static {
    type Session: Session;

    /// Opens a new session, waiting for a free connection if the backend's
    /// connection pool is exhausted.
    fn create_session(&self) -> Result<Self::Session, SessionError>;

    /// Releases the factory. Later `create_session` calls fail.
    fn close(&self);

    /// Whether [`SessionFactory::close`] has not been called yet.
    fn is_open(&self) -> bool;
}

// ---------------------------------------------------------------------------
// External enrichment service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExternalServiceError {
    #[error("external service unavailable: {0}")]
    Unavailable(String),
    #[error("external service rejected input: {0}")]
    InvalidInput(String),
}

/// A synchronous, blocking client of a slow external service.
///
/// No internal pooling is assumed; callers bound concurrency by running calls
/// on a worker pool sized to the service's allowed connection count.
pub trait ExternalService: Send + Sync + 'static {
    /// Looks up the result for `query`. May block for seconds.
    fn get_link(&self, query: &str) -> Result<String, ExternalServiceError>;
}

// ---------------------------------------------------------------------------
// Transport completion
// ---------------------------------------------------------------------------

/// Caller-visible result of processing one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Success with a JSON body.
    Json(Value),
    /// Redirect the caller to `location` (see-other semantics).
    SeeOther { location: String },
    /// The request failed on the server side.
    ServerError { message: String },
    /// The server could not take the request on (shutting down, timed out).
    Unavailable { message: String },
}

impl Outcome {
    #[must_use]
    pub fn see_other(location: impl Into<String>) -> Self {
        Self::SeeOther {
            location: location.into(),
        }
    }

    #[must_use]
    pub fn server_error(message: impl Into<String>) -> Self {
        Self::ServerError {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// HTTP status code the transport should report for this outcome.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Json(_) => 200,
            Self::SeeOther { .. } => 303,
            Self::ServerError { .. } => 500,
            Self::Unavailable { .. } => 503,
        }
    }
}

/// The transport's handle for completing one asynchronously processed request.
pub trait AsyncHandle: Send + Sync + 'static {
    /// Delivers `outcome` to the original caller.
    ///
    /// Returns `false` if the caller is no longer waiting (timed out or
    /// disconnected). That is not an error for the completing stage.
    fn complete_with(&self, outcome: Outcome) -> bool;
}
