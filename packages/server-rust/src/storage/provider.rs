//! Scoped session provider.
//!
//! A [`SessionProvider`] resolves "the session of resource group G for the
//! request running on this thread". The session is stored as an attribute of
//! the installed [`RequestContext`], created lazily on the first
//! [`get`](SessionProvider::get) and reused until it is removed from scope.

use std::fmt;
use std::sync::Arc;

use handoff_core::{RequestContext, Session, SessionError, SessionFactory};
use tracing::debug;

/// Errors returned by [`SessionProvider`].
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// `get` was called on a thread with no installed request context.
    #[error("no request context is active for resource group {group}")]
    NoActiveContext { group: String },
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Supplies the session of one resource group bound to the calling thread's
/// request context.
///
/// Contract: a session must be closed before it is removed from scope.
/// Removing an open session detaches it without releasing its connection;
/// the provider does not check this.
pub struct SessionProvider<F: SessionFactory> {
    group: Arc<str>,
    key: Arc<str>,
    factory: Arc<F>,
}

impl<F: SessionFactory> SessionProvider<F> {
    #[must_use]
    pub fn new(group: impl Into<Arc<str>>, factory: Arc<F>) -> Self {
        let group = group.into();
        let key = Arc::from(format!("session:{group}"));
        Self {
            group,
            key,
            factory,
        }
    }

    /// Name of the resource group this provider serves.
    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    #[must_use]
    pub fn factory(&self) -> &Arc<F> {
        &self.factory
    }

    /// Returns the session bound to the current context, opening one if the
    /// context has none yet.
    ///
    /// Repeated calls within one context return the same session until
    /// [`remove_from_scope`](Self::remove_from_scope) is called.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::NoActiveContext`] if the calling thread has no
    /// installed context, or the factory's error if a session cannot be opened.
    pub fn get(&self) -> Result<Arc<F::Session>, ProviderError> {
        match RequestContext::with_current(|ctx| ctx.get::<F::Session>(&self.key)) {
            None => Err(self.no_context()),
            Some(Some(session)) => Ok(session),
            Some(None) => {
                // Opened outside the context borrow: create_session may block.
                let session = Arc::new(self.factory.create_session()?);
                let attached = RequestContext::with_current(|ctx| {
                    ctx.insert(self.key.to_string(), Arc::clone(&session));
                });
                if attached.is_none() {
                    return Err(self.no_context());
                }
                debug!(group = %self.group, "session bound to request context");
                Ok(session)
            }
        }
    }

    /// Returns the bound session without opening one.
    #[must_use]
    pub fn current(&self) -> Option<Arc<F::Session>> {
        RequestContext::with_current(|ctx| ctx.get::<F::Session>(&self.key)).flatten()
    }

    /// Detaches the bound session from the current context without closing it.
    ///
    /// The next [`get`](Self::get) in this context opens a fresh session.
    pub fn remove_from_scope(&self) -> Option<Arc<F::Session>> {
        RequestContext::with_current(|ctx| ctx.remove(&self.key))
            .flatten()
            .and_then(|attribute| attribute.downcast::<F::Session>().ok())
    }

    /// Closes the bound session (if any) and removes it from scope.
    ///
    /// The session is removed even when closing fails, so a later `get`
    /// never sees it again.
    ///
    /// # Errors
    ///
    /// Returns the session's close error.
    pub fn close_and_remove(&self) -> Result<(), SessionError> {
        let Some(session) = self.remove_from_scope() else {
            return Ok(());
        };
        session.close()
    }

    fn no_context(&self) -> ProviderError {
        ProviderError::NoActiveContext {
            group: self.group.to_string(),
        }
    }
}

impl<F: SessionFactory> Clone for SessionProvider<F> {
    fn clone(&self) -> Self {
        Self {
            group: Arc::clone(&self.group),
            key: Arc::clone(&self.key),
            factory: Arc::clone(&self.factory),
        }
    }
}

impl<F: SessionFactory> fmt::Debug for SessionProvider<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionProvider")
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}
