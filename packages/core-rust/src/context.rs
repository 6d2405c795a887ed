//! Request-scoped context attached to the thread that executes a task.
//!
//! A [`RequestContext`] is an owned snapshot of "the current logical request":
//! its identity plus a set of named attributes (for example the session handle
//! of a resource group). Handing work to another pool copies the snapshot, so
//! stages of unrelated requests that share a pool thread never observe each
//! other's attributes, and a stage that detaches an attribute only affects the
//! copy it is running with.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// A type-erased attribute value stored in a [`RequestContext`].
pub type Attribute = Arc<dyn Any + Send + Sync>;

thread_local! {
    static CURRENT: RefCell<Option<RequestContext>> = const { RefCell::new(None) };
}

/// Per-request context carrying identity and request-scoped attributes.
///
/// Cloning is cheap: attribute values are reference counted, only the map of
/// names is copied.
#[derive(Clone)]
pub struct RequestContext {
    request_id: Arc<str>,
    attributes: HashMap<String, Attribute>,
}

impl RequestContext {
    /// Creates an empty context for the request identified by `request_id`.
    #[must_use]
    pub fn new(request_id: impl Into<Arc<str>>) -> Self {
        Self {
            request_id: request_id.into(),
            attributes: HashMap::new(),
        }
    }

    /// Identity of the logical request this context belongs to.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Returns the attribute stored under `key` if it exists and has type `T`.
    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.attributes
            .get(key)
            .and_then(|attr| Arc::clone(attr).downcast::<T>().ok())
    }

    /// Stores `value` under `key`, returning the attribute it replaced.
    pub fn insert<T: Any + Send + Sync>(
        &mut self,
        key: impl Into<String>,
        value: Arc<T>,
    ) -> Option<Attribute> {
        self.attributes.insert(key.into(), value)
    }

    /// Detaches the attribute stored under `key` from this context.
    ///
    /// The value itself is not touched: releasing whatever it holds is the
    /// caller's responsibility.
    pub fn remove(&mut self, key: &str) -> Option<Attribute> {
        self.attributes.remove(key)
    }

    /// Whether an attribute is stored under `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    /// Installs this context as the calling thread's active context.
    ///
    /// The previously active context (if any) is restored when the returned
    /// guard drops, including while unwinding from a panic.
    #[must_use = "the context is uninstalled as soon as the guard is dropped"]
    pub fn enter(self) -> ScopeGuard {
        let previous = CURRENT.with(|current| current.replace(Some(self)));
        ScopeGuard {
            previous,
            _not_send: PhantomData,
        }
    }

    /// Returns a snapshot of the calling thread's active context.
    #[must_use]
    pub fn current() -> Option<Self> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Whether a context is installed on the calling thread.
    #[must_use]
    pub fn is_active() -> bool {
        CURRENT.with(|current| current.borrow().is_some())
    }

    /// Runs `f` against the calling thread's active context.
    ///
    /// Returns `None` when no context is installed. `f` must not call back
    /// into [`RequestContext::current`] or `with_current`.
    pub fn with_current<R>(f: impl FnOnce(&mut Self) -> R) -> Option<R> {
        CURRENT.with(|current| current.borrow_mut().as_mut().map(f))
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&str> = self.attributes.keys().map(String::as_str).collect();
        keys.sort_unstable();
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("attributes", &keys)
            .finish()
    }
}

/// Guard returned by [`RequestContext::enter`].
///
/// Not `Send`: it must be dropped on the thread that installed the context.
pub struct ScopeGuard {
    previous: Option<RequestContext>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        // The thread-local may already be gone if the thread is exiting.
        let _ = CURRENT.try_with(|current| {
            *current.borrow_mut() = previous;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_context_outside_scope() {
        assert!(!RequestContext::is_active());
        assert!(RequestContext::current().is_none());
        assert!(RequestContext::with_current(|_| ()).is_none());
    }

    #[test]
    fn enter_installs_and_guard_clears() {
        {
            let _guard = RequestContext::new("req-1").enter();
            let current = RequestContext::current().unwrap();
            assert_eq!(current.request_id(), "req-1");
        }
        assert!(RequestContext::current().is_none());
    }

    #[test]
    fn nested_enter_restores_outer_context() {
        let _outer = RequestContext::new("outer").enter();
        {
            let _inner = RequestContext::new("inner").enter();
            assert_eq!(RequestContext::current().unwrap().request_id(), "inner");
        }
        assert_eq!(RequestContext::current().unwrap().request_id(), "outer");
    }

    #[test]
    fn typed_attribute_lookup() {
        let mut ctx = RequestContext::new("req");
        ctx.insert("count", Arc::new(7_u32));

        assert_eq!(*ctx.get::<u32>("count").unwrap(), 7);
        assert!(ctx.get::<String>("count").is_none(), "wrong type yields None");
        assert!(ctx.get::<u32>("missing").is_none());
    }

    #[test]
    fn snapshot_is_independent_of_the_installed_context() {
        let mut ctx = RequestContext::new("req");
        ctx.insert("session", Arc::new("handle".to_string()));
        let _guard = ctx.enter();

        let snapshot = RequestContext::current().unwrap();
        RequestContext::with_current(|current| current.remove("session"));

        assert!(snapshot.contains("session"), "copy keeps the attribute");
        assert!(!RequestContext::current().unwrap().contains("session"));
    }

    #[test]
    fn with_current_mutates_the_installed_context() {
        let _guard = RequestContext::new("req").enter();
        RequestContext::with_current(|ctx| ctx.insert("flag", Arc::new(true)));
        assert!(RequestContext::current().unwrap().contains("flag"));
    }

    #[test]
    fn guard_restores_context_when_unwinding() {
        let result = std::panic::catch_unwind(|| {
            let _guard = RequestContext::new("doomed").enter();
            panic!("task failed");
        });
        assert!(result.is_err());
        assert!(RequestContext::current().is_none());
    }

    #[test]
    fn debug_lists_attribute_names_only() {
        let mut ctx = RequestContext::new("req-9");
        ctx.insert("b", Arc::new(1_u8));
        ctx.insert("a", Arc::new(2_u8));
        let rendered = format!("{ctx:?}");
        assert!(rendered.contains("req-9"));
        assert!(rendered.contains("[\"a\", \"b\"]"));
    }
}
