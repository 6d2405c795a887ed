use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use handoff_core::SessionFactory;
use parking_lot::RwLock;

use super::error::ConfigError;
use super::pool::WorkerPool;
use crate::storage::SessionProvider;

// ---------------------------------------------------------------------------
// ManagedFactory trait
// ---------------------------------------------------------------------------

/// Type-erased view of a group's session factory.
///
/// Lets the registry own factories of different concrete types and close
/// them at shutdown; [`ResourceRegistry::provider`] recovers the concrete
/// type by downcasting.
pub trait ManagedFactory: Send + Sync + Any {
    fn close(&self);

    fn is_open(&self) -> bool;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<F: SessionFactory> ManagedFactory for F {
    fn close(&self) {
        SessionFactory::close(self);
    }

    fn is_open(&self) -> bool {
        SessionFactory::is_open(self)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// ---------------------------------------------------------------------------
// ResourceGroup
// ---------------------------------------------------------------------------

/// A named downstream dependency with its dedicated worker pool and, for
/// databases, its session factory.
pub struct ResourceGroup {
    name: Arc<str>,
    pool: Arc<WorkerPool>,
    factory: Option<Arc<dyn ManagedFactory>>,
    shutdown_timeout: Duration,
}

/// Result of shutting down one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupShutdown {
    pub group: String,
    /// Whether the pool drained within its timeout.
    pub drained: bool,
    pub elapsed: Duration,
}

impl ResourceGroup {
    #[must_use]
    pub fn new(
        name: impl Into<Arc<str>>,
        pool: Arc<WorkerPool>,
        factory: Option<Arc<dyn ManagedFactory>>,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            pool,
            factory,
            shutdown_timeout,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    #[must_use]
    pub fn has_factory(&self) -> bool {
        self.factory.is_some()
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Drains the pool, then closes the factory. Blocks the calling thread.
    pub fn shutdown(&self) -> GroupShutdown {
        let started = Instant::now();
        let drained = self.pool.shutdown_gracefully(self.shutdown_timeout);
        if let Some(factory) = &self.factory {
            factory.close();
        }
        GroupShutdown {
            group: self.name.to_string(),
            drained,
            elapsed: started.elapsed(),
        }
    }
}

impl fmt::Debug for ResourceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceGroup")
            .field("name", &self.name)
            .field("pool", &self.pool)
            .field("has_factory", &self.factory.is_some())
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ResourceRegistry
// ---------------------------------------------------------------------------

/// Registry of declared resource groups.
///
/// Lookups are by group name. A lookup for an undeclared group is a
/// configuration error.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    by_name: DashMap<Arc<str>, Arc<ResourceGroup>>,
    /// Registration order.
    order: RwLock<Vec<Arc<str>>>,
}

impl ResourceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `group`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DuplicateGroup`] if a group of that name exists.
    pub fn register(&self, group: ResourceGroup) -> Result<(), ConfigError> {
        let name = Arc::clone(&group.name);
        match self.by_name.entry(Arc::clone(&name)) {
            Entry::Occupied(_) => Err(ConfigError::DuplicateGroup {
                name: name.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(group));
                self.order.write().push(name);
                Ok(())
            }
        }
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownGroup`] if `name` was never registered.
    pub fn group(&self, name: &str) -> Result<Arc<ResourceGroup>, ConfigError> {
        self.by_name
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ConfigError::UnknownGroup {
                name: name.to_string(),
            })
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownGroup`] if `name` was never registered.
    pub fn pool(&self, name: &str) -> Result<Arc<WorkerPool>, ConfigError> {
        self.group(name).map(|group| Arc::clone(group.pool()))
    }

    /// Returns a session provider for database group `name`.
    ///
    /// # Errors
    ///
    /// Fails if the group is undeclared, has no factory, or its factory is
    /// not an `F`.
    pub fn provider<F: SessionFactory>(&self, name: &str) -> Result<SessionProvider<F>, ConfigError> {
        let group = self.group(name)?;
        let factory = group
            .factory
            .as_ref()
            .ok_or_else(|| ConfigError::MissingFactory {
                name: name.to_string(),
            })?;
        let typed = Arc::clone(factory)
            .into_any()
            .downcast::<F>()
            .map_err(|_| ConfigError::FactoryTypeMismatch {
                name: name.to_string(),
            })?;
        Ok(SessionProvider::new(Arc::clone(&group.name), typed))
    }

    /// All groups in registration order.
    #[must_use]
    pub fn groups(&self) -> Vec<Arc<ResourceGroup>> {
        self.order
            .read()
            .iter()
            .filter_map(|name| self.by_name.get(name).map(|entry| Arc::clone(entry.value())))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use handoff_core::{Session, SessionError};

    use super::*;
    use crate::storage::{MemoryDatabase, MemorySessionFactory};

    struct OtherSession;

    impl Session for OtherSession {
        fn begin(&self) -> Result<(), SessionError> {
            Ok(())
        }
        fn is_transaction_active(&self) -> bool {
            false
        }
        fn set_rollback_only(&self) -> Result<(), SessionError> {
            Ok(())
        }
        fn is_rollback_only(&self) -> bool {
            false
        }
        fn commit(&self) -> Result<(), SessionError> {
            Ok(())
        }
        fn rollback(&self) -> Result<(), SessionError> {
            Ok(())
        }
        fn close(&self) -> Result<(), SessionError> {
            Ok(())
        }
        fn is_open(&self) -> bool {
            true
        }
    }

    struct OtherFactory;

    impl SessionFactory for OtherFactory {
        type Session = OtherSession;
        fn create_session(&self) -> Result<OtherSession, SessionError> {
            Ok(OtherSession)
        }
        fn close(&self) {}
        fn is_open(&self) -> bool {
            true
        }
    }

    fn database_group(name: &str) -> (ResourceGroup, Arc<MemorySessionFactory>) {
        let factory = Arc::new(MemorySessionFactory::new(
            name,
            Arc::new(MemoryDatabase::new()),
            2,
            Duration::from_millis(20),
        ));
        let managed: Arc<dyn ManagedFactory> = factory.clone();
        let group = ResourceGroup::new(
            name,
            Arc::new(WorkerPool::new(name, 2).unwrap()),
            Some(managed),
            Duration::from_secs(1),
        );
        (group, factory)
    }

    fn external_group(name: &str) -> ResourceGroup {
        ResourceGroup::new(
            name,
            Arc::new(WorkerPool::new(name, 1).unwrap()),
            None,
            Duration::from_secs(1),
        )
    }

    #[test]
    fn register_and_look_up_by_name() {
        let registry = ResourceRegistry::new();
        let (group, _factory) = database_group("queryRecordDb");
        registry.register(group).unwrap();

        assert_eq!(registry.group("queryRecordDb").unwrap().name(), "queryRecordDb");
        assert_eq!(registry.pool("queryRecordDb").unwrap().size(), 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unknown_group_is_a_config_error() {
        let registry = ResourceRegistry::new();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.pool("nope"),
            Err(ConfigError::UnknownGroup { name }) if name == "nope"
        ));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = ResourceRegistry::new();
        registry.register(external_group("externalService")).unwrap();
        assert!(matches!(
            registry.register(external_group("externalService")),
            Err(ConfigError::DuplicateGroup { .. })
        ));
    }

    #[test]
    fn provider_downcasts_to_the_registered_factory() {
        let registry = ResourceRegistry::new();
        let (group, factory) = database_group("queryRecordDb");
        registry.register(group).unwrap();

        let provider = registry
            .provider::<MemorySessionFactory>("queryRecordDb")
            .unwrap();
        assert!(Arc::ptr_eq(provider.factory(), &factory));
        assert_eq!(provider.group(), "queryRecordDb");
    }

    #[test]
    fn provider_for_wrong_factory_type_fails() {
        let registry = ResourceRegistry::new();
        let (group, _factory) = database_group("queryRecordDb");
        registry.register(group).unwrap();

        assert!(matches!(
            registry.provider::<OtherFactory>("queryRecordDb"),
            Err(ConfigError::FactoryTypeMismatch { .. })
        ));
    }

    #[test]
    fn provider_for_group_without_factory_fails() {
        let registry = ResourceRegistry::new();
        registry.register(external_group("externalService")).unwrap();

        assert!(matches!(
            registry.provider::<MemorySessionFactory>("externalService"),
            Err(ConfigError::MissingFactory { .. })
        ));
    }

    #[test]
    fn groups_are_listed_in_registration_order() {
        let registry = ResourceRegistry::new();
        registry.register(external_group("c")).unwrap();
        registry.register(external_group("a")).unwrap();
        registry.register(external_group("b")).unwrap();

        let names: Vec<String> = registry.groups().iter().map(|g| g.name().to_string()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn group_shutdown_drains_pool_and_closes_factory() {
        let (group, factory) = database_group("queryRecordDb");
        assert!(group.has_factory());

        let report = group.shutdown();

        assert!(report.drained);
        assert_eq!(report.group, "queryRecordDb");
        assert!(!SessionFactory::is_open(&*factory));
        assert!(group.pool().submit(|| {}).is_err());
    }
}
