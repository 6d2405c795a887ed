//! Startup and shutdown of every resource group.
//!
//! [`Lifecycle::start`] creates each declared group's worker pool and, for
//! databases, its session factory. [`Lifecycle::shutdown`] fires the shutdown
//! signal, stops the keepalive pinger, then drains every group at the same
//! time, so total shutdown time is bounded by the slowest group.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use handoff_core::ExternalService;
use tracing::{error, info, warn};

use super::config::{ResourceKind, ServerConfig};
use super::domain::{ChatRoom, DatabaseBinding, DomainServices, SaveQueryPipeline};
use super::error::ConfigError;
use super::pool::WorkerPool;
use super::registry::{GroupShutdown, ManagedFactory, ResourceGroup, ResourceRegistry};
use super::worker::{BackgroundWorker, KeepalivePinger};
use crate::network::{ConnectionRegistry, ShutdownController};
use crate::storage::{
    MemoryChatLogDao, MemoryDatabase, MemoryQueryRecordDao, MemorySessionFactory,
    SimulatedExternalService,
};

/// Outcome of [`Lifecycle::shutdown`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// One entry per group, in registration order.
    pub groups: Vec<GroupShutdown>,
    pub elapsed: Duration,
}

impl ShutdownReport {
    #[must_use]
    pub fn all_drained(&self) -> bool {
        self.groups.iter().all(|group| group.drained)
    }

    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        millis(self.elapsed)
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
#[must_use]
pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Owns the resource groups and the process-wide shutdown signal.
pub struct Lifecycle {
    config: ServerConfig,
    resources: Arc<ResourceRegistry>,
    external: Arc<dyn ExternalService>,
    connections: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownController>,
    keepalive: Option<BackgroundWorker<KeepalivePinger>>,
}

impl Lifecycle {
    /// Validates `config` and creates every group it declares.
    ///
    /// # Errors
    ///
    /// Returns the validation error, or [`ConfigError::Pool`] if a worker
    /// thread could not be spawned.
    pub fn start(config: ServerConfig) -> Result<Self, ConfigError> {
        let processing_time = match config.group(&config.external_group).map(|g| &g.kind) {
            Some(ResourceKind::External { processing_time }) => *processing_time,
            _ => Duration::from_secs(1),
        };
        Self::start_with_external(config, Arc::new(SimulatedExternalService::new(processing_time)))
    }

    /// Like [`Lifecycle::start`] but enriches through `external`.
    ///
    /// # Errors
    ///
    /// See [`Lifecycle::start`].
    pub fn start_with_external(
        config: ServerConfig,
        external: Arc<dyn ExternalService>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let resources = Arc::new(ResourceRegistry::new());

        for group in &config.groups {
            let pool = Arc::new(WorkerPool::new(group.name.as_str(), group.pool_size)?);
            let factory: Option<Arc<dyn ManagedFactory>> = match &group.kind {
                ResourceKind::Database {
                    max_connections,
                    acquire_timeout,
                } => {
                    if group.pool_size > *max_connections {
                        warn!(
                            group = %group.name,
                            pool_size = group.pool_size,
                            max_connections,
                            "pool has more workers than connections"
                        );
                    }
                    let factory: Arc<dyn ManagedFactory> = Arc::new(MemorySessionFactory::new(
                        group.name.as_str(),
                        Arc::new(MemoryDatabase::new()),
                        *max_connections,
                        *acquire_timeout,
                    ));
                    Some(factory)
                }
                ResourceKind::External { .. } => None,
            };
            resources.register(ResourceGroup::new(
                group.name.as_str(),
                pool,
                factory,
                group.shutdown_timeout,
            ))?;
            info!(
                group = %group.name,
                kind = group.kind.as_str(),
                pool_size = group.pool_size,
                "{} created successfully",
                group.name
            );
        }

        Ok(Self {
            config,
            resources,
            external,
            connections: Arc::new(ConnectionRegistry::new()),
            shutdown: Arc::new(ShutdownController::new()),
            keepalive: None,
        })
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn resources(&self) -> Arc<ResourceRegistry> {
        Arc::clone(&self.resources)
    }

    /// Live chat connections.
    #[must_use]
    pub fn connections(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.connections)
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Wires the domain flows onto the configured groups.
    ///
    /// # Errors
    ///
    /// Fails if a flow's group is missing or of the wrong kind.
    pub fn services(&self) -> Result<DomainServices, ConfigError> {
        let query_pool = self.resources.pool(&self.config.query_group)?;
        let query_provider = self
            .resources
            .provider::<MemorySessionFactory>(&self.config.query_group)?;
        let query_dao = MemoryQueryRecordDao::shared(query_provider.clone());

        let chat_pool = self.resources.pool(&self.config.chat_group)?;
        let chat_provider = self
            .resources
            .provider::<MemorySessionFactory>(&self.config.chat_group)?;
        let chat_dao = MemoryChatLogDao::shared(chat_provider.clone());

        let save_query = SaveQueryPipeline::new(
            Arc::clone(&query_pool),
            self.resources.pool(&self.config.external_group)?,
            query_provider.clone(),
            Arc::clone(&query_dao),
            Arc::clone(&self.external),
        );
        let chat = ChatRoom::new(
            Arc::clone(&chat_pool),
            chat_provider.clone(),
            Arc::clone(&chat_dao),
            Arc::clone(&self.connections),
            self.shutdown.shutdown_receiver(),
        );

        Ok(DomainServices::new(
            save_query,
            DatabaseBinding {
                pool: query_pool,
                provider: query_provider,
                dao: query_dao,
            },
            DatabaseBinding {
                pool: chat_pool,
                provider: chat_provider,
                dao: chat_dao,
            },
            chat,
            self.config.request_timeout,
        ))
    }

    /// Starts pinging chat connections at the configured interval. No-op if
    /// keepalive is disabled or already running. Must be called inside a
    /// tokio runtime.
    pub fn start_keepalive(&mut self) {
        let Some(interval) = self.config.keepalive_interval else {
            return;
        };
        if self.keepalive.is_some() {
            return;
        }
        info!(interval_secs = interval.as_secs(), "keepalive pinger started");
        self.keepalive = Some(BackgroundWorker::start(
            KeepalivePinger::new(Arc::clone(&self.connections)),
            interval,
        ));
    }

    #[must_use]
    pub fn is_keepalive_running(&self) -> bool {
        self.keepalive.as_ref().is_some_and(BackgroundWorker::is_running)
    }

    /// Stops everything.
    ///
    /// Order: the shutdown signal fires (suppressing chat fan-out), the
    /// keepalive pinger stops, then every group drains concurrently.
    pub async fn shutdown(mut self) -> ShutdownReport {
        let started = Instant::now();
        info!(groups = self.resources.len(), "shutting down resource groups");

        self.shutdown.trigger_shutdown();
        if let Some(mut keepalive) = self.keepalive.take() {
            keepalive.stop().await;
        }

        let groups = shutdown_groups(self.resources.groups()).await;
        let report = ShutdownReport {
            groups,
            elapsed: started.elapsed(),
        };
        info!(
            elapsed_ms = report.elapsed_ms(),
            all_drained = report.all_drained(),
            "shutdown finished"
        );
        report
    }
}

/// Shuts every group down at once on the blocking thread pool.
pub async fn shutdown_groups(groups: Vec<Arc<ResourceGroup>>) -> Vec<GroupShutdown> {
    let names: Vec<String> = groups.iter().map(|group| group.name().to_string()).collect();
    let started = Instant::now();
    let tasks = groups.into_iter().map(|group| {
        tokio::task::spawn_blocking(move || group.shutdown())
    });

    let results = join_all(tasks).await;
    let mut reports = Vec::with_capacity(results.len());
    for (name, result) in names.into_iter().zip(results) {
        let report = match result {
            Ok(report) => report,
            Err(err) => {
                error!(group = %name, error = %err, "group shutdown task failed");
                GroupShutdown {
                    group: name.clone(),
                    drained: false,
                    elapsed: started.elapsed(),
                }
            }
        };
        if report.drained {
            info!(
                group = %report.group,
                elapsed_ms = millis(report.elapsed),
                "{} shutdown completed",
                report.group
            );
        } else {
            warn!(
                group = %report.group,
                elapsed_ms = millis(report.elapsed),
                "{} shutdown timed out, pending tasks discarded",
                report.group
            );
        }
        reports.push(report);
    }
    reports
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
