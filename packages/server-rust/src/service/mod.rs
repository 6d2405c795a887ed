//! Execution substrate: pools, resource groups, lifecycle, and staged flows.
//!
//! 1. **Pools** (`pool`): bounded worker pools that carry the submitter's
//!    request context to the task
//! 2. **Resource groups** (`registry`, `config`): one pool per downstream
//!    resource, plus its session factory for databases
//! 3. **Lifecycle** (`lifecycle`): startup and concurrent shutdown
//! 4. **Completion and dispatch** (`completion`, `dispatch`): exactly-once
//!    completion and the stage boundary
//! 5. **Domain flows** (`domain`): save pipeline, listings, chat
//! 6. **Background workers** (`worker`): keepalive pinger

pub mod completion;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod lifecycle;
pub mod pool;
pub mod registry;
pub mod worker;

pub use completion::{start_async, CompletionHandle, OneshotHandle, PendingOutcome};
pub use config::{
    ResourceGroupConfig, ResourceKind, ServerConfig, CHAT_LOG_DB, EXTERNAL_SERVICE,
    QUERY_RECORD_DB,
};
pub use dispatch::{dispatch_in_session, failure_outcome, run_stage, submit_stage};
pub use domain::DomainServices;
pub use error::{ConfigError, PoolError, StageError};
pub use lifecycle::{shutdown_groups, Lifecycle, ShutdownReport};
pub use pool::{PoolState, WorkerPool};
pub use registry::{GroupShutdown, ManagedFactory, ResourceGroup, ResourceRegistry};
pub use worker::{BackgroundRunnable, BackgroundWorker, KeepalivePinger};
