//! Session-backed storage for the `Handoff` server.
//!
//! - [`SessionProvider`]: request-scoped session of one resource group
//! - [`UnitOfWork`]: transaction demarcation around an operation
//! - [`MemorySessionFactory`]: in-memory backing store with a bounded
//!   connection pool
//! - [`QueryRecordDao`] / [`ChatLogDao`]: data access for the sample domain
//! - [`SimulatedExternalService`]: slow external collaborator

pub mod dao;
pub mod external;
pub mod memory;
pub mod provider;
pub mod unit_of_work;

pub use dao::*;
pub use external::*;
pub use memory::*;
pub use provider::*;
pub use unit_of_work::*;
