//! Handoff Core — scoped request context, session and collaborator interfaces,
//! and the domain records that flow through staged pipelines.

pub mod context;
pub mod traits;
pub mod types;

pub use context::{Attribute, RequestContext, ScopeGuard};
pub use traits::{
    AsyncHandle, ExternalService, ExternalServiceError, Outcome, Session, SessionError,
    SessionFactory,
};
pub use types::{ChatLogEntry, QueryRecord, RecordId};
