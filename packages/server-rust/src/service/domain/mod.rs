//! Sample domain flows wired onto the resource groups.
//!
//! - [`save_query`]: three-stage save-and-enrich pipeline across two pools
//! - [`listing`]: single-hop JSON listings
//! - [`chat`]: chat room whose messages are logged before fan-out

pub mod chat;
pub mod listing;
pub mod save_query;

use std::sync::Arc;
use std::time::Duration;

pub use chat::{escape_html, ChatRoom, SEND_FAILED_NOTICE};
pub use save_query::{PipelineState, SaveQueryPipeline, SaveQueryRequest, QUERY_LIST_LOCATION};

use crate::service::completion::CompletionHandle;
use crate::service::pool::WorkerPool;
use crate::storage::{ChatLogDao, MemorySessionFactory, QueryRecordDao, SessionProvider};

/// A database group as seen by one flow.
pub struct DatabaseBinding<D: ?Sized> {
    pub pool: Arc<WorkerPool>,
    pub provider: SessionProvider<MemorySessionFactory>,
    pub dao: Arc<D>,
}

/// Every flow the transport layer can start.
pub struct DomainServices {
    save_query: SaveQueryPipeline<MemorySessionFactory>,
    queries: DatabaseBinding<dyn QueryRecordDao>,
    chat_log: DatabaseBinding<dyn ChatLogDao>,
    chat: ChatRoom<MemorySessionFactory>,
    request_timeout: Duration,
}

impl DomainServices {
    #[must_use]
    pub fn new(
        save_query: SaveQueryPipeline<MemorySessionFactory>,
        queries: DatabaseBinding<dyn QueryRecordDao>,
        chat_log: DatabaseBinding<dyn ChatLogDao>,
        chat: ChatRoom<MemorySessionFactory>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            save_query,
            queries,
            chat_log,
            chat,
            request_timeout,
        }
    }

    /// See [`SaveQueryPipeline::submit`].
    pub fn save_query(&self, request: SaveQueryRequest, completion: &CompletionHandle) -> bool {
        self.save_query.submit(request, completion)
    }

    pub fn list_query_records(&self, completion: &CompletionHandle) -> bool {
        listing::list_query_records(
            &self.queries.pool,
            self.queries.provider.clone(),
            Arc::clone(&self.queries.dao),
            completion,
        )
    }

    pub fn list_chat_log(&self, completion: &CompletionHandle) -> bool {
        listing::list_chat_log(
            &self.chat_log.pool,
            self.chat_log.provider.clone(),
            Arc::clone(&self.chat_log.dao),
            completion,
        )
    }

    #[must_use]
    pub fn chat(&self) -> &ChatRoom<MemorySessionFactory> {
        &self.chat
    }

    /// How long a caller waits for an asynchronous flow to complete.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}
