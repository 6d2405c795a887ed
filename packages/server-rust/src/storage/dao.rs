//! Data access objects for the sample domain.
//!
//! The traits are what the flows depend on; the `Memory*` implementations
//! resolve the current session through a [`SessionProvider`] on every call,
//! so they always act on the session of the request running on the calling
//! thread.

use std::sync::Arc;

use handoff_core::{ChatLogEntry, QueryRecord, SessionError};

use super::memory::MemorySessionFactory;
use super::provider::{ProviderError, SessionProvider};
use super::unit_of_work::TxError;

#[derive(Debug, thiserror::Error)]
pub enum DaoError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Transaction(#[from] TxError),
    #[error("data access failed: {0}")]
    Backend(String),
}

pub trait QueryRecordDao: Send + Sync + 'static {
    /// All records ordered by id.
    fn find_all(&self) -> Result<Vec<QueryRecord>, DaoError>;

    /// Inserts `record`, assigning its id.
    fn persist(&self, record: &mut QueryRecord) -> Result<(), DaoError>;

    /// Updates the row `record.id` refers to. Returns `false` if there is no
    /// such row.
    fn update(&self, record: &QueryRecord) -> Result<bool, DaoError>;
}

pub trait ChatLogDao: Send + Sync + 'static {
    fn find_all(&self) -> Result<Vec<ChatLogEntry>, DaoError>;

    fn persist(&self, entry: &mut ChatLogEntry) -> Result<(), DaoError>;
}

// ---------------------------------------------------------------------------
// Memory-backed implementations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MemoryQueryRecordDao {
    provider: SessionProvider<MemorySessionFactory>,
}

impl MemoryQueryRecordDao {
    #[must_use]
    pub fn new(provider: SessionProvider<MemorySessionFactory>) -> Self {
        Self { provider }
    }

    #[must_use]
    pub fn shared(provider: SessionProvider<MemorySessionFactory>) -> Arc<dyn QueryRecordDao> {
        Arc::new(Self::new(provider))
    }
}

impl QueryRecordDao for MemoryQueryRecordDao {
    fn find_all(&self) -> Result<Vec<QueryRecord>, DaoError> {
        Ok(self.provider.get()?.query_records()?)
    }

    fn persist(&self, record: &mut QueryRecord) -> Result<(), DaoError> {
        Ok(self.provider.get()?.insert_query(record)?)
    }

    fn update(&self, record: &QueryRecord) -> Result<bool, DaoError> {
        Ok(self.provider.get()?.update_query(record)?)
    }
}

#[derive(Debug, Clone)]
pub struct MemoryChatLogDao {
    provider: SessionProvider<MemorySessionFactory>,
}

impl MemoryChatLogDao {
    #[must_use]
    pub fn new(provider: SessionProvider<MemorySessionFactory>) -> Self {
        Self { provider }
    }

    #[must_use]
    pub fn shared(provider: SessionProvider<MemorySessionFactory>) -> Arc<dyn ChatLogDao> {
        Arc::new(Self::new(provider))
    }
}

impl ChatLogDao for MemoryChatLogDao {
    fn find_all(&self) -> Result<Vec<ChatLogEntry>, DaoError> {
        Ok(self.provider.get()?.chat_log()?)
    }

    fn persist(&self, entry: &mut ChatLogEntry) -> Result<(), DaoError> {
        Ok(self.provider.get()?.insert_chat(entry)?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use handoff_core::{RecordId, RequestContext};

    use super::*;
    use crate::storage::memory::MemoryDatabase;
    use crate::storage::unit_of_work::UnitOfWork;

    fn provider() -> SessionProvider<MemorySessionFactory> {
        let factory = MemorySessionFactory::new(
            "queryRecordDb",
            Arc::new(MemoryDatabase::new()),
            2,
            Duration::from_millis(20),
        );
        SessionProvider::new("queryRecordDb", Arc::new(factory))
    }

    #[test]
    fn persist_then_update_inside_units_of_work() {
        let provider = provider();
        let dao = MemoryQueryRecordDao::new(provider.clone());
        let _scope = RequestContext::new("req").enter();

        let mut record = QueryRecord::new("abc");
        UnitOfWork::new(&provider)
            .run(|| dao.persist(&mut record))
            .unwrap();
        assert_eq!(record.id, Some(RecordId(1)));

        record.result = Some("found".to_string());
        let updated = UnitOfWork::new(&provider).run(|| dao.update(&record)).unwrap();
        assert!(updated);

        assert_eq!(dao.find_all().unwrap(), vec![record]);
        provider.close_and_remove().unwrap();
    }

    #[test]
    fn update_of_missing_row_returns_false() {
        let provider = provider();
        let dao = MemoryQueryRecordDao::new(provider.clone());
        let _scope = RequestContext::new("req").enter();

        let updated = UnitOfWork::new(&provider)
            .run(|| dao.update(&QueryRecord::with_id(RecordId(999), "x")))
            .unwrap();
        assert!(!updated);
        provider.close_and_remove().unwrap();
    }

    #[test]
    fn persist_outside_a_transaction_fails() {
        let provider = provider();
        let dao = MemoryChatLogDao::new(provider.clone());
        let _scope = RequestContext::new("req").enter();

        let err = dao.persist(&mut ChatLogEntry::new("user-1", "hi")).unwrap_err();
        assert!(matches!(err, DaoError::Session(SessionError::NoTransaction)));
        provider.close_and_remove().unwrap();
    }

    #[test]
    fn chat_entries_are_listed_in_insertion_order() {
        let provider = provider();
        let dao = MemoryChatLogDao::new(provider.clone());
        let _scope = RequestContext::new("req").enter();

        UnitOfWork::new(&provider)
            .run(|| {
                dao.persist(&mut ChatLogEntry::new("user-1", "first"))?;
                dao.persist(&mut ChatLogEntry::new("user-2", "second"))
            })
            .unwrap();

        let messages: Vec<String> = dao
            .find_all()
            .unwrap()
            .into_iter()
            .map(|entry| entry.message)
            .collect();
        assert_eq!(messages, vec!["first", "second"]);
        provider.close_and_remove().unwrap();
    }

    #[test]
    fn dao_without_context_reports_provider_error() {
        let dao = MemoryQueryRecordDao::new(provider());
        assert!(matches!(
            dao.find_all(),
            Err(DaoError::Provider(ProviderError::NoActiveContext { .. }))
        ));
    }
}
