//! In-memory backing store with a bounded connection pool.
//!
//! [`MemoryDatabase`] holds the committed tables. [`MemorySessionFactory`]
//! hands out at most `max_connections` open [`MemorySession`]s at a time; a
//! caller asking for one more waits up to `acquire_timeout` for a session to
//! be closed. Writes are buffered in the session's transaction and applied to
//! the database on commit, so a rollback leaves no trace.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use handoff_core::{ChatLogEntry, QueryRecord, RecordId, Session, SessionError, SessionFactory};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// MemoryDatabase
// ---------------------------------------------------------------------------

/// Committed state of one database: the query-record and chat-log tables.
#[derive(Debug)]
pub struct MemoryDatabase {
    query_records: DashMap<RecordId, QueryRecord>,
    chat_log: DashMap<RecordId, ChatLogEntry>,
    next_id: AtomicI64,
    /// Serializes commits so a transaction's writes land together.
    commit_lock: Mutex<()>,
}

impl MemoryDatabase {
    /// Creates an empty database. Identifiers start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            query_records: DashMap::new(),
            chat_log: DashMap::new(),
            next_id: AtomicI64::new(1),
            commit_lock: Mutex::new(()),
        }
    }

    /// Committed query records ordered by id.
    #[must_use]
    pub fn query_records(&self) -> Vec<QueryRecord> {
        let mut records: Vec<QueryRecord> = self
            .query_records
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|record| record.id);
        records
    }

    /// Committed chat log entries ordered by id.
    #[must_use]
    pub fn chat_log(&self) -> Vec<ChatLogEntry> {
        let mut entries: Vec<ChatLogEntry> = self
            .chat_log
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by_key(|entry| entry.id);
        entries
    }

    /// Looks up one committed query record.
    #[must_use]
    pub fn query_record(&self, id: RecordId) -> Option<QueryRecord> {
        self.query_records.get(&id).map(|entry| entry.value().clone())
    }

    fn allocate_id(&self) -> RecordId {
        RecordId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn apply(&self, writes: Vec<Write>) {
        let _commit = self.commit_lock.lock();
        for write in writes {
            match write {
                Write::InsertQuery(record) | Write::UpdateQuery(record) => {
                    if let Some(id) = record.id {
                        self.query_records.insert(id, record);
                    }
                }
                Write::InsertChat(entry) => {
                    if let Some(id) = entry.id {
                        self.chat_log.insert(id, entry);
                    }
                }
            }
        }
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
enum Write {
    InsertQuery(QueryRecord),
    UpdateQuery(QueryRecord),
    InsertChat(ChatLogEntry),
}

#[derive(Debug, Default)]
struct Transaction {
    writes: Vec<Write>,
    rollback_only: bool,
}

impl Transaction {
    /// Latest version of query record `id` written by this transaction.
    fn pending_query(&self, id: RecordId) -> Option<&QueryRecord> {
        self.writes.iter().rev().find_map(|write| match write {
            Write::InsertQuery(record) | Write::UpdateQuery(record) if record.id == Some(id) => {
                Some(record)
            }
            _ => None,
        })
    }
}

// ---------------------------------------------------------------------------
// MemorySessionFactory
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct FactoryShared {
    name: Arc<str>,
    database: Arc<MemoryDatabase>,
    max_connections: usize,
    acquire_timeout: Duration,
    open: AtomicBool,
    in_use: Mutex<usize>,
    released: Condvar,
    next_session: AtomicU64,
}

impl FactoryShared {
    fn release(&self) {
        let mut in_use = self.in_use.lock();
        *in_use = in_use.saturating_sub(1);
        drop(in_use);
        self.released.notify_one();
    }
}

/// Session factory over a [`MemoryDatabase`] with a bounded connection pool.
#[derive(Debug)]
pub struct MemorySessionFactory {
    shared: Arc<FactoryShared>,
}

impl MemorySessionFactory {
    /// Creates a factory allowing `max_connections` concurrently open sessions.
    #[must_use]
    pub fn new(
        name: impl Into<Arc<str>>,
        database: Arc<MemoryDatabase>,
        max_connections: usize,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(FactoryShared {
                name: name.into(),
                database,
                max_connections,
                acquire_timeout,
                open: AtomicBool::new(true),
                in_use: Mutex::new(0),
                released: Condvar::new(),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[must_use]
    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.shared.database
    }

    #[must_use]
    pub fn max_connections(&self) -> usize {
        self.shared.max_connections
    }

    /// Number of sessions currently holding a connection.
    #[must_use]
    pub fn connections_in_use(&self) -> usize {
        *self.shared.in_use.lock()
    }
}

impl SessionFactory for MemorySessionFactory {
    type Session = MemorySession;

    fn create_session(&self) -> Result<MemorySession, SessionError> {
        let shared = &self.shared;
        let started = Instant::now();
        let deadline = started + shared.acquire_timeout;

        let mut in_use = shared.in_use.lock();
        loop {
            if !shared.open.load(Ordering::Acquire) {
                return Err(SessionError::FactoryClosed);
            }
            if *in_use < shared.max_connections {
                break;
            }
            if shared.released.wait_until(&mut in_use, deadline).timed_out()
                && *in_use >= shared.max_connections
            {
                let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                return Err(SessionError::ConnectionTimeout { waited_ms });
            }
        }
        *in_use += 1;
        drop(in_use);

        let id = shared.next_session.fetch_add(1, Ordering::Relaxed);
        debug!(factory = %shared.name, session = id, "session opened");
        Ok(MemorySession {
            id,
            factory: Arc::clone(shared),
            state: Mutex::new(SessionState {
                open: true,
                transaction: None,
            }),
        })
    }

    fn close(&self) {
        self.shared.open.store(false, Ordering::Release);
        // Wake waiters so they observe the closed flag.
        let _in_use = self.shared.in_use.lock();
        self.shared.released.notify_all();
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// MemorySession
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SessionState {
    open: bool,
    transaction: Option<Transaction>,
}

/// One open connection to a [`MemoryDatabase`].
#[derive(Debug)]
pub struct MemorySession {
    id: u64,
    factory: Arc<FactoryShared>,
    state: Mutex<SessionState>,
}

impl MemorySession {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Runs `f` against the active transaction.
    fn with_transaction<R>(
        &self,
        f: impl FnOnce(&mut Transaction) -> R,
    ) -> Result<R, SessionError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(SessionError::Closed);
        }
        state
            .transaction
            .as_mut()
            .map(f)
            .ok_or(SessionError::NoTransaction)
    }

    /// Persists a new query record, assigning its id.
    ///
    /// # Errors
    ///
    /// Fails if the session is closed or no transaction is active.
    pub fn insert_query(&self, record: &mut QueryRecord) -> Result<(), SessionError> {
        let database = &self.factory.database;
        self.with_transaction(|tx| {
            let id = database.allocate_id();
            record.id = Some(id);
            tx.writes.push(Write::InsertQuery(record.clone()));
        })
    }

    /// Updates an existing query record.
    ///
    /// Returns `false` without writing anything if the record has no id or
    /// no row with that id exists.
    ///
    /// # Errors
    ///
    /// Fails if the session is closed or no transaction is active.
    pub fn update_query(&self, record: &QueryRecord) -> Result<bool, SessionError> {
        let database = &self.factory.database;
        self.with_transaction(|tx| {
            let Some(id) = record.id else {
                return false;
            };
            let exists =
                tx.pending_query(id).is_some() || database.query_records.contains_key(&id);
            if exists {
                tx.writes.push(Write::UpdateQuery(record.clone()));
            }
            exists
        })
    }

    /// All query records visible to this session, including its own
    /// uncommitted writes.
    ///
    /// # Errors
    ///
    /// Fails if the session is closed.
    pub fn query_records(&self) -> Result<Vec<QueryRecord>, SessionError> {
        let state = self.state.lock();
        if !state.open {
            return Err(SessionError::Closed);
        }
        let mut records = self.factory.database.query_records();
        if let Some(tx) = &state.transaction {
            for write in &tx.writes {
                if let Write::InsertQuery(record) | Write::UpdateQuery(record) = write {
                    match records.iter_mut().find(|existing| existing.id == record.id) {
                        Some(existing) => existing.clone_from(record),
                        None => records.push(record.clone()),
                    }
                }
            }
            records.sort_by_key(|record| record.id);
        }
        Ok(records)
    }

    /// Persists a new chat log entry, assigning its id.
    ///
    /// # Errors
    ///
    /// Fails if the session is closed or no transaction is active.
    pub fn insert_chat(&self, entry: &mut ChatLogEntry) -> Result<(), SessionError> {
        let database = &self.factory.database;
        self.with_transaction(|tx| {
            entry.id = Some(database.allocate_id());
            tx.writes.push(Write::InsertChat(entry.clone()));
        })
    }

    /// All committed chat log entries plus this session's uncommitted ones.
    ///
    /// # Errors
    ///
    /// Fails if the session is closed.
    pub fn chat_log(&self) -> Result<Vec<ChatLogEntry>, SessionError> {
        let state = self.state.lock();
        if !state.open {
            return Err(SessionError::Closed);
        }
        let mut entries = self.factory.database.chat_log();
        if let Some(tx) = &state.transaction {
            entries.extend(tx.writes.iter().filter_map(|write| match write {
                Write::InsertChat(entry) => Some(entry.clone()),
                _ => None,
            }));
        }
        Ok(entries)
    }
}

impl Session for MemorySession {
    fn begin(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(SessionError::Closed);
        }
        if state.transaction.is_some() {
            return Err(SessionError::TransactionAlreadyActive);
        }
        state.transaction = Some(Transaction::default());
        Ok(())
    }

    fn is_transaction_active(&self) -> bool {
        self.state.lock().transaction.is_some()
    }

    fn set_rollback_only(&self) -> Result<(), SessionError> {
        self.with_transaction(|tx| tx.rollback_only = true)
    }

    fn is_rollback_only(&self) -> bool {
        self.state
            .lock()
            .transaction
            .as_ref()
            .is_some_and(|tx| tx.rollback_only)
    }

    fn commit(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(SessionError::Closed);
        }
        let tx = state.transaction.take().ok_or(SessionError::NoTransaction)?;
        if tx.rollback_only {
            return Err(SessionError::Backend(
                "transaction was marked rollback-only and has been rolled back".to_string(),
            ));
        }
        self.factory.database.apply(tx.writes);
        Ok(())
    }

    fn rollback(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(SessionError::Closed);
        }
        state
            .transaction
            .take()
            .map(drop)
            .ok_or(SessionError::NoTransaction)
    }

    fn close(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        if !state.open {
            return Ok(());
        }
        if state.transaction.is_some() {
            return Err(SessionError::TransactionActive);
        }
        state.open = false;
        drop(state);
        self.factory.release();
        debug!(factory = %self.factory.name, session = self.id, "session closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.open {
            warn!(
                factory = %self.factory.name,
                session = self.id,
                "session dropped without close; releasing its connection"
            );
            state.open = false;
            self.factory.release();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn factory(max_connections: usize) -> MemorySessionFactory {
        MemorySessionFactory::new(
            "testDb",
            Arc::new(MemoryDatabase::new()),
            max_connections,
            Duration::from_millis(50),
        )
    }

    #[test]
    fn insert_is_visible_only_after_commit() {
        let factory = factory(2);
        let session = factory.create_session().unwrap();
        session.begin().unwrap();

        let mut record = QueryRecord::new("abc");
        session.insert_query(&mut record).unwrap();
        assert_eq!(record.id, Some(RecordId(1)), "id assigned at persist time");
        assert!(factory.database().query_records().is_empty());
        assert_eq!(session.query_records().unwrap().len(), 1, "reads own writes");

        session.commit().unwrap();
        assert_eq!(factory.database().query_records(), vec![record]);
        session.close().unwrap();
    }

    #[test]
    fn rollback_discards_writes() {
        let factory = factory(1);
        let session = factory.create_session().unwrap();
        session.begin().unwrap();
        session.insert_chat(&mut ChatLogEntry::new("user-1", "hi")).unwrap();
        session.rollback().unwrap();

        assert!(!session.is_transaction_active());
        assert!(factory.database().chat_log().is_empty());
        session.close().unwrap();
    }

    #[test]
    fn update_of_missing_record_affects_nothing() {
        let factory = factory(1);
        let session = factory.create_session().unwrap();
        session.begin().unwrap();

        let updated = session
            .update_query(&QueryRecord::with_id(RecordId(999), "gone"))
            .unwrap();
        assert!(!updated);
        assert!(!session.update_query(&QueryRecord::new("no id")).unwrap());

        session.commit().unwrap();
        assert!(factory.database().query_records().is_empty());
        session.close().unwrap();
    }

    #[test]
    fn update_of_existing_record_replaces_it() {
        let factory = factory(1);
        let session = factory.create_session().unwrap();
        session.begin().unwrap();
        let mut record = QueryRecord::new("abc");
        session.insert_query(&mut record).unwrap();
        session.commit().unwrap();

        record.result = Some("found".to_string());
        session.begin().unwrap();
        assert!(session.update_query(&record).unwrap());
        session.commit().unwrap();

        let id = record.id.unwrap();
        assert_eq!(factory.database().query_record(id), Some(record));
        session.close().unwrap();
    }

    #[test]
    fn writes_require_a_transaction() {
        let factory = factory(1);
        let session = factory.create_session().unwrap();
        let err = session.insert_query(&mut QueryRecord::new("abc")).unwrap_err();
        assert_eq!(err, SessionError::NoTransaction);
        assert_eq!(session.commit().unwrap_err(), SessionError::NoTransaction);
        session.close().unwrap();
    }

    #[test]
    fn begin_twice_is_rejected() {
        let factory = factory(1);
        let session = factory.create_session().unwrap();
        session.begin().unwrap();
        assert_eq!(
            session.begin().unwrap_err(),
            SessionError::TransactionAlreadyActive
        );
        session.rollback().unwrap();
        session.close().unwrap();
    }

    #[test]
    fn rollback_only_transaction_cannot_commit() {
        let factory = factory(1);
        let session = factory.create_session().unwrap();
        session.begin().unwrap();
        session.insert_query(&mut QueryRecord::new("abc")).unwrap();
        session.set_rollback_only().unwrap();
        assert!(session.is_rollback_only());

        assert!(matches!(session.commit(), Err(SessionError::Backend(_))));
        assert!(!session.is_transaction_active());
        assert!(factory.database().query_records().is_empty());
        session.close().unwrap();
    }

    #[test]
    fn close_with_active_transaction_fails() {
        let factory = factory(1);
        let session = factory.create_session().unwrap();
        session.begin().unwrap();

        assert_eq!(session.close().unwrap_err(), SessionError::TransactionActive);
        assert!(session.is_open());
        assert_eq!(factory.connections_in_use(), 1);

        session.rollback().unwrap();
        session.close().unwrap();
        session.close().unwrap();
        assert_eq!(factory.connections_in_use(), 0);
    }

    #[test]
    fn closed_session_rejects_operations() {
        let factory = factory(1);
        let session = factory.create_session().unwrap();
        session.close().unwrap();
        assert!(!session.is_open());
        assert_eq!(session.begin().unwrap_err(), SessionError::Closed);
        assert_eq!(session.query_records().unwrap_err(), SessionError::Closed);
    }

    #[test]
    fn exhausted_pool_times_out() {
        let factory = factory(1);
        let held = factory.create_session().unwrap();

        let err = factory.create_session().unwrap_err();
        assert!(matches!(err, SessionError::ConnectionTimeout { waited_ms } if waited_ms >= 50));

        held.close().unwrap();
        let next = factory.create_session().unwrap();
        next.close().unwrap();
    }

    #[test]
    fn waiter_gets_connection_released_by_another_thread() {
        let factory = Arc::new(MemorySessionFactory::new(
            "testDb",
            Arc::new(MemoryDatabase::new()),
            1,
            Duration::from_secs(5),
        ));
        let held = factory.create_session().unwrap();

        let waiter = {
            let factory = Arc::clone(&factory);
            thread::spawn(move || factory.create_session().map(|s| s.close()))
        };
        thread::sleep(Duration::from_millis(30));
        held.close().unwrap();

        assert!(waiter.join().unwrap().is_ok());
        assert_eq!(factory.connections_in_use(), 0);
    }

    #[test]
    fn dropped_session_releases_its_connection() {
        let factory = factory(1);
        drop(factory.create_session().unwrap());
        assert_eq!(factory.connections_in_use(), 0);
    }

    #[test]
    fn closed_factory_rejects_new_sessions() {
        let factory = factory(1);
        factory.close();
        assert!(!factory.is_open());
        assert_eq!(
            factory.create_session().unwrap_err(),
            SessionError::FactoryClosed
        );
    }
}
