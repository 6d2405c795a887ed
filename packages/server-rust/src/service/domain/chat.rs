//! Chat room over `WebSocket` connections, logged to the chat database.
//!
//! Each posted message is persisted in a unit of work on the chat group's
//! pool and broadcast to every participant only once it is committed. Fan-out
//! is suppressed once the injected shutdown signal has fired.

use std::sync::Arc;

use handoff_core::{ChatLogEntry, RequestContext, SessionFactory};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::network::{ConnectionHandle, ConnectionRegistry, OutboundMessage};
use crate::service::pool::WorkerPool;
use crate::storage::{ChatLogDao, DaoError, SessionProvider, UnitOfWork};

/// Sent to the author when their message could not be stored.
pub const SEND_FAILED_NOTICE: &str = "### couldn't send message :(";

/// Shared chat state. Cheap to clone.
pub struct ChatRoom<F: SessionFactory> {
    pool: Arc<WorkerPool>,
    provider: SessionProvider<F>,
    dao: Arc<dyn ChatLogDao>,
    registry: Arc<ConnectionRegistry>,
    shutdown: watch::Receiver<bool>,
}

impl<F: SessionFactory> ChatRoom<F> {
    #[must_use]
    pub fn new(
        pool: Arc<WorkerPool>,
        provider: SessionProvider<F>,
        dao: Arc<dyn ChatLogDao>,
        registry: Arc<ConnectionRegistry>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pool,
            provider,
            dao,
            registry,
            shutdown,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Greets a newly registered connection and announces it to the room.
    ///
    /// Returns the participant's nickname.
    pub fn join(&self, connection: &ConnectionHandle) -> String {
        let nickname = format!("user-{}", connection.id);
        if !connection.try_send(OutboundMessage::Text(format!(
            "### assigned nickname: {nickname}"
        ))) {
            debug!(connection = %connection.id, "could not deliver nickname");
        }
        self.broadcast(&format!("### {nickname} has joined"));
        nickname
    }

    /// Stores `message` from `nickname` and then broadcasts it.
    ///
    /// Runs on the chat pool and returns immediately. If the message cannot
    /// be stored (or the pool is shut down) only the author is told.
    pub fn post(&self, nickname: &str, author: Arc<ConnectionHandle>, message: String) {
        let formatted = format!("{nickname}: {}", escape_html(&message));
        let entry = ChatLogEntry::new(nickname, message);
        let context = RequestContext::new(format!("chat-{}", uuid::Uuid::new_v4()));
        let room = self.clone();
        let task_author = Arc::clone(&author);

        let submitted = self.pool.submit_with_context(Some(context), move || {
            match room.store(entry) {
                Ok(()) => {
                    room.broadcast(&formatted);
                }
                Err(err) => {
                    warn!(connection = %task_author.id, error = %err, "couldn't save message");
                    notify_send_failed(&task_author);
                }
            }
        });
        if let Err(err) = submitted {
            warn!(connection = %author.id, error = %err, "chat pool rejected message");
            notify_send_failed(&author);
        }
    }

    /// Announces that `nickname` left.
    pub fn leave(&self, nickname: &str) {
        self.broadcast(&format!("### {nickname} has disconnected"));
    }

    /// Sends `text` to every participant unless shutdown has started.
    ///
    /// Returns how many participants it was queued for.
    pub fn broadcast(&self, text: &str) -> usize {
        if *self.shutdown.borrow() {
            return 0;
        }
        self.registry
            .broadcast(&OutboundMessage::Text(text.to_string()))
    }

    fn store(&self, mut entry: ChatLogEntry) -> Result<(), DaoError> {
        let stored = UnitOfWork::new(&self.provider).run(|| self.dao.persist(&mut entry));
        let closed = self.provider.close_and_remove();
        stored?;
        Ok(closed?)
    }
}

impl<F: SessionFactory> Clone for ChatRoom<F> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            provider: self.provider.clone(),
            dao: Arc::clone(&self.dao),
            registry: Arc::clone(&self.registry),
            shutdown: self.shutdown.clone(),
        }
    }
}

fn notify_send_failed(author: &ConnectionHandle) {
    if !author.try_send(OutboundMessage::Text(SEND_FAILED_NOTICE.to_string())) {
        debug!(connection = %author.id, "author already gone");
    }
}

/// Escapes the characters HTML treats specially.
#[must_use]
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
    }
    escaped
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use handoff_core::{ChatLogEntry, SessionError};
    use tokio::sync::mpsc;

    use super::*;
    use crate::network::ConnectionConfig;
    use crate::storage::{MemoryChatLogDao, MemoryDatabase, MemorySessionFactory};

    const WAIT: Duration = Duration::from_secs(5);

    struct FailingChatDao;

    impl ChatLogDao for FailingChatDao {
        fn find_all(&self) -> Result<Vec<ChatLogEntry>, DaoError> {
            Ok(Vec::new())
        }
        fn persist(&self, _entry: &mut ChatLogEntry) -> Result<(), DaoError> {
            Err(DaoError::Session(SessionError::Backend("disk full".to_string())))
        }
    }

    struct Room {
        room: ChatRoom<MemorySessionFactory>,
        factory: Arc<MemorySessionFactory>,
        pool: Arc<WorkerPool>,
        shutdown: watch::Sender<bool>,
    }

    fn room(dao: Option<Arc<dyn ChatLogDao>>) -> Room {
        let factory = Arc::new(MemorySessionFactory::new(
            "chatLogDb",
            Arc::new(MemoryDatabase::new()),
            1,
            Duration::from_secs(1),
        ));
        let provider = SessionProvider::new("chatLogDb", Arc::clone(&factory));
        let dao = dao.unwrap_or_else(|| MemoryChatLogDao::shared(provider.clone()));
        let pool = Arc::new(WorkerPool::new("chatLogDb", 1).unwrap());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let room = ChatRoom::new(
            Arc::clone(&pool),
            provider,
            dao,
            Arc::new(ConnectionRegistry::new()),
            shutdown_rx,
        );
        Room {
            room,
            factory,
            pool,
            shutdown,
        }
    }

    fn connect(
        room: &ChatRoom<MemorySessionFactory>,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
        room.registry().register(&ConnectionConfig::default())
    }

    async fn next_text(rx: &mut mpsc::Receiver<OutboundMessage>) -> String {
        match tokio::time::timeout(WAIT, rx.recv()).await {
            Ok(Some(OutboundMessage::Text(text))) => text,
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    #[test]
    fn escapes_html_special_characters() {
        assert_eq!(
            escape_html(r#"<b>"Tom" & 'Jerry'</b>"#),
            "&lt;b&gt;&quot;Tom&quot; &amp; &apos;Jerry&apos;&lt;/b&gt;"
        );
        assert_eq!(escape_html("plain"), "plain");
    }

    #[tokio::test]
    async fn join_assigns_nickname_and_announces() {
        let fixture = room(None);
        let (alice, mut alice_rx) = connect(&fixture.room);
        let nickname = fixture.room.join(&alice);
        assert_eq!(nickname, "user-1");
        assert_eq!(next_text(&mut alice_rx).await, "### assigned nickname: user-1");
        assert_eq!(next_text(&mut alice_rx).await, "### user-1 has joined");

        let (bob, _bob_rx) = connect(&fixture.room);
        fixture.room.join(&bob);
        assert_eq!(next_text(&mut alice_rx).await, "### user-2 has joined");
    }

    #[tokio::test]
    async fn posted_message_is_stored_then_broadcast() {
        let fixture = room(None);
        let (alice, mut alice_rx) = connect(&fixture.room);
        let (_bob, mut bob_rx) = connect(&fixture.room);

        fixture.room.post("user-1", alice, "<hi>".to_string());

        assert_eq!(next_text(&mut bob_rx).await, "user-1: &lt;hi&gt;");
        assert_eq!(next_text(&mut alice_rx).await, "user-1: &lt;hi&gt;");
        assert!(fixture.pool.shutdown_gracefully(WAIT));

        let log = fixture.factory.database().chat_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].username, "user-1");
        assert_eq!(log[0].message, "<hi>", "stored unescaped");
        assert_eq!(fixture.factory.connections_in_use(), 0);
    }

    #[tokio::test]
    async fn failed_store_notifies_only_the_author() {
        let fixture = room(Some(Arc::new(FailingChatDao)));
        let (alice, mut alice_rx) = connect(&fixture.room);
        let (_bob, mut bob_rx) = connect(&fixture.room);

        fixture.room.post("user-1", alice, "hello".to_string());

        assert_eq!(next_text(&mut alice_rx).await, SEND_FAILED_NOTICE);
        assert!(fixture.pool.shutdown_gracefully(WAIT));
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rejected_post_notifies_the_author() {
        let fixture = room(None);
        assert!(fixture.pool.shutdown_gracefully(WAIT));
        let (alice, mut alice_rx) = connect(&fixture.room);

        fixture.room.post("user-1", alice, "hello".to_string());
        assert_eq!(next_text(&mut alice_rx).await, SEND_FAILED_NOTICE);
    }

    #[tokio::test]
    async fn shutdown_signal_suppresses_broadcast() {
        let fixture = room(None);
        let (alice, mut alice_rx) = connect(&fixture.room);

        fixture.shutdown.send(true).unwrap();
        assert_eq!(fixture.room.broadcast("anyone?"), 0);
        fixture.room.leave("user-1");

        // The author's own greeting still goes out; fan-out does not.
        fixture.room.join(&alice);
        assert_eq!(next_text(&mut alice_rx).await, "### assigned nickname: user-1");
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn leave_is_announced() {
        let fixture = room(None);
        let (_alice, mut alice_rx) = connect(&fixture.room);
        fixture.room.leave("user-2");
        assert_eq!(next_text(&mut alice_rx).await, "### user-2 has disconnected");
    }
}
