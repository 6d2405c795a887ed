//! Background worker for periodic tasks.
//!
//! `BackgroundWorker<R>` drives a `BackgroundRunnable` from a tokio task; the
//! only runnable shipped here is the chat keepalive pinger.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::network::{ConnectionRegistry, OutboundMessage};

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Periodic job executed by `BackgroundWorker`.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// Called on each tick interval.
    async fn on_tick(&mut self);

    /// Called once when the worker stops. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Runs periodic ticks on one tokio task.
///
/// The first tick is skipped, so `on_tick` first fires one full interval
/// after `start`.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
    _runnable: PhantomData<fn() -> R>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker. Must be called inside a tokio runtime.
    pub fn start(mut runnable: R, tick_interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(tick_interval);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticks.tick().await;

            loop {
                tokio::select! {
                    _ = ticks.tick() => {
                        runnable.on_tick().await;
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }

            runnable.shutdown().await;
        });

        Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            _runnable: PhantomData,
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Signals the worker and waits for its `shutdown` hook to finish.
    /// Later calls return immediately.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// KeepalivePinger
// ---------------------------------------------------------------------------

/// Pings every open chat connection so idle intermediaries keep it alive.
pub struct KeepalivePinger {
    connections: Arc<ConnectionRegistry>,
    rounds: u64,
}

impl KeepalivePinger {
    #[must_use]
    pub fn new(connections: Arc<ConnectionRegistry>) -> Self {
        Self {
            connections,
            rounds: 0,
        }
    }

    fn ping_all(&mut self) -> usize {
        self.rounds += 1;
        let payload = self.rounds.to_be_bytes().to_vec();
        let delivered = self.connections.broadcast(&OutboundMessage::Ping(payload));
        debug!(round = self.rounds, delivered, "keepalive ping sent");
        delivered
    }
}

#[async_trait]
impl BackgroundRunnable for KeepalivePinger {
    async fn on_tick(&mut self) {
        self.ping_all();
    }

    async fn shutdown(&mut self) {
        info!(rounds = self.rounds, "keepalive pinger stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
