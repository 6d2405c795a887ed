//! Bounded worker pool dedicated to one downstream resource group.
//!
//! A [`WorkerPool`] owns a fixed number of OS threads fed from one FIFO queue.
//! The thread count is the only admission control for the resource behind the
//! pool: sized to a connection pool's capacity, at most that many tasks hold a
//! connection at once while the rest wait in the queue. The queue itself is
//! unbounded.
//!
//! Every task carries the [`RequestContext`] snapshot of its origin, which is
//! installed on the worker thread for the task's duration and removed before
//! the next task starts.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use handoff_core::RequestContext;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use super::error::PoolError;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Task {
    job: Job,
    context: Option<RequestContext>,
}

/// Lifecycle state of a pool.
///
/// State machine: Running -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Accepting and executing tasks.
    Running,
    /// No new tasks accepted; queued and running tasks are being finished.
    Draining,
    /// Workers have been told to exit. Queued tasks were finished or discarded.
    Stopped,
}

impl PoolState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

struct Queue {
    tasks: VecDeque<Task>,
    state: PoolState,
    active: usize,
    /// Result of the first completed shutdown, returned by later calls.
    shutdown_result: Option<bool>,
}

impl Queue {
    fn is_idle(&self) -> bool {
        self.tasks.is_empty() && self.active == 0
    }
}

struct Shared {
    name: Arc<str>,
    queue: Mutex<Queue>,
    /// Signalled when a task is queued or the state changes.
    available: Condvar,
    /// Signalled when the queue is empty and no task is running.
    idle: Condvar,
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

/// A fixed-size pool of named OS threads executing blocking tasks.
pub struct WorkerPool {
    shared: Arc<Shared>,
    size: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Starts `size` worker threads named `<name>-<index>`.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidSize`] if `size` is zero, or
    /// [`PoolError::Spawn`] if the OS refuses to create a thread. In the
    /// latter case the threads started so far are told to exit.
    pub fn new(name: impl Into<Arc<str>>, size: usize) -> Result<Self, PoolError> {
        let name = name.into();
        if size == 0 {
            return Err(PoolError::InvalidSize {
                pool: name.to_string(),
            });
        }

        let shared = Arc::new(Shared {
            name: Arc::clone(&name),
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                state: PoolState::Running,
                active: 0,
                shutdown_result: None,
            }),
            available: Condvar::new(),
            idle: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || worker_loop(&worker_shared));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(source) => {
                    shared.queue.lock().state = PoolState::Stopped;
                    shared.available.notify_all();
                    return Err(PoolError::Spawn {
                        pool: name.to_string(),
                        source,
                    });
                }
            }
        }

        debug!(pool = %name, size, "worker pool started");

        Ok(Self {
            shared,
            size,
            workers: Mutex::new(workers),
        })
    }

    /// Name of the pool (also the prefix of its thread names).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Number of worker threads.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn state(&self) -> PoolState {
        self.shared.queue.lock().state
    }

    /// Number of tasks waiting for a worker.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().tasks.len()
    }

    /// Number of tasks currently executing.
    #[must_use]
    pub fn active(&self) -> usize {
        self.shared.queue.lock().active
    }

    /// Enqueues `task` with a snapshot of the calling thread's active context.
    ///
    /// Never blocks waiting for the task to run.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::ShutDown`] once shutdown has started.
    pub fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_with_context(RequestContext::current(), task)
    }

    /// Enqueues `task` to run with `context` installed.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::ShutDown`] once shutdown has started.
    pub fn submit_with_context<F>(
        &self,
        context: Option<RequestContext>,
        task: F,
    ) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queue = self.shared.queue.lock();
        if queue.state != PoolState::Running {
            return Err(PoolError::ShutDown {
                pool: self.name().to_string(),
            });
        }
        queue.tasks.push_back(Task {
            job: Box::new(task),
            context,
        });
        drop(queue);
        self.shared.available.notify_one();
        Ok(())
    }

    /// Stops accepting tasks and waits up to `timeout` for queued and running
    /// tasks to finish.
    ///
    /// Returns `true` if the pool drained in time; its threads have then been
    /// joined. Returns `false` otherwise: queued tasks that never started are
    /// discarded and the threads still running a task are detached, exiting as
    /// soon as that task returns. Either way the pool ends up
    /// [`PoolState::Stopped`]. Later calls return the first call's result.
    pub fn shutdown_gracefully(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut queue = self.shared.queue.lock();
        if let Some(result) = queue.shutdown_result {
            return result;
        }

        queue.state = PoolState::Draining;
        self.shared.available.notify_all();
        info!(
            pool = %self.shared.name,
            queued = queue.tasks.len(),
            active = queue.active,
            "draining worker pool"
        );

        while !queue.is_idle() {
            if self.shared.idle.wait_until(&mut queue, deadline).timed_out() {
                break;
            }
        }

        let drained = queue.is_idle();
        let still_running = queue.active;
        let discarded = std::mem::take(&mut queue.tasks);
        queue.state = PoolState::Stopped;
        queue.shutdown_result = Some(drained);
        drop(queue);
        self.shared.available.notify_all();

        let workers = std::mem::take(&mut *self.workers.lock());
        if drained {
            for handle in workers {
                if handle.join().is_err() {
                    warn!(pool = %self.shared.name, "worker thread exited abnormally");
                }
            }
            info!(pool = %self.shared.name, "worker pool drained");
        } else {
            warn!(
                pool = %self.shared.name,
                discarded = discarded.len(),
                still_running,
                "worker pool drain timed out; remaining workers detached"
            );
        }
        // Dropped outside the lock: task closures may own arbitrary state.
        drop(discarded);

        drained
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let mut queue = self.shared.queue.lock();
        if queue.state == PoolState::Stopped {
            return;
        }
        queue.state = PoolState::Stopped;
        let discarded = std::mem::take(&mut queue.tasks);
        drop(queue);
        self.shared.available.notify_all();
        drop(discarded);
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue = self.shared.queue.lock();
        f.debug_struct("WorkerPool")
            .field("name", &self.shared.name)
            .field("size", &self.size)
            .field("state", &queue.state)
            .field("queued", &queue.tasks.len())
            .field("active", &queue.active)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Worker threads
// ---------------------------------------------------------------------------

fn worker_loop(shared: &Shared) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(task) = queue.tasks.pop_front() {
                    queue.active += 1;
                    break task;
                }
                if queue.state != PoolState::Running {
                    return;
                }
                shared.available.wait(&mut queue);
            }
        };

        run_task(&shared.name, task);

        let mut queue = shared.queue.lock();
        queue.active -= 1;
        if queue.is_idle() {
            shared.idle.notify_all();
        }
    }
}

fn run_task(pool: &str, task: Task) {
    let Task { job, context } = task;
    let _scope = context.map(RequestContext::enter);
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        error!(
            pool,
            panic = panic_message(payload.as_ref()),
            "task panicked; worker continues"
        );
    }
}

/// Renders a panic payload for logging.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
