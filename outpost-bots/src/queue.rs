//! FIFO task queue: at most one task in flight per queue.
//!
//! Each queue runs its own processing loop. A task body is an
//! `anyhow::Result` future; errors and panics are logged at the queue
//! boundary and the loop moves on to the next task. Failed tasks are never
//! retried.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// One queued unit of work.
pub struct Task {
    /// Tag of the session the task acts on.
    pub owner: String,
    pub description: String,
    body: BoxFuture<'static, anyhow::Result<()>>,
}

impl Task {
    pub fn new<F>(owner: impl Into<String>, description: impl Into<String>, body: F) -> Self
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            owner: owner.into(),
            description: description.into(),
            body: Box::pin(body),
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("owner", &self.owner)
            .field("description", &self.description)
            .finish()
    }
}

struct Inner {
    name: String,
    tasks: Mutex<VecDeque<Task>>,
    busy: AtomicBool,
    shutting_down: AtomicBool,
    wake: Notify,
    idle: Notify,
    poll_interval: Duration,
}

impl Inner {
    fn is_idle(&self) -> bool {
        // `process` sets `busy` while holding the lock it pops under.
        let tasks = self.tasks.lock();
        tasks.is_empty() && !self.busy.load(Ordering::SeqCst)
    }
}

/// Handle to a queue and its processing loop. Clones share the queue.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

impl TaskQueue {
    /// Create the queue and start its processing loop.
    pub fn spawn(name: impl Into<String>) -> Self {
        Self::with_poll_interval(name, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(name: impl Into<String>, poll_interval: Duration) -> Self {
        let queue = Self {
            inner: Arc::new(Inner {
                name: name.into(),
                tasks: Mutex::new(VecDeque::new()),
                busy: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                wake: Notify::new(),
                idle: Notify::new(),
                poll_interval,
            }),
        };
        tokio::spawn(process(queue.inner.clone()));
        queue
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Append to the tail. Returns false once the queue is shutting down.
    pub fn enqueue(&self, task: Task) -> bool {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            tracing::warn!(
                queue = %self.inner.name,
                bot = %task.owner,
                task = %task.description,
                "Queue shutting down, task refused"
            );
            return false;
        }
        let pending = {
            let mut tasks = self.inner.tasks.lock();
            tasks.push_back(task);
            tasks.len()
        };
        tracing::debug!(queue = %self.inner.name, pending, "Task queued");
        self.inner.wake.notify_one();
        true
    }

    /// Number of tasks waiting to start.
    pub fn len(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// True when a task with this owner and description is waiting to start.
    pub fn has_pending(&self, owner: &str, description: &str) -> bool {
        self.inner
            .tasks
            .lock()
            .iter()
            .any(|t| t.owner == owner && t.description == description)
    }

    /// Stop dequeuing. The in-flight task finishes; waiting tasks are
    /// dropped.
    pub fn set_shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let dropped = std::mem::take(&mut *self.inner.tasks.lock());
        if !dropped.is_empty() {
            tracing::warn!(
                queue = %self.inner.name,
                dropped = dropped.len(),
                "Discarding queued tasks on shutdown"
            );
        }
        self.inner.wake.notify_one();
        self.inner.idle.notify_waiters();
    }

    /// Wait until the queue is empty and idle. Returns false on timeout.
    pub async fn wait_for_completion(&self, timeout: Duration) -> bool {
        let inner = &self.inner;
        let drained = async {
            loop {
                let idle = inner.idle.notified();
                if inner.is_idle() {
                    return;
                }
                tokio::select! {
                    _ = idle => {}
                    _ = tokio::time::sleep(inner.poll_interval) => {}
                }
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}

async fn process(inner: Arc<Inner>) {
    while !inner.shutting_down.load(Ordering::SeqCst) {
        let next = {
            let mut tasks = inner.tasks.lock();
            let next = tasks.pop_front();
            if next.is_some() {
                inner.busy.store(true, Ordering::SeqCst);
            }
            next
        };

        let Some(task) = next else {
            tokio::select! {
                _ = inner.wake.notified() => {}
                _ = tokio::time::sleep(inner.poll_interval) => {}
            }
            continue;
        };

        let Task {
            owner,
            description,
            body,
        } = task;
        tracing::debug!(queue = %inner.name, bot = %owner, task = %description, "Task started");

        // Spawned so a panicking body is contained like an error.
        match tokio::spawn(body).await {
            Ok(Ok(())) => {
                tracing::debug!(queue = %inner.name, bot = %owner, task = %description, "Task finished")
            }
            Ok(Err(e)) => {
                tracing::error!(queue = %inner.name, bot = %owner, task = %description, error = %format!("{e:#}"), "Task failed")
            }
            Err(e) => {
                tracing::error!(queue = %inner.name, bot = %owner, task = %description, error = %e, "Task panicked")
            }
        }

        inner.busy.store(false, Ordering::SeqCst);
        inner.idle.notify_waiters();
    }
    tracing::debug!(queue = %inner.name, "Queue stopped");
}
