//! Serialized execution contexts for user callbacks
//!
//! A `Handler` owns a tokio task that runs posted closures one at a time,
//! in posting order. The dynamic channel manager never calls user code on
//! its own queue; it posts the callback to the handler the caller chose.

use tokio::sync::mpsc;
use tracing::warn;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a serialized task queue. Cloning shares the same queue.
#[derive(Clone, Debug)]
pub struct Handler {
    tasks: mpsc::UnboundedSender<Task>,
}

impl Handler {
    /// Spawn a new queue on the current tokio runtime.
    ///
    /// Panics if called outside a tokio runtime, like `tokio::spawn`.
    pub fn new() -> Self {
        let (tasks, mut rx) = mpsc::unbounded_channel::<Task>();
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                task();
            }
        });
        Self { tasks }
    }

    /// Queue `task` behind everything already posted.
    ///
    /// Returns false when the queue's task has ended and the closure was dropped.
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tasks.send(Box::new(task)).is_err() {
            warn!("Handler queue closed, dropping callback");
            return false;
        }
        true
    }
}

impl Default for Handler {
    fn default() -> Self {
        Self::new()
    }
}
