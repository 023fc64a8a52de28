//! The single pending non-blocking task.
//!
//! Checking for a pending task and starting one happen under the same lock.
//! The worker reports completion through a `watch` channel so `^result` can
//! wait a bounded time without polling.

use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

use crate::error::{DeviceError, ProxyError, Result};

/// What a finished task produced: its value or an error message.
pub(crate) type TaskOutcome = std::result::Result<Value, String>;

#[derive(Debug, PartialEq)]
pub(crate) enum TaskPoll {
    /// No task is pending.
    Empty,
    Running,
    /// The task finished; the slot is now free.
    Done(TaskOutcome),
}

struct PendingTask {
    command: String,
    started_at: Instant,
    done: watch::Receiver<Option<TaskOutcome>>,
}

#[derive(Default)]
pub(crate) struct TaskSlot {
    pending: Mutex<Option<PendingTask>>,
}

impl TaskSlot {
    fn lock(&self) -> MutexGuard<'_, Option<PendingTask>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start `work` on a blocking worker unless a task is already pending.
    pub(crate) fn try_start<F>(&self, command: &str, work: F) -> Result<()>
    where
        F: FnOnce() -> std::result::Result<Value, DeviceError> + Send + 'static,
    {
        let mut pending = self.lock();
        if pending.is_some() {
            return Err(ProxyError::TaskPending);
        }

        let (tx, rx) = watch::channel(None);
        let name = command.to_string();
        tokio::task::spawn_blocking(move || {
            let outcome = match catch_unwind(AssertUnwindSafe(work)) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("\"{name}\" panicked")),
            };
            // The receiver is gone if the task was released by an abort.
            let _ = tx.send(Some(outcome));
        });

        *pending = Some(PendingTask {
            command: command.to_string(),
            started_at: Instant::now(),
            done: rx,
        });
        Ok(())
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.lock().is_some()
    }

    /// Consume the outcome if the task has finished, without waiting.
    pub(crate) fn poll(&self) -> TaskPoll {
        let mut pending = self.lock();
        let finished = match pending.as_ref() {
            None => return TaskPoll::Empty,
            Some(task) => task.done.borrow().is_some() || task.done.has_changed().is_err(),
        };
        if !finished {
            return TaskPoll::Running;
        }

        match pending.take() {
            Some(task) => {
                debug!(
                    "Task \"{}\" finished after {:?}",
                    task.command,
                    task.started_at.elapsed()
                );
                let outcome = task
                    .done
                    .borrow()
                    .clone()
                    .unwrap_or_else(|| Err(format!("\"{}\" ended without a result", task.command)));
                TaskPoll::Done(outcome)
            }
            None => TaskPoll::Empty,
        }
    }

    /// Like `poll`, but give a running task up to `timeout` to finish first.
    pub(crate) async fn wait(&self, timeout: Duration) -> TaskPoll {
        let done = {
            let pending = self.lock();
            pending.as_ref().map(|task| task.done.clone())
        };
        let Some(mut done) = done else {
            return TaskPoll::Empty;
        };
        // An error here means the worker dropped its sender; `poll` reports it.
        let _ = tokio::time::timeout(timeout, done.wait_for(Option::is_some)).await;
        self.poll()
    }

    /// Forget the pending task. Its worker keeps running; the outcome is dropped.
    pub(crate) fn release(&self) -> Option<String> {
        self.lock().take().map(|task| task.command)
    }
}
