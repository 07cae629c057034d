use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::PoolError;
use crate::message::TaskId;

/// Sending half of a caller's [`crate::TaskHandle`].
pub type Completion = oneshot::Sender<Result<Value, PoolError>>;

/// A task between submission and resolution.
#[derive(Debug)]
pub struct PendingTask {
    pub task_type: String,
    /// Taken when the task is dispatched.
    pub payload: Option<Value>,
    pub enqueued_at: Instant,
    pub dispatched_at: Option<Instant>,
    completion: Completion,
}

impl PendingTask {
    pub fn new(task_type: String, payload: Value, completion: Completion) -> Self {
        Self {
            task_type,
            payload: Some(payload),
            enqueued_at: Instant::now(),
            dispatched_at: None,
            completion,
        }
    }

    /// Dispatch-to-now, or zero if the task never left the queue.
    pub fn elapsed(&self) -> Duration {
        self.dispatched_at
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    /// Deliver the result. A caller that dropped its handle is not an error.
    pub fn resolve(self, result: Result<Value, PoolError>) {
        let _ = self.completion.send(result);
    }
}

/// Map from task id to its pending entry.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: HashMap<TaskId, PendingTask>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: TaskId, task: PendingTask) {
        self.entries.insert(id, task);
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut PendingTask> {
        self.entries.get_mut(&id)
    }

    pub fn remove(&mut self, id: TaskId) -> Option<PendingTask> {
        self.entries.remove(&id)
    }

    /// Remove every entry, oldest id first.
    pub fn drain(&mut self) -> Vec<(TaskId, PendingTask)> {
        let mut all: Vec<_> = self.entries.drain().collect();
        all.sort_unstable_by_key(|(id, _)| *id);
        all
    }
}
