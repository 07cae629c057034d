use std::collections::HashMap;
use std::sync::Arc;

use offload_core::RuntimeFlags;
use serde_json::Value;

use crate::message::{TaskId, WorkerId};

/// Task type answered by every worker without a registered handler.
pub const PING: &str = "ping";

/// Task type reserved for runtime flag broadcasts.
pub const CONFIG: &str = "config";

const RESERVED: &[&str] = &[PING, CONFIG];

/// Error returned by a handler. Only its message crosses the worker boundary.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self(format!("invalid payload: {e}"))
    }
}

/// What a handler knows about the task it is running.
///
/// `flags` is the worker-local copy as of the moment the task started.
#[derive(Debug)]
pub struct TaskContext<'a> {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub task_type: &'a str,
    pub flags: &'a RuntimeFlags,
}

/// A computation registered under a task type and run inside workers.
///
/// Handlers receive the decoded payload as their only input and must not
/// rely on state shared with the pool.
pub trait TaskHandler: Send + Sync {
    fn handle(&self, ctx: &TaskContext<'_>, payload: Value) -> Result<Value, HandlerError>;
}

struct FnHandler<F>(F);

impl<F> TaskHandler for FnHandler<F>
where
    F: Fn(&TaskContext<'_>, Value) -> Result<Value, HandlerError> + Send + Sync,
{
    fn handle(&self, ctx: &TaskContext<'_>, payload: Value) -> Result<Value, HandlerError> {
        (self.0)(ctx, payload)
    }
}

/// Immutable table of task type -> handler shared by all workers.
///
/// Names are validated on registration, so a registry that was built
/// successfully never contains duplicates or reserved names.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler. Returns error if the name is empty, reserved or taken.
    pub fn register(
        &mut self,
        task_type: impl Into<String>,
        handler: impl TaskHandler + 'static,
    ) -> Result<(), RegistryError> {
        let task_type = task_type.into();
        if task_type.trim().is_empty() {
            return Err(RegistryError::EmptyTaskType);
        }
        if RESERVED.contains(&task_type.as_str()) {
            return Err(RegistryError::ReservedTaskType(task_type));
        }
        if self.handlers.contains_key(&task_type) {
            return Err(RegistryError::DuplicateTaskType(task_type));
        }
        self.handlers.insert(task_type, Arc::new(handler));
        Ok(())
    }

    /// Register a closure as a handler.
    pub fn register_fn<F>(&mut self, task_type: impl Into<String>, f: F) -> Result<(), RegistryError>
    where
        F: Fn(&TaskContext<'_>, Value) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.register(task_type, FnHandler(f))
    }

    /// Look up a handler by task type.
    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    /// Registered task types, sorted.
    pub fn task_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for task type '{0}' is already registered")]
    DuplicateTaskType(String),
    #[error("task type '{0}' is reserved")]
    ReservedTaskType(String),
    #[error("task type must not be empty")]
    EmptyTaskType,
}
