use thiserror::Error;

use crate::message::WorkerId;

/// Errors surfaced to callers through [`crate::TaskHandle`] or the pool API.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("task '{task_type}' failed: {message}")]
    TaskFailed { task_type: String, message: String },

    #[error("worker {worker} crashed: {reason}")]
    WorkerCrashed { worker: WorkerId, reason: String },

    #[error("pool terminated")]
    Terminated,

    #[error("task queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("no workers left: every worker slot was retired")]
    NoWorkers,

    #[error("invalid pool config: {0}")]
    Config(#[from] offload_core::ConfigError),

    #[error("payload is not serializable: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("no tokio runtime available to drive the pool")]
    NoRuntime,
}

/// Failures encoding or decoding frames that cross the worker boundary.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}
