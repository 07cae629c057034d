//! Bounded pool of isolated worker threads for CPU-bound tasks.
//!
//! Callers submit `(task_type, payload)` pairs through a [`WorkerPool`] and
//! await a [`TaskHandle`]. A single control loop owns the queue, the pending
//! table and the stats; workers only ever see encoded request frames.

pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod message;
pub mod pool;
pub mod stats;
pub mod worker;

pub use error::{PoolError, ProtocolError};
pub use handler::{HandlerError, HandlerRegistry, RegistryError, TaskContext, TaskHandler};
pub use message::{Outcome, Request, Response, TaskId, WorkerId};
pub use offload_core::{PoolConfig, RespawnPolicy, RuntimeFlags};
pub use pool::{TaskHandle, WorkerPool};
pub use stats::{PoolStats, StatsAggregator};
