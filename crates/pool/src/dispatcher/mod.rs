//! Single-owner control loop pairing idle workers with queued tasks.
//!
//! Split into focused submodules:
//! - `queue`: FIFO of task ids awaiting a worker, with optional capacity
//! - `pending`: every live task from submission until it is resolved
//! - `control`: loop state, worker slots, lifecycle and command handling
//! - `routing`: dispatch, response correlation and fault handling

mod control;
mod pending;
mod queue;
mod routing;

pub(crate) use self::control::{Command, ControlLoop};
pub use self::pending::{PendingTable, PendingTask};
pub use self::queue::TaskQueue;
