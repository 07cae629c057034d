//! Worker threads and the boundary protocol they speak.
//!
//! A worker is an OS thread with a private inbox of encoded [`Request`]
//! frames. It processes one frame at a time and answers every task with
//! exactly one encoded [`Response`] on the shared event channel. A handler
//! panic is caught and answered as a task failure; the worker stays usable.
//! An undecodable frame is reported as a fault, after which the thread
//! exits and the control loop decides whether to respawn the slot.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;

use offload_core::RuntimeFlags;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::handler::{HandlerRegistry, TaskContext, PING};
use crate::message::{Frame, Outcome, Request, Response, TaskId, WorkerId};

/// Something a worker (or a respawn timer for its slot) reports to the control loop.
#[derive(Debug)]
pub struct WorkerEvent {
    pub worker: WorkerId,
    pub generation: u32,
    pub kind: WorkerEventKind,
}

#[derive(Debug)]
pub enum WorkerEventKind {
    /// An encoded [`Response`].
    Frame(Frame),
    /// The execution context failed; the thread is gone.
    Fault(String),
    /// The backoff for a crashed slot elapsed.
    RespawnDue,
}

/// Sending half of a worker's inbox.
pub type Inbox = std_mpsc::Sender<Frame>;

/// Spawn a worker thread for slot `id`.
pub fn spawn(
    id: WorkerId,
    generation: u32,
    registry: Arc<HandlerRegistry>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) -> std::io::Result<Inbox> {
    let (inbox_tx, inbox_rx) = std_mpsc::channel::<Frame>();
    let worker = Worker {
        id,
        generation,
        registry,
        flags: RuntimeFlags::empty(),
        events,
    };

    std::thread::Builder::new()
        .name(format!("offload-worker-{id}"))
        .spawn(move || worker.run(inbox_rx))?;

    Ok(inbox_tx)
}

struct Worker {
    id: WorkerId,
    generation: u32,
    registry: Arc<HandlerRegistry>,
    /// Worker-local flags, populated by `Config` requests.
    flags: RuntimeFlags,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl Worker {
    fn run(mut self, inbox: std_mpsc::Receiver<Frame>) {
        debug!(worker = self.id, generation = self.generation, "worker started");

        while let Ok(frame) = inbox.recv() {
            let request = match Request::from_frame(&frame) {
                Ok(r) => r,
                Err(e) => {
                    self.fault(format!("undecodable request: {e}"));
                    return;
                }
            };

            match request {
                Request::Config { flags } => {
                    self.flags.merge(&flags);
                    trace!(worker = self.id, flags = ?self.flags, "runtime flags updated");
                }
                Request::Task { id, task_type, payload } => {
                    let run = panic::catch_unwind(AssertUnwindSafe(|| {
                        self.execute(id, &task_type, payload)
                    }));
                    let outcome = run.unwrap_or_else(|panic| {
                        let message = format!(
                            "handler for '{task_type}' panicked: {}",
                            panic_message(panic.as_ref())
                        );
                        warn!(worker = self.id, task_id = id, %message, "handler panicked");
                        Outcome::Failure(message)
                    });
                    if !self.reply(id, outcome) {
                        return;
                    }
                }
            }
        }

        debug!(worker = self.id, generation = self.generation, "inbox closed, worker exiting");
    }

    fn execute(&self, id: TaskId, task_type: &str, payload: Value) -> Outcome {
        if task_type == PING {
            return Outcome::Success(json!({
                "pong": true,
                "worker": self.id,
                "time": chrono::Utc::now().timestamp_millis(),
            }));
        }

        let Some(handler) = self.registry.get(task_type) else {
            return Outcome::Failure(format!("unknown task type: {task_type}"));
        };

        let ctx = TaskContext {
            task_id: id,
            worker_id: self.id,
            task_type,
            flags: &self.flags,
        };
        match handler.handle(&ctx, payload) {
            Ok(result) => Outcome::Success(result),
            Err(e) => {
                debug!(worker = self.id, task_id = id, task_type, error = %e, "handler failed");
                Outcome::Failure(e.to_string())
            }
        }
    }

    /// Send the response for `id`. Returns false once the control loop is gone.
    fn reply(&self, id: TaskId, outcome: Outcome) -> bool {
        let frame = match (Response { id, outcome }).to_frame() {
            Ok(f) => f,
            Err(e) => {
                warn!(worker = self.id, task_id = id, error = %e, "result not encodable");
                let fallback = Response {
                    id,
                    outcome: Outcome::Failure(format!("result not encodable: {e}")),
                };
                match fallback.to_frame() {
                    Ok(f) => f,
                    Err(e) => {
                        self.fault(format!("response encoding failed: {e}"));
                        return false;
                    }
                }
            }
        };
        self.send(WorkerEventKind::Frame(frame))
    }

    fn fault(&self, reason: String) {
        warn!(worker = self.id, generation = self.generation, %reason, "worker faulted");
        self.send(WorkerEventKind::Fault(reason));
    }

    fn send(&self, kind: WorkerEventKind) -> bool {
        self.events
            .send(WorkerEvent {
                worker: self.id,
                generation: self.generation,
                kind,
            })
            .is_ok()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
