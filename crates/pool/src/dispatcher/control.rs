use std::sync::Arc;

use offload_core::{PoolConfig, RuntimeFlags};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info};

use crate::error::PoolError;
use crate::handler::HandlerRegistry;
use crate::message::{Request, TaskId, WorkerId};
use crate::stats::{PoolStats, StatsAggregator, SubmitCounters};
use crate::worker::{self, Inbox, WorkerEvent, WorkerEventKind};

use super::pending::{Completion, PendingTable, PendingTask};
use super::queue::TaskQueue;

/// Caller-side requests to the control loop.
#[derive(Debug)]
pub(crate) enum Command {
    Submit {
        id: TaskId,
        task_type: String,
        payload: Value,
        completion: Completion,
    },
    /// Flags to merge into every live worker.
    Configure(RuntimeFlags),
    /// Reject everything pending, close all workers, acknowledge.
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum SlotState {
    Idle,
    Busy(TaskId),
    /// Waiting out the backoff before respawn attempt `attempt`.
    Respawning { attempt: u32 },
    Retired,
}

#[derive(Debug)]
pub(super) struct WorkerSlot {
    pub(super) id: WorkerId,
    /// Bumped on every respawn; events from older generations are stale.
    pub(super) generation: u32,
    pub(super) inbox: Option<Inbox>,
    pub(super) state: SlotState,
    /// Crashes of this slot so far (never reset).
    pub(super) crashes: u32,
}

impl WorkerSlot {
    pub(super) fn is_live(&self) -> bool {
        matches!(self.state, SlotState::Idle | SlotState::Busy(_))
    }
}

/// Owner of all mutable pool state. Runs as one tokio task.
pub(crate) struct ControlLoop {
    pub(super) config: PoolConfig,
    pub(super) registry: Arc<HandlerRegistry>,
    /// Full merged flags, replayed to respawned workers.
    pub(super) flags: RuntimeFlags,
    pub(super) slots: Vec<WorkerSlot>,
    pub(super) queue: TaskQueue,
    pub(super) pending: PendingTable,
    pub(super) stats: StatsAggregator,
    pub(super) counters: Arc<SubmitCounters>,
    pub(super) stats_tx: watch::Sender<PoolStats>,
    pub(super) events_tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl ControlLoop {
    /// Spawn `size` workers and send each the current flags before any task.
    pub(crate) fn start(
        config: PoolConfig,
        size: usize,
        registry: Arc<HandlerRegistry>,
        flags: RuntimeFlags,
        counters: Arc<SubmitCounters>,
        stats_tx: watch::Sender<PoolStats>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WorkerEvent>), PoolError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let config_frame = Request::Config { flags: flags.clone() }.to_frame()?;

        let mut slots = Vec::with_capacity(size);
        for id in 0..size {
            let inbox = worker::spawn(id, 1, Arc::clone(&registry), events_tx.clone())?;
            // A freshly spawned worker holds its receiver, so this cannot fail.
            let _ = inbox.send(config_frame.clone());
            slots.push(WorkerSlot {
                id,
                generation: 1,
                inbox: Some(inbox),
                state: SlotState::Idle,
                crashes: 0,
            });
        }

        let control = Self {
            queue: TaskQueue::new(),
            config,
            registry,
            flags,
            slots,
            pending: PendingTable::new(),
            stats: StatsAggregator::new(),
            counters,
            stats_tx,
            events_tx,
        };
        control.publish();
        Ok((control, events_rx))
    }

    /// Multiplex caller commands and worker events until shutdown.
    ///
    /// A closed command channel (every pool handle dropped) is treated as
    /// a shutdown request.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        info!(workers = self.slots.len(), "control loop started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Submit { id, task_type, payload, completion }) => {
                        self.submit(id, task_type, payload, completion);
                    }
                    Some(Command::Configure(flags)) => self.broadcast_config(flags),
                    Some(Command::Shutdown(ack)) => {
                        self.teardown();
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        debug!("all pool handles dropped");
                        self.teardown();
                        break;
                    }
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
        }

        info!("control loop stopped");
    }

    /// Queue an admitted task. Rejected at once when no worker can ever run it.
    pub(super) fn submit(
        &mut self,
        id: TaskId,
        task_type: String,
        payload: Value,
        completion: Completion,
    ) {
        if self.exhausted() {
            debug!(task_id = id, task_type = %task_type, "submission rejected, no workers left");
            self.counters.dequeued();
            self.counters.resolved();
            let _ = completion.send(Err(PoolError::NoWorkers));
            return;
        }
        self.queue.push(id);
        self.pending.insert(id, PendingTask::new(task_type, payload, completion));
        self.process_queue();
        self.publish();
    }

    /// Every slot is retired; nothing queued will ever be dispatched.
    pub(super) fn exhausted(&self) -> bool {
        self.slots.iter().all(|s| s.state == SlotState::Retired)
    }

    /// Reject everything still waiting once the last slot has retired.
    pub(super) fn reject_if_exhausted(&mut self) {
        if !self.exhausted() {
            return;
        }
        let waiting = self.queue.drain();
        if !waiting.is_empty() {
            error!(count = waiting.len(), "all workers retired; rejecting queued tasks");
        }
        for id in waiting {
            self.counters.dequeued();
            if let Some(task) = self.pending.remove(id) {
                self.counters.resolved();
                task.resolve(Err(PoolError::NoWorkers));
            }
        }
    }

    pub(super) fn handle_event(&mut self, event: WorkerEvent) {
        let WorkerEvent { worker, generation, kind } = event;
        match kind {
            WorkerEventKind::Frame(frame) => self.handle_message(worker, generation, &frame),
            WorkerEventKind::Fault(reason) => self.handle_fault(worker, generation, reason),
            WorkerEventKind::RespawnDue => self.respawn(worker, generation),
        }
    }

    /// Merge `flags` and fire-and-forget them to every live worker.
    fn broadcast_config(&mut self, flags: RuntimeFlags) {
        self.flags.merge(&flags);
        let frame = match (Request::Config { flags }).to_frame() {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, "failed to encode config broadcast");
                return;
            }
        };

        let mut lost = Vec::new();
        for slot in self.slots.iter().filter(|s| s.is_live()) {
            let delivered = slot
                .inbox
                .as_ref()
                .is_some_and(|inbox| inbox.send(frame.clone()).is_ok());
            if !delivered {
                lost.push((slot.id, slot.generation));
            }
        }
        debug!(flags = ?self.flags, "runtime flags broadcast");

        if !lost.is_empty() {
            for (worker, generation) in lost {
                self.fail_worker(worker, generation, "inbox closed during config broadcast".into());
            }
            self.process_queue();
            self.publish();
        }
    }

    /// Reject every pending task and close every worker inbox.
    fn teardown(&mut self) {
        let pending = self.pending.drain();
        if !pending.is_empty() {
            info!(count = pending.len(), "rejecting pending tasks on shutdown");
        }
        for (_, task) in pending {
            self.counters.resolved();
            task.resolve(Err(PoolError::Terminated));
        }
        for _ in self.queue.drain() {
            self.counters.dequeued();
        }
        for slot in &mut self.slots {
            slot.inbox = None;
            slot.state = SlotState::Retired;
        }
        self.stats.reset();
        self.stats_tx.send_replace(PoolStats::default());
    }

    /// Publish the worker gauges and completion counters to
    /// `WorkerPool::stats` readers.
    pub(super) fn publish(&self) {
        let workers = self.slots.iter().filter(|s| s.is_live()).count();
        let busy = self
            .slots
            .iter()
            .filter(|s| matches!(s.state, SlotState::Busy(_)))
            .count();
        self.stats_tx.send_replace(self.stats.snapshot(workers, busy));
    }
}
