use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::PoolError;
use crate::message::{Outcome, Request, Response, WorkerId};
use crate::worker::{self, WorkerEvent, WorkerEventKind};

use super::control::{ControlLoop, SlotState};

impl ControlLoop {
    /// First idle worker in ascending id order.
    fn idle_worker(&self) -> Option<WorkerId> {
        self.slots
            .iter()
            .find(|s| s.state == SlotState::Idle)
            .map(|s| s.id)
    }

    /// Pair queued tasks with idle workers, earliest submission first.
    pub(super) fn process_queue(&mut self) {
        while !self.queue.is_empty() {
            let Some(worker) = self.idle_worker() else { break };
            let Some(id) = self.queue.pop() else { break };
            self.counters.dequeued();
            let Some(task) = self.pending.get_mut(id) else {
                warn!(task_id = id, "queued task missing from pending table");
                continue;
            };

            let request = Request::Task {
                id,
                task_type: task.task_type.clone(),
                payload: task.payload.take().unwrap_or(Value::Null),
            };
            let frame = match request.to_frame() {
                Ok(f) => f,
                Err(e) => {
                    warn!(task_id = id, error = %e, "task payload could not be encoded");
                    if let Some(task) = self.pending.remove(id) {
                        self.counters.resolved();
                        task.resolve(Err(e.into()));
                    }
                    continue;
                }
            };
            if frame.len() > self.config.payload_warn_bytes {
                warn!(
                    task_id = id,
                    task_type = %task.task_type,
                    kb = frame.len() / 1024,
                    "large payload dispatched"
                );
            }

            debug!(
                task_id = id,
                worker,
                waited_ms = task.enqueued_at.elapsed().as_millis() as u64,
                "dispatching task"
            );
            task.dispatched_at = Some(std::time::Instant::now());

            let slot = &mut self.slots[worker];
            slot.state = SlotState::Busy(id);
            let delivered = slot
                .inbox
                .as_ref()
                .is_some_and(|inbox| inbox.send(frame).is_ok());
            if !delivered {
                let generation = slot.generation;
                self.fail_worker(worker, generation, "worker inbox closed".into());
            }
        }
    }

    /// Correlate a response frame with its pending task.
    pub(super) fn handle_message(&mut self, worker: WorkerId, generation: u32, frame: &[u8]) {
        if !self.is_current(worker, generation) {
            debug!(worker, generation, "dropping response from stale worker");
            return;
        }

        let Response { id, outcome } = match Response::from_frame(frame) {
            Ok(r) => r,
            Err(e) => {
                self.handle_fault(worker, generation, format!("undecodable response: {e}"));
                return;
            }
        };

        let slot = &mut self.slots[worker];
        if slot.state == SlotState::Busy(id) {
            slot.state = SlotState::Idle;
        }

        let Some(task) = self.pending.remove(id) else {
            debug!(task_id = id, worker, "response for unknown task dropped");
            self.process_queue();
            self.publish();
            return;
        };

        self.counters.resolved();
        let elapsed = task.elapsed();
        self.stats.record_completion(elapsed, outcome.is_success());
        debug!(
            task_id = id,
            worker,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            success = outcome.is_success(),
            "task completed"
        );

        self.process_queue();
        self.publish();

        let result = match outcome {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(message) => Err(PoolError::TaskFailed {
                task_type: task.task_type.clone(),
                message,
            }),
        };
        task.resolve(result);
    }

    /// Transport-level failure of a worker: fail its task, schedule recovery.
    pub(super) fn handle_fault(&mut self, worker: WorkerId, generation: u32, reason: String) {
        if !self.is_current(worker, generation) {
            debug!(worker, generation, "ignoring fault from stale worker");
            return;
        }
        self.fail_worker(worker, generation, reason);
        self.process_queue();
        self.publish();
    }

    /// Reject the in-flight task of `worker`, close it, and either schedule a
    /// respawn or retire the slot. Once every slot is retired, waiting tasks
    /// are rejected too. Does not dispatch or publish.
    pub(super) fn fail_worker(&mut self, worker: WorkerId, generation: u32, reason: String) {
        if !self.is_current(worker, generation) {
            return;
        }
        error!(worker, generation, %reason, "worker failed");

        let slot = &mut self.slots[worker];
        let in_flight = match slot.state {
            SlotState::Busy(id) => Some(id),
            _ => None,
        };
        slot.inbox = None;
        slot.crashes += 1;
        let attempt = slot.crashes;

        if self.config.respawn.allows(attempt) {
            let delay = self.config.respawn.delay_for(attempt);
            warn!(
                worker,
                attempt,
                max_attempts = self.config.respawn.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "scheduling worker respawn"
            );
            slot.state = SlotState::Respawning { attempt };
            self.schedule_respawn(worker, generation, delay);
        } else {
            error!(worker, "worker exceeded max respawn attempts; retiring");
            slot.state = SlotState::Retired;
        }

        if let Some(id) = in_flight {
            if let Some(task) = self.pending.remove(id) {
                self.counters.resolved();
                task.resolve(Err(PoolError::WorkerCrashed { worker, reason }));
            }
        }
        self.reject_if_exhausted();
    }

    fn schedule_respawn(&self, worker: WorkerId, generation: u32, delay: Duration) {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(WorkerEvent {
                worker,
                generation,
                kind: WorkerEventKind::RespawnDue,
            });
        });
    }

    /// Bring a crashed slot back with a new generation and the current flags.
    pub(super) fn respawn(&mut self, worker: WorkerId, generation: u32) {
        let Some(slot) = self.slots.get(worker) else { return };
        if slot.generation != generation || !matches!(slot.state, SlotState::Respawning { .. }) {
            return;
        }

        let next_generation = generation + 1;
        let spawned = worker::spawn(
            worker,
            next_generation,
            Arc::clone(&self.registry),
            self.events_tx.clone(),
        );
        let inbox = match spawned {
            Ok(inbox) => inbox,
            Err(e) => {
                // Count the failed spawn as another crash of the same generation.
                let slot = &mut self.slots[worker];
                slot.state = SlotState::Idle;
                self.fail_worker(worker, generation, format!("respawn failed: {e}"));
                self.publish();
                return;
            }
        };

        if let Ok(frame) = (Request::Config { flags: self.flags.clone() }).to_frame() {
            let _ = inbox.send(frame);
        }

        let slot = &mut self.slots[worker];
        slot.generation = next_generation;
        slot.inbox = Some(inbox);
        slot.state = SlotState::Idle;
        info!(worker, generation = next_generation, "worker respawned");

        self.process_queue();
        self.publish();
    }

    fn is_current(&self, worker: WorkerId, generation: u32) -> bool {
        self.slots
            .get(worker)
            .is_some_and(|s| s.generation == generation && s.is_live())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use offload_core::{PoolConfig, RespawnPolicy, RuntimeFlags};
    use serde_json::json;
    use tokio::sync::{mpsc, oneshot, watch};

    use super::*;
    use crate::handler::HandlerRegistry;
    use crate::message::TaskId;
    use crate::stats::{PoolStats, SubmitCounters};

    const TIMEOUT: Duration = Duration::from_secs(5);

    type Reply = oneshot::Receiver<Result<Value, PoolError>>;

    struct Harness {
        control: ControlLoop,
        events: mpsc::UnboundedReceiver<WorkerEvent>,
        counters: Arc<SubmitCounters>,
        stats: watch::Receiver<PoolStats>,
    }

    impl Harness {
        fn start(size: usize, respawn: RespawnPolicy) -> Self {
            let mut registry = HandlerRegistry::new();
            registry.register_fn("echo", |_ctx, payload| Ok(payload)).unwrap();
            registry
                .register_fn("block", |_ctx, _payload| {
                    std::thread::sleep(Duration::from_millis(50));
                    Ok(Value::Null)
                })
                .unwrap();
            registry
                .register_fn("flag", |ctx, _payload| Ok(json!(ctx.flags.is_enabled("x"))))
                .unwrap();

            let config = PoolConfig {
                min_workers: 1,
                respawn,
                ..PoolConfig::with_size(size)
            };
            let flags: RuntimeFlags = [("x", true)].into_iter().collect();
            let counters = Arc::new(SubmitCounters::new());
            let (stats_tx, stats) = watch::channel(PoolStats::default());
            let (control, events) = ControlLoop::start(
                config,
                size,
                Arc::new(registry),
                flags,
                Arc::clone(&counters),
                stats_tx,
            )
            .unwrap();
            Self { control, events, counters, stats }
        }

        fn submit(&mut self, id: TaskId, task_type: &str) -> Reply {
            let (tx, rx) = oneshot::channel();
            self.counters.admit(None).unwrap();
            self.control.submit(id, task_type.into(), Value::Null, tx);
            rx
        }

        /// Feed worker events into the loop until `reply` resolves.
        async fn resolve(&mut self, mut reply: Reply) -> Result<Value, PoolError> {
            loop {
                if let Ok(result) = reply.try_recv() {
                    return result;
                }
                self.pump().await;
            }
        }

        async fn pump(&mut self) {
            let event = tokio::time::timeout(TIMEOUT, self.events.recv())
                .await
                .expect("worker event expected")
                .expect("events channel open");
            self.control.handle_event(event);
        }

        fn stats(&self) -> PoolStats {
            self.counters.fill(*self.stats.borrow())
        }
    }

    fn policy(max_attempts: u32) -> RespawnPolicy {
        RespawnPolicy {
            max_attempts,
            initial_delay_ms: 10,
            max_delay_ms: 100,
        }
    }

    #[tokio::test]
    async fn fault_rejects_in_flight_task_and_respawns() {
        let mut h = Harness::start(2, policy(2));
        let reply = h.submit(1, "block");
        assert_eq!(h.control.slots[0].state, SlotState::Busy(1));

        h.control.handle_fault(0, 1, "inbox lost".into());
        match reply.await.unwrap() {
            Err(PoolError::WorkerCrashed { worker, reason }) => {
                assert_eq!(worker, 0);
                assert_eq!(reason, "inbox lost");
            }
            other => panic!("expected WorkerCrashed, got {other:?}"),
        }
        assert_eq!(h.control.slots[0].state, SlotState::Respawning { attempt: 1 });
        let stats = h.stats();
        assert_eq!(stats.workers, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.tasks_completed, 0);

        // The old thread's late response is stale and dropped.
        while h.control.slots[0].state != SlotState::Idle {
            h.pump().await;
        }
        assert_eq!(h.control.slots[0].generation, 2);
        assert_eq!(h.stats().workers, 2);

        // The respawned worker got the merged flags before its first task.
        let reply = h.submit(2, "flag");
        assert_eq!(h.control.slots[0].state, SlotState::Busy(2));
        assert_eq!(h.resolve(reply).await.unwrap(), json!(true));
    }

    #[tokio::test]
    async fn retiring_last_worker_rejects_waiting_tasks() {
        let mut h = Harness::start(1, policy(0));
        let in_flight = h.submit(1, "block");
        let waiting = h.submit(2, "echo");
        assert_eq!(h.stats().queued, 1);

        h.control.handle_fault(0, 1, "inbox lost".into());
        assert!(matches!(
            in_flight.await.unwrap(),
            Err(PoolError::WorkerCrashed { worker: 0, .. })
        ));
        assert!(matches!(waiting.await.unwrap(), Err(PoolError::NoWorkers)));
        assert_eq!(h.control.slots[0].state, SlotState::Retired);

        let late = h.submit(3, "echo");
        assert!(matches!(late.await.unwrap(), Err(PoolError::NoWorkers)));

        let stats = h.stats();
        assert_eq!(stats.workers, 0);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.tasks_queued, 3);
    }

    #[tokio::test]
    async fn stale_fault_is_ignored() {
        let mut h = Harness::start(2, policy(2));
        let reply = h.submit(1, "echo");

        h.control.handle_fault(0, 7, "from an old generation".into());
        assert_eq!(h.control.slots[0].crashes, 0);
        assert_eq!(h.resolve(reply).await.unwrap(), Value::Null);
        assert_eq!(h.stats().workers, 2);
    }
}
