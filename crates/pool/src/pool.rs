use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use offload_core::{PoolConfig, RuntimeFlags};

use crate::dispatcher::{Command, ControlLoop};
use crate::error::PoolError;
use crate::handler::{HandlerRegistry, PING};
use crate::message::TaskId;
use crate::stats::{PoolStats, SubmitCounters};

/// Caller-side handle to a pool of worker threads.
///
/// All scheduling state lives in the control loop task; this handle only
/// holds the command sender, the stats receiver, the id counter and the
/// merged runtime flags. Share it behind an `Arc` when several callers
/// submit work.
pub struct WorkerPool {
    config: PoolConfig,
    size: usize,
    registry: Arc<HandlerRegistry>,
    next_id: AtomicU64,
    /// Flags replayed to workers on every init.
    flags: Mutex<RuntimeFlags>,
    running: Mutex<Option<Running>>,
}

struct Running {
    commands: mpsc::UnboundedSender<Command>,
    stats: watch::Receiver<PoolStats>,
    counters: Arc<SubmitCounters>,
    control: JoinHandle<()>,
}

impl Running {
    fn is_alive(&self) -> bool {
        !self.control.is_finished()
    }
}

impl WorkerPool {
    /// Create a pool sized from the host's available parallelism.
    /// Nothing is spawned until [`WorkerPool::init`] or the first submit.
    ///
    /// Returns [`PoolError::Config`] if `config` fails validation.
    pub fn new(config: PoolConfig, registry: HandlerRegistry) -> Result<Self, PoolError> {
        Self::with_host_hint(config, registry, PoolConfig::host_parallelism())
    }

    /// Like [`WorkerPool::new`] with an explicit host concurrency hint.
    pub fn with_host_hint(
        config: PoolConfig,
        registry: HandlerRegistry,
        host_hint: usize,
    ) -> Result<Self, PoolError> {
        config.validate()?;
        let size = config.resolved_size(host_hint);
        let flags = config.flags.clone();
        Ok(Self {
            config,
            size,
            registry: Arc::new(registry),
            next_id: AtomicU64::new(1),
            flags: Mutex::new(flags),
            running: Mutex::new(None),
        })
    }

    /// Number of worker slots this pool runs.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Spawn the workers and the control loop. No-op while running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn init(&self) -> Result<(), PoolError> {
        let mut running = self.lock_running();
        self.ensure_running(&mut running)?;
        Ok(())
    }

    /// Start the control loop unless the one in `running` is still alive.
    fn ensure_running<'a>(
        &self,
        running: &'a mut Option<Running>,
    ) -> Result<&'a Running, PoolError> {
        if !running.as_ref().is_some_and(Running::is_alive) {
            *running = Some(self.start()?);
        }
        running.as_ref().ok_or(PoolError::Terminated)
    }

    fn start(&self) -> Result<Running, PoolError> {
        let handle = Handle::try_current().map_err(|_| PoolError::NoRuntime)?;
        let flags = lock(&self.flags).clone();
        let counters = Arc::new(SubmitCounters::new());
        let (stats_tx, stats_rx) = watch::channel(PoolStats::default());
        let (control, events) = ControlLoop::start(
            self.config.clone(),
            self.size,
            Arc::clone(&self.registry),
            flags,
            Arc::clone(&counters),
            stats_tx,
        )?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let join = handle.spawn(control.run(commands_rx, events));

        info!(
            workers = self.size,
            task_types = ?self.registry.task_types(),
            "worker pool initialized"
        );
        Ok(Running {
            commands: commands_tx,
            stats: stats_rx,
            counters,
            control: join,
        })
    }

    /// Queue a task and return a handle resolving to its result.
    ///
    /// Never blocks. Initializes the pool first if it is not running, so a
    /// submit after [`WorkerPool::shutdown`] starts a fresh set of workers.
    pub fn submit<P: Serialize>(
        &self,
        task_type: impl Into<String>,
        payload: P,
    ) -> Result<TaskHandle, PoolError> {
        let task_type = task_type.into();
        let payload = serde_json::to_value(payload)?;

        let mut guard = self.lock_running();
        let running = self.ensure_running(&mut guard)?;
        running.counters.admit(self.config.max_queue_depth)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (completion, rx) = oneshot::channel();
        debug!(task_id = id, task_type = %task_type, "task submitted");
        let sent = running.commands.send(Command::Submit {
            id,
            task_type,
            payload,
            completion,
        });
        if sent.is_err() {
            running.counters.withdraw();
            return Err(PoolError::Terminated);
        }

        Ok(TaskHandle { id, rx })
    }

    /// Submit the built-in liveness task.
    pub fn ping(&self) -> Result<TaskHandle, PoolError> {
        self.submit(PING, Value::Null)
    }

    /// Merge `flags` into the pool's runtime flags and broadcast them to
    /// every live worker. Applies from each worker's next task; no ack.
    pub fn configure(&self, flags: RuntimeFlags) {
        lock(&self.flags).merge(&flags);

        let running = self.lock_running();
        if let Some(running) = running.as_ref() {
            if running.commands.send(Command::Configure(flags)).is_err() {
                warn!("control loop gone; flags kept for next init");
            }
        }
    }

    /// Current stats; all zeros when not running.
    ///
    /// Submission gauges (`tasks_queued`, `queued`, `pending`) already
    /// include every task whose `submit` has returned. Worker gauges and
    /// completion counters come from the control loop's last publish.
    pub fn stats(&self) -> PoolStats {
        self.lock_running()
            .as_ref()
            .filter(|r| r.is_alive())
            .map(|r| r.counters.fill(*r.stats.borrow()))
            .unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        self.lock_running().as_ref().is_some_and(Running::is_alive)
    }

    /// Reject every pending task with [`PoolError::Terminated`], stop all
    /// workers and return to the uninitialized state.
    pub async fn shutdown(&self) {
        let running = self.lock_running().take();
        let Some(running) = running else {
            return;
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if running.commands.send(Command::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        if let Err(e) = running.control.await {
            warn!(error = %e, "control loop ended abnormally");
        }
        info!("worker pool shut down");
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        lock(&self.running)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Future resolving to the result of one submitted task.
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    rx: oneshot::Receiver<Result<Value, PoolError>>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }
}

impl Future for TaskHandle {
    type Output = Result<Value, PoolError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(PoolError::Terminated)))
    }
}
