//! Engine: heartbeat, delayed-task promotion and worker loops

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::activity::{ActivityTracker, Transition};
use crate::backend::Backend;
use crate::config::StoreConfig;
use crate::error::{TaskError, TaskResult};
use crate::handler::HandlerRegistry;
use crate::keys::KeyNamespace;
use crate::queue::TaskQueue;
use crate::scheduler::{DelayedScheduler, PromoteOutcome};
use crate::task::{now_unix, TaskEnvelope};
use crate::workers::{WorkerId, WorkerRegistry};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Id under which this process registers its heartbeat
    pub worker_id: WorkerId,
    /// Number of independent worker loops, at least one
    pub worker_count: usize,
    /// How often the worker signature is refreshed
    pub heartbeat_interval: Duration,
    /// Quiet time after which the engine reports itself idle
    pub idle_timeout: Duration,
    /// Heartbeat age after which a peer is evicted from the registry
    pub worker_timeout: Duration,
    /// Pause of the promotion loop when nothing is due
    pub promotion_idle_interval: Duration,
    /// Pause of a worker loop after finding the queue empty
    pub empty_queue_backoff: Duration,
    /// Upper bound for the backoff after store errors in a worker loop
    pub max_error_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::new_v4(),
            worker_count: 1,
            heartbeat_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(10),
            worker_timeout: Duration::from_secs(10),
            promotion_idle_interval: Duration::from_millis(100),
            empty_queue_backoff: Duration::from_secs(1),
            max_error_backoff: Duration::from_secs(30),
        }
    }
}

/// Stops an engine's loops from anywhere
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Stop scheduling new loop iterations; in-flight tasks run to completion
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Sleep for `duration` unless shutdown is requested first.
/// Returns whether the loop should keep going.
async fn pause(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if duration.is_zero() {
        tokio::task::yield_now().await;
        return !*shutdown.borrow();
    }

    let sender_alive = tokio::select! {
        _ = sleep(duration) => true,
        changed = shutdown.changed() => changed.is_ok(),
    };
    sender_alive && !*shutdown.borrow()
}

async fn check_for_idle(activity: &Mutex<ActivityTracker>) {
    let transition = activity.lock().await.check(now_unix());

    match transition {
        Some(Transition::BecameActive { .. }) => info!("Became active!"),
        Some(Transition::WentIdle(period)) => {
            info!("Went idle...");
            info!("Processing time: {:.0}s", period.processing_time);
            info!("Tasks completed: {}", period.tasks_completed);
            match period.tasks_per_second {
                Some(rate) => info!("Tasks per second: {:.0}", rate),
                None => info!("Tasks per second: n/a"),
            }
        }
        None => {}
    }
}

/// Runs the loops that make up one worker process
pub struct Engine {
    config: EngineConfig,
    store: StoreConfig,
    queue: TaskQueue,
    scheduler: DelayedScheduler,
    registry: WorkerRegistry,
    handlers: Arc<HandlerRegistry>,
    activity: Arc<Mutex<ActivityTracker>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl Engine {
    /// Wire up the components and register this worker.
    ///
    /// Fails on a zero `worker_count`, or if the initial signature cannot be
    /// written, which usually means the store is unreachable.
    pub async fn new(
        backend: Arc<dyn Backend>,
        store: StoreConfig,
        handlers: HandlerRegistry,
        config: EngineConfig,
    ) -> TaskResult<Self> {
        if config.worker_count == 0 {
            return Err(TaskError::config("worker_count must be at least 1"));
        }

        let keys = KeyNamespace::new(store.key_prefix.clone());
        let queue = TaskQueue::new(backend.clone(), &keys);
        let scheduler = DelayedScheduler::new(backend.clone(), queue.clone(), &keys);
        let registry = WorkerRegistry::new(backend, &keys, &store.worker_registration_key);

        let activity = ActivityTracker::new(now_unix(), config.idle_timeout);
        registry
            .heartbeat(config.worker_id, 0, activity.last_action_time())
            .await?;

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            store,
            queue,
            scheduler,
            registry,
            handlers: Arc::new(handlers),
            activity: Arc::new(Mutex::new(activity)),
            shutdown_tx: Arc::new(shutdown_tx),
        })
    }

    pub fn worker_id(&self) -> WorkerId {
        self.config.worker_id
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn scheduler(&self) -> &DelayedScheduler {
        &self.scheduler
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Snapshot of the idle/active state
    pub async fn activity(&self) -> ActivityTracker {
        self.activity.lock().await.clone()
    }

    /// Run until [`ShutdownHandle::shutdown`] is called.
    ///
    /// Returns once every loop has stopped; worker loops finish the task they
    /// are processing first.
    pub async fn run(&self) -> TaskResult<()> {
        info!(
            "Tasker engine ready: id {}, {} handlers, redis {}:{} db {}",
            self.config.worker_id,
            self.handlers.len(),
            self.store.host,
            self.store.port,
            self.store.database
        );

        let mut loops = vec![
            ("heartbeat", self.start_heartbeat_loop()),
            ("promotion", self.start_promotion_loop()),
        ];
        for n in 0..self.config.worker_count {
            loops.push(("worker", self.start_worker_loop(n)));
        }

        for (name, handle) in loops {
            if let Err(e) = handle.await {
                error!("{} loop ended abnormally: {}", name, e);
            }
        }

        if let Err(e) = self.registry.deregister(self.config.worker_id).await {
            warn!("Failed to deregister worker {}: {}", self.config.worker_id, e);
        }

        info!("Worker {} shut down complete", self.config.worker_id);
        Ok(())
    }

    /// Run until the process receives Ctrl-C
    pub async fn run_until_ctrl_c(&self) -> TaskResult<()> {
        let shutdown = self.shutdown_handle();
        let signal_task = tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Caught interrupt, shutting down");
                    shutdown.shutdown();
                }
                Err(e) => error!("Failed to listen for interrupt: {}", e),
            }
        });

        let result = self.run().await;
        signal_task.abort();
        result
    }

    /// Refresh our signature, evict dead peers, update idle state
    fn start_heartbeat_loop(&self) -> JoinHandle<()> {
        let config = self.config.clone();
        let registry = self.registry.clone();
        let activity = self.activity.clone();
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }

                let (tasks_completed, last_action_time) = {
                    let activity = activity.lock().await;
                    (activity.tasks_completed(), activity.last_action_time())
                };

                if let Err(e) = registry
                    .heartbeat(config.worker_id, tasks_completed, last_action_time)
                    .await
                {
                    warn!("Heartbeat failed: {}", e);
                }

                match registry.sweep(config.worker_timeout).await {
                    Ok(evicted) if !evicted.is_empty() => {
                        debug!("Evicted {} stale workers", evicted.len());
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Worker sweep failed: {}", e),
                }

                check_for_idle(&activity).await;

                if !pause(&mut shutdown, config.heartbeat_interval).await {
                    break;
                }
            }

            debug!("Heartbeat loop stopped");
        })
    }

    /// Move due delayed tasks to the front of the queue
    fn start_promotion_loop(&self) -> JoinHandle<()> {
        let scheduler = self.scheduler.clone();
        let idle_interval = self.config.promotion_idle_interval;
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }

                let delay = match scheduler.has_due_task().await {
                    Ok(true) => {
                        match scheduler.promote_next(true).await {
                            Ok(PromoteOutcome::Raced) => {
                                warn!("Failed delaying next task. Was presumably already picked up");
                            }
                            Ok(_) => {}
                            Err(e) => error!("Failed to promote delayed task: {}", e),
                        }
                        // Keep draining while work is due
                        Duration::ZERO
                    }
                    Ok(false) => idle_interval,
                    Err(e) => {
                        warn!("Failed to check delayed tasks: {}", e);
                        idle_interval
                    }
                };

                if !pause(&mut shutdown, delay).await {
                    break;
                }
            }

            debug!("Promotion loop stopped");
        })
    }

    /// Pull tasks one at a time and dispatch them
    fn start_worker_loop(&self, n: usize) -> JoinHandle<()> {
        let config = self.config.clone();
        let queue = self.queue.clone();
        let handlers = self.handlers.clone();
        let activity = self.activity.clone();
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut error_backoff = config.empty_queue_backoff;

            loop {
                if *shutdown.borrow() {
                    break;
                }

                check_for_idle(&activity).await;

                let delay = match queue.dequeue().await {
                    Ok(Some(envelope)) => {
                        error_backoff = config.empty_queue_backoff;
                        Self::process_task(n, envelope, &handlers, &activity).await;
                        Duration::ZERO
                    }
                    Ok(None) => {
                        error_backoff = config.empty_queue_backoff;
                        config.empty_queue_backoff
                    }
                    Err(TaskError::Serialization(e)) => {
                        error!("Worker {}: dropped task: {}", n, e);
                        Duration::ZERO
                    }
                    Err(e) => {
                        let delay = error_backoff;
                        if e.is_recoverable() {
                            warn!("Worker {}: store unavailable ({}), retrying in {:?}", n, e, delay);
                        } else {
                            error!("Worker {}: dequeue failed ({}), retrying in {:?}", n, e, delay);
                        }
                        error_backoff = (error_backoff * 2).min(config.max_error_backoff);
                        delay
                    }
                };

                if !pause(&mut shutdown, delay).await {
                    break;
                }
            }

            debug!("Worker loop {} stopped", n);
        })
    }

    /// Dispatch one task. Failures end here; the task is not retried.
    async fn process_task(
        n: usize,
        envelope: TaskEnvelope,
        handlers: &Arc<HandlerRegistry>,
        activity: &Mutex<ActivityTracker>,
    ) {
        activity.lock().await.record_action(now_unix());

        let task_key = envelope.key;
        let task_type = envelope.task_type.clone();
        debug!("Worker {} processing task {} ({})", n, task_key, task_type);

        // A panicking handler only takes down this dispatch, not the loop
        let dispatch = {
            let handlers = handlers.clone();
            tokio::spawn(async move { handlers.dispatch(&envelope.task_type, &envelope.data).await })
        };

        match dispatch.await {
            Ok(report) => {
                if !report.is_success() {
                    error!("Task {} ({}) failed.. Continuing loop", task_key, task_type);
                }
                if report.succeeded > 0 {
                    activity
                        .lock()
                        .await
                        .record_completed(report.succeeded as u64, now_unix());
                }
            }
            Err(e) => error!("Task {} ({}) panicked: {}", task_key, task_type, e),
        }
    }
}
