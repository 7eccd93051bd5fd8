use crate::config::WorkerConfig;
use crate::error::{TaskPanicked, WorkerError};
use crate::operation::{
    AsyncOperation, OperationCallback, OperationId, OperationOutput, OperationStatus,
    OperationType,
};
use crate::progress::{notify, OperationTable, ProgressReporter};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

type Task = Box<dyn FnOnce(&ProgressReporter) -> anyhow::Result<OperationOutput> + Send>;

struct Job {
    id: OperationId,
    task: Task,
    callback: Option<OperationCallback>,
}

#[derive(Default)]
pub struct SubmitOptions {
    /// Observes every progress report and, once, the terminal record.
    pub callback: Option<OperationCallback>,
    pub metadata: HashMap<String, String>,
}

impl SubmitOptions {
    pub fn with_callback(callback: impl Fn(&AsyncOperation) + Send + Sync + 'static) -> Self {
        Self {
            callback: Some(Arc::new(callback)),
            metadata: HashMap::new(),
        }
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

struct Shared {
    operations: OperationTable,
    queue: Mutex<VecDeque<Job>>,
    queue_ready: Condvar,
}

struct Worker {
    name: String,
    handle: JoinHandle<()>,
    // Owned by one pool; a restart never clears it.
    shutdown: Arc<AtomicBool>,
    // Disconnects when the worker thread exits, even by unwinding.
    exited: mpsc::Receiver<()>,
}

/// Fixed-size pool of OS threads executing blocking tasks off the UI thread.
///
/// Each submitted task gets an [`AsyncOperation`] record that moves
/// `Pending -> Running -> {Completed | Failed}`; only a `Pending` operation
/// can be cancelled. The owner controls the lifecycle with [`start`] and
/// [`stop`].
///
/// [`start`]: AsyncOperationManager::start
/// [`stop`]: AsyncOperationManager::stop
pub struct AsyncOperationManager {
    config: WorkerConfig,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    workers: Mutex<Vec<Worker>>,
}

impl AsyncOperationManager {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                operations: Arc::new(Mutex::new(HashMap::new())),
                queue: Mutex::new(VecDeque::new()),
                queue_ready: Condvar::new(),
            }),
            next_id: AtomicU64::new(0),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        !self.workers.lock().is_empty()
    }

    pub fn start(&self) -> Result<(), WorkerError> {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            debug!("Operation manager already started");
            return Ok(());
        }
        if self.config.max_workers == 0 {
            return Err(WorkerError::InvalidWorkerCount(0));
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let poll_interval = self.config.poll_interval();

        for index in 0..self.config.max_workers {
            let (exit_tx, exited) = mpsc::channel::<()>();
            let shared = Arc::clone(&self.shared);
            let pool_shutdown = Arc::clone(&shutdown);
            let name = format!("obd-worker-{index}");
            let handle = thread::Builder::new().name(name.clone()).spawn(move || {
                let _exit_signal = exit_tx;
                worker_loop(&shared, &pool_shutdown, poll_interval);
            })?;
            workers.push(Worker {
                name,
                handle,
                shutdown: Arc::clone(&shutdown),
                exited,
            });
        }

        info!("Operation manager started with {} workers", workers.len());
        Ok(())
    }

    /// Cancels every pending operation and joins the workers.
    ///
    /// A worker still busy after `join_timeout` is abandoned; its current
    /// task keeps running to completion in the background.
    pub fn stop(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in &workers {
            worker.shutdown.store(true, Ordering::SeqCst);
        }

        let drained: Vec<Job> = self.shared.queue.lock().drain(..).collect();
        let cancelled: HashMap<OperationId, AsyncOperation> = {
            let mut operations = self.shared.operations.lock();
            operations
                .values_mut()
                .filter(|op| op.status == OperationStatus::Pending)
                .map(|op| {
                    op.cancel();
                    (op.id, op.clone())
                })
                .collect()
        };
        self.shared.queue_ready.notify_all();

        if !cancelled.is_empty() {
            info!("Cancelled {} pending operations on stop", cancelled.len());
        }
        for job in drained {
            if let (Some(callback), Some(op)) = (job.callback, cancelled.get(&job.id)) {
                notify(&callback, op);
            }
        }

        let timeout = self.config.join_timeout();
        for worker in workers {
            match worker.exited.recv_timeout(timeout) {
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    warn!(
                        "Worker {} did not stop within {:?}, abandoning it",
                        worker.name, timeout
                    );
                }
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                    if worker.handle.join().is_err() {
                        warn!("Worker {} exited by panicking", worker.name);
                    }
                }
            }
        }
        debug!("Operation manager stopped");
    }

    pub fn submit_operation<T, F>(&self, operation_type: OperationType, task: F) -> OperationId
    where
        T: Any + Send + Sync,
        F: FnOnce(&ProgressReporter) -> anyhow::Result<T> + Send + 'static,
    {
        self.submit_operation_with(operation_type, SubmitOptions::default(), task)
    }

    /// Records a `Pending` operation and enqueues it. Never blocks on the
    /// work itself.
    pub fn submit_operation_with<T, F>(
        &self,
        operation_type: OperationType,
        options: SubmitOptions,
        task: F,
    ) -> OperationId
    where
        T: Any + Send + Sync,
        F: FnOnce(&ProgressReporter) -> anyhow::Result<T> + Send + 'static,
    {
        let id = OperationId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let SubmitOptions { callback, metadata } = options;

        self.shared
            .operations
            .lock()
            .insert(id, AsyncOperation::new(id, operation_type, metadata));

        let task: Task = Box::new(move |reporter: &ProgressReporter| {
            task(reporter).map(|value| Arc::new(value) as OperationOutput)
        });
        self.shared.queue.lock().push_back(Job { id, task, callback });
        self.shared.queue_ready.notify_one();

        debug!("Submitted {} operation {}", operation_type, id);
        id
    }

    pub fn get_operation_status(&self, id: OperationId) -> Option<AsyncOperation> {
        self.shared.operations.lock().get(&id).cloned()
    }

    /// Succeeds only while the operation has not been picked up by a worker.
    pub fn cancel_operation(&self, id: OperationId) -> bool {
        let snapshot = {
            let mut operations = self.shared.operations.lock();
            match operations.get_mut(&id) {
                Some(op) if op.status == OperationStatus::Pending => {
                    op.cancel();
                    op.clone()
                }
                _ => return false,
            }
        };

        let job = {
            let mut queue = self.shared.queue.lock();
            queue
                .iter()
                .position(|job| job.id == id)
                .and_then(|index| queue.remove(index))
        };
        // If a worker already dequeued the job it reports the cancellation.
        if let Some(callback) = job.and_then(|job| job.callback) {
            notify(&callback, &snapshot);
        }

        info!("Cancelled operation {}", id);
        true
    }

    pub fn get_active_operations(&self) -> HashMap<OperationId, AsyncOperation> {
        self.shared
            .operations
            .lock()
            .iter()
            .filter(|(_, op)| op.status.is_active())
            .map(|(id, op)| (*id, op.clone()))
            .collect()
    }

    /// Drops terminal records that ended at least `max_age` ago. Returns the
    /// number of records removed.
    pub fn cleanup_completed_operations(&self, max_age: Duration) -> usize {
        let now = chrono::Utc::now();
        let mut operations = self.shared.operations.lock();
        let before = operations.len();
        operations.retain(|_, op| {
            let expired = match (op.is_terminal(), op.end_time) {
                (true, Some(end)) => (now - end).to_std().unwrap_or(Duration::ZERO) >= max_age,
                _ => false,
            };
            !expired
        });
        let removed = before - operations.len();
        if removed > 0 {
            debug!("Cleaned up {} finished operations", removed);
        }
        removed
    }
}

impl Drop for AsyncOperationManager {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}

fn worker_loop(shared: &Shared, shutdown: &AtomicBool, poll_interval: Duration) {
    debug!("Worker started");
    while !shutdown.load(Ordering::SeqCst) {
        let Some(job) = next_job(shared, shutdown, poll_interval) else {
            continue;
        };
        if catch_unwind(AssertUnwindSafe(|| execute(shared, job))).is_err() {
            error!("Worker loop recovered from a panic");
        }
    }
    debug!("Worker exiting");
}

fn next_job(shared: &Shared, shutdown: &AtomicBool, poll_interval: Duration) -> Option<Job> {
    let mut queue = shared.queue.lock();
    if queue.is_empty() && !shutdown.load(Ordering::SeqCst) {
        shared.queue_ready.wait_for(&mut queue, poll_interval);
    }
    if shutdown.load(Ordering::SeqCst) {
        return None;
    }
    queue.pop_front()
}

fn execute(shared: &Shared, job: Job) {
    let Job { id, task, callback } = job;

    let skipped = {
        let mut operations = shared.operations.lock();
        match operations.get_mut(&id) {
            Some(op) if op.status == OperationStatus::Pending => {
                op.mark_running();
                None
            }
            Some(op) => Some(op.clone()),
            None => return,
        }
    };
    if let Some(op) = skipped {
        debug!("Skipping operation {} ({:?})", id, op.status);
        if let Some(callback) = &callback {
            notify(callback, &op);
        }
        return;
    }

    let reporter = ProgressReporter::new(id, Arc::clone(&shared.operations), callback.clone());
    let outcome = catch_unwind(AssertUnwindSafe(|| task(&reporter)));

    let finished = {
        let mut operations = shared.operations.lock();
        let Some(op) = operations.get_mut(&id) else {
            return;
        };
        match outcome {
            Ok(Ok(output)) => op.complete(output),
            Ok(Err(e)) => op.fail(e),
            Err(payload) => op.fail(anyhow::Error::new(TaskPanicked::from_payload(payload))),
        }
        op.clone()
    };

    match finished.status {
        OperationStatus::Completed => {
            debug!("Operation {} ({}) completed", id, finished.operation_type)
        }
        _ => warn!(
            "Operation {} ({}) failed: {}",
            id,
            finished.operation_type,
            finished.error_message().unwrap_or_default()
        ),
    }

    if let Some(callback) = &callback {
        notify(callback, &finished);
    }
}
