//! Task scheduler running one worker per task key.
//!
//! A worker calls its task in a loop. `Active` runs it again after yielding
//! to the runtime; `Idle` parks the worker until [`TaskScheduler::wake`] is
//! called for its key or the idle interval (plus jitter) elapses.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::infrastructure::config::DeliveryConfig;

use super::{Task, TaskHint};

struct Worker {
    task: Arc<dyn Task>,
    wake: Arc<Notify>,
    handle: JoinHandle<()>,
}

pub struct TaskScheduler {
    workers: DashMap<String, Worker>,
    idle_interval: Duration,
    idle_jitter_ms: u64,
    shutdown: broadcast::Sender<()>,
}

impl TaskScheduler {
    pub fn new(config: &DeliveryConfig) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            workers: DashMap::new(),
            idle_interval: config.idle_interval(),
            idle_jitter_ms: config.idle_jitter_ms,
            shutdown,
        }
    }

    /// Start driving `task`. Returns false if a task with the same id is
    /// already scheduled.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add_task(&self, task: Arc<dyn Task>) -> bool {
        let key = task.id().to_string();
        let entry = match self.workers.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return false,
            dashmap::mapref::entry::Entry::Vacant(entry) => entry,
        };

        let wake = Arc::new(Notify::new());
        let handle = tokio::spawn(run_worker(
            Arc::clone(&task),
            Arc::clone(&wake),
            self.shutdown.subscribe(),
            self.idle_interval,
            self.idle_jitter_ms,
        ));
        task.on_add();
        entry.insert(Worker { task, wake, handle });
        tracing::debug!(task_id = %key, "Task added to scheduler");
        true
    }

    /// Stop the worker for `task_id` and notify the task.
    pub fn remove_task(&self, task_id: &str) -> bool {
        match self.workers.remove(task_id) {
            Some((_, worker)) => {
                worker.handle.abort();
                worker.task.on_remove();
                tracing::debug!(task_id = %task_id, "Task removed from scheduler");
                true
            }
            None => false,
        }
    }

    /// Run an idle task without waiting for its interval to elapse.
    pub fn wake(&self, task_id: &str) {
        if let Some(worker) = self.workers.get(task_id) {
            worker.wake.notify_one();
        }
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.workers.contains_key(task_id)
    }

    pub fn task_count(&self) -> usize {
        self.workers.len()
    }

    /// Signal every worker to stop and wait for them to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(());
        let keys: Vec<String> = self.workers.iter().map(|w| w.key().clone()).collect();
        for key in keys {
            if let Some((_, worker)) = self.workers.remove(&key) {
                if let Err(e) = worker.handle.await {
                    if !e.is_cancelled() {
                        tracing::warn!(task_id = %key, error = %e, "Task worker ended abnormally");
                    }
                }
                worker.task.on_remove();
            }
        }
        tracing::info!("Task scheduler stopped");
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        for worker in self.workers.iter() {
            worker.handle.abort();
        }
    }
}

fn idle_delay(interval: Duration, jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return interval;
    }
    interval + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
}

async fn run_worker(
    task: Arc<dyn Task>,
    wake: Arc<Notify>,
    mut shutdown: broadcast::Receiver<()>,
    idle_interval: Duration,
    idle_jitter_ms: u64,
) {
    loop {
        match task.call() {
            TaskHint::Active => {
                if !matches!(shutdown.try_recv(), Err(TryRecvError::Empty)) {
                    break;
                }
                tokio::task::yield_now().await;
            }
            TaskHint::Idle => {
                let delay = idle_delay(idle_interval, idle_jitter_ms);
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = wake.notified() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    tracing::debug!(task_id = %task.id(), "Task worker stopped");
}
