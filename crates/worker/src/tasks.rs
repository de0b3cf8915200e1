//! Registry of the worker's long-running background tasks.
//!
//! Shutdown escalates: tasks are first asked to stop through a shared
//! signal, then aborted. A task that survives every round is reported by
//! name so the process can exit without it.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long each shutdown round waits for tasks to finish.
pub const WAIT_MAXIMUM: Duration = Duration::from_secs(5);

/// Shutdown rounds before giving up on a task.
pub const SHUTDOWN_ROUNDS: u32 = 3;

struct RegisteredTask {
    name: String,
    handle: JoinHandle<()>,
}

pub struct TaskRegistry {
    tasks: Mutex<Vec<RegisteredTask>>,
    stop: watch::Sender<bool>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            tasks: Mutex::new(Vec::new()),
            stop,
        }
    }

    /// Flips to `true` once shutdown begins.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    pub fn is_stopping(&self) -> bool {
        *self.stop.borrow()
    }

    pub fn spawn<F>(&self, name: &str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        debug!(task = name, "background task started");
        self.lock().push(RegisteredTask {
            name: name.to_string(),
            handle,
        });
    }

    pub fn len(&self) -> usize {
        self.lock().iter().filter(|t| !t.handle.is_finished()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<RegisteredTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stops every registered task. Returns the names of tasks still
    /// running after `rounds` rounds of `wait` each.
    pub async fn shutdown(&self, wait: Duration, rounds: u32) -> Vec<String> {
        self.stop.send_replace(true);
        let mut remaining: Vec<RegisteredTask> = self.lock().drain(..).collect();

        for round in 0..rounds.max(1) {
            if round > 0 {
                for task in &remaining {
                    debug!(task = %task.name, round, "aborting task");
                    task.handle.abort();
                }
            }
            let _ = tokio::time::timeout(
                wait,
                join_all(remaining.iter_mut().map(|t| &mut t.handle)),
            )
            .await;
            remaining.retain(|t| !t.handle.is_finished());
            if remaining.is_empty() {
                return Vec::new();
            }
        }

        let stuck: Vec<String> = remaining.iter().map(|t| t.name.clone()).collect();
        warn!(tasks = ?stuck, "background tasks did not stop");
        stuck
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cooperative_tasks_stop_on_signal() {
        let registry = TaskRegistry::new();
        let mut stop = registry.stop_signal();
        registry.spawn("waiter", async move {
            let _ = stop.wait_for(|s| *s).await;
        });
        assert_eq!(registry.len(), 1);
        let stuck = registry.shutdown(Duration::from_millis(500), 3).await;
        assert!(stuck.is_empty());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn deaf_tasks_are_aborted() {
        let registry = TaskRegistry::new();
        registry.spawn("sleeper", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let stuck = registry.shutdown(Duration::from_millis(50), 3).await;
        assert!(stuck.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tasks_that_never_yield_are_reported() {
        let registry = TaskRegistry::new();
        let release = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let spin = release.clone();
        registry.spawn("spinner", async move {
            while !spin.load(std::sync::atomic::Ordering::Acquire) {
                std::hint::spin_loop();
            }
        });
        let stuck = registry.shutdown(Duration::from_millis(20), 2).await;
        assert_eq!(stuck, vec!["spinner".to_string()]);
        release.store(true, std::sync::atomic::Ordering::Release);
    }
}
