//! Background task scheduling
//!
//! Each task kind runs at most once at a time: triggering a kind that is
//! already running hands back the in-flight handle instead of starting a
//! second run. Recurring jobs re-trigger their kind on a fixed period until
//! the scheduler is shut down, always letting the current run finish.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Backup,
    Upload,
    /// Distribution plus the replica-count check.
    Distribute,
    Restore,
    Verify,
    /// Metadata written to disk.
    Flush,
}

pub type TaskOutcome = Result<(), String>;

/// Cloneable handle to one run; every clone resolves to the same outcome.
pub type TaskHandle = Shared<BoxFuture<'static, TaskOutcome>>;

/// Builds the future for one run of a recurring job.
pub type JobFactory = Arc<dyn Fn() -> BoxFuture<'static, TaskOutcome> + Send + Sync>;

struct Running {
    handle: TaskHandle,
    done: Arc<AtomicBool>,
}

pub struct TaskScheduler {
    running: Mutex<HashMap<TaskKind, Running>>,
    shutdown: broadcast::Sender<()>,
    recurring: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskScheduler {
    pub fn new() -> Arc<Self> {
        let (shutdown, _) = broadcast::channel(1);
        Arc::new(Self {
            running: Mutex::new(HashMap::new()),
            shutdown,
            recurring: Mutex::new(Vec::new()),
        })
    }

    /// Start `job` unless a run of `kind` is still in flight, in which case
    /// that run's handle is returned and `job` is dropped unstarted.
    pub fn trigger<F, Fut>(&self, kind: TaskKind, job: F) -> TaskHandle
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = TaskOutcome> + Send + 'static,
    {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = running.get(&kind) {
            if !current.done.load(Ordering::SeqCst) {
                log::debug!("{:?} already running", kind);
                return current.handle.clone();
            }
        }

        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        let run = job();
        let task = tokio::spawn(async move {
            let outcome = run.await;
            flag.store(true, Ordering::SeqCst);
            outcome
        });
        let handle = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(format!("task aborted: {}", e)),
            }
        }
        .boxed()
        .shared();

        running.insert(
            kind,
            Running {
                handle: handle.clone(),
                done,
            },
        );
        handle
    }

    pub fn is_running(&self, kind: TaskKind) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .map(|r| !r.done.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Trigger `kind` every `period`, starting immediately.
    pub fn every(self: &Arc<Self>, kind: TaskKind, period: Duration, job: JobFactory) {
        let scheduler = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        let job = Arc::clone(&job);
                        if let Err(e) = scheduler.trigger(kind, move || job()).await {
                            log::warn!("{:?} run failed: {}", kind, e);
                        }
                    }
                }
            }
            log::debug!("Recurring {:?} stopped", kind);
        });
        self.recurring
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
    }

    /// Stop recurring jobs once their current run completes.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(());
        let tasks: Vec<JoinHandle<()>> = self
            .recurring
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                log::warn!("Recurring job ended abnormally: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_second_trigger_joins_running_task() {
        let scheduler = TaskScheduler::new();
        let started = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());

        let job = |started: Arc<AtomicUsize>, release: Arc<Notify>| {
            move || async move {
                started.fetch_add(1, Ordering::SeqCst);
                release.notified().await;
                Ok::<(), String>(())
            }
        };

        let first = scheduler.trigger(TaskKind::Verify, job(started.clone(), release.clone()));
        tokio::task::yield_now().await;
        let second = scheduler.trigger(TaskKind::Verify, job(started.clone(), release.clone()));
        assert!(scheduler.is_running(TaskKind::Verify));

        release.notify_one();
        assert_eq!(first.await, Ok(()));
        assert_eq!(second.await, Ok(()));
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_running(TaskKind::Verify));
    }

    #[tokio::test]
    async fn test_kinds_run_independently_and_rerun_after_completion() {
        let scheduler = TaskScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let count = |runs: Arc<AtomicUsize>| {
            move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            }
        };

        scheduler.trigger(TaskKind::Backup, count(runs.clone())).await.unwrap();
        scheduler.trigger(TaskKind::Backup, count(runs.clone())).await.unwrap();
        scheduler.trigger(TaskKind::Upload, count(runs.clone())).await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failure_is_shared_with_every_waiter() {
        let scheduler = TaskScheduler::new();
        let handle = scheduler.trigger(TaskKind::Restore, || async { Err::<(), String>("disk full".to_string()) });
        let other = handle.clone();
        assert_eq!(handle.await, Err("disk full".to_string()));
        assert_eq!(other.await, Err("disk full".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recurring_job_stops_on_shutdown() {
        let scheduler = TaskScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let job: JobFactory = Arc::new(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            }
            .boxed()
        });

        scheduler.every(TaskKind::Distribute, Duration::from_secs(10), job);
        tokio::time::sleep(Duration::from_secs(25)).await;
        scheduler.shutdown().await;
        let after_shutdown = runs.load(Ordering::SeqCst);
        assert!(after_shutdown >= 3, "ran {} times", after_shutdown);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_shutdown);
    }
}
