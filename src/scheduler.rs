//! Fixed-rate task scheduling.
//!
//! The engine runs two schedulers: the main one carries the writer, a
//! dedicated one carries the disconnect monitor so writer load can never
//! starve connectivity repair. Shutdown comes in two flavours matching
//! those uses: [`Scheduler::shutdown`] lets in-flight ticks finish,
//! [`Scheduler::shutdown_now`] aborts them.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

struct RunningTask {
    name: String,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Handle to one scheduled task. Cancelling signals the task to stop at the
/// next tick boundary; a tick already running is left to finish.
#[derive(Clone)]
pub struct TaskHandle {
    name: String,
    stop: watch::Sender<bool>,
}

impl TaskHandle {
    pub fn cancel(&self) {
        debug!(task = %self.name, "Cancelling scheduled task");
        let _ = self.stop.send(true);
    }
}

/// Single-purpose fixed-rate scheduler over tokio tasks.
pub struct Scheduler {
    name: String,
    tasks: parking_lot::Mutex<Vec<RunningTask>>,
}

impl Scheduler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schedules `tick` at a fixed rate, first firing after `initial_delay`.
    ///
    /// `period` must be strictly positive.
    pub fn schedule_at_fixed_rate<F, Fut>(
        &self,
        task_name: impl Into<String>,
        initial_delay: Duration,
        period: Duration,
        mut tick: F,
    ) -> TaskHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        assert!(period > Duration::ZERO, "scheduling period must be positive");
        let task_name = task_name.into();
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let loop_name = task_name.clone();
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + initial_delay;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    changed = stop_rx.changed() => {
                        // A dropped sender means the scheduler is gone.
                        if changed.is_err() || *stop_rx.borrow() {
                            debug!(task = %loop_name, "Scheduled task stopping");
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        tick().await;
                    }
                }
            }
        });

        let task_handle = TaskHandle {
            name: task_name.clone(),
            stop: stop_tx.clone(),
        };
        self.tasks.lock().push(RunningTask {
            name: task_name,
            stop: stop_tx,
            handle,
        });
        task_handle
    }

    /// Cooperative shutdown: no further ticks fire, ticks in flight finish.
    pub async fn shutdown(&self) {
        let tasks: Vec<RunningTask> = self.tasks.lock().drain(..).collect();
        for task in &tasks {
            let _ = task.stop.send(true);
        }
        for task in tasks {
            if let Err(e) = task.handle.await {
                if !e.is_cancelled() {
                    debug!(task = %task.name, error = %e, "Scheduled task ended abnormally");
                }
            }
        }
    }

    /// Forced shutdown: in-flight ticks are aborted.
    pub fn shutdown_now(&self) {
        let tasks: Vec<RunningTask> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.handle.abort();
        }
    }
}
