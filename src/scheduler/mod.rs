use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Context provided to background tasks during execution
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
    pub shutdown: broadcast::Receiver<()>,
}

/// Trait for background tasks that run periodically
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging
    fn name(&self) -> &'static str;

    /// Target time between the starts of two consecutive runs
    fn interval(&self) -> Duration;

    /// Execute the task
    async fn execute(&self, ctx: Context) -> Result<()>;
}

/// Scheduler manages background tasks with graceful shutdown.
///
/// Each task is self-paced: the time a run takes is subtracted from the
/// sleep before the next one, so a slow run is followed by a short nap
/// rather than a full interval.
pub struct Scheduler {
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Register a periodic background task on the current tokio runtime
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> Result<&Self> {
        let runtime = Handle::try_current().map_err(|e| {
            Error::InvalidState(format!(
                "cannot schedule {} outside a tokio runtime: {}",
                task.name(),
                e
            ))
        })?;
        let handle = self.spawn_timer_loop(&runtime, task);
        self.tasks.lock()?.push(handle);
        Ok(self)
    }

    /// Number of registered task loops
    pub fn task_count(&self) -> usize {
        self.tasks.lock().map(|tasks| tasks.len()).unwrap_or(0)
    }

    fn spawn_timer_loop<T: BackgroundTask + 'static>(
        &self,
        runtime: &Handle,
        task: Arc<T>,
    ) -> JoinHandle<()> {
        let interval = task.interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        runtime.spawn(async move {
            let mut run_id = 0u64;
            let mut nap = interval;

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.recv() => {
                        tracing::info!(task = task.name(), "Task shutting down");
                        break;
                    }

                    _ = tokio::time::sleep(nap) => {
                        run_id += 1;
                        let started = Instant::now();
                        let ctx = Context {
                            task_name: task.name(),
                            run_id,
                            shutdown: shutdown_rx.resubscribe(),
                        };

                        if let Err(e) = task.execute(ctx).await {
                            tracing::error!(
                                task = task.name(),
                                run_id,
                                error = %e,
                                "Task execution failed"
                            );
                        }

                        nap = interval.saturating_sub(started.elapsed());
                    }
                }
            }
        })
    }

    /// Ask every task loop to exit after its in-flight run, without waiting
    pub fn signal_shutdown(&self) {
        self.shutdown_tx.send(()).ok();
    }

    /// Graceful shutdown - wait for all tasks
    pub async fn shutdown(self) -> Result<()> {
        self.signal_shutdown();

        let tasks = std::mem::take(&mut *self.tasks.lock()?);
        for task in tasks {
            task.await
                .map_err(|e| Error::InvalidState(format!("Task join error: {}", e)))?;
        }

        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.signal_shutdown();
    }
}
