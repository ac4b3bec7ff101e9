//! # [`Runtime`] Module
//!
//! The `Runtime` module owns the long-running tasks of a gossip member: one-shot
//! tasks that run until they finish or are told to stop (e.g. a receive loop), and
//! recurrent tasks that fire a handler on a fixed interval (e.g. a probe cycle).
//! Every task carries its own shutdown channel so it can be destroyed on its own
//! or together with the whole runtime.

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture};
use futures::stream::{Stream, StreamExt as _};
use futures::Future;
use pin_project::pin_project;
use std::fmt::Debug;
use std::hash::Hash;
use std::pin::pin;
use std::sync::Arc;
use std::{
    pin::Pin,
    task::{Context, Poll},
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use task_metrics::METRICS;
use tracing::{debug, error, warn};
mod task_metrics;

// [`RuntimeConfig`] runtime configuration
pub struct RuntimeConfig {
    enable_metrics: bool,
    shutdown_duration: Duration,
}

// [`Runtime`] main entry point. It stores the spawned tasks (recurrent and one-shot)
// keyed by their id.
pub struct Runtime<T>
where
    T: Hash + Eq + Clone + Send + Sync + 'static,
{
    // Represents tasks in the runtime, each with the shutdown channel used to stop it
    // and the join handle used to wait for (or abort) it during teardown.
    tasks: DashMap<T, RuntimeTask>,

    // runtime configuration
    config: RuntimeConfig,
}

struct RuntimeTask {
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// [`RecurrentTicker`] yields once per interval. Missed ticks are delayed rather
/// than fired in a burst, so a slow iteration never causes back-to-back runs.
#[pin_project]
pub struct RecurrentTicker {
    #[pin]
    interval: tokio::time::Interval,
}

impl RecurrentTicker {
    fn new(period: Duration) -> Self {
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }
}

impl Stream for RecurrentTicker {
    type Item = Instant;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        this.interval.poll_tick(cx).map(Some)
    }
}

// [`RuntimeBuilder`] represents runtime configuration builder.
pub struct RuntimeBuilder {
    config: RuntimeConfig,
}

impl RuntimeBuilder {
    /// Creates a new [`RuntimeBuilder`] to configure and build a Runtime.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let runtime = Runtime::builder()
    ///     .with_metrics_enabled(true)
    ///     .build::<TaskId>();
    /// ```
    fn new() -> Self {
        Self {
            config: RuntimeConfig {
                enable_metrics: false,
                shutdown_duration: Duration::from_millis(10_000),
            },
        }
    }

    /// Enables or disables metrics collection.
    ///
    /// # Arguments
    /// * `enable_metrics` - Set to `true` to enable metrics, `false` to disable.
    pub fn with_metrics_enabled(mut self, enable_metrics: bool) -> Self {
        self.config.enable_metrics = enable_metrics;
        self
    }

    /// Sets the duration to wait for tasks to stop during shutdown. Tasks still
    /// running after that are aborted.
    pub fn with_shutdown_duration(mut self, shutdown_duration: Duration) -> Self {
        self.config.shutdown_duration = shutdown_duration;
        self
    }

    /// Builds the Runtime with the configured settings.
    ///
    /// # Type Parameters
    /// * `T` - The task identifier type.
    pub fn build<T>(self) -> Arc<Runtime<T>>
    where
        T: Hash + Eq + Clone + Send + Sync + 'static,
    {
        Arc::new(Runtime {
            tasks: DashMap::new(),
            config: self.config,
        })
    }
}

// [`RuntimeExt`] represents runtime trait
#[async_trait::async_trait]
pub trait RuntimeExt<T>: Send + Sync + 'static
where
    T: Hash + Eq + Clone + Send + Sync + 'static,
{
    /// Spawn a task that runs until its future completes or the task is destroyed.
    async fn spawn_task<F>(&self, task_id: T, future: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static;

    /// Spawn a recurrent task that calls its handler once per `period`.
    async fn spawn_recurrent_task<F>(&self, task_id: T, period: Duration, handler: F) -> Result<()>
    where
        F: Fn() -> BoxFuture<'static, Result<()>> + Send + Sync + 'static;

    /// Destroy a spawned task by its ID
    async fn destroy_task(&self, task_id: &T) -> Result<()>;

    /// Destroy the whole runtime and shut everything down
    async fn destroy(&self) -> Result<()>;

    /// Whether the task exists and has not finished yet
    fn is_active(&self, task_id: &T) -> bool;
}

impl<T> Runtime<T>
where
    T: Hash + Debug + Eq + Clone + Send + Sync + 'static,
{
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    fn register(&self, task_id: T, shutdown: broadcast::Sender<()>, handle: JoinHandle<()>) {
        if let Some(previous) = self.tasks.insert(task_id.clone(), RuntimeTask { shutdown, handle }) {
            warn!(task = ?task_id, "replacing a task that was still registered");
            let _ = previous.shutdown.send(());
        }
    }

    /// Runs a one-shot task until its future resolves or a shutdown signal arrives.
    async fn run_task<F>(
        task_id: T,
        future: F,
        mut shutdown_rx: broadcast::Receiver<()>,
        enable_metrics: bool,
    ) where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        if enable_metrics {
            METRICS.active_tasks.increment(1.0);
        }
        tokio::select! {
            result = future => {
                if let Err(e) = result {
                    error!(task = ?task_id, "task failed: {:#}", e);
                    if enable_metrics {
                        METRICS.task_errors.increment(1);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                debug!(task = ?task_id, "task received shutdown signal");
            }
        }
        if enable_metrics {
            METRICS.active_tasks.decrement(1.0);
        }
    }

    /// Manages the lifecycle of a recurrent task.
    ///
    /// Each tick runs the handler to completion unless a shutdown signal arrives
    /// first. A failing iteration is logged and counted; the next tick runs as usual.
    async fn run_recurrent_task<F>(
        task_id: T,
        ticker: RecurrentTicker,
        handler: F,
        mut shutdown_rx: broadcast::Receiver<()>,
        enable_metrics: bool,
    ) where
        F: Fn() -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        if enable_metrics {
            METRICS.active_tasks.increment(1.0);
        }
        let mut ticker = pin!(ticker);
        loop {
            tokio::select! {
                _ = ticker.next() => {}
                _ = shutdown_rx.recv() => break,
            }

            let start = Instant::now();
            let result = tokio::select! {
                result = handler() => result,
                _ = shutdown_rx.recv() => break,
            };

            if enable_metrics {
                METRICS.task_iterations.increment(1);
                METRICS.task_iteration_latency.record(start.elapsed().as_secs_f64());
            }
            if let Err(e) = result {
                error!(task = ?task_id, "recurrent task iteration failed: {:#}", e);
                if enable_metrics {
                    METRICS.task_errors.increment(1);
                }
            }
        }
        debug!(task = ?task_id, "recurrent task stopped");
        if enable_metrics {
            METRICS.active_tasks.decrement(1.0);
        }
    }
}

#[async_trait::async_trait]
impl<T> RuntimeExt<T> for Runtime<T>
where
    T: Hash + Eq + Debug + Clone + Send + Sync + 'static,
{
    /// Spawns a new task with the given ID.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// runtime.spawn_task(TaskId::Receiver, async move {
    ///     // loop until the socket closes
    ///     Ok(())
    /// }).await?;
    /// ```
    async fn spawn_task<F>(&self, task_id: T, future: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(Self::run_task(
            task_id.clone(),
            future,
            shutdown_rx,
            self.config.enable_metrics,
        ));
        self.register(task_id, shutdown_tx, handle);
        Ok(())
    }

    /// Spawns a new recurrent task that executes periodically. The first tick
    /// fires immediately.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// runtime.spawn_recurrent_task(
    ///     TaskId::Prober,
    ///     Duration::from_secs(1),
    ///     move || Box::pin(async move { Ok(()) }),
    /// ).await?;
    /// ```
    async fn spawn_recurrent_task<F>(&self, task_id: T, period: Duration, handler: F) -> Result<()>
    where
        F: Fn() -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        if period.is_zero() {
            return Err(anyhow!("recurrent task {:?} needs a non-zero period", task_id));
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(Self::run_recurrent_task(
            task_id.clone(),
            RecurrentTicker::new(period),
            handler,
            shutdown_rx,
            self.config.enable_metrics,
        ));
        self.register(task_id, shutdown_tx, handle);
        Ok(())
    }

    /// Destroys a spawned task by its ID and waits for it to stop.
    async fn destroy_task(&self, task_id: &T) -> Result<()> {
        let Some((_, task)) = self.tasks.remove(task_id) else {
            return Ok(());
        };

        // A send error only means the task already finished.
        let _ = task.shutdown.send(());
        let abort_handle = task.handle.abort_handle();
        match tokio::time::timeout(self.config.shutdown_duration, task.handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.is_cancelled() => Ok(()),
            Ok(Err(e)) => Err(anyhow!("task {:?} panicked: {}", task_id, e)),
            Err(_) => {
                abort_handle.abort();
                Err(anyhow!("task {:?} did not stop in time and was aborted", task_id))
            }
        }
    }

    /// Destroys the entire runtime, shutting down all tasks.
    async fn destroy(&self) -> Result<()> {
        let task_ids: Vec<T> = self.tasks.iter().map(|entry| entry.key().clone()).collect();
        let tasks: Vec<(T, RuntimeTask)> = task_ids
            .iter()
            .filter_map(|task_id| self.tasks.remove(task_id))
            .collect();

        for (_, task) in &tasks {
            let _ = task.shutdown.send(());
        }

        let abort_handles: Vec<_> = tasks.iter().map(|(_, task)| task.handle.abort_handle()).collect();
        let handles = tasks.into_iter().map(|(_, task)| task.handle);
        if tokio::time::timeout(self.config.shutdown_duration, join_all(handles)).await.is_err() {
            error!("Shutdown timeout reached. Some tasks did not shut down gracefully.");
            for abort_handle in abort_handles {
                abort_handle.abort();
            }
        }
        Ok(())
    }

    fn is_active(&self, task_id: &T) -> bool {
        self.tasks
            .get(task_id)
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Hash, Eq, PartialEq, Debug)]
    enum MockTaskId {
        Ticker,
        Worker,
    }

    type MockRuntime = Runtime<MockTaskId>;

    fn counting_handler(
        counter: Arc<AtomicUsize>,
        fail: bool,
    ) -> impl Fn() -> BoxFuture<'static, Result<()>> + Send + Sync + 'static {
        move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if fail {
                    return Err(anyhow!("iteration failed"));
                }
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_recurrent_task_runs_until_destroyed() {
        let runtime = MockRuntime::builder().with_metrics_enabled(true).build::<MockTaskId>();
        let counter = Arc::new(AtomicUsize::new(0));

        runtime
            .spawn_recurrent_task(MockTaskId::Ticker, Duration::from_millis(10), counting_handler(counter.clone(), false))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(counter.load(Ordering::SeqCst) >= 3);
        assert!(runtime.is_active(&MockTaskId::Ticker));

        runtime.destroy().await.unwrap();
        assert!(!runtime.is_active(&MockTaskId::Ticker));

        let stopped_at = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), stopped_at);
    }

    #[tokio::test]
    async fn test_failing_iteration_does_not_stop_task() {
        let runtime = MockRuntime::builder().build::<MockTaskId>();
        let counter = Arc::new(AtomicUsize::new(0));

        runtime
            .spawn_recurrent_task(MockTaskId::Ticker, Duration::from_millis(10), counting_handler(counter.clone(), true))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(counter.load(Ordering::SeqCst) >= 3);
        runtime.destroy_task(&MockTaskId::Ticker).await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_period_is_rejected() {
        let runtime = MockRuntime::builder().build::<MockTaskId>();
        let counter = Arc::new(AtomicUsize::new(0));
        let result = runtime
            .spawn_recurrent_task(MockTaskId::Ticker, Duration::ZERO, counting_handler(counter, false))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_destroy_task_stops_pending_task() {
        let runtime = MockRuntime::builder()
            .with_shutdown_duration(Duration::from_millis(500))
            .build::<MockTaskId>();

        runtime
            .spawn_task(MockTaskId::Worker, async move {
                futures::future::pending::<()>().await;
                Ok(())
            })
            .await
            .unwrap();

        assert!(runtime.is_active(&MockTaskId::Worker));
        runtime.destroy_task(&MockTaskId::Worker).await.unwrap();
        assert!(!runtime.is_active(&MockTaskId::Worker));
    }

    #[tokio::test]
    async fn test_finished_task_is_not_active() {
        let runtime = MockRuntime::builder().build::<MockTaskId>();
        runtime.spawn_task(MockTaskId::Worker, async { Ok(()) }).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!runtime.is_active(&MockTaskId::Worker));
    }
}
