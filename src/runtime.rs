//! Wiring and lifecycle of all components.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bus::NotificationBus;
use crate::config::RelayConfig;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::gateway::{AppState, Gateway};
use crate::queue::TaskQueue;
use crate::store::{self, ResultStore};
use crate::task::TaskRegistry;
use crate::worker::{WorkerDeps, WorkerPool};

/// Owns one instance of every component. Nothing here is global.
pub struct TaskRuntime {
    config: RelayConfig,
    registry: Arc<TaskRegistry>,
    queue: Arc<TaskQueue>,
    store: Arc<dyn ResultStore>,
    bus: Arc<NotificationBus>,
    dispatcher: Arc<Dispatcher>,
    gateway: Arc<Gateway>,
    pool: Option<WorkerPool>,
    sweeper: Option<JoinHandle<()>>,
}

impl TaskRuntime {
    /// Build components from `config`, opening the configured result store.
    pub async fn new(config: RelayConfig, registry: Arc<TaskRegistry>) -> Result<Self> {
        let store = store::open(&config.result_backend, config.result_ttl).await?;
        Ok(Self::with_store(config, registry, store))
    }

    /// Build components around an existing result store.
    pub fn with_store(
        config: RelayConfig,
        registry: Arc<TaskRegistry>,
        store: Arc<dyn ResultStore>,
    ) -> Self {
        let queue = TaskQueue::new(config.queue_capacity);
        let bus = NotificationBus::new(config.bus_capacity);
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            queue.clone(),
            store.clone(),
            config.retry,
        ));
        let gateway = Arc::new(Gateway::new(
            store.clone(),
            bus.clone(),
            config.ping_interval,
            config.stream_idle_timeout,
        ));

        Self {
            config,
            registry,
            queue,
            store,
            bus,
            dispatcher,
            gateway,
            pool: None,
            sweeper: None,
        }
    }

    /// Start the worker pool and the expiry sweep. Idempotent.
    pub fn start(&mut self) {
        if self.pool.is_some() {
            return;
        }
        let deps = WorkerDeps {
            registry: self.registry.clone(),
            store: self.store.clone(),
            bus: self.bus.clone(),
            task_timeout: self.config.task_timeout,
        };
        self.pool = Some(WorkerPool::start(
            self.config.worker_concurrency,
            self.queue.clone(),
            deps,
        ));
        self.sweeper = Some(store::spawn_expiry_task(
            self.store.clone(),
            self.config.expiry_sweep_interval,
        ));
        info!(
            workers = self.config.worker_concurrency,
            tasks = ?self.registry.names(),
            "Task runtime started"
        );
    }

    /// Stop accepting work and let in-flight attempts finish.
    ///
    /// Attempts still running after `shutdown_timeout` are cancelled and their
    /// work functions dropped.
    pub async fn shutdown(&mut self) {
        self.queue.close();
        if let Some(mut pool) = self.pool.take() {
            let grace = self.config.shutdown_timeout;
            if tokio::time::timeout(grace, pool.join()).await.is_err() {
                warn!(
                    grace_secs = grace.as_secs(),
                    in_flight = self.queue.in_flight_len(),
                    "Workers still busy after grace period, cancelling"
                );
                pool.abort().await;
            }
        }
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
        info!("Task runtime stopped");
    }

    /// State for the HTTP router.
    pub fn app_state(&self) -> AppState {
        AppState {
            dispatcher: self.dispatcher.clone(),
            gateway: self.gateway.clone(),
            queue: self.queue.clone(),
            bus: self.bus.clone(),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<NotificationBus> {
        &self.bus
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::task::builtin::EchoTask;
    use crate::task::{Outcome, Phase, TaskHandler};
    use crate::worker::ProgressReporter;

    /// Never finishes on its own; records when its future is dropped.
    struct Stuck {
        cancelled: Arc<AtomicBool>,
    }

    struct MarkOnDrop(Arc<AtomicBool>);

    impl Drop for MarkOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl TaskHandler for Stuck {
        fn name(&self) -> &str {
            "stuck"
        }

        async fn run(&self, _input: serde_json::Value, _progress: ProgressReporter) -> Outcome {
            let _mark = MarkOnDrop(self.cancelled.clone());
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Outcome::Success(json!(null))
        }
    }

    fn registry() -> Arc<TaskRegistry> {
        let registry = Arc::new(TaskRegistry::new());
        registry.register(Arc::new(EchoTask));
        registry
    }

    #[tokio::test]
    async fn submit_run_and_poll() {
        let mut runtime = TaskRuntime::new(RelayConfig::default(), registry())
            .await
            .unwrap();
        runtime.start();

        let id = runtime
            .dispatcher()
            .submit("echo", json!({"n": 42}))
            .await
            .unwrap();

        let view = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let view = runtime.gateway().status(id).await.unwrap();
                if view.phase.is_terminal() {
                    return view;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(view.phase, Phase::Success);
        assert_eq!(view.result, Some(json!({"n": 42})));
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_rejects_new_submissions() {
        let mut runtime = TaskRuntime::new(RelayConfig::default(), registry())
            .await
            .unwrap();
        runtime.start();
        runtime.shutdown().await;

        assert!(runtime.queue().is_closed());
        assert!(runtime.dispatcher().submit("echo", json!(1)).await.is_err());
    }

    #[tokio::test]
    async fn shutdown_cancels_work_past_the_grace_period() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let registry = Arc::new(TaskRegistry::new());
        registry.register(Arc::new(Stuck {
            cancelled: cancelled.clone(),
        }));
        let config = RelayConfig {
            shutdown_timeout: Duration::from_millis(100),
            ..RelayConfig::default()
        };
        let mut runtime = TaskRuntime::new(config, registry).await.unwrap();
        runtime.start();

        let id = runtime.dispatcher().submit("stuck", json!({})).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while runtime.gateway().status(id).await.unwrap().phase != Phase::Started {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(5), runtime.shutdown())
            .await
            .expect("shutdown exceeded its grace period");

        tokio::time::timeout(Duration::from_secs(2), async {
            while !cancelled.load(Ordering::SeqCst) || runtime.queue().in_flight_len() != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("work function still running after shutdown");
    }
}
