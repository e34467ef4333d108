//! Node runtime.
//!
//! The runtime wires a queue engine from configuration:
//! - Start order: storage → engine (state restore) → recycle scheduler → coordinator
//! - Shutdown: engine close, which stops the scheduler, deregisters and closes storage
//!
//! The coordinator is optional and never fatal: when the coordination
//! service cannot be configured the node runs standalone and reports the
//! coordinator as degraded.

use crate::cluster::{self, ClusterCoordinator, CoordinationService, CoordinatorOptions};
use crate::core::config::Config;
use crate::queue::{EngineOptions, QueueEngine};
use crate::storage;
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Component health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    Starting,
    Healthy,
    /// Running with reduced function.
    Degraded,
    Failed,
    Stopping,
    Stopped,
    /// Not configured for this node.
    Disabled,
}

/// Health of each component.
#[derive(Debug, Clone)]
pub struct RuntimeHealth {
    pub storage: ComponentHealth,
    pub engine: ComponentHealth,
    pub recycler: ComponentHealth,
    pub coordinator: ComponentHealth,
}

impl Default for RuntimeHealth {
    fn default() -> Self {
        Self {
            storage: ComponentHealth::Starting,
            engine: ComponentHealth::Starting,
            recycler: ComponentHealth::Starting,
            coordinator: ComponentHealth::Starting,
        }
    }
}

impl RuntimeHealth {
    /// Check if the node can serve queue traffic. The coordinator does not
    /// affect readiness.
    pub fn is_ready(&self) -> bool {
        matches!(
            (self.storage, self.engine, self.recycler),
            (
                ComponentHealth::Healthy,
                ComponentHealth::Healthy,
                ComponentHealth::Healthy
            )
        )
    }

    /// Check if no data-path component has failed.
    pub fn is_alive(&self) -> bool {
        ![self.storage, self.engine, self.recycler].contains(&ComponentHealth::Failed)
    }
}

/// A running node.
pub struct Runtime {
    config: Arc<Config>,
    engine: Option<Arc<QueueEngine>>,
    /// Overrides the service built from `cluster.endpoints`.
    coordination: Option<Arc<dyn CoordinationService>>,
    health: RuntimeHealth,
    running: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Runtime {
    /// Create a runtime. The configuration is validated here.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config: Arc::new(config),
            engine: None,
            coordination: None,
            health: RuntimeHealth::default(),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Use `service` for cluster coordination instead of `cluster.endpoints`.
    pub fn with_coordination(mut self, service: Arc<dyn CoordinationService>) -> Self {
        self.coordination = Some(service);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The engine, once started.
    pub fn engine(&self) -> Option<Arc<QueueEngine>> {
        self.engine.clone()
    }

    pub fn health(&self) -> &RuntimeHealth {
        &self.health
    }

    pub fn is_ready(&self) -> bool {
        self.health.is_ready()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Get a shutdown receiver for graceful shutdown coordination.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Open storage, restore the engine and start background tasks.
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!(
            backend = %self.config.storage.backend,
            storage_dir = %self.config.storage.dir,
            node = %format!("{}:{}", self.config.node.ip, self.config.node.port),
            "starting linemq node"
        );

        let store = match storage::open(&self.config.storage) {
            Ok(store) => store,
            Err(err) => {
                self.health.storage = ComponentHealth::Failed;
                return Err(err.context("failed to open storage"));
            }
        };
        self.health.storage = ComponentHealth::Healthy;

        let options = EngineOptions::from_config(&self.config.queue);
        let engine = match QueueEngine::open(store, options) {
            Ok(engine) => Arc::new(engine),
            Err(err) => {
                self.health.engine = ComponentHealth::Failed;
                return Err(err.context("failed to restore queue state"));
            }
        };
        self.health.engine = ComponentHealth::Healthy;

        engine
            .start_recycler()
            .context("failed to start recycle scheduler")?;
        self.health.recycler = ComponentHealth::Healthy;

        self.health.coordinator = self.start_coordinator(&engine);
        self.engine = Some(engine);

        self.running.store(true, Ordering::Release);
        tracing::info!("linemq node started");
        Ok(())
    }

    fn start_coordinator(&self, engine: &QueueEngine) -> ComponentHealth {
        let service = match self.coordination.clone() {
            Some(service) => service,
            None => match cluster::connect(&self.config.cluster) {
                Ok(Some(service)) => service,
                Ok(None) => {
                    tracing::info!("no cluster endpoints configured; running standalone");
                    return ComponentHealth::Disabled;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "cluster coordination unavailable; running standalone");
                    return ComponentHealth::Degraded;
                }
            },
        };

        let options = CoordinatorOptions::from_config(&self.config.cluster, &self.config.node);
        let handle = ClusterCoordinator::new(service, options).spawn();
        match engine.attach_coordinator(handle) {
            Ok(()) => ComponentHealth::Healthy,
            Err(err) => {
                tracing::warn!(error = %err, "failed to attach coordinator");
                ComponentHealth::Degraded
            }
        }
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Start, wait for SIGINT or [`shutdown`](Self::shutdown), then stop.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown signal received (SIGINT)");
            }
            _ = async {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            } => {
                tracing::info!("shutdown requested by component");
            }
        }

        self.stop().await
    }

    /// Close the engine and everything it owns.
    pub async fn stop(&mut self) -> Result<()> {
        tracing::info!("stopping linemq node");
        self.running.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);

        self.health.recycler = ComponentHealth::Stopping;
        self.health.engine = ComponentHealth::Stopping;

        if let Some(engine) = self.engine.take() {
            engine.close().await.context("failed to close queue engine")?;
        }

        self.health.recycler = ComponentHealth::Stopped;
        self.health.engine = ComponentHealth::Stopped;
        if self.health.coordinator != ComponentHealth::Disabled {
            self.health.coordinator = ComponentHealth::Stopped;
        }
        self.health.storage = ComponentHealth::Stopped;

        tracing::info!("linemq node stopped");
        Ok(())
    }
}
