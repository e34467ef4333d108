//! Node registration and peer discovery.
//!
//! # Layout
//!
//! ```text
//! /{cluster}/servers/{ip}:{port}  -> JSON NodeRecord
//! /{cluster}/topics/{topic}       -> "{ip}:{port}" of the owning node
//! ```
//!
//! Ownership is advisory: nothing is replicated between nodes and the data
//! path never waits on the coordination service.
//!
//! # Agent
//!
//! [`ClusterCoordinator::spawn`] runs a background task that registers the
//! node (retrying each interval until it succeeds), heartbeats, refreshes the
//! peer list and publishes topics announced by the engine. Every failure is
//! logged and retried; none reach the engine.

use super::service::CoordinationService;
use crate::core::config::{ClusterConfig, NodeConfig};
use crate::core::time::{Clock, SystemClock};
use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Registration stored for each node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub address: String,
    pub port: u16,
    pub cluster: String,
    pub topics: Vec<String>,
    pub started_at_ms: u64,
    pub heartbeat_ms: u64,
}

impl NodeRecord {
    /// `ip:port` identifier.
    pub fn id(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Peer liveness judged from heartbeat age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    /// Heartbeat within two intervals.
    Alive,
    /// Missed heartbeats but within the peer TTL.
    Suspect,
    /// Past the peer TTL; most likely gone without deregistering.
    Expired,
}

/// Another node in the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub record: NodeRecord,
    pub state: PeerState,
}

impl Peer {
    pub fn id(&self) -> String {
        self.record.id()
    }
}

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub cluster: String,
    pub address: String,
    pub port: u16,
    pub heartbeat_interval: Duration,
    pub peer_ttl: Duration,
    pub request_timeout: Duration,
}

impl CoordinatorOptions {
    pub fn from_config(cluster: &ClusterConfig, node: &NodeConfig) -> Self {
        Self {
            cluster: cluster.name.clone(),
            address: node.ip.clone(),
            port: node.port,
            heartbeat_interval: Duration::from_millis(cluster.heartbeat_interval_ms),
            peer_ttl: Duration::from_millis(cluster.peer_ttl_ms),
            request_timeout: Duration::from_millis(cluster.request_timeout_ms),
        }
    }
}

/// Registers this node and its topics, and lists peers.
pub struct ClusterCoordinator {
    service: Arc<dyn CoordinationService>,
    options: CoordinatorOptions,
    clock: Arc<dyn Clock>,
    started_at_ms: u64,
    topics: Mutex<BTreeSet<String>>,
    registered: AtomicBool,
}

impl ClusterCoordinator {
    pub fn new(service: Arc<dyn CoordinationService>, options: CoordinatorOptions) -> Self {
        Self::with_clock(service, options, Arc::new(SystemClock))
    }

    pub fn with_clock(
        service: Arc<dyn CoordinationService>,
        options: CoordinatorOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let started_at_ms = clock.now().ms;
        Self {
            service,
            options,
            clock,
            started_at_ms,
            topics: Mutex::new(BTreeSet::new()),
            registered: AtomicBool::new(false),
        }
    }

    /// `ip:port` of this node.
    pub fn node_id(&self) -> String {
        format!("{}:{}", self.options.address, self.options.port)
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    fn servers_prefix(&self) -> String {
        format!("/{}/servers/", self.options.cluster)
    }

    fn server_key(&self) -> String {
        format!("{}{}", self.servers_prefix(), self.node_id())
    }

    fn topic_key(&self, topic: &str) -> String {
        format!("/{}/topics/{}", self.options.cluster, topic)
    }

    fn record(&self) -> NodeRecord {
        NodeRecord {
            address: self.options.address.clone(),
            port: self.options.port,
            cluster: self.options.cluster.clone(),
            topics: self.topics.lock().iter().cloned().collect(),
            started_at_ms: self.started_at_ms,
            heartbeat_ms: self.clock.now().ms,
        }
    }

    async fn timed<T>(&self, what: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.options.request_timeout, call)
            .await
            .map_err(|_| anyhow!("{} timed out after {:?}", what, self.options.request_timeout))?
    }

    async fn put_record(&self) -> Result<()> {
        let value = serde_json::to_vec(&self.record()).context("failed to encode node record")?;
        self.timed("node registration", self.service.put(&self.server_key(), value))
            .await
    }

    /// Register this node and claim `topics`.
    pub async fn register(&self, topics: impl IntoIterator<Item = String>) -> Result<()> {
        self.topics.lock().extend(topics);
        self.put_record().await?;
        let owned: Vec<String> = self.topics.lock().iter().cloned().collect();
        for topic in &owned {
            self.timed(
                "topic publication",
                self.service
                    .put(&self.topic_key(topic), self.node_id().into_bytes()),
            )
            .await?;
        }
        self.registered.store(true, Ordering::Release);
        tracing::info!(
            node = %self.node_id(),
            cluster = %self.options.cluster,
            topics = owned.len(),
            service = %self.service.describe(),
            "registered with cluster"
        );
        Ok(())
    }

    /// Claim one more topic.
    pub async fn publish_topic(&self, topic: &str) -> Result<()> {
        self.topics.lock().insert(topic.to_string());
        self.timed(
            "topic publication",
            self.service
                .put(&self.topic_key(topic), self.node_id().into_bytes()),
        )
        .await?;
        if self.is_registered() {
            self.put_record().await?;
        }
        tracing::debug!(topic, "published topic ownership");
        Ok(())
    }

    /// Refresh this node's registration.
    pub async fn heartbeat(&self) -> Result<()> {
        self.put_record().await
    }

    /// Every registered node except this one.
    pub async fn peers(&self) -> Result<Vec<Peer>> {
        let entries = self
            .timed("peer listing", self.service.get_prefix(&self.servers_prefix()))
            .await?;
        let own_key = self.server_key();
        let now = self.clock.now();
        let interval_ms = self.options.heartbeat_interval.as_millis() as u64;
        let ttl_ms = self.options.peer_ttl.as_millis() as u64;
        let alive_ms = interval_ms.saturating_mul(2).min(ttl_ms);

        let mut peers = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            if key == own_key {
                continue;
            }
            let record: NodeRecord = match serde_json::from_slice(&value) {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "ignoring malformed node record");
                    continue;
                }
            };
            let age = now.ms.saturating_sub(record.heartbeat_ms);
            let state = if age <= alive_ms {
                PeerState::Alive
            } else if age <= ttl_ms {
                PeerState::Suspect
            } else {
                PeerState::Expired
            };
            peers.push(Peer { record, state });
        }
        Ok(peers)
    }

    /// Remove this node's registration and topic claims.
    ///
    /// Every key is attempted even when an earlier delete fails, and the
    /// registered flag is ignored: a partially written registration is
    /// removed too. Returns the first failure.
    pub async fn deregister(&self) -> Result<()> {
        let owned: Vec<String> = self.topics.lock().iter().cloned().collect();
        let mut first_err = None;
        for topic in &owned {
            if let Err(err) = self
                .timed("topic release", self.service.delete(&self.topic_key(topic)))
                .await
            {
                tracing::warn!(topic = %topic, error = %err, "failed to release topic");
                first_err = first_err.or(Some(err));
            }
        }
        if let Err(err) = self
            .timed("deregistration", self.service.delete(&self.server_key()))
            .await
        {
            tracing::warn!(node = %self.node_id(), error = %err, "failed to remove node record");
            first_err = first_err.or(Some(err));
        }
        self.registered.store(false, Ordering::Release);

        match first_err {
            Some(err) => Err(err),
            None => {
                tracing::info!(node = %self.node_id(), "deregistered from cluster");
                Ok(())
            }
        }
    }

    /// Start the background agent.
    pub fn spawn(self) -> CoordinatorHandle {
        let coordinator = Arc::new(self);
        let connected = Arc::new(AtomicBool::new(false));
        let (announce_tx, mut announce_rx) = mpsc::unbounded_channel::<String>();
        let (peers_tx, peers_rx) = watch::channel(Vec::new());
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let agent = Arc::clone(&coordinator);
        let agent_connected = Arc::clone(&connected);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(agent.options.heartbeat_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let ok = agent.refresh(&peers_tx).await;
                        agent_connected.store(ok, Ordering::Release);
                    }
                    Some(topic) = announce_rx.recv() => {
                        if !agent.announce(&topic).await {
                            agent_connected.store(false, Ordering::Release);
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            if let Err(err) = agent.deregister().await {
                tracing::warn!(error = %err, "failed to deregister from cluster");
            }
            agent_connected.store(false, Ordering::Release);
        });

        CoordinatorHandle {
            coordinator,
            announce: announce_tx,
            peers: peers_rx,
            shutdown: shutdown_tx,
            connected,
            task,
        }
    }

    /// One agent tick. Returns whether the service answered.
    async fn refresh(&self, peers_tx: &watch::Sender<Vec<Peer>>) -> bool {
        let registered = if self.is_registered() {
            self.heartbeat().await
        } else {
            self.register(Vec::new()).await
        };
        if let Err(err) = registered {
            tracing::warn!(error = %err, "cluster heartbeat failed; local traffic unaffected");
            return false;
        }

        match self.peers().await {
            Ok(peers) => {
                peers_tx.send_replace(peers);
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, "peer refresh failed");
                false
            }
        }
    }

    async fn announce(&self, topic: &str) -> bool {
        if !self.is_registered() {
            // Registration publishes every known topic.
            self.topics.lock().insert(topic.to_string());
            return true;
        }
        match self.publish_topic(topic).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(topic, error = %err, "failed to publish topic; re-registering");
                self.registered.store(false, Ordering::Release);
                false
            }
        }
    }
}

/// Handle to a running coordinator agent.
pub struct CoordinatorHandle {
    coordinator: Arc<ClusterCoordinator>,
    announce: mpsc::UnboundedSender<String>,
    peers: watch::Receiver<Vec<Peer>>,
    shutdown: watch::Sender<bool>,
    connected: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for CoordinatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorHandle")
            .field("node", &self.coordinator.node_id())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl CoordinatorHandle {
    /// Queue a topic for publication.
    pub fn announce(&self, topic: &str) {
        if self.announce.send(topic.to_string()).is_err() {
            tracing::debug!(topic, "coordinator stopped; topic not announced");
        }
    }

    /// Latest peer list.
    pub fn peers(&self) -> Vec<Peer> {
        self.peers.borrow().clone()
    }

    /// Receiver notified on every peer refresh.
    pub fn subscribe(&self) -> watch::Receiver<Vec<Peer>> {
        self.peers.clone()
    }

    /// Whether the last exchange with the service succeeded.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn node_id(&self) -> String {
        self.coordinator.node_id()
    }

    /// Stop the agent, deregistering within the request timeout.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = (&mut self.task).await {
            tracing::warn!(error = %err, "coordinator task failed");
        }
    }
}

impl Drop for CoordinatorHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
