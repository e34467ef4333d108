//! Cluster discovery.
//!
//! Nodes register themselves and the topics they own in an external
//! coordination service and list each other from there. Nothing here sits on
//! the data path.
//!
//! - [`service`] - [`CoordinationService`] contract and [`MemoryCoordination`]
//! - [`etcd`] - etcd v3 client (feature `etcd`)
//! - [`coordinator`] - registration, heartbeats and the background agent

pub mod coordinator;
#[cfg(feature = "etcd")]
pub mod etcd;
pub mod service;

pub use coordinator::{
    ClusterCoordinator, CoordinatorHandle, CoordinatorOptions, NodeRecord, Peer, PeerState,
};
pub use service::{CoordinationService, MemoryCoordination};

use crate::core::config::ClusterConfig;
use anyhow::Result;
use std::sync::Arc;

/// Build the coordination client for `config`, or `None` when no endpoints
/// are configured.
pub fn connect(config: &ClusterConfig) -> Result<Option<Arc<dyn CoordinationService>>> {
    if !config.is_clustered() {
        return Ok(None);
    }
    #[cfg(feature = "etcd")]
    {
        let timeout = std::time::Duration::from_millis(config.request_timeout_ms);
        let service = etcd::EtcdCoordination::connect(&config.endpoints, timeout)?;
        Ok(Some(Arc::new(service)))
    }
    #[cfg(not(feature = "etcd"))]
    {
        anyhow::bail!("cluster endpoints configured but linemq was built without the etcd feature")
    }
}
