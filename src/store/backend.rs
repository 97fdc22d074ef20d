//! Abstract consensus store trait.
//!
//! The consensus engine is an external collaborator.  quorumd only needs
//! to start it with a bootstrap-derived configuration, wait for it to be
//! ready, learn its member id and client endpoints, and stop it.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use crate::cluster::bootstrap::{BootstrapPlan, ClusterState};
use crate::config::{Config, SecurityConfig};

/// Boxed future returned by store methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// Startup configuration for the consensus store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub name: String,
    pub data_dir: PathBuf,
    pub listen_client_urls: String,
    pub listen_peer_urls: String,
    pub advertise_client_urls: String,
    pub advertise_peer_urls: String,
    /// `name=peerURL` list, comma separated.
    pub initial_cluster: String,
    pub initial_cluster_state: ClusterState,
    pub security: SecurityConfig,
}

impl StoreConfig {
    /// Merge a bootstrap plan into the node configuration.
    ///
    /// A plan without members keeps the configured initial cluster; the
    /// store ignores it anyway when it restarts on existing data.
    pub fn from_plan(config: &Config, plan: &BootstrapPlan) -> Self {
        let node = &config.node;
        let initial_cluster = if plan.initial_cluster.is_empty() {
            node.initial_cluster.clone()
        } else {
            plan.initial_cluster_string()
        };
        Self {
            name: node.name.clone(),
            data_dir: node.data_dir.clone(),
            listen_client_urls: node.client_urls.clone(),
            listen_peer_urls: node.peer_urls.clone(),
            advertise_client_urls: node.advertise_client_urls.clone(),
            advertise_peer_urls: node.advertise_peer_urls.clone(),
            initial_cluster,
            initial_cluster_state: plan.initial_cluster_state,
            security: config.security.clone(),
        }
    }
}

/// A started consensus store.
pub trait StoreHandle: Send + Sync {
    /// Resolve once the store serves requests.  Fails if the store dies first.
    fn wait_ready(&self) -> StoreFuture<'_, ()>;

    /// The numeric member id the store runs as.
    fn member_id(&self) -> StoreFuture<'_, u64>;

    /// Client endpoints of this store, for a local membership client.
    fn client_endpoints(&self) -> Vec<String>;

    /// Stop the store and release its resources.
    fn stop(self: Box<Self>) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
}

/// Something that can launch a consensus store.
pub trait ConsensusStore: Send + Sync + 'static {
    /// Launch the store.  Returns as soon as it is started, not ready.
    fn start(&self, config: StoreConfig) -> StoreFuture<'_, Box<dyn StoreHandle>>;
}
