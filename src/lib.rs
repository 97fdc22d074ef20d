//! quorumd library -- bootstrap controller for a consensus cluster node.
//!
//! Decides whether a node founds a new cluster or joins an existing one,
//! registers it through the cluster's membership API when joining, starts
//! the consensus store with the resulting plan, and reconciles the peer
//! URLs the cluster records for it.

pub mod cluster;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod node;
pub mod security;
pub mod server;
pub mod store;

use crate::node::NodeStatus;

/// Shared state of the status server, passed via `axum::extract::State`.
pub struct AppState {
    /// Bootstrap outcome of this node.
    pub status: NodeStatus,
}
