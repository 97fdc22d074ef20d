//! Cluster membership and bootstrap.
//!
//! Before the consensus store starts, quorumd works out whether this node
//! founds a cluster, rejoins one on existing data, or joins a running
//! cluster through its membership API.

pub mod bootstrap;
pub mod local_state;
pub mod membership;

#[cfg(test)]
pub(crate) mod fake;
