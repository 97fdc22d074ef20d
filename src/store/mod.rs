//! Consensus store adapters.
//!
//! The [`backend::ConsensusStore`] trait abstracts over how the consensus
//! engine is launched.  [`etcd::EtcdProcessStore`] runs etcd as a child
//! process.

pub mod backend;
pub mod etcd;
