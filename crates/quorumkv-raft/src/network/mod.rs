//! Raft transport between hosts.
//!
//! - [`NngRaftNetwork`] sends one shard's RPCs to a peer replica
//! - [`NngNetworkFactory`] creates those clients for openraft
//! - [`RaftServer`] receives RPCs for every shard hosted locally
//! - [`ConnectionTracker`] reports peer reachability changes

pub mod connections;
pub mod factory;
pub mod messages;
pub mod server;
pub mod transport;

pub use connections::ConnectionTracker;
pub use factory::NngNetworkFactory;
pub use messages::{RaftReply, RaftRequest};
pub use server::{RaftServer, Router, ServerHandle};
pub use transport::NngRaftNetwork;
