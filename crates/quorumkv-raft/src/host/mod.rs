//! Hosting raft groups: one openraft instance per local replica, sharing
//! a transport and a data directory.

mod group;
mod nodehost;

pub use nodehost::{LocalReplica, NodeHost, StartOptions};
