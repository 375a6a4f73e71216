//! Node-local service discovery daemon.
//!
//! Services register with the daemon on their node. The daemon keeps them in
//! a local cache, mirrors them into a shared etcd keyspace under a per-node
//! lease, and maintains a node-local copy of every registration in the
//! cluster for lookups:
//!
//! - [`RegistryServicer`] owns the per-service lifecycle and expiry timers
//! - [`LeaseManager`] keeps the node lease alive across restarts and outages
//! - [`WatchManager`] streams remote changes into the global cache
//! - [`Synchronizer`] periodically reconciles both caches with the remote store
//! - [`DiscoveryNode`] wires everything together behind a gRPC server

mod cache;
mod client;
mod config;
mod errors;
mod lease;
mod registry;
mod remote;
mod server;
mod service;
mod sync;
mod watch;

pub mod proto;
pub mod utils;

pub use cache::*;
pub use client::*;
pub use config::*;
pub use errors::*;
pub use lease::*;
pub use registry::*;
pub use remote::*;
pub use server::*;
pub use service::*;
pub use sync::*;
pub use watch::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub(crate) mod test_utils;
