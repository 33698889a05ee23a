//! Replicated State Store
//!
//! Holds, per cluster address, the claim set that node last published. The
//! store is an injected dependency of the registry coordinator.
//!
//! ## Core Concepts
//! - **LWW per key**: every node writes only its own key, so replicas merge by
//!   keeping the newest version of each key (`crdt`).
//! - **Consistency levels**: a write completes locally or after `n`, a majority
//!   or all replicas acknowledged it.
//! - **Change stream**: subscribers learn which keys changed after every merge.
//!
//! ## Submodules
//! - **`store`**: the `ReplicatedStore` trait and peer sources.
//! - **`gossip`**: UDP gossip implementation used by nodes.
//! - **`memory`**: deterministic in-process implementation used by tests.
//! - **`protocol`**: replicator wire messages.

pub mod crdt;
pub mod gossip;
pub mod memory;
pub mod protocol;
pub mod store;
pub mod types;

#[cfg(test)]
mod tests;
