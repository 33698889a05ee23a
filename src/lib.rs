//! Cluster-wide Acknowledgement Label Registry
//!
//! This library crate defines the modules a node runs to keep acknowledgement
//! labels unique across the cluster. It serves as the foundation for the
//! binary executable (`main.rs`).
//!
//! ## Architecture Modules
//! - **`registry`**: the per-node coordinator. Validates declarations against
//!   local claims and a cached view of remote claims, publishes local claims
//!   on every tick and releases claims of terminated subscribers.
//! - **`ddata`**: the replicated state store. A last-writer-wins map keyed by
//!   cluster address, replicated by UDP gossip (or in memory for tests).
//! - **`membership`**: SWIM-like UDP membership plus the monitor that prunes
//!   claims of removed members.
//! - **`config`**: node configuration with defaults for every field.
//! - **`error`**: error types surfaced by the registry and the store.

pub mod config;
pub mod ddata;
pub mod error;
pub mod membership;
pub mod registry;

pub use config::NodeConfig;
pub use error::{RegistryError, ReplicationError};
pub use registry::coordinator::AckCoordinator;
pub use registry::handle::RegistryHandle;
pub use registry::types::{Declaration, SubAck, Subscriber, SubscriberId, SubscriberLifetime};
