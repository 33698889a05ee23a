//! Acknowledgement Label Registry
//!
//! Keeps acknowledgement labels unique across the cluster. Every node runs one
//! coordinator that validates declarations against its own claims and against
//! a cached view of everyone else's, and publishes its claims periodically into
//! the replicated store.
//!
//! ## Core Concepts
//! - **Declaration**: a subscriber claims a set of labels, alone or as a member
//!   of a named group. Group members must all declare the same label set.
//! - **Eventual uniqueness**: checks run against the local index and the last
//!   merged remote view, so concurrent declarations on two nodes may both pass.
//!   The remote view settles such conflicts deterministically by address.
//! - **Liveness**: a subscriber's claims are released when its lifetime ends.
//!
//! ## Submodules
//! - **`coordinator`**: the single-threaded control loop.
//! - **`handle`**: the async client API into the loop.
//! - **`index`**: the local claim index.
//! - **`remote`**: the remote view derived from the replicated table.
//! - **`liveness`**: termination watches on declared subscribers.
//! - **`types`**: subscribers, declarations and acks.

pub mod coordinator;
pub mod handle;
pub mod index;
pub mod liveness;
pub mod remote;
pub mod types;
