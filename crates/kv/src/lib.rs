//! Replicated KV layer on top of node-local storage.
//!
//! Provides: consistent-hash key placement, tunable N/R/W quorums,
//! latest-timestamp-wins reconciliation with read repair, and a coordinator
//! that fans out replica calls through a pluggable transport.

pub mod chaos;
pub mod coordinator;
pub mod params;
pub mod replica_client;
pub mod router;

pub use coordinator::{Coordinator, CoordinatorConfig, GetResult, KvError};
pub use params::{ParamsError, ReplicationParams};
pub use replica_client::{InProcessReplicaClient, ReplicaClient, ReplicaError};
pub use router::{Router, RouterError};
