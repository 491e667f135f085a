//! Shard management module
//!
//! Registry of shard specs, the lazily-connecting pool, and the per-thread
//! routing context.

mod context;
mod pool;
mod registry;

pub use context::{ContextSlot, ShardContext, ShardScope};
pub use pool::{ConnectionPool, Connector};
pub use registry::{RegistryBuilder, ReplicationTopology, Role, ShardRegistry, ShardSpec, MASTER};
