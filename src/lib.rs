//! Shard Router - transparent database sharding layer
//!
//! Sits between data-access code and a set of database connections and picks,
//! per call and per thread, which connection runs an operation:
//! - Builds a registry of shards and groups from the shards file
//! - Resolves the calling thread's shard context, including nested overrides
//! - Routes reads to slaves and writes to the master in replicated setups
//! - Fans schema migrations out across shard sets
//!
//! Without a shards file the router degrades to the single implicit `master`
//! connection and every override becomes a pass-through.

pub mod config;
pub mod error;
pub mod metrics;
pub mod migration;
pub mod proxy;
pub mod replication;
pub mod shard;

pub use self::config::{ConnectionConfig, RouterSettings, ShardEntry, ShardsConfig};
pub use error::{BoxError, MigrationError, Result, ShardError};
pub use migration::{
    Direction, MigrationCommand, MigrationEngine, MigrationFile, MigrationReport, MigrationTargets,
    ShardedMigrator,
};
pub use proxy::{IntoShardNames, OperationKind, ShardProxy};
pub use replication::ReplicationPolicy;
pub use shard::{
    ConnectionPool, Connector, RegistryBuilder, ReplicationTopology, Role, ShardContext,
    ShardRegistry, ShardSpec, MASTER,
};

/// Run `body` against `shard` on `proxy`
///
/// Passes straight through when the proxy is not sharded.
pub fn using<K: Connector, R>(
    proxy: &ShardProxy<K>,
    shard: impl IntoShardNames,
    body: impl FnOnce() -> R,
) -> Result<R> {
    proxy.run_queries_on_shard(shard, body)
}
