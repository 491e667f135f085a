//! Router metrics module
//!
//! Emits through the `metrics` facade; the host process installs whatever
//! recorder/exporter it uses.

use crate::error::ShardError;
use crate::proxy::OperationKind;
use metrics::{counter, describe_counter, Unit};
use std::sync::Once;

static DESCRIBE: Once = Once::new();

/// Router metrics collector
#[derive(Debug, Clone, Default)]
pub struct RouterMetrics {
    _private: (),
}

impl RouterMetrics {
    /// Register metric descriptions and return a collector
    pub fn new() -> Self {
        DESCRIBE.call_once(Self::register_metrics);
        Self { _private: () }
    }

    fn register_metrics() {
        describe_counter!(
            "shard_router_queries_total",
            Unit::Count,
            "Data-access calls forwarded to a shard"
        );
        describe_counter!(
            "shard_router_replica_reads_total",
            Unit::Count,
            "Reads routed to a replication slave"
        );
        describe_counter!(
            "shard_router_connections_opened_total",
            Unit::Count,
            "Shard connections established by the pool"
        );
        describe_counter!(
            "shard_router_errors_total",
            Unit::Count,
            "Routing, configuration and migration errors"
        );
        describe_counter!(
            "shard_router_migrations_total",
            Unit::Count,
            "Per-shard migration runs by outcome"
        );
    }

    /// Record a forwarded call
    pub fn record_query(&self, shard: &str, kind: OperationKind) {
        counter!(
            "shard_router_queries_total",
            "shard" => shard.to_string(),
            "operation" => kind.as_str()
        )
        .increment(1);
    }

    /// Record a read served by a slave
    pub fn record_replica_read(&self, shard: &str) {
        counter!(
            "shard_router_replica_reads_total",
            "shard" => shard.to_string()
        )
        .increment(1);
    }

    /// Record a new pool connection
    pub fn record_connection(&self, shard: &str) {
        counter!(
            "shard_router_connections_opened_total",
            "shard" => shard.to_string()
        )
        .increment(1);
    }

    /// Record an error by type
    pub fn record_error(&self, err: &ShardError) {
        counter!(
            "shard_router_errors_total",
            "error_type" => err.error_type_label()
        )
        .increment(1);
    }

    /// Record the outcome of one shard's migration run
    pub fn record_migration(&self, shard: &str, outcome: &'static str) {
        counter!(
            "shard_router_migrations_total",
            "shard" => shard.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }
}
