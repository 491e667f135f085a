//! Routing proxy
//!
//! Every data-access call goes through [`ShardProxy::execute`], which resolves
//! the calling thread's shard context (and the replication policy, when
//! active) into a connection from the pool. Overrides are exposed as
//! `using` for the rest of the caller's scope, and as block forms that always
//! restore the prior selection.
//!
//! A proxy built without shard configuration runs in non-sharded mode: every
//! call targets the implicit master and overrides are ignored.

use crate::config::{ConnectionConfig, RouterSettings, ShardsConfig};
use crate::error::{Result, ShardError};
use crate::metrics::RouterMetrics;
use crate::replication::ReplicationPolicy;
use crate::shard::{ConnectionPool, Connector, ContextSlot, ShardContext, ShardRegistry, MASTER};

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Kind of data-access operation being routed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Read,
    Write,
}

impl OperationKind {
    /// Static label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Read => "read",
            OperationKind::Write => "write",
        }
    }
}

/// Anything that names one or more shards (or groups)
pub trait IntoShardNames {
    fn into_shard_names(self) -> Vec<String>;
}

impl IntoShardNames for &str {
    fn into_shard_names(self) -> Vec<String> {
        vec![self.to_string()]
    }
}

impl IntoShardNames for String {
    fn into_shard_names(self) -> Vec<String> {
        vec![self]
    }
}

impl IntoShardNames for &String {
    fn into_shard_names(self) -> Vec<String> {
        vec![self.clone()]
    }
}

impl IntoShardNames for Vec<String> {
    fn into_shard_names(self) -> Vec<String> {
        self
    }
}

impl IntoShardNames for &[String] {
    fn into_shard_names(self) -> Vec<String> {
        self.to_vec()
    }
}

impl IntoShardNames for Vec<&str> {
    fn into_shard_names(self) -> Vec<String> {
        self.into_iter().map(str::to_string).collect()
    }
}

impl IntoShardNames for &[&str] {
    fn into_shard_names(self) -> Vec<String> {
        self.iter().map(|s| s.to_string()).collect()
    }
}

impl<const N: usize> IntoShardNames for [&str; N] {
    fn into_shard_names(self) -> Vec<String> {
        self.iter().map(|s| s.to_string()).collect()
    }
}

/// Shard-routing façade over a connection pool
pub struct ShardProxy<K: Connector> {
    registry: ShardRegistry,
    pool: ConnectionPool<K>,
    replication: ReplicationPolicy,
    context: ContextSlot,
    metrics: RouterMetrics,
}

impl<K: Connector> ShardProxy<K> {
    /// Create a proxy over `registry`, connecting through `connector`
    pub fn new(registry: ShardRegistry, connector: K) -> Self {
        let metrics = RouterMetrics::new();
        let pool = ConnectionPool::new(connector, registry.verify_connection(), metrics.clone());
        let replication = ReplicationPolicy::new(registry.replication().cloned());

        Self {
            registry,
            pool,
            replication,
            context: ContextSlot::new(),
            metrics,
        }
    }

    /// Load the shards file located by `settings` and build a proxy
    ///
    /// `master` is the application's default connection, used for the
    /// implicit `master` shard.
    pub fn from_settings(
        settings: &RouterSettings,
        master: ConnectionConfig,
        connector: K,
    ) -> Result<Self> {
        let config = ShardsConfig::load(settings)?;
        let registry = ShardRegistry::build(config.as_ref(), &settings.app_env, master)?;
        Ok(Self::new(registry, connector))
    }

    /// Shard registry
    pub fn registry(&self) -> &ShardRegistry {
        &self.registry
    }

    /// Connection pool
    pub fn pool(&self) -> &ConnectionPool<K> {
        &self.pool
    }

    /// Whether shard configuration is active
    pub fn is_sharded(&self) -> bool {
        self.registry.is_sharded()
    }

    /// Whether reads are routed to slaves
    pub fn is_replicated(&self) -> bool {
        self.replication.is_replicated()
    }

    /// Copy of the calling thread's context
    pub fn context(&self) -> ShardContext {
        self.context.get()
    }

    /// Shards selected on the calling thread, or `[master]` when none
    pub fn current_shards(&self) -> Vec<String> {
        let ctx = self.context.get();
        if ctx.current_shard().is_empty() {
            vec![MASTER.to_string()]
        } else {
            ctx.current_shard().to_vec()
        }
    }

    /// Name of the active shard, without replication routing
    pub fn shard_name(&self) -> Result<String> {
        self.resolve(&self.context.get())
    }

    fn resolve(&self, ctx: &ShardContext) -> Result<String> {
        if !self.registry.is_sharded() {
            return Ok(MASTER.to_string());
        }

        if let Some(head) = ctx.head() {
            self.check_shard(head)?;
            return Ok(head.to_string());
        }

        if ctx.group_explicitly_set() {
            let first_member = ctx
                .current_group()
                .iter()
                .filter_map(|group| self.registry.shards_for_group(group))
                .find_map(|members| members.iter().next());
            if let Some(shard) = first_member {
                return Ok(shard.clone());
            }
        }

        Ok(MASTER.to_string())
    }

    /// Effective shard for an operation of `kind`
    pub fn route(&self, kind: OperationKind) -> Result<String> {
        let ctx = self.context.get();
        let base = self.resolve(&ctx)?;
        if ctx.is_overridden() {
            return Ok(base);
        }

        let effective = self.replication.refine(&base, kind);
        if effective != base {
            self.metrics.record_replica_read(effective);
        }
        Ok(effective.to_string())
    }

    /// Connection for the active shard
    ///
    /// Resolved as a write: under replication without an override this is
    /// the master. Use [`connection_for`](Self::connection_for) with
    /// [`OperationKind::Read`] to get a slave.
    pub fn select_connection(&self) -> Result<Arc<K::Connection>> {
        self.connection_for(OperationKind::Write)
    }

    /// Connection for an operation of `kind`
    pub fn connection_for(&self, kind: OperationKind) -> Result<Arc<K::Connection>> {
        let shard = self.route(kind)?;
        let spec = self.registry.require(&shard).map_err(|e| self.fail(e))?;
        self.pool.connection_for(spec)
    }

    /// Forward a call to the connection selected for `kind`
    ///
    /// Results and errors of `call` are returned unchanged.
    pub fn execute<R, E>(
        &self,
        kind: OperationKind,
        call: impl FnOnce(&K::Connection) -> std::result::Result<R, E>,
    ) -> std::result::Result<R, E>
    where
        E: From<ShardError>,
    {
        let shard = self.route(kind)?;
        let spec = self.registry.require(&shard).map_err(|e| self.fail(e))?;
        let connection = self.pool.connection_for(spec)?;

        debug!(shard = %shard, operation = kind.as_str(), "Forwarding call");
        self.metrics.record_query(&shard, kind);

        call(&connection)
    }

    /// Whether shards are backed by more than one engine kind
    pub fn should_clean_table_name(&self) -> bool {
        self.registry.adapters().len() > 1
    }

    /// Distinct engine kinds across the registry
    pub fn adapters(&self) -> BTreeSet<String> {
        self.registry.adapters()
    }

    /// Connection config of the active shard
    pub fn current_config(&self) -> Result<ConnectionConfig> {
        let shard = self.shard_name()?;
        Ok(self.registry.require(&shard)?.config.clone())
    }

    /// Select shard(s) for the rest of the caller's scope
    ///
    /// The caller is responsible for [`reset`](Self::reset) afterwards.
    pub fn using(&self, shards: impl IntoShardNames) -> Result<&Self> {
        if !self.is_sharded() {
            return Ok(self);
        }

        let shards = shards.into_shard_names();
        self.check_shards(&shards)?;
        self.context.update(|ctx| ctx.set_shard(shards));
        Ok(self)
    }

    /// Select group(s) for the rest of the caller's scope
    pub fn using_group(&self, groups: impl IntoShardNames) -> Result<&Self> {
        if !self.is_sharded() {
            return Ok(self);
        }

        let groups = groups.into_shard_names();
        if let Some(missing) = groups.iter().find(|g| !self.registry.has_group(g)) {
            return Err(self.fail(ShardError::UnknownGroup {
                name: missing.clone(),
            }));
        }
        self.context.update(|ctx| ctx.set_group(groups));
        Ok(self)
    }

    /// Run `body` with the context pinned to `shards`, restoring it afterwards
    pub fn with_shard<R>(&self, shards: impl IntoShardNames, body: impl FnOnce() -> R) -> Result<R> {
        if !self.is_sharded() {
            return Ok(body());
        }

        let shards = shards.into_shard_names();
        self.check_shards(&shards)?;
        Ok(self.context.with_shard(shards, body))
    }

    /// Block form of [`using`](Self::using)
    pub fn run_queries_on_shard<R>(
        &self,
        shards: impl IntoShardNames,
        body: impl FnOnce() -> R,
    ) -> Result<R> {
        self.with_shard(shards, body)
    }

    /// Run `body` once per shard, pinned to that shard
    ///
    /// Stops at the first failure: shards after the failing one are not
    /// visited. The context is restored in every case. In non-sharded mode
    /// `body` runs once against the master.
    pub fn send_queries_to_multiple_shards<T, E>(
        &self,
        shards: impl IntoShardNames,
        mut body: impl FnMut(&str) -> std::result::Result<T, E>,
    ) -> std::result::Result<Vec<T>, E>
    where
        E: From<ShardError>,
    {
        if !self.is_sharded() {
            return Ok(vec![body(MASTER)?]);
        }

        let shards = shards.into_shard_names();
        self.check_shards(&shards)?;

        let mut results = Vec::with_capacity(shards.len());
        for shard in &shards {
            let outcome = self.context.with_shard(vec![shard.clone()], || body(shard.as_str()));
            match outcome {
                Ok(value) => results.push(value),
                Err(e) => {
                    warn!(shard = %shard, "Fan-out halted by failure");
                    return Err(e);
                }
            }
        }
        Ok(results)
    }

    /// Return the calling thread's context to its initial state
    ///
    /// Call at the end of each request on pooled threads that used
    /// [`using`](Self::using) or [`using_group`](Self::using_group).
    pub fn reset(&self) {
        self.context.reset();
    }

    /// Close every pooled connection
    pub fn disconnect_all(&self) {
        self.pool.disconnect_all();
    }

    fn check_shard(&self, name: &str) -> Result<()> {
        if self.registry.contains(name) {
            Ok(())
        } else {
            Err(self.fail(ShardError::UnknownShard {
                name: name.to_string(),
            }))
        }
    }

    fn check_shards(&self, names: &[String]) -> Result<()> {
        names.iter().try_for_each(|name| self.check_shard(name))
    }

    fn fail(&self, err: ShardError) -> ShardError {
        self.metrics.record_error(&err);
        err
    }
}
