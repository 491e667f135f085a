//! Connection pool implementation
//!
//! Lazily opens one connection handle per shard and caches it for the life
//! of the pool. Racing first accesses, and racing reconnects after a failed
//! verification, open exactly one handle per shard name.

use crate::error::{BoxError, Result, ShardError};
use crate::metrics::RouterMetrics;
use crate::shard::registry::ShardSpec;

use dashmap::DashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{info, warn};

/// Opens connections for shard specs
///
/// Implemented by the host data-access layer. The router never interprets
/// the connection; it only hands it back to the caller.
pub trait Connector: Send + Sync {
    /// Live connection handle
    type Connection: Send + Sync;

    /// Establish a connection for `spec`
    fn connect(&self, spec: &ShardSpec) -> std::result::Result<Self::Connection, BoxError>;

    /// Check that a cached connection is still usable
    fn verify(&self, _connection: &Self::Connection) -> std::result::Result<(), BoxError> {
        Ok(())
    }
}

/// Per-name cache cell
///
/// `handle` is read on every access; `connecting` is held only while a
/// connection for this name is being opened or replaced.
struct Slot<C> {
    handle: RwLock<Option<Arc<C>>>,
    connecting: Mutex<()>,
}

impl<C> Slot<C> {
    fn new() -> Self {
        Self {
            handle: RwLock::new(None),
            connecting: Mutex::new(()),
        }
    }

    fn current(&self) -> Option<Arc<C>> {
        self.handle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store(&self, handle: Arc<C>) {
        *self.handle.write().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }
}

/// Shard name -> cached connection handle
pub struct ConnectionPool<K: Connector> {
    connector: K,
    slots: DashMap<String, Arc<Slot<K::Connection>>>,
    verify: bool,
    metrics: RouterMetrics,
}

impl<K: Connector> ConnectionPool<K> {
    /// Create an empty pool
    ///
    /// # Arguments
    /// * `connector` - Opens connections on first use
    /// * `verify` - Run [`Connector::verify`] on cached handles before returning them
    /// * `metrics` - Router metrics
    pub fn new(connector: K, verify: bool, metrics: RouterMetrics) -> Self {
        Self {
            connector,
            slots: DashMap::new(),
            verify,
            metrics,
        }
    }

    /// Cached connection for `spec`, connecting on first use
    ///
    /// The map is locked only to find or insert the name's slot; connecting
    /// happens under that slot's own lock, so other names stay readable.
    pub fn connection_for(&self, spec: &ShardSpec) -> Result<Arc<K::Connection>> {
        let slot = self.slot(&spec.name);

        let Some(handle) = slot.current() else {
            return self.replace(&slot, spec, None);
        };
        if !self.verify {
            return Ok(handle);
        }

        match self.connector.verify(&handle) {
            Ok(()) => Ok(handle),
            Err(e) => {
                warn!(shard = %spec.name, error = %e, "Cached connection failed verification, reconnecting");
                self.replace(&slot, spec, Some(&handle))
            }
        }
    }

    fn slot(&self, name: &str) -> Arc<Slot<K::Connection>> {
        if let Some(slot) = self.slots.get(name) {
            return Arc::clone(slot.value());
        }
        Arc::clone(
            self.slots
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Slot::new()))
                .value(),
        )
    }

    /// Open a handle unless another thread already replaced `stale`
    fn replace(
        &self,
        slot: &Slot<K::Connection>,
        spec: &ShardSpec,
        stale: Option<&Arc<K::Connection>>,
    ) -> Result<Arc<K::Connection>> {
        let _connecting = slot
            .connecting
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(current) = slot.current() {
            let still_stale = stale.is_some_and(|s| Arc::ptr_eq(s, &current));
            if !still_stale {
                return Ok(current);
            }
        }

        let handle = Arc::new(self.open(spec)?);
        slot.store(Arc::clone(&handle));
        Ok(handle)
    }

    fn open(&self, spec: &ShardSpec) -> Result<K::Connection> {
        match self.connector.connect(spec) {
            Ok(connection) => {
                info!(shard = %spec.name, adapter = %spec.adapter(), "Connected to shard");
                self.metrics.record_connection(&spec.name);
                Ok(connection)
            }
            Err(source) => {
                let err = ShardError::ConnectionFailed {
                    shard: spec.name.clone(),
                    source,
                };
                self.metrics.record_error(&err);
                warn!(shard = %spec.name, error = %err, "Failed to connect to shard");
                Err(err)
            }
        }
    }

    /// Whether a handle is cached for `name`
    pub fn is_connected(&self, name: &str) -> bool {
        self.slots
            .get(name)
            .is_some_and(|slot| slot.current().is_some())
    }

    /// Number of cached handles
    pub fn connection_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.current().is_some())
            .count()
    }

    /// Drop every cached handle
    pub fn disconnect_all(&self) {
        let count = self.connection_count();
        self.slots.clear();
        info!(count, "Connection pool cleared");
    }

    /// Access the connector
    pub fn connector(&self) -> &K {
        &self.connector
    }
}
