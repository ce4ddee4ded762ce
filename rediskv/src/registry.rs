//! Shared connection pooling across stores.
//!
//! Stores opened against the same server share one physical connection.
//! The [`ConnectionRegistry`] keys pooled connections by a hash of the
//! normalized connection parameters and tracks which stores use each one;
//! a connection is closed when its last store leaves.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use common::{Connection, ConnectionConfig, create_connection};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::config::ConnectionSource;
use crate::error::Result;

static GLOBAL: OnceLock<Arc<ConnectionRegistry>> = OnceLock::new();

/// Stable identity of a physical connection: the hex SHA-256 of the
/// normalized parameters that decide which server and session it reaches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ConnectionId(String);

impl ConnectionId {
    pub(crate) fn of(config: &ConnectionConfig) -> Self {
        let mut hasher = Sha256::new();
        for (name, value) in config.identity_fields() {
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
        Self(format!("{:x}", hasher.finalize()))
    }
}

type StoreId = u64;

struct Pooled {
    connection: Arc<dyn Connection>,
    stores: HashSet<StoreId>,
}

/// Pool of shared connections, reference-counted by the stores using them.
///
/// [`ConnectionRegistry::global`] is used unless a store is opened with an
/// explicit registry, which keeps tests from sharing state.
#[derive(Default)]
pub struct ConnectionRegistry {
    pools: Mutex<HashMap<ConnectionId, Pooled>>,
    next_store: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> Arc<ConnectionRegistry> {
        GLOBAL
            .get_or_init(|| Arc::new(ConnectionRegistry::new()))
            .clone()
    }

    /// Number of pooled physical connections.
    pub async fn connection_count(&self) -> usize {
        self.pools.lock().await.len()
    }

    /// Closes every pooled connection and forgets all memberships.
    ///
    /// Stores still holding a pooled connection see
    /// [`Error::Closed`](crate::Error::Closed) on their next call. Close
    /// failures are logged and otherwise ignored.
    pub async fn reset(&self) {
        let pools: Vec<(ConnectionId, Pooled)> = self.pools.lock().await.drain().collect();
        for (id, pooled) in pools {
            tracing::debug!(
                connection = %id.0,
                stores = pooled.stores.len(),
                "resetting pooled connection"
            );
            if let Err(e) = pooled.connection.close().await {
                tracing::warn!(connection = %id.0, error = %e, "failed to close pooled connection");
            }
        }
    }

    /// Joins the pooled connection for `config`, creating it if needed.
    /// Returns the lease and whether the connection was created by this call.
    ///
    /// The pool lock is not held while connecting. When two joins race to
    /// create the same connection, the later one closes its own and joins
    /// the winner's.
    async fn join(
        self: &Arc<Self>,
        config: &ConnectionConfig,
    ) -> Result<(Arc<dyn Connection>, ConnectionLease, bool)> {
        let id = ConnectionId::of(config);
        let store = self.next_store.fetch_add(1, Ordering::Relaxed);

        loop {
            if let Some(connection) = self.attach(&id, store).await {
                return Ok((connection, self.lease(id, store), false));
            }

            let connection = create_connection(config).await?;
            let mut pools = self.pools.lock().await;
            let raced = pools
                .get(&id)
                .is_some_and(|pooled| !pooled.connection.is_closed());
            if raced {
                drop(pools);
                if let Err(e) = connection.close().await {
                    tracing::warn!(connection = %id.0, error = %e, "failed to close surplus connection");
                }
                continue;
            }

            // A pooled connection closed behind the registry's back is replaced.
            pools.insert(
                id.clone(),
                Pooled {
                    connection: Arc::clone(&connection),
                    stores: HashSet::from([store]),
                },
            );
            tracing::debug!(connection = %id.0, store, "created pooled connection");
            return Ok((connection, self.lease(id, store), true));
        }
    }

    /// Adds `store` to a live pooled connection for `id`, if there is one.
    async fn attach(&self, id: &ConnectionId, store: StoreId) -> Option<Arc<dyn Connection>> {
        let mut pools = self.pools.lock().await;
        let pooled = pools
            .get_mut(id)
            .filter(|pooled| !pooled.connection.is_closed())?;
        pooled.stores.insert(store);
        tracing::debug!(
            connection = %id.0,
            store,
            stores = pooled.stores.len(),
            "joined pooled connection"
        );
        Some(Arc::clone(&pooled.connection))
    }

    fn lease(self: &Arc<Self>, id: ConnectionId, store: StoreId) -> ConnectionLease {
        ConnectionLease::Shared {
            registry: Arc::clone(self),
            id,
            store,
        }
    }

    async fn leave(&self, id: &ConnectionId, store: StoreId) {
        let mut pools = self.pools.lock().await;
        let Some(pooled) = pools.get_mut(id) else {
            return;
        };
        if !pooled.stores.remove(&store) {
            return;
        }
        tracing::debug!(
            connection = %id.0,
            store,
            stores = pooled.stores.len(),
            "left pooled connection"
        );
        if !pooled.stores.is_empty() {
            return;
        }
        if let Some(pooled) = pools.remove(id) {
            drop(pools);
            tracing::debug!(connection = %id.0, "closing idle pooled connection");
            if let Err(e) = pooled.connection.close().await {
                tracing::warn!(connection = %id.0, error = %e, "failed to close pooled connection");
            }
        }
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ConnectionRegistry");
        match self.pools.try_lock() {
            Ok(pools) => debug.field("connections", &pools.len()),
            Err(_) => debug.field("connections", &".."),
        };
        debug.finish_non_exhaustive()
    }
}

/// How a store holds its connection, and therefore what closing the store
/// does to it.
pub(crate) enum ConnectionLease {
    /// Caller-owned; left open.
    External,
    /// Owned by the store; closed with it.
    Dedicated(Arc<dyn Connection>),
    /// Pooled; the store leaves the pool.
    Shared {
        registry: Arc<ConnectionRegistry>,
        id: ConnectionId,
        store: StoreId,
    },
}

impl ConnectionLease {
    /// Gives the connection back. Never fails; close errors are logged.
    pub(crate) async fn release(self) {
        match self {
            ConnectionLease::External => {}
            ConnectionLease::Dedicated(connection) => {
                if let Err(e) = connection.close().await {
                    tracing::warn!(error = %e, "failed to close dedicated connection");
                }
            }
            ConnectionLease::Shared {
                registry,
                id,
                store,
            } => registry.leave(&id, store).await,
        }
    }
}

/// A connection resolved for one store.
pub(crate) struct Resolved {
    pub(crate) connection: Arc<dyn Connection>,
    pub(crate) lease: ConnectionLease,
    /// The physical connection did not exist before this call.
    pub(crate) created: bool,
}

/// Picks the connection for a store: an adopted client, a dedicated
/// connection, or the pooled one for the same server.
pub(crate) async fn resolve(
    source: &ConnectionSource,
    own_client: bool,
    registry: &Arc<ConnectionRegistry>,
) -> Result<Resolved> {
    let config = match source {
        ConnectionSource::Client(connection) => {
            return Ok(Resolved {
                connection: Arc::clone(connection),
                lease: ConnectionLease::External,
                created: false,
            });
        }
        ConnectionSource::Url(url) => ConnectionConfig::from_url(url)?,
        ConnectionSource::Config(config) => config.clone(),
    };

    if own_client {
        let connection = create_connection(&config).await?;
        tracing::debug!("opened dedicated connection");
        return Ok(Resolved {
            lease: ConnectionLease::Dedicated(Arc::clone(&connection)),
            connection,
            created: true,
        });
    }

    let (connection, lease, created) = registry.join(&config).await?;
    Ok(Resolved {
        connection,
        lease,
        created,
    })
}
