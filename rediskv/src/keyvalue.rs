//! Core KeyValueDb implementation.

use std::sync::Arc;

use bytes::Bytes;
use common::Connection;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{ClearOptions, ConnectionSource, OpenOptions, ScanOptions};
use crate::error::{Error, Result};
use crate::iterator::{
    BufferedIterator, FetchStrategy, KeyIterator, KeyValueIterator, ValueIterator,
};
use crate::location::Location;
use crate::model::{BatchOp, StoreStatus};
use crate::registry::{ConnectionLease, ConnectionRegistry, resolve};
use crate::storage::KeyValueStorage;

/// An ordered key-value store at one location of a Redis server.
///
/// Keys live in a sorted set (`<location>:ordering`) whose members all
/// share one score, so the set orders purely by key bytes; values live in a
/// hash (`<location>:values`). Every write touches both inside one atomic
/// command group, and every range fetch reads both in one atomic script
/// call.
///
/// All methods take `&self`; a store can be shared across tasks behind an
/// `Arc`. Call [`close`](KeyValueDb::close) when done so a pooled connection
/// can be released.
///
/// # Example
///
/// ```ignore
/// use rediskv::{KeyValueDb, OpenOptions, ScanOptions};
/// use bytes::Bytes;
///
/// let kv = KeyValueDb::open("users", OpenOptions::default()).await?;
///
/// kv.put(Bytes::from("user:123"), Bytes::from("alice")).await?;
/// assert_eq!(kv.get(Bytes::from("user:123")).await?, Bytes::from("alice"));
///
/// let mut iter = kv.iterator(ScanOptions::prefix("user:")).await?;
/// while let Some(entry) = iter.next().await? {
///     println!("{:?}: {:?}", entry.key, entry.value);
/// }
///
/// kv.close().await?;
/// ```
pub struct KeyValueDb {
    location: Location,
    storage: KeyValueStorage,
    lease: Mutex<Option<ConnectionLease>>,
    /// Cancelled on close; every iterator holds a child token.
    shutdown: CancellationToken,
    high_water_mark: usize,
}

impl KeyValueDb {
    /// Opens the store at `location`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an empty location or bad
    /// options, and [`Error::Connection`] if the server cannot be reached.
    pub async fn open(location: &str, options: OpenOptions) -> Result<Self> {
        let location = Location::parse(location)?;
        options.validate()?;

        let registry = options
            .registry
            .clone()
            .unwrap_or_else(ConnectionRegistry::global);
        let resolved = resolve(&options.connection, options.own_client, &registry).await?;
        let storage = KeyValueStorage::new(resolved.connection, &location);

        let clear = options.clear_on_open && resolved.created;
        if let Err(e) = Self::prepare(&storage, clear).await {
            resolved.lease.release().await;
            return Err(e);
        }

        tracing::debug!(location = location.as_str(), cleared = clear, "opened store");
        Ok(Self {
            location,
            storage,
            lease: Mutex::new(Some(resolved.lease)),
            shutdown: CancellationToken::new(),
            high_water_mark: options.high_water_mark,
        })
    }

    async fn prepare(storage: &KeyValueStorage, clear: bool) -> Result<()> {
        storage.connection().prepare().await?;
        if clear {
            storage.drop_all().await?;
        }
        Ok(())
    }

    /// Closes the store and ends all of its iterators. Later calls on the
    /// store fail with [`Error::Closed`]. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        let Some(lease) = self.lease.lock().await.take() else {
            return Ok(());
        };
        self.shutdown.cancel();
        lease.release().await;
        tracing::debug!(location = self.location.as_str(), "closed store");
        Ok(())
    }

    pub fn status(&self) -> StoreStatus {
        if self.shutdown.is_cancelled() {
            StoreStatus::Closed
        } else {
            StoreStatus::Open
        }
    }

    /// The sanitized location.
    pub fn location(&self) -> &str {
        self.location.as_str()
    }

    /// The underlying connection, possibly shared with other stores.
    pub fn connection(&self) -> Arc<dyn Connection> {
        Arc::clone(self.storage.connection())
    }

    /// Gets the value of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the key does not exist. A key stored
    /// with an empty value is found and yields an empty value.
    pub async fn get(&self, key: Bytes) -> Result<Bytes> {
        self.ensure_open()?;
        match self.storage.get(key.clone()).await? {
            Some(value) => Ok(value),
            None => Err(Error::NotFound(format!(
                "key {:?} in {}",
                key,
                self.location.as_str()
            ))),
        }
    }

    /// Gets the values of `keys`, aligned by position; missing keys are `None`.
    pub async fn get_many(&self, keys: Vec<Bytes>) -> Result<Vec<Option<Bytes>>> {
        self.ensure_open()?;
        self.storage.get_many(keys).await
    }

    /// Puts a key-value pair, overwriting any existing value.
    pub async fn put(&self, key: Bytes, value: Bytes) -> Result<()> {
        self.ensure_open()?;
        self.storage.put(key, value).await
    }

    /// Deletes a key. No-op if the key does not exist.
    pub async fn delete(&self, key: Bytes) -> Result<()> {
        self.ensure_open()?;
        self.storage.delete(key).await
    }

    /// Applies `ops` in order as one atomic unit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedOperation`] without applying anything if
    /// any op is [`BatchOp::Unsupported`].
    pub async fn batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        self.ensure_open()?;
        self.storage.apply(ops).await
    }

    /// Iterates key-value entries in the range described by `options`.
    pub async fn iterator(&self, options: ScanOptions) -> Result<KeyValueIterator> {
        self.scan(&options)
    }

    /// Iterates keys only.
    pub async fn keys(&self, options: ScanOptions) -> Result<KeyIterator> {
        self.scan(&options)
    }

    /// Iterates values only, in key order.
    pub async fn values(&self, options: ScanOptions) -> Result<ValueIterator> {
        self.scan(&options)
    }

    fn scan<S: FetchStrategy>(&self, options: &ScanOptions) -> Result<BufferedIterator<S>> {
        self.ensure_open()?;
        BufferedIterator::new(
            self.storage.clone(),
            options,
            self.high_water_mark,
            self.shutdown.child_token(),
        )
    }

    /// Removes keys.
    ///
    /// With no range and no limit both structures are dropped in one step.
    /// Otherwise matching keys are deleted page by page, each page atomically;
    /// a failure stops the clear with earlier pages already removed.
    pub async fn clear(&self, options: ClearOptions) -> Result<()> {
        self.ensure_open()?;
        let page = options.page_size(self.high_water_mark)?;
        if !options.range.has_range() && options.range.limit.is_none() {
            return self.storage.drop_all().await;
        }

        let mut range = options.range;
        range.high_water_mark = Some(page);
        let mut keys: KeyIterator = self.scan(&range)?;
        let result = self.delete_pages(&mut keys, page).await;
        keys.close();
        result
    }

    async fn delete_pages(&self, keys: &mut KeyIterator, page: usize) -> Result<()> {
        loop {
            let batch = keys.next_batch(page).await?;
            if batch.is_empty() {
                return Ok(());
            }
            tracing::trace!(count = batch.len(), "clearing page");
            self.storage.delete_keys(batch).await?;
        }
    }

    /// Removes all data at this location. The store stays open.
    pub async fn destroy(&self) -> Result<()> {
        self.ensure_open()?;
        self.storage.drop_all().await
    }

    /// Removes all data at `location` without opening a store there.
    ///
    /// An adopted client is used as-is; otherwise a temporary dedicated
    /// connection is opened and closed again.
    pub async fn destroy_location(location: &str, source: ConnectionSource) -> Result<()> {
        let location = Location::parse(location)?;
        let resolved = resolve(&source, true, &ConnectionRegistry::global()).await?;
        let result = KeyValueStorage::new(resolved.connection, &location)
            .drop_all()
            .await;
        resolved.lease.release().await;
        tracing::debug!(location = location.as_str(), "destroyed location");
        result
    }

    /// Closes every connection in the process-wide registry.
    pub async fn reset() {
        ConnectionRegistry::global().reset().await
    }

    /// Number of connections in the process-wide registry.
    pub async fn connection_count() -> usize {
        ConnectionRegistry::global().connection_count().await
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }
        Ok(())
    }
}
