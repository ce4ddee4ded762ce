use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

use super::config::InMemoryConfig;
use super::{
    Command, Connection, FetchedRange, LexBound, Projection, RangeQuery, StorageError,
    StorageResult,
};
use crate::BytesRange;

/// Hashes and sorted sets of one in-memory database.
#[derive(Default)]
struct Structures {
    hashes: HashMap<String, HashMap<Bytes, Bytes>>,
    sorted: HashMap<String, BTreeSet<Bytes>>,
}

impl Structures {
    fn apply(&mut self, command: Command) {
        match command {
            Command::HashSet { key, field, value } => {
                self.hashes.entry(key).or_default().insert(field, value);
            }
            Command::HashDel { key, field } => {
                if let Some(hash) = self.hashes.get_mut(&key) {
                    hash.remove(&field);
                    if hash.is_empty() {
                        self.hashes.remove(&key);
                    }
                }
            }
            Command::SortedAdd { key, member } => {
                self.sorted.entry(key).or_default().insert(member);
            }
            Command::SortedRem { key, member } => {
                if let Some(set) = self.sorted.get_mut(&key) {
                    set.remove(&member);
                    if set.is_empty() {
                        self.sorted.remove(&key);
                    }
                }
            }
            Command::Delete { keys } => {
                for key in keys {
                    self.hashes.remove(&key);
                    self.sorted.remove(&key);
                }
            }
        }
    }

    fn hash_get(&self, key: &str, field: &Bytes) -> Option<Bytes> {
        self.hashes.get(key).and_then(|hash| hash.get(field)).cloned()
    }

    /// Members of `key` within the query bounds, in scan order.
    fn range(&self, query: &RangeQuery) -> Vec<Bytes> {
        let Some(set) = self.sorted.get(&query.ordering) else {
            return Vec::new();
        };
        let (lower, upper) = if query.reverse {
            (&query.end, &query.start)
        } else {
            (&query.start, &query.end)
        };
        let Some(range) = lex_range(lower, upper).filter(|range| !range.is_empty()) else {
            return Vec::new();
        };

        let matching = set.range::<Bytes, _>(range);
        if query.reverse {
            matching.rev().take(query.count).cloned().collect()
        } else {
            matching.take(query.count).cloned().collect()
        }
    }
}

/// Converts lower/upper lex bounds into a byte range. Returns `None` when a
/// sentinel points the wrong way (`+` as lower bound, `-` as upper bound),
/// which matches nothing.
fn lex_range(lower: &LexBound, upper: &LexBound) -> Option<BytesRange> {
    let start = match lower {
        LexBound::Min => Bound::Unbounded,
        LexBound::Max => return None,
        LexBound::Inclusive(key) => Bound::Included(key.clone()),
        LexBound::Exclusive(key) => Bound::Excluded(key.clone()),
    };
    let end = match upper {
        LexBound::Max => Bound::Unbounded,
        LexBound::Min => return None,
        LexBound::Inclusive(key) => Bound::Included(key.clone()),
        LexBound::Exclusive(key) => Bound::Excluded(key.clone()),
    };
    Some(BytesRange::new(start, end))
}

/// In-memory implementation of [`Connection`].
///
/// Every command group and every range fetch runs under a single lock
/// acquisition, which gives the same atomicity the Redis implementation gets
/// from MULTI/EXEC and Lua scripts. Data belongs to the connection: stores
/// sharing one `InMemoryConnection` see each other's writes, a fresh
/// connection starts empty.
pub struct InMemoryConnection {
    config: InMemoryConfig,
    data: RwLock<Structures>,
    closed: AtomicBool,
}

impl InMemoryConnection {
    pub fn new(config: InMemoryConfig) -> Self {
        Self {
            config,
            data: RwLock::new(Structures::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &InMemoryConfig {
        &self.config
    }

    /// Number of hash and sorted-set structures currently held.
    pub fn structure_count(&self) -> usize {
        self.data
            .read()
            .map(|data| data.hashes.len() + data.sorted.len())
            .unwrap_or(0)
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    fn read(&self) -> StorageResult<std::sync::RwLockReadGuard<'_, Structures>> {
        self.ensure_open()?;
        self.data
            .read()
            .map_err(|e| StorageError::Internal(format!("Failed to acquire read lock: {}", e)))
    }
}

impl Default for InMemoryConnection {
    fn default() -> Self {
        Self::new(InMemoryConfig::default())
    }
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn prepare(&self) -> StorageResult<()> {
        self.ensure_open()
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn exec(&self, commands: Vec<Command>) -> StorageResult<()> {
        self.ensure_open()?;
        let mut data = self
            .data
            .write()
            .map_err(|e| StorageError::Internal(format!("Failed to acquire write lock: {}", e)))?;
        for command in commands {
            data.apply(command);
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn fetch_range(&self, query: RangeQuery) -> StorageResult<FetchedRange> {
        let data = self.read()?;
        let keys = data.range(&query);

        let fetched = match query.projection {
            Projection::Keys => FetchedRange::Keys(keys),
            Projection::Values => FetchedRange::Values {
                values: keys
                    .iter()
                    .map(|key| data.hash_get(&query.values, key))
                    .collect(),
                last_key: keys.last().cloned(),
            },
            Projection::Pairs => FetchedRange::Pairs(
                keys.into_iter()
                    .map(|key| {
                        let value = data.hash_get(&query.values, &key);
                        (key, value)
                    })
                    .collect(),
            ),
        };
        Ok(fetched)
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn hash_get(&self, key: &str, field: Bytes) -> StorageResult<Option<Bytes>> {
        Ok(self.read()?.hash_get(key, &field))
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn hash_get_many(
        &self,
        key: &str,
        fields: Vec<Bytes>,
    ) -> StorageResult<Vec<Option<Bytes>>> {
        let data = self.read()?;
        Ok(fields.iter().map(|field| data.hash_get(key, field)).collect())
    }

    async fn close(&self) -> StorageResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
