pub mod config;
pub mod factory;
pub mod in_memory;
pub mod redis_connection;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};

/// A mutating command against one backing structure.
///
/// Commands are never sent one by one: a `Vec<Command>` handed to
/// [`Connection::exec`] is applied as a single all-or-nothing group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Sets `field` to `value` in the hash `key`.
    HashSet {
        key: String,
        field: Bytes,
        value: Bytes,
    },
    /// Removes `field` from the hash `key`.
    HashDel { key: String, field: Bytes },
    /// Adds `member` to the sorted set `key` with a score of zero, so the
    /// set orders purely by member bytes.
    SortedAdd { key: String, member: Bytes },
    /// Removes `member` from the sorted set `key`.
    SortedRem { key: String, member: Bytes },
    /// Drops whole structures.
    Delete { keys: Vec<String> },
}

/// A bound in the server's lexicographic range syntax.
///
/// `Min` and `Max` are the `-` / `+` sentinels: smaller (larger) than every
/// possible member. `Inclusive` and `Exclusive` encode as `[key` and `(key`;
/// an empty key is still a concrete bound.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LexBound {
    Min,
    Max,
    Inclusive(Bytes),
    Exclusive(Bytes),
}

impl LexBound {
    /// Encodes the bound as a command argument.
    pub fn encode(&self) -> Bytes {
        match self {
            LexBound::Min => Bytes::from_static(b"-"),
            LexBound::Max => Bytes::from_static(b"+"),
            LexBound::Inclusive(key) => prefixed(b'[', key),
            LexBound::Exclusive(key) => prefixed(b'(', key),
        }
    }
}

fn prefixed(tag: u8, key: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + key.len());
    buf.put_u8(tag);
    buf.extend_from_slice(key);
    buf.freeze()
}

/// What a range fetch returns for each matching ordering entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Projection {
    /// Keys only; no value lookup.
    Keys,
    /// Values only; keys are looked up but dropped from the output.
    Values,
    /// Keys paired with their values.
    Pairs,
}

/// A single range fetch against an ordering/value structure pair.
#[derive(Clone, Debug)]
pub struct RangeQuery {
    /// Sorted set holding the keys.
    pub ordering: String,
    /// Hash holding key → value.
    pub values: String,
    pub projection: Projection,
    /// Scans from `start` towards `end` in descending order when set.
    /// `start` is then the upper bound.
    pub reverse: bool,
    pub start: LexBound,
    pub end: LexBound,
    /// Maximum number of ordering entries to return.
    pub count: usize,
}

/// The reply of one range fetch.
///
/// Values are `None` only when the ordering structure holds a key the value
/// structure does not, which mutations through this layer never produce.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchedRange {
    Keys(Vec<Bytes>),
    Values {
        values: Vec<Option<Bytes>>,
        last_key: Option<Bytes>,
    },
    Pairs(Vec<(Bytes, Option<Bytes>)>),
}

impl FetchedRange {
    /// Number of ordering entries the fetch matched.
    pub fn len(&self) -> usize {
        match self {
            FetchedRange::Keys(keys) => keys.len(),
            FetchedRange::Values { values, .. } => values.len(),
            FetchedRange::Pairs(pairs) => pairs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The last key observed, from which a follow-up fetch resumes.
    pub fn last_key(&self) -> Option<&Bytes> {
        match self {
            FetchedRange::Keys(keys) => keys.last(),
            FetchedRange::Values { last_key, .. } => last_key.as_ref(),
            FetchedRange::Pairs(pairs) => pairs.last().map(|(key, _)| key),
        }
    }
}

/// Error type for backing-server operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Transport or server-side failure.
    Connection(String),
    /// The connection was already closed.
    Closed,
    /// Unusable connection parameters.
    InvalidInput(String),
    /// Malformed reply or broken invariant.
    Internal(String),
}

impl std::error::Error for StorageError {}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            StorageError::Connection(msg) => write!(f, "Connection error: {}", msg),
            StorageError::Closed => write!(f, "Connection is closed"),
            StorageError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            StorageError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl StorageError {
    /// Converts a transport error to StorageError::Connection.
    pub fn from_connection(e: impl std::fmt::Display) -> Self {
        StorageError::Connection(e.to_string())
    }
}

/// Result type alias for backing-server operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// A physical connection to the backing data-structure server.
///
/// Implementations must apply each [`exec`](Connection::exec) group and each
/// [`fetch_range`](Connection::fetch_range) atomically: no other client's
/// command may interleave within one call.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Registers the server-side range procedures. Idempotent per connection.
    async fn prepare(&self) -> StorageResult<()>;

    /// Applies all commands as one atomic group.
    async fn exec(&self, commands: Vec<Command>) -> StorageResult<()>;

    /// Runs one atomic range fetch.
    async fn fetch_range(&self, query: RangeQuery) -> StorageResult<FetchedRange>;

    /// Reads one field of a hash.
    async fn hash_get(&self, key: &str, field: Bytes) -> StorageResult<Option<Bytes>>;

    /// Reads several fields of a hash, aligned with `fields`.
    async fn hash_get_many(
        &self,
        key: &str,
        fields: Vec<Bytes>,
    ) -> StorageResult<Vec<Option<Bytes>>>;

    /// Closes the connection. Later calls fail with [`StorageError::Closed`].
    async fn close(&self) -> StorageResult<()>;

    fn is_closed(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(LexBound::Min, b"-".as_slice())]
    #[case(LexBound::Max, b"+".as_slice())]
    #[case(LexBound::Inclusive(Bytes::from("abc")), b"[abc".as_slice())]
    #[case(LexBound::Exclusive(Bytes::from("abc")), b"(abc".as_slice())]
    #[case(LexBound::Inclusive(Bytes::new()), b"[".as_slice())]
    #[case(LexBound::Exclusive(Bytes::new()), b"(".as_slice())]
    fn should_encode_lex_bound(#[case] bound: LexBound, #[case] expected: &[u8]) {
        assert_eq!(bound.encode().as_ref(), expected);
    }

    #[test]
    fn should_report_last_key_of_each_projection() {
        let keys = FetchedRange::Keys(vec![Bytes::from("a"), Bytes::from("b")]);
        let values = FetchedRange::Values {
            values: vec![Some(Bytes::from("1"))],
            last_key: Some(Bytes::from("a")),
        };
        let pairs = FetchedRange::Pairs(vec![(Bytes::from("z"), None)]);

        assert_eq!(keys.last_key(), Some(&Bytes::from("b")));
        assert_eq!(values.last_key(), Some(&Bytes::from("a")));
        assert_eq!(pairs.last_key(), Some(&Bytes::from("z")));
        assert!(FetchedRange::Keys(vec![]).last_key().is_none());
    }
}
