//! Backing-server layer for the rediskv crates.
//!
//! Models the remote data-structure server as the [`Connection`] capability:
//! atomic command groups, atomic lexicographic range fetches over a sorted
//! set paired with a hash, and single/multi field hash reads. Two
//! implementations are provided, one for Redis and one in memory.

pub mod bytes;
pub mod storage;

pub use crate::bytes::{BytesRange, lex_increment};
pub use storage::config::{ConnectionConfig, InMemoryConfig, RedisConfig};
pub use storage::factory::create_connection;
pub use storage::in_memory::InMemoryConnection;
pub use storage::redis_connection::RedisConnection;
pub use storage::{
    Command, Connection, FetchedRange, LexBound, Projection, RangeQuery, StorageError,
    StorageResult,
};
