//! rediskv - An ordered key-value store on top of Redis.
//!
//! Redis has no native ordered map with byte keys and values, so each store
//! keeps two structures under its location: a sorted set whose members are
//! the keys (all with score 0, so `ZRANGEBYLEX` walks them in byte order)
//! and a hash mapping each key to its value.
//!
//! # Architecture
//!
//! - Writes go through one atomic command group that updates both
//!   structures, so neither ever holds a key the other lacks.
//! - Scans are served by a [`BufferedIterator`] that pulls batches through
//!   an atomic server-side script, pairing keys and values in one round trip,
//!   and resumes each batch just after the last key it saw.
//! - Stores pointing at the same server share one physical connection
//!   through a reference-counted [`ConnectionRegistry`].
//!
//! # Example
//!
//! ```ignore
//! use rediskv::{BatchOp, KeyValueDb, OpenOptions, ScanOptions};
//! use bytes::Bytes;
//!
//! let kv = KeyValueDb::open("users", OpenOptions::default()).await?;
//!
//! kv.batch(vec![
//!     BatchOp::put("user:123", "alice"),
//!     BatchOp::put("user:456", "bob"),
//! ])
//! .await?;
//!
//! let mut iter = kv.iterator(ScanOptions::prefix("user:").reverse()).await?;
//! while let Some(entry) = iter.next().await? {
//!     println!("{:?}: {:?}", entry.key, entry.value);
//! }
//!
//! kv.close().await?;
//! ```

mod config;
mod error;
mod iterator;
mod keyvalue;
mod location;
mod model;
mod range;
mod registry;
mod storage;

pub use config::{
    ALL_BATCH_SIZE, ClearOptions, ConnectionSource, DEFAULT_HIGH_WATER_MARK, OpenOptions,
    ScanOptions,
};
pub use error::{Error, Result};
pub use iterator::{
    BufferedIterator, FetchStrategy, IteratorCloser, KeyIterator, KeyValueIterator, KeysOnly,
    Pairs, ValueIterator, ValuesOnly,
};
pub use keyvalue::KeyValueDb;
pub use model::{BatchOp, KeyValueEntry, StoreStatus};
pub use registry::ConnectionRegistry;
