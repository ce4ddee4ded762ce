//! Ordering/value structure pair for one location.
//!
//! [`KeyValueStorage`] is the only place mutations are turned into backing
//! commands. Every key write or removal touches both structures inside one
//! atomic command group, so neither ever holds a key the other lacks.

use std::sync::Arc;

use bytes::Bytes;
use common::{Command, Connection, FetchedRange, Projection, RangeQuery};

use crate::error::{Error, Result};
use crate::location::Location;
use crate::model::BatchOp;
use crate::range::ScanRange;

#[derive(Clone)]
pub(crate) struct KeyValueStorage {
    connection: Arc<dyn Connection>,
    ordering: String,
    values: String,
}

impl KeyValueStorage {
    pub(crate) fn new(connection: Arc<dyn Connection>, location: &Location) -> Self {
        Self {
            connection,
            ordering: location.ordering(),
            values: location.values(),
        }
    }

    pub(crate) fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub(crate) async fn put(&self, key: Bytes, value: Bytes) -> Result<()> {
        let mut commands = Vec::with_capacity(2);
        self.push_put(&mut commands, key, value);
        self.exec(commands).await
    }

    pub(crate) async fn delete(&self, key: Bytes) -> Result<()> {
        let mut commands = Vec::with_capacity(2);
        self.push_delete(&mut commands, key);
        self.exec(commands).await
    }

    /// Applies all operations as one atomic group. An unsupported operation
    /// rejects the batch before anything is sent.
    pub(crate) async fn apply(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut commands = Vec::with_capacity(ops.len() * 2);
        for (position, op) in ops.into_iter().enumerate() {
            match op {
                BatchOp::Put { key, value } => {
                    self.push_put(&mut commands, key, value.unwrap_or_default())
                }
                BatchOp::Delete { key } => self.push_delete(&mut commands, key),
                BatchOp::Unsupported => {
                    return Err(Error::UnsupportedOperation(format!(
                        "batch operation at position {} is neither put nor del",
                        position
                    )));
                }
            }
        }
        self.exec(commands).await
    }

    /// Removes `keys` from both structures in one atomic group.
    pub(crate) async fn delete_keys(&self, keys: Vec<Bytes>) -> Result<()> {
        let mut commands = Vec::with_capacity(keys.len() * 2);
        for key in keys {
            self.push_delete(&mut commands, key);
        }
        self.exec(commands).await
    }

    /// Drops both structures.
    pub(crate) async fn drop_all(&self) -> Result<()> {
        self.exec(vec![Command::Delete {
            keys: vec![self.ordering.clone(), self.values.clone()],
        }])
        .await
    }

    pub(crate) async fn get(&self, key: Bytes) -> Result<Option<Bytes>> {
        Ok(self.connection.hash_get(&self.values, key).await?)
    }

    pub(crate) async fn get_many(&self, keys: Vec<Bytes>) -> Result<Vec<Option<Bytes>>> {
        Ok(self.connection.hash_get_many(&self.values, keys).await?)
    }

    /// One atomic fetch of at most `count` entries of `range`.
    pub(crate) async fn fetch(
        &self,
        projection: Projection,
        range: &ScanRange,
        count: usize,
    ) -> Result<FetchedRange> {
        let query = RangeQuery {
            ordering: self.ordering.clone(),
            values: self.values.clone(),
            projection,
            reverse: range.reverse,
            start: range.start.clone(),
            end: range.end.clone(),
            count,
        };
        Ok(self.connection.fetch_range(query).await?)
    }

    fn push_put(&self, commands: &mut Vec<Command>, key: Bytes, value: Bytes) {
        commands.push(Command::HashSet {
            key: self.values.clone(),
            field: key.clone(),
            value,
        });
        commands.push(Command::SortedAdd {
            key: self.ordering.clone(),
            member: key,
        });
    }

    fn push_delete(&self, commands: &mut Vec<Command>, key: Bytes) {
        commands.push(Command::HashDel {
            key: self.values.clone(),
            field: key.clone(),
        });
        commands.push(Command::SortedRem {
            key: self.ordering.clone(),
            member: key,
        });
    }

    async fn exec(&self, commands: Vec<Command>) -> Result<()> {
        Ok(self.connection.exec(commands).await?)
    }
}
