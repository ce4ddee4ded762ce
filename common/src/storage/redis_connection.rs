//! [`Connection`] backed by a Redis server.
//!
//! Command groups become MULTI/EXEC transactions. Range fetches that need
//! values run as Lua scripts so the ordering scan and the value lookups
//! happen in one atomic step; key-only fetches are a plain
//! `ZRANGEBYLEX`/`ZREVRANGEBYLEX`.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tokio::sync::OnceCell;

use super::config::RedisConfig;
use super::{
    Command, Connection, FetchedRange, Projection, RangeQuery, StorageError, StorageResult,
};

const ITER_PAIRS_SCRIPT: &str = include_str!("scripts/iter_pairs.lua");
const ITER_VALUES_SCRIPT: &str = include_str!("scripts/iter_values.lua");

pub struct RedisConnection {
    manager: RwLock<Option<ConnectionManager>>,
    iter_pairs: Script,
    iter_values: Script,
    prepared: OnceCell<()>,
}

impl RedisConnection {
    /// Connects to the server described by `config`, failing after the
    /// configured connect timeout.
    pub async fn connect(config: &RedisConfig) -> StorageResult<Self> {
        let url = config.to_url()?;
        let client = Client::open(url.as_str()).map_err(StorageError::from_connection)?;
        let timeout = Duration::from_millis(config.connect_timeout_ms);

        let manager = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                StorageError::Connection(format!(
                    "timed out after {:?} connecting to {}",
                    timeout,
                    describe(config)
                ))
            })?
            .map_err(StorageError::from_connection)?;

        tracing::debug!(server = %describe(config), db = config.db, "connected to redis");
        Ok(Self {
            manager: RwLock::new(Some(manager)),
            iter_pairs: Script::new(ITER_PAIRS_SCRIPT),
            iter_values: Script::new(ITER_VALUES_SCRIPT),
            prepared: OnceCell::new(),
        })
    }

    /// Returns a handle on the multiplexed connection.
    fn manager(&self) -> StorageResult<ConnectionManager> {
        let guard = self
            .manager
            .read()
            .map_err(|e| StorageError::Internal(format!("Failed to acquire read lock: {}", e)))?;
        guard.clone().ok_or(StorageError::Closed)
    }
}

/// Server address without credentials, for logs and errors.
fn describe(config: &RedisConfig) -> String {
    match &config.path {
        Some(path) => format!("unix:{}", path),
        None => format!("{}:{}", config.host, config.port),
    }
}

fn direction(reverse: bool) -> &'static str {
    if reverse { "1" } else { "0" }
}

fn decode_pairs(reply: Vec<Option<Vec<u8>>>) -> StorageResult<Vec<(Bytes, Option<Bytes>)>> {
    if reply.len() % 2 != 0 {
        return Err(StorageError::Internal(format!(
            "pair fetch returned an odd number of items: {}",
            reply.len()
        )));
    }
    let mut pairs = Vec::with_capacity(reply.len() / 2);
    let mut items = reply.into_iter();
    while let Some(key) = items.next() {
        let key = key.ok_or_else(|| StorageError::Internal("pair fetch returned a nil key".into()))?;
        let value = items.next().flatten();
        pairs.push((Bytes::from(key), value.map(Bytes::from)));
    }
    Ok(pairs)
}

fn decode_values(mut reply: Vec<Option<Vec<u8>>>) -> StorageResult<FetchedRange> {
    let Some(last) = reply.pop() else {
        return Ok(FetchedRange::Values {
            values: Vec::new(),
            last_key: None,
        });
    };
    let last_key = last
        .ok_or_else(|| StorageError::Internal("value fetch returned a nil cursor key".into()))?;
    Ok(FetchedRange::Values {
        values: reply.into_iter().map(|v| v.map(Bytes::from)).collect(),
        last_key: Some(Bytes::from(last_key)),
    })
}

#[async_trait]
impl Connection for RedisConnection {
    async fn prepare(&self) -> StorageResult<()> {
        self.prepared
            .get_or_try_init(|| async {
                let mut conn = self.manager()?;
                for script in [&self.iter_pairs, &self.iter_values] {
                    script
                        .prepare_invoke()
                        .load_async(&mut conn)
                        .await
                        .map_err(StorageError::from_connection)?;
                }
                tracing::debug!("registered range scripts");
                Ok::<(), StorageError>(())
            })
            .await?;
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn exec(&self, commands: Vec<Command>) -> StorageResult<()> {
        if commands.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for command in &commands {
            match command {
                Command::HashSet { key, field, value } => {
                    pipe.cmd("HSET")
                        .arg(key)
                        .arg(field.as_ref())
                        .arg(value.as_ref())
                        .ignore();
                }
                Command::HashDel { key, field } => {
                    pipe.cmd("HDEL").arg(key).arg(field.as_ref()).ignore();
                }
                Command::SortedAdd { key, member } => {
                    pipe.cmd("ZADD").arg(key).arg(0).arg(member.as_ref()).ignore();
                }
                Command::SortedRem { key, member } => {
                    pipe.cmd("ZREM").arg(key).arg(member.as_ref()).ignore();
                }
                Command::Delete { keys } => {
                    pipe.cmd("DEL").arg(keys).ignore();
                }
            }
        }

        let mut conn = self.manager()?;
        let () = pipe
            .query_async(&mut conn)
            .await
            .map_err(StorageError::from_connection)?;
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn fetch_range(&self, query: RangeQuery) -> StorageResult<FetchedRange> {
        let mut conn = self.manager()?;
        let start = query.start.encode();
        let end = query.end.encode();

        let script = match query.projection {
            Projection::Keys => {
                let name = if query.reverse {
                    "ZREVRANGEBYLEX"
                } else {
                    "ZRANGEBYLEX"
                };
                let mut cmd = redis::cmd(name);
                cmd.arg(&query.ordering)
                    .arg(start.as_ref())
                    .arg(end.as_ref())
                    .arg("LIMIT")
                    .arg(0)
                    .arg(query.count);
                let keys: Vec<Vec<u8>> = cmd
                    .query_async(&mut conn)
                    .await
                    .map_err(StorageError::from_connection)?;
                return Ok(FetchedRange::Keys(keys.into_iter().map(Bytes::from).collect()));
            }
            Projection::Values => &self.iter_values,
            Projection::Pairs => &self.iter_pairs,
        };

        let mut invocation = script.prepare_invoke();
        invocation
            .key(&query.ordering)
            .key(&query.values)
            .arg(direction(query.reverse))
            .arg(start.as_ref())
            .arg(end.as_ref())
            .arg(query.count);
        let reply: Vec<Option<Vec<u8>>> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(StorageError::from_connection)?;

        match query.projection {
            Projection::Pairs => decode_pairs(reply).map(FetchedRange::Pairs),
            _ => decode_values(reply),
        }
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn hash_get(&self, key: &str, field: Bytes) -> StorageResult<Option<Bytes>> {
        let mut conn = self.manager()?;
        let mut cmd = redis::cmd("HGET");
        cmd.arg(key).arg(field.as_ref());
        let value: Option<Vec<u8>> = cmd
            .query_async(&mut conn)
            .await
            .map_err(StorageError::from_connection)?;
        Ok(value.map(Bytes::from))
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn hash_get_many(
        &self,
        key: &str,
        fields: Vec<Bytes>,
    ) -> StorageResult<Vec<Option<Bytes>>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.manager()?;
        let mut cmd = redis::cmd("HMGET");
        cmd.arg(key);
        for field in &fields {
            cmd.arg(field.as_ref());
        }
        let values: Vec<Option<Vec<u8>>> = cmd
            .query_async(&mut conn)
            .await
            .map_err(StorageError::from_connection)?;
        Ok(values.into_iter().map(|v| v.map(Bytes::from)).collect())
    }

    async fn close(&self) -> StorageResult<()> {
        let mut guard = self
            .manager
            .write()
            .map_err(|e| StorageError::Internal(format!("Failed to acquire write lock: {}", e)))?;
        // In-flight calls keep their own clone; the socket closes once they finish.
        guard.take();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.manager.read().map(|m| m.is_none()).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(s: &str) -> Option<Vec<u8>> {
        Some(s.as_bytes().to_vec())
    }

    #[test]
    fn should_decode_flat_pair_reply() {
        // given
        let reply = vec![item("a"), item("1"), item("b"), None];

        // when
        let pairs = decode_pairs(reply).unwrap();

        // then
        assert_eq!(
            pairs,
            vec![
                (Bytes::from("a"), Some(Bytes::from("1"))),
                (Bytes::from("b"), None),
            ]
        );
    }

    #[test]
    fn should_reject_odd_pair_reply() {
        let result = decode_pairs(vec![item("a")]);

        assert!(matches!(result, Err(StorageError::Internal(_))));
    }

    #[test]
    fn should_split_cursor_key_from_value_reply() {
        // given
        let reply = vec![item("1"), item(""), item("b")];

        // when
        let fetched = decode_values(reply).unwrap();

        // then
        assert_eq!(
            fetched,
            FetchedRange::Values {
                values: vec![Some(Bytes::from("1")), Some(Bytes::new())],
                last_key: Some(Bytes::from("b")),
            }
        );
    }

    #[test]
    fn should_decode_empty_value_reply() {
        let fetched = decode_values(vec![]).unwrap();

        assert!(fetched.is_empty());
        assert!(fetched.last_key().is_none());
    }

    #[test]
    fn should_describe_server_without_credentials() {
        let config = RedisConfig {
            password: Some("secret".to_string()),
            ..RedisConfig::default()
        };

        assert_eq!(describe(&config), "127.0.0.1:6379");
    }
}
