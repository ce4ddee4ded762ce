//! Integration tests for the store against the in-memory backend.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use common::{
    Command, Connection, ConnectionConfig, FetchedRange, InMemoryConfig, InMemoryConnection,
    RangeQuery, StorageResult,
};
use proptest::prelude::*;
use rediskv::{
    BatchOp, ConnectionRegistry, ConnectionSource, Error, KeyValueDb, OpenOptions, ScanOptions,
};

fn options(registry: &Arc<ConnectionRegistry>, db: i64) -> OpenOptions {
    OpenOptions {
        connection: ConnectionSource::Config(ConnectionConfig::InMemory(InMemoryConfig { db })),
        registry: Some(Arc::clone(registry)),
        ..OpenOptions::default()
    }
}

async fn setup_test_store() -> KeyValueDb {
    let registry = Arc::new(ConnectionRegistry::new());
    KeyValueDb::open("store", options(&registry, 0))
        .await
        .expect("Failed to open store")
}

async fn put_keys(kv: &KeyValueDb, keys: &[&str]) {
    let ops = keys
        .iter()
        .map(|k| BatchOp::put(k.to_string(), format!("value-{}", k)))
        .collect();
    kv.batch(ops).await.unwrap();
}

async fn scan(kv: &KeyValueDb, options: ScanOptions) -> Vec<String> {
    kv.keys(options)
        .await
        .unwrap()
        .all()
        .await
        .unwrap()
        .into_iter()
        .map(|k| String::from_utf8(k.to_vec()).unwrap())
        .collect()
}

fn bytes(s: &str) -> Option<Bytes> {
    Some(Bytes::from(s.to_string()))
}

#[tokio::test]
async fn test_scan_scenario_with_bounds_and_reverse() {
    // Setup
    let kv = setup_test_store().await;
    put_keys(&kv, &["a", "b", "c"]).await;

    // gt excludes the bound
    let gt = ScanOptions {
        gt: bytes("a"),
        ..ScanOptions::default()
    };
    assert_eq!(scan(&kv, gt).await, vec!["b", "c"]);

    // gte includes it, lt excludes the upper one
    let gte_lt = ScanOptions {
        gte: bytes("a"),
        lt: bytes("c"),
        ..ScanOptions::default()
    };
    assert_eq!(scan(&kv, gte_lt).await, vec!["a", "b"]);

    // unbounded reverse
    assert_eq!(
        scan(&kv, ScanOptions::default().reverse()).await,
        vec!["c", "b", "a"]
    );
}

#[tokio::test]
async fn test_inclusive_and_exclusive_bounds_at_the_bound_value() {
    // Setup
    let kv = setup_test_store().await;
    put_keys(&kv, &["a", "b", "c", "d"]).await;

    let cases = [
        (ScanOptions { gt: bytes("b"), ..ScanOptions::default() }, vec!["c", "d"]),
        (ScanOptions { gte: bytes("b"), ..ScanOptions::default() }, vec!["b", "c", "d"]),
        (ScanOptions { lt: bytes("c"), ..ScanOptions::default() }, vec!["a", "b"]),
        (ScanOptions { lte: bytes("c"), ..ScanOptions::default() }, vec!["a", "b", "c"]),
        (
            ScanOptions { gt: bytes("a"), lte: bytes("c"), reverse: true, ..ScanOptions::default() },
            vec!["c", "b"],
        ),
        (
            ScanOptions { gte: bytes("b"), lt: bytes("d"), reverse: true, ..ScanOptions::default() },
            vec!["c", "b"],
        ),
    ];

    for (options, expected) in cases {
        assert_eq!(scan(&kv, options.clone()).await, expected, "{:?}", options);
    }
}

#[tokio::test]
async fn test_empty_bound_is_a_real_bound() {
    // Setup
    let kv = setup_test_store().await;
    kv.put(Bytes::new(), Bytes::from("empty-key")).await.unwrap();
    put_keys(&kv, &["a"]).await;

    // gt "" excludes only the empty key
    let gt_empty = ScanOptions {
        gt: Some(Bytes::new()),
        ..ScanOptions::default()
    };
    assert_eq!(scan(&kv, gt_empty).await, vec!["a"]);

    // lte "" matches only the empty key
    let lte_empty = ScanOptions {
        lte: Some(Bytes::new()),
        ..ScanOptions::default()
    };
    assert_eq!(scan(&kv, lte_empty).await, vec![""]);
}

#[tokio::test]
async fn test_empty_value_is_not_a_missing_key() {
    // Setup
    let kv = setup_test_store().await;

    kv.put(Bytes::from("empty"), Bytes::new()).await.unwrap();
    assert_eq!(kv.get(Bytes::from("empty")).await.unwrap(), Bytes::new());

    kv.delete(Bytes::from("empty")).await.unwrap();
    let result = kv.get(Bytes::from("empty")).await;
    assert!(matches!(result, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_unsupported_batch_leaves_store_unchanged() {
    // Setup
    let kv = setup_test_store().await;
    put_keys(&kv, &["a", "b"]).await;
    let before = scan(&kv, ScanOptions::default()).await;

    // A batch decoded from an external description with an unknown op kind
    let ops: Vec<BatchOp> = serde_json::from_str(
        r#"[
            {"type": "del", "key": "a"},
            {"type": "put", "key": "z", "value": "26"},
            {"type": "merge", "key": "b"}
        ]"#,
    )
    .unwrap();
    let result = kv.batch(ops).await;

    assert!(matches!(result, Err(Error::UnsupportedOperation(_))));
    assert_eq!(scan(&kv, ScanOptions::default()).await, before);
}

#[tokio::test]
async fn test_limit_caps_results_for_any_batch_size() {
    // Setup
    let kv = setup_test_store().await;
    let keys: Vec<String> = (0..20).map(|i| format!("key-{:02}", i)).collect();
    let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
    put_keys(&kv, &refs).await;

    for high_water_mark in [1, 3, 7, 128] {
        let options = ScanOptions {
            limit: Some(5),
            high_water_mark: Some(high_water_mark),
            ..ScanOptions::default()
        };
        let result = scan(&kv, options).await;
        assert_eq!(result, refs[..5].to_vec(), "high_water_mark {}", high_water_mark);
    }
}

#[tokio::test]
async fn test_closing_iterator_mid_scan_ends_iteration() {
    // Setup
    let kv = setup_test_store().await;
    put_keys(&kv, &["a", "b", "c", "d"]).await;
    let options = ScanOptions {
        high_water_mark: Some(2),
        ..ScanOptions::default()
    };
    let mut iter = kv.iterator(options).await.unwrap();
    assert_eq!(iter.next().await.unwrap().unwrap().key, Bytes::from("a"));

    // Close from another task
    let closer = iter.closer();
    tokio::spawn(async move { closer.close() }).await.unwrap();

    assert!(iter.next().await.unwrap().is_none());
    assert!(iter.next_batch(10).await.unwrap().is_empty());
    assert!(iter.next().await.unwrap().is_none());
}

/// In-memory connection whose range fetches take `delay` to answer.
struct SlowFetchConnection {
    inner: InMemoryConnection,
    delay: Duration,
}

#[async_trait]
impl Connection for SlowFetchConnection {
    async fn prepare(&self) -> StorageResult<()> {
        self.inner.prepare().await
    }

    async fn exec(&self, commands: Vec<Command>) -> StorageResult<()> {
        self.inner.exec(commands).await
    }

    async fn fetch_range(&self, query: RangeQuery) -> StorageResult<FetchedRange> {
        tokio::time::sleep(self.delay).await;
        self.inner.fetch_range(query).await
    }

    async fn hash_get(&self, key: &str, field: Bytes) -> StorageResult<Option<Bytes>> {
        self.inner.hash_get(key, field).await
    }

    async fn hash_get_many(
        &self,
        key: &str,
        fields: Vec<Bytes>,
    ) -> StorageResult<Vec<Option<Bytes>>> {
        self.inner.hash_get_many(key, fields).await
    }

    async fn close(&self) -> StorageResult<()> {
        self.inner.close().await
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

async fn setup_slow_store() -> KeyValueDb {
    let connection: Arc<dyn Connection> = Arc::new(SlowFetchConnection {
        inner: InMemoryConnection::default(),
        delay: Duration::from_millis(200),
    });
    let kv = KeyValueDb::open("store", OpenOptions::new(ConnectionSource::Client(connection)))
        .await
        .expect("Failed to open store");
    put_keys(&kv, &["a", "b", "c"]).await;
    kv
}

#[tokio::test]
async fn test_closing_store_during_fetch_discards_fetched_entries() {
    // Setup
    let kv = setup_slow_store().await;
    let mut iter = kv.iterator(ScanOptions::default()).await.unwrap();

    // Close the store while the first fetch is in flight
    let (read, closed) = tokio::join!(iter.next(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        kv.close().await
    });

    closed.unwrap();
    assert_eq!(read.unwrap(), None);
    assert!(iter.is_closed());
    assert!(iter.next_batch(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_closing_iterator_during_fetch_discards_fetched_entries() {
    // Setup
    let kv = setup_slow_store().await;
    let mut keys = kv.keys(ScanOptions::default()).await.unwrap();
    let closer = keys.closer();

    // Close the iterator while a batch read is waiting on its fetch
    let (batch, ()) = tokio::join!(keys.next_batch(2), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        closer.close();
    });

    assert!(batch.unwrap().is_empty());
    assert_eq!(keys.next().await.unwrap(), None);

    // The store itself stays usable
    assert_eq!(kv.get(Bytes::from("a")).await.unwrap(), Bytes::from("value-a"));
    kv.close().await.unwrap();
}

#[tokio::test]
async fn test_stores_with_same_identity_share_one_connection() {
    // Setup
    let registry = Arc::new(ConnectionRegistry::new());

    let first = KeyValueDb::open("first", options(&registry, 0)).await.unwrap();
    let second = KeyValueDb::open("second", options(&registry, 0)).await.unwrap();
    assert_eq!(registry.connection_count().await, 1);

    // Same physical connection, separate locations
    first.put(Bytes::from("k"), Bytes::from("1")).await.unwrap();
    assert!(second.get(Bytes::from("k")).await.unwrap_err().is_not_found());

    first.close().await.unwrap();
    assert_eq!(registry.connection_count().await, 1);
    second.put(Bytes::from("k"), Bytes::from("2")).await.unwrap();

    second.close().await.unwrap();
    assert_eq!(registry.connection_count().await, 0);
}

#[tokio::test]
async fn test_stores_with_different_db_do_not_share() {
    // Setup
    let registry = Arc::new(ConnectionRegistry::new());

    let first = KeyValueDb::open("store", options(&registry, 0)).await.unwrap();
    let second = KeyValueDb::open("store", options(&registry, 1)).await.unwrap();
    assert_eq!(registry.connection_count().await, 2);

    first.put(Bytes::from("k"), Bytes::from("1")).await.unwrap();
    assert!(second.get(Bytes::from("k")).await.unwrap_err().is_not_found());

    first.close().await.unwrap();
    second.close().await.unwrap();
    assert_eq!(registry.connection_count().await, 0);
}

#[tokio::test]
async fn test_reset_closes_connections_of_open_stores() {
    // Setup
    let registry = Arc::new(ConnectionRegistry::new());
    let kv = KeyValueDb::open("store", options(&registry, 0)).await.unwrap();

    registry.reset().await;

    assert_eq!(registry.connection_count().await, 0);
    assert_eq!(
        kv.put(Bytes::from("k"), Bytes::new()).await,
        Err(Error::Closed)
    );
    // closing afterwards still completes
    assert!(kv.close().await.is_ok());
}

#[tokio::test]
async fn test_url_source_is_validated_before_connecting() {
    let registry = Arc::new(ConnectionRegistry::new());
    let options = OpenOptions {
        connection: ConnectionSource::Url("memcached://localhost".to_string()),
        registry: Some(Arc::clone(&registry)),
        ..OpenOptions::default()
    };

    let result = KeyValueDb::open("store", options).await;

    assert!(matches!(result, Err(Error::InvalidArgument(_))));
    assert_eq!(registry.connection_count().await, 0);
}

#[tokio::test]
async fn test_values_iterator_follows_key_order() {
    // Setup
    let kv = setup_test_store().await;
    put_keys(&kv, &["b", "a", "c"]).await;

    let mut iter = kv.values(ScanOptions::default().reverse()).await.unwrap();
    let values = iter.next_batch(2).await.unwrap();

    assert_eq!(values, vec![Bytes::from("value-c"), Bytes::from("value-b")]);
    assert_eq!(iter.next().await.unwrap(), Some(Bytes::from("value-a")));
    assert_eq!(iter.next().await.unwrap(), None);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_scans_return_surviving_keys_in_byte_order(
        ops in prop::collection::vec(
            (prop::collection::vec(any::<u8>(), 0..6), any::<bool>()),
            0..40,
        ),
        high_water_mark in 1usize..8,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let (forward, reverse, expected) = runtime.block_on(async {
            let kv = setup_test_store().await;
            let mut expected = BTreeSet::new();
            for (key, delete) in ops {
                let key = Bytes::from(key);
                if delete {
                    kv.delete(key.clone()).await.unwrap();
                    expected.remove(&key);
                } else {
                    kv.put(key.clone(), key.clone()).await.unwrap();
                    expected.insert(key);
                }
            }
            let options = ScanOptions {
                high_water_mark: Some(high_water_mark),
                ..ScanOptions::default()
            };
            let forward = kv.iterator(options.clone()).await.unwrap().all().await.unwrap();
            let reverse = kv.keys(options.reverse()).await.unwrap().all().await.unwrap();
            (forward, reverse, expected)
        });

        let forward_keys: Vec<Bytes> = forward.iter().map(|e| e.key.clone()).collect();
        let expected: Vec<Bytes> = expected.into_iter().collect();
        prop_assert_eq!(&forward_keys, &expected);
        prop_assert!(forward.iter().all(|e| e.key == e.value));
        let mut reversed = reverse.clone();
        reversed.reverse();
        prop_assert_eq!(reversed, forward_keys);
    }
}
