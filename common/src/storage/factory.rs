//! Connection factory for creating backing-server connections from configuration.

use std::sync::Arc;

use super::config::ConnectionConfig;
use super::in_memory::InMemoryConnection;
use super::redis_connection::RedisConnection;
use super::{Connection, StorageResult};

/// Opens a new physical connection for the given configuration.
///
/// Every call creates a distinct connection; sharing is decided by callers.
pub async fn create_connection(config: &ConnectionConfig) -> StorageResult<Arc<dyn Connection>> {
    match config {
        ConnectionConfig::InMemory(memory) => {
            Ok(Arc::new(InMemoryConnection::new(memory.clone())))
        }
        ConnectionConfig::Redis(redis) => {
            let connection = RedisConnection::connect(redis).await?;
            Ok(Arc::new(connection))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::config::InMemoryConfig;

    #[tokio::test]
    async fn should_create_independent_in_memory_connections() {
        // given
        let config = ConnectionConfig::InMemory(InMemoryConfig::default());

        // when
        let first = create_connection(&config).await.unwrap();
        let second = create_connection(&config).await.unwrap();
        first.close().await.unwrap();

        // then
        assert!(first.is_closed());
        assert!(!second.is_closed());
    }
}
