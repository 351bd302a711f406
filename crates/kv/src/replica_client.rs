//! Abstraction over coordinator-to-replica calls.
//!
//! The HTTP implementation lives in `ringkv-net::replica_client`.
//! [`InProcessReplicaClient`] routes calls straight to other nodes'
//! [`Storage`] handles, for tests and single-process clusters.

use ringkv_common::{NodeId, Timestamp};
use ringkv_storage::{Record, Storage};
use std::collections::HashMap;
use std::sync::Arc;

/// Why one replica call failed. The coordinator treats every variant the
/// same way: that replica did not answer.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ReplicaError {
    #[error("timeout")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("rejected by replica: {0}")]
    Rejected(String),
    #[error("local storage failed: {0}")]
    Storage(String),
}

impl ReplicaError {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connect(_) => "connect",
            Self::Malformed(_) => "malformed",
            Self::Rejected(_) => "rejected",
            Self::Storage(_) => "storage",
        }
    }
}

/// Transport for replica operations.
///
/// Writes carry the coordinator's timestamp; replicas never assign their
/// own. `send_get` returns tombstones as records so the coordinator can tell
/// "deleted" from "never written".
#[async_trait::async_trait]
pub trait ReplicaClient: Send + Sync + 'static {
    async fn send_put(
        &self,
        target: &NodeId,
        key: &[u8],
        value: &[u8],
        timestamp: Timestamp,
    ) -> Result<(), ReplicaError>;

    async fn send_delete(
        &self,
        target: &NodeId,
        key: &[u8],
        timestamp: Timestamp,
    ) -> Result<(), ReplicaError>;

    async fn send_get(&self, target: &NodeId, key: &[u8]) -> Result<Option<Record>, ReplicaError>;

    /// Send a record as a put or a delete.
    async fn send_record(&self, target: &NodeId, record: &Record) -> Result<(), ReplicaError> {
        match &record.value {
            Some(value) => {
                self.send_put(target, &record.key, value, record.timestamp)
                    .await
            }
            None => self.send_delete(target, &record.key, record.timestamp).await,
        }
    }
}

/// A [`ReplicaClient`] that calls peers' storage directly.
#[derive(Clone, Default)]
pub struct InProcessReplicaClient {
    nodes: HashMap<NodeId, Arc<dyn Storage>>,
}

impl std::fmt::Debug for InProcessReplicaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessReplicaClient")
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl InProcessReplicaClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the storage that backs `node`.
    pub fn register(&mut self, node: NodeId, storage: Arc<dyn Storage>) {
        self.nodes.insert(node, storage);
    }

    fn storage(&self, target: &NodeId) -> Result<&Arc<dyn Storage>, ReplicaError> {
        self.nodes
            .get(target)
            .ok_or_else(|| ReplicaError::Connect(format!("unknown node {}", target)))
    }
}

fn rejected(e: impl std::fmt::Display) -> ReplicaError {
    ReplicaError::Rejected(e.to_string())
}

#[async_trait::async_trait]
impl ReplicaClient for InProcessReplicaClient {
    async fn send_put(
        &self,
        target: &NodeId,
        key: &[u8],
        value: &[u8],
        timestamp: Timestamp,
    ) -> Result<(), ReplicaError> {
        self.storage(target)?
            .put(key, value, timestamp)
            .map_err(rejected)
    }

    async fn send_delete(
        &self,
        target: &NodeId,
        key: &[u8],
        timestamp: Timestamp,
    ) -> Result<(), ReplicaError> {
        self.storage(target)?.delete(key, timestamp).map_err(rejected)
    }

    async fn send_get(&self, target: &NodeId, key: &[u8]) -> Result<Option<Record>, ReplicaError> {
        self.storage(target)?.get(key).map_err(rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringkv_storage::MemoryStorage;

    fn ts(n: u64) -> Timestamp {
        Timestamp::from_nanos(n)
    }

    #[tokio::test]
    async fn test_in_process_roundtrip() {
        let node = NodeId::new("http://a:1");
        let storage = Arc::new(MemoryStorage::new());
        let mut client = InProcessReplicaClient::new();
        client.register(node.clone(), storage.clone());

        client.send_put(&node, b"k", b"v", ts(1)).await.unwrap();
        let record = client.send_get(&node, b"k").await.unwrap().unwrap();
        assert_eq!(record.value.as_deref(), Some(&b"v"[..]));

        client.send_delete(&node, b"k", ts(2)).await.unwrap();
        assert!(client
            .send_get(&node, b"k")
            .await
            .unwrap()
            .unwrap()
            .is_tombstone());
        assert!(client.send_get(&node, b"other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_send_record_dispatches_on_tombstone() {
        let node = NodeId::new("http://a:1");
        let storage = Arc::new(MemoryStorage::new());
        let mut client = InProcessReplicaClient::new();
        client.register(node.clone(), storage.clone());

        client
            .send_record(&node, &Record::put(b"k".to_vec(), b"v".to_vec(), ts(1)))
            .await
            .unwrap();
        client
            .send_record(&node, &Record::tombstone(b"k".to_vec(), ts(2)))
            .await
            .unwrap();
        assert!(storage.get(b"k").unwrap().unwrap().is_tombstone());
    }

    #[tokio::test]
    async fn test_unknown_node_is_connect_error() {
        let client = InProcessReplicaClient::new();
        let err = client
            .send_get(&NodeId::new("http://nowhere:1"), b"k")
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicaError::Connect(_)));
        assert_eq!(err.reason(), "connect");
    }

    #[tokio::test]
    async fn test_closed_storage_is_rejected() {
        let node = NodeId::new("http://a:1");
        let storage = Arc::new(MemoryStorage::new());
        storage.close().unwrap();
        let mut client = InProcessReplicaClient::new();
        client.register(node.clone(), storage);

        let err = client.send_put(&node, b"k", b"v", ts(1)).await.unwrap_err();
        assert!(matches!(err, ReplicaError::Rejected(_)));
    }
}
