//! Fault injection for replica traffic.
//!
//! [`ChaosReplicaClient`] sits in front of another [`ReplicaClient`] and can
//! take nodes down, make them hang, drop calls at random or add latency.
//! Tests use it to simulate partitions without real sockets.

use crate::replica_client::{ReplicaClient, ReplicaError};
use rand::Rng;
use ringkv_common::{NodeId, Timestamp};
use ringkv_storage::Record;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;

/// Configuration for replica chaos injection.
#[derive(Debug, Clone)]
pub struct ChaosReplicaConfig {
    /// Probability of returning an error \[0.0, 1.0\].
    pub failure_rate: f64,
    /// Fixed latency injected before forwarding.
    pub latency: Duration,
    /// Random additional latency in \[0, jitter\].
    pub jitter: Duration,
}

impl Default for ChaosReplicaConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.0,
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }
}

/// Forwards to `inner` unless the target is down, stalled or unlucky.
pub struct ChaosReplicaClient<R: ReplicaClient> {
    inner: Arc<R>,
    config: Arc<RwLock<ChaosReplicaConfig>>,
    failed_nodes: Arc<RwLock<HashSet<NodeId>>>,
    /// Nodes whose calls hang until the caller gives up.
    stalled_nodes: Arc<RwLock<HashSet<NodeId>>>,
}

impl<R: ReplicaClient> std::fmt::Debug for ChaosReplicaClient<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosReplicaClient").finish_non_exhaustive()
    }
}

impl<R: ReplicaClient> ChaosReplicaClient<R> {
    pub fn new(inner: R, config: ChaosReplicaConfig) -> Self {
        Self {
            inner: Arc::new(inner),
            config: Arc::new(RwLock::new(config)),
            failed_nodes: Arc::new(RwLock::new(HashSet::new())),
            stalled_nodes: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Mark a node as failed (until recovered). Calls fail immediately.
    pub async fn fail_node(&self, node_id: NodeId) {
        self.failed_nodes.write().await.insert(node_id);
    }

    /// Make calls to a node hang (until recovered), as if it stopped
    /// answering without closing connections.
    pub async fn stall_node(&self, node_id: NodeId) {
        self.stalled_nodes.write().await.insert(node_id);
    }

    /// Remove a node from the failed and stalled sets.
    pub async fn recover_node(&self, node_id: &NodeId) {
        self.failed_nodes.write().await.remove(node_id);
        self.stalled_nodes.write().await.remove(node_id);
    }

    pub async fn set_failure_rate(&self, rate: f64) {
        self.config.write().await.failure_rate = rate;
    }

    async fn injected_delay(&self) -> (Duration, f64) {
        let config = self.config.read().await;
        let mut delay = config.latency;
        if !config.jitter.is_zero() {
            let extra = rand::thread_rng().gen_range(0..=config.jitter.as_millis() as u64);
            delay += Duration::from_millis(extra);
        }
        (delay, config.failure_rate)
    }

    /// Runs before every forwarded call. Stalled targets never return.
    async fn maybe_fail(&self, target: &NodeId) -> Result<(), ReplicaError> {
        if self.failed_nodes.read().await.contains(target) {
            return Err(ReplicaError::Connect(format!("chaos: {} is down", target)));
        }
        if self.stalled_nodes.read().await.contains(target) {
            std::future::pending::<()>().await;
        }

        let (delay, failure_rate) = self.injected_delay().await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if failure_rate > 0.0 && rand::thread_rng().gen_bool(failure_rate.min(1.0)) {
            return Err(ReplicaError::Connect(format!("chaos: dropped call to {}", target)));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<R: ReplicaClient> ReplicaClient for ChaosReplicaClient<R> {
    async fn send_put(
        &self,
        target: &NodeId,
        key: &[u8],
        value: &[u8],
        timestamp: Timestamp,
    ) -> Result<(), ReplicaError> {
        self.maybe_fail(target).await?;
        self.inner.send_put(target, key, value, timestamp).await
    }

    async fn send_delete(
        &self,
        target: &NodeId,
        key: &[u8],
        timestamp: Timestamp,
    ) -> Result<(), ReplicaError> {
        self.maybe_fail(target).await?;
        self.inner.send_delete(target, key, timestamp).await
    }

    async fn send_get(&self, target: &NodeId, key: &[u8]) -> Result<Option<Record>, ReplicaError> {
        self.maybe_fail(target).await?;
        self.inner.send_get(target, key).await
    }
}
