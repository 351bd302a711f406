//! KV coordinator: handles client PUT/GET/DELETE by fanning out to replicas.
//!
//! The coordinator:
//! 1. Stamps writes with its monotonic clock
//! 2. Maps the key to its N replicas (via the router)
//! 3. Sends replica calls in parallel, each with its own timeout
//! 4. Returns once W acks (write) or R answers (read) arrive
//! 5. Resolves reads by latest timestamp
//! 6. Optionally repairs stale replicas in the background

use crate::params::{ParamsError, ReplicationParams};
use crate::replica_client::{ReplicaClient, ReplicaError};
use crate::router::Router;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use ringkv_common::{MonotonicClock, NodeId, Timestamp};
use ringkv_metrics::{metrics, start_kv_timer, start_replica_timer};
use ringkv_storage::{Record, Storage, StorageError};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Per-call timeout when none is configured.
pub const DEFAULT_REPLICA_TIMEOUT: Duration = Duration::from_millis(500);

/// Quorum and replication configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Default N/R/W for requests that do not carry their own.
    pub replication: ReplicationParams,
    /// Deadline for each individual remote replica call.
    pub replica_timeout: Duration,
    /// Whether to perform async read repair.
    pub read_repair: bool,
}

impl CoordinatorConfig {
    /// Majority quorums over the whole cluster, with read repair on.
    pub fn for_cluster(cluster_size: usize) -> Self {
        Self {
            replication: ReplicationParams::default_for(cluster_size),
            replica_timeout: DEFAULT_REPLICA_TIMEOUT,
            read_repair: true,
        }
    }
}

/// Result of a successful GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResult {
    pub value: Vec<u8>,
    pub timestamp: Timestamp,
}

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("key not found")]
    NotFound,
    #[error("not enough replicas: need {needed}, got {got}")]
    QuorumNotReached { needed: usize, got: usize },
    #[error("invalid replication parameters: {0}")]
    InvalidParams(#[from] ParamsError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

type WriteHandle = JoinHandle<(NodeId, Result<(), ReplicaError>)>;
type ReadHandle = JoinHandle<(NodeId, Result<Option<Record>, ReplicaError>)>;

/// Run a blocking storage call off the async runtime.
async fn on_storage<T, F>(storage: &Arc<dyn Storage>, f: F) -> Result<T, StorageError>
where
    T: Send + 'static,
    F: FnOnce(&dyn Storage) -> Result<T, StorageError> + Send + 'static,
{
    let storage = storage.clone();
    tokio::task::spawn_blocking(move || f(storage.as_ref()))
        .await
        .unwrap_or_else(|e| Err(StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))))
}

/// Dispatches single replica operations, locally or over the transport.
struct Replicas<R: ReplicaClient> {
    local_id: NodeId,
    storage: Arc<dyn Storage>,
    client: Arc<R>,
    timeout: Duration,
}

impl<R: ReplicaClient> Clone for Replicas<R> {
    fn clone(&self) -> Self {
        Self {
            local_id: self.local_id.clone(),
            storage: self.storage.clone(),
            client: self.client.clone(),
            timeout: self.timeout,
        }
    }
}

impl<R: ReplicaClient> Replicas<R> {
    async fn write(&self, node: &NodeId, record: &Record) -> Result<(), ReplicaError> {
        let op = if record.is_tombstone() { "delete" } else { "put" };
        let result = if *node == self.local_id {
            let record = record.clone();
            on_storage(&self.storage, move |s| s.apply(&record))
                .await
                .map_err(|e| ReplicaError::Storage(e.to_string()))
        } else {
            metrics().replica_requests_sent.with_label_values(&[op]).inc();
            let _timer = start_replica_timer(op, "outbound");
            tokio::time::timeout(self.timeout, self.client.send_record(node, record))
                .await
                .unwrap_or(Err(ReplicaError::Timeout))
        };
        self.observe(node, op, &result);
        result
    }

    async fn read(&self, node: &NodeId, key: &[u8]) -> Result<Option<Record>, ReplicaError> {
        let result = if *node == self.local_id {
            let key = key.to_vec();
            on_storage(&self.storage, move |s| s.get(&key))
                .await
                .map_err(|e| ReplicaError::Storage(e.to_string()))
        } else {
            metrics().replica_requests_sent.with_label_values(&["get"]).inc();
            let _timer = start_replica_timer("get", "outbound");
            tokio::time::timeout(self.timeout, self.client.send_get(node, key))
                .await
                .unwrap_or(Err(ReplicaError::Timeout))
        };
        self.observe(node, "get", &result);
        result
    }

    fn observe<T>(&self, node: &NodeId, op: &str, result: &Result<T, ReplicaError>) {
        match result {
            Ok(_) => tracing::debug!(%node, op, "replica call ok"),
            Err(e @ ReplicaError::Storage(_)) => {
                metrics()
                    .replica_failures
                    .with_label_values(&[op, e.reason()])
                    .inc();
                tracing::error!(%node, op, "local storage failure: {}", e);
            }
            Err(e) => {
                metrics()
                    .replica_failures
                    .with_label_values(&[op, e.reason()])
                    .inc();
                tracing::warn!(%node, op, "replica call failed: {}", e);
            }
        }
    }

    fn spawn_write(&self, node: NodeId, record: Arc<Record>) -> WriteHandle {
        let this = self.clone();
        tokio::spawn(async move {
            let result = this.write(&node, &record).await;
            (node, result)
        })
    }

    fn spawn_read(&self, node: NodeId, key: Arc<[u8]>) -> ReadHandle {
        let this = self.clone();
        tokio::spawn(async move {
            let result = this.read(&node, &key).await;
            (node, result)
        })
    }
}

/// Distributed KV coordinator.
///
/// Generic over `R: ReplicaClient` for testability: real deployment uses
/// `HttpReplicaClient`, tests use an in-process client.
pub struct Coordinator<R: ReplicaClient> {
    router: Arc<Router>,
    replicas: Replicas<R>,
    clock: MonotonicClock,
    config: CoordinatorConfig,
}

impl<R: ReplicaClient> std::fmt::Debug for Coordinator<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("local_id", &self.replicas.local_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<R: ReplicaClient> Coordinator<R> {
    /// Fails if the default replication parameters do not fit the topology.
    pub fn new(
        local_id: NodeId,
        router: Arc<Router>,
        storage: Arc<dyn Storage>,
        replica_client: Arc<R>,
        config: CoordinatorConfig,
    ) -> Result<Self, KvError> {
        config.replication.validate(router.cluster_size())?;
        Ok(Self {
            router,
            replicas: Replicas {
                local_id,
                storage,
                client: replica_client,
                timeout: config.replica_timeout,
            },
            clock: MonotonicClock::new(),
            config,
        })
    }

    pub fn local_id(&self) -> &NodeId {
        &self.replicas.local_id
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    fn resolve_params(
        &self,
        requested: Option<ReplicationParams>,
    ) -> Result<ReplicationParams, KvError> {
        let params = requested.unwrap_or(self.config.replication);
        params.validate(self.router.cluster_size())?;
        Ok(params)
    }

    fn quorum_failure(&self, op: &str, needed: usize, got: usize) -> KvError {
        metrics().quorum_failures.with_label_values(&[op]).inc();
        tracing::warn!(op, needed, got, "quorum not reached");
        KvError::QuorumNotReached { needed, got }
    }

    // -----------------------------------------------------------------------
    // PUT / DELETE
    // -----------------------------------------------------------------------

    /// PUT a value. Returns the timestamp assigned to the write.
    pub async fn put(
        &self,
        key: &[u8],
        value: Vec<u8>,
        params: Option<ReplicationParams>,
    ) -> Result<Timestamp, KvError> {
        metrics().kv_puts.inc();
        let _timer = start_kv_timer("put");
        let params = self.resolve_params(params)?;

        let timestamp = self.clock.now();
        self.replicate(Record::put(key.to_vec(), value, timestamp), params, "put")
            .await?;
        Ok(timestamp)
    }

    /// DELETE a key by writing a tombstone. Returns its timestamp.
    pub async fn delete(
        &self,
        key: &[u8],
        params: Option<ReplicationParams>,
    ) -> Result<Timestamp, KvError> {
        metrics().kv_deletes.inc();
        let _timer = start_kv_timer("delete");
        let params = self.resolve_params(params)?;

        let timestamp = self.clock.now();
        self.replicate(Record::tombstone(key.to_vec(), timestamp), params, "delete")
            .await?;
        Ok(timestamp)
    }

    /// Send `record` to all N replicas and wait for W acks.
    ///
    /// Calls still in flight once the outcome is known keep running in the
    /// background; their results are discarded.
    async fn replicate(
        &self,
        record: Record,
        params: ReplicationParams,
        op: &str,
    ) -> Result<(), KvError> {
        let targets = self.router.replicas_for(&record.key, params.n);
        if targets.is_empty() {
            return Err(self.quorum_failure(op, params.w, 0));
        }

        let record = Arc::new(record);
        let mut pending: FuturesUnordered<WriteHandle> = targets
            .into_iter()
            .map(|node| self.replicas.spawn_write(node, record.clone()))
            .collect();

        let mut acks = 0usize;
        while acks < params.w && acks + pending.len() >= params.w {
            let Some(joined) = pending.next().await else {
                break;
            };
            match joined {
                Ok((_, Ok(()))) => acks += 1,
                Ok((_, Err(_))) => {}
                Err(e) => tracing::error!("replica write task failed: {}", e),
            }
        }

        if acks < params.w {
            return Err(self.quorum_failure(op, params.w, acks));
        }
        tracing::debug!(
            key = %hex::encode(&record.key),
            ts = %record.timestamp,
            acks,
            "{} reached quorum",
            op
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // GET
    // -----------------------------------------------------------------------

    /// GET a key. Waits for R answers and returns the latest version.
    /// A tombstone winner reads as [`KvError::NotFound`].
    pub async fn get(
        &self,
        key: &[u8],
        params: Option<ReplicationParams>,
    ) -> Result<GetResult, KvError> {
        metrics().kv_gets.inc();
        let _timer = start_kv_timer("get");
        let params = self.resolve_params(params)?;

        let targets = self.router.replicas_for(key, params.n);
        if targets.is_empty() {
            return Err(self.quorum_failure("get", params.r, 0));
        }

        let key: Arc<[u8]> = Arc::from(key);
        let mut pending: FuturesUnordered<ReadHandle> = targets
            .into_iter()
            .map(|node| self.replicas.spawn_read(node, key.clone()))
            .collect();

        let mut responses: Vec<(NodeId, Option<Record>)> = Vec::new();
        while responses.len() < params.r && responses.len() + pending.len() >= params.r {
            let Some(joined) = pending.next().await else {
                break;
            };
            match joined {
                Ok((node, Ok(found))) => responses.push((node, found)),
                Ok((_, Err(_))) => {}
                Err(e) => tracing::error!("replica read task failed: {}", e),
            }
        }

        if responses.len() < params.r {
            return Err(self.quorum_failure("get", params.r, responses.len()));
        }

        let outcome = match latest(responses.iter().map(|(_, found)| found)) {
            Some(Record {
                value: Some(value),
                timestamp,
                ..
            }) => Ok(GetResult {
                value: value.clone(),
                timestamp: *timestamp,
            }),
            _ => Err(KvError::NotFound),
        };

        if self.config.read_repair {
            self.spawn_read_repair(key, responses, pending);
        }

        outcome
    }

    // -----------------------------------------------------------------------
    // Internal: read repair
    // -----------------------------------------------------------------------

    /// Spawn a background task that waits for the remaining replicas (each
    /// bounded by its call timeout), then pushes the latest version to every
    /// replica that answered with something older.
    fn spawn_read_repair(
        &self,
        key: Arc<[u8]>,
        mut responses: Vec<(NodeId, Option<Record>)>,
        mut stragglers: FuturesUnordered<ReadHandle>,
    ) {
        let replicas = self.replicas.clone();

        tokio::spawn(async move {
            while let Some(joined) = stragglers.next().await {
                if let Ok((node, Ok(found))) = joined {
                    responses.push((node, found));
                }
            }

            let Some(winner) = latest(responses.iter().map(|(_, found)| found)).cloned() else {
                return;
            };

            for (node, found) in responses {
                if !is_stale(found.as_ref(), &winner) {
                    continue;
                }
                metrics().read_repairs.inc();
                tracing::debug!(
                    %node,
                    key = %hex::encode(&key),
                    ts = %winner.timestamp,
                    "read repair"
                );
                let replicas = replicas.clone();
                let winner = winner.clone();
                tokio::spawn(async move {
                    if let Err(e) = replicas.write(&node, &winner).await {
                        tracing::warn!("read repair of {} failed: {}", node, e);
                    }
                });
            }
        });
    }

    // -----------------------------------------------------------------------
    // Replica-side operations
    // -----------------------------------------------------------------------

    /// Read the local copy of `key`, as a replica.
    pub async fn local_get(&self, key: &[u8]) -> Result<Option<Record>, KvError> {
        let key = key.to_vec();
        Ok(on_storage(&self.replicas.storage, move |s| s.get(&key)).await?)
    }

    /// Store a record sent by another coordinator, as a replica.
    pub async fn local_apply(&self, record: Record) -> Result<(), KvError> {
        Ok(on_storage(&self.replicas.storage, move |s| s.apply(&record)).await?)
    }
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

/// The winning version among replica answers, `None` if every replica
/// reported the key absent. Ties resolve by [`Record::version_cmp`].
pub fn latest<'a, I>(versions: I) -> Option<&'a Record>
where
    I: IntoIterator<Item = &'a Option<Record>>,
{
    versions
        .into_iter()
        .flatten()
        .max_by(|a, b| a.version_cmp(b))
}

/// Whether a replica that answered `found` needs `winner` pushed to it.
fn is_stale(found: Option<&Record>, winner: &Record) -> bool {
    found.map_or(true, |record| winner.supersedes(record))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
