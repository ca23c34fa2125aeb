//! Backend abstraction.
//!
//! A [`Client`] is one of a closed set of backends, chosen by configuration at
//! startup. Every backend returns a [`BatchHandle`] from `submit` without
//! waiting for the batch to finish; completion order is unspecified.

pub mod direct;
pub mod distributed;
pub mod handle;
pub mod pool;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, SimResult, ValidationError};
use crate::graph::{OperationRegistry, Plan};
use crate::worker::BatchWorker;

pub use direct::DirectClient;
pub use distributed::{DistributedClient, DistributedConfig, LoopbackConnection, WorkerConnection, LOOPBACK_SCHEME};
pub use handle::{wait_all, wait_any, BatchHandle, BatchOutcome, CancelToken, Completer};
pub use pool::{LocalPoolClient, LocalPoolConfig};

/// Backend variant names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Synchronous, in the caller's thread.
    Direct,
    /// Local worker threads.
    LocalPool,
    /// Remote workers.
    Distributed,
}

/// Backend selection, as read from configuration.
///
/// ```json
/// { "backend": "local_pool", "workers": 8 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum ClientConfig {
    /// Run batches in the caller's thread.
    Direct,
    /// Run batches on a local thread pool.
    LocalPool(LocalPoolConfig),
    /// Send batches to remote workers.
    Distributed(DistributedConfig),
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::LocalPool(LocalPoolConfig::default())
    }
}

impl ClientConfig {
    /// Parses a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self, ValidationError> {
        serde_json::from_str(json).map_err(|e| ValidationError::InvalidConfig {
            reason: format!("invalid client configuration: {e}"),
        })
    }
}

/// A batch execution backend.
#[derive(Debug)]
pub enum Client {
    /// Synchronous backend.
    Direct(DirectClient),
    /// Local worker-pool backend.
    LocalPool(LocalPoolClient),
    /// Remote worker backend.
    Distributed(DistributedClient),
}

impl Client {
    /// Creates a synchronous backend.
    #[must_use]
    pub fn direct() -> Self {
        Self::Direct(DirectClient::new())
    }

    /// Starts a local pool backend.
    pub fn local_pool(config: &LocalPoolConfig) -> SimResult<Self> {
        Ok(Self::LocalPool(LocalPoolClient::start(config)?))
    }

    /// Starts a distributed backend over the given connections.
    pub fn distributed(connections: Vec<Box<dyn WorkerConnection>>, config: &DistributedConfig) -> SimResult<Self> {
        Ok(Self::Distributed(DistributedClient::new(connections, config)?))
    }

    /// Builds the backend named by `config`.
    ///
    /// `registry` backs in-process workers for `loopback://` endpoints. Other
    /// endpoints are dialed over gRPC, which needs the `transport-grpc` feature.
    ///
    /// # Errors
    /// `BackendUnavailable` if no workers can be acquired.
    pub fn from_config(config: &ClientConfig, registry: Arc<OperationRegistry>) -> SimResult<Arc<Self>> {
        let client = match config {
            ClientConfig::Direct => Self::direct(),
            ClientConfig::LocalPool(pool) => Self::local_pool(pool)?,
            ClientConfig::Distributed(dist) => {
                let mut connections: Vec<Box<dyn WorkerConnection>> = Vec::with_capacity(dist.endpoints.len());
                for endpoint in &dist.endpoints {
                    connections.push(connect(endpoint, &registry)?);
                }
                Self::distributed(connections, dist)?
            }
        };
        tracing::info!(backend = ?client.kind(), cores = client.num_cores(), "client ready");
        Ok(Arc::new(client))
    }

    /// Which backend this is.
    #[must_use]
    pub const fn kind(&self) -> BackendKind {
        match self {
            Self::Direct(_) => BackendKind::Direct,
            Self::LocalPool(_) => BackendKind::LocalPool,
            Self::Distributed(_) => BackendKind::Distributed,
        }
    }

    /// Number of batches this backend can execute at once.
    #[must_use]
    pub fn num_cores(&self) -> usize {
        match self {
            Self::Direct(_) => 1,
            Self::LocalPool(pool) => pool.workers(),
            Self::Distributed(dist) => dist.connections(),
        }
    }

    /// Submits one batch. Never waits for it to finish.
    ///
    /// # Errors
    /// `QueueFull` when the backend cannot accept more work right now.
    pub fn submit(&self, plan: &Arc<Plan>, batch_index: u64, batch_size: usize) -> SimResult<BatchHandle> {
        tracing::trace!(batch_index, batch_size, "submitting batch");
        match self {
            Self::Direct(direct) => direct.submit(plan, batch_index, batch_size),
            Self::LocalPool(pool) => pool.submit(plan, batch_index, batch_size),
            Self::Distributed(dist) => dist.submit(plan, batch_index, batch_size),
        }
    }

    /// Blocks until at least one handle resolves; returns the resolved positions.
    pub fn wait_any(&self, handles: &mut [BatchHandle], timeout: Option<Duration>) -> SimResult<Vec<usize>> {
        wait_any(handles, timeout)
    }

    /// Blocks until every uncancelled handle resolves.
    pub fn wait_all(&self, handles: &mut [BatchHandle], timeout: Option<Duration>) -> SimResult<()> {
        wait_all(handles, timeout)
    }

    /// Non-blocking completion check.
    pub fn is_done(&self, handle: &mut BatchHandle) -> bool {
        handle.is_done()
    }

    /// Cancels a batch; its result is never delivered.
    pub fn cancel(&self, handle: &mut BatchHandle) {
        tracing::debug!(batch_index = handle.batch_index(), "cancelling batch");
        handle.cancel();
    }
}

fn connect(endpoint: &str, registry: &Arc<OperationRegistry>) -> SimResult<Box<dyn WorkerConnection>> {
    if endpoint.starts_with(LOOPBACK_SCHEME) {
        let worker = Arc::new(BatchWorker::new(Arc::clone(registry)));
        return Ok(Box::new(LoopbackConnection::new(endpoint, worker)));
    }
    remote(endpoint)
}

#[cfg(feature = "transport-grpc")]
fn remote(endpoint: &str) -> SimResult<Box<dyn WorkerConnection>> {
    let connection = crate::transport::GrpcConnection::connect(endpoint).map_err(|e| ClientError::BackendUnavailable {
        reason: format!("cannot reach worker {endpoint}: {e}"),
    })?;
    Ok(Box::new(connection))
}

#[cfg(not(feature = "transport-grpc"))]
fn remote(endpoint: &str) -> SimResult<Box<dyn WorkerConnection>> {
    Err(ClientError::BackendUnavailable {
        reason: format!("cannot reach worker {endpoint}: built without the transport-grpc feature"),
    }
    .into())
}
