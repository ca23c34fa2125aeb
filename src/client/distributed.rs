//! Distributed backend.
//!
//! Batches are encoded as [`BatchRequest`]s at submit time and pushed onto one
//! shared queue. Each remote connection is driven by its own dispatcher thread,
//! so there is one logical worker per connection. A reply resolves the handle
//! only if it echoes the request id and batch index.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, SimError, SimResult, TransportError};
use crate::graph::Plan;
use crate::wire::{BatchReply, BatchRequest};
use crate::worker::BatchWorker;

use super::handle::{BatchHandle, BatchOutcome, Completer};

/// Endpoint prefix for in-process workers.
pub const LOOPBACK_SCHEME: &str = "loopback://";

/// A blocking request/reply channel to one remote worker.
pub trait WorkerConnection: Send {
    /// Address of the remote worker.
    fn endpoint(&self) -> &str;

    /// Sends one encoded request and returns the encoded reply.
    fn round_trip(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError>;
}

/// Connection to a [`BatchWorker`] living in this process.
#[derive(Debug, Clone)]
pub struct LoopbackConnection {
    endpoint: String,
    worker: Arc<BatchWorker>,
}

impl LoopbackConnection {
    /// Wraps `worker` under the given endpoint name.
    #[must_use]
    pub fn new(endpoint: impl Into<String>, worker: Arc<BatchWorker>) -> Self {
        Self {
            endpoint: endpoint.into(),
            worker,
        }
    }
}

impl WorkerConnection for LoopbackConnection {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn round_trip(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.worker.serve(request)
    }
}

/// Distributed backend configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    /// Worker addresses, e.g. `http://10.0.0.5:50061` or `loopback://a`.
    pub endpoints: Vec<String>,
    /// Attempts per batch for retryable transport failures.
    pub max_attempts: u32,
    /// Maximum batches waiting for a free connection.
    pub queue_capacity: usize,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            max_attempts: 3,
            queue_capacity: 1024,
        }
    }
}

struct Dispatch {
    request: BatchRequest,
    payload: Vec<u8>,
    completer: Completer,
}

/// Backend sending batches to remote workers.
#[derive(Debug)]
pub struct DistributedClient {
    tx: Option<Sender<Dispatch>>,
    dispatchers: Vec<JoinHandle<()>>,
    endpoints: Vec<String>,
    queue_capacity: usize,
}

impl DistributedClient {
    /// Starts one dispatcher thread per connection.
    ///
    /// # Errors
    /// `BackendUnavailable` if there are no connections or a thread cannot be spawned.
    pub fn new(connections: Vec<Box<dyn WorkerConnection>>, config: &DistributedConfig) -> SimResult<Self> {
        if connections.is_empty() {
            return Err(ClientError::BackendUnavailable {
                reason: "distributed backend needs at least one worker connection".to_string(),
            }
            .into());
        }
        let queue_capacity = config.queue_capacity.max(1);
        let max_attempts = config.max_attempts.max(1);
        let (tx, rx) = bounded::<Dispatch>(queue_capacity);

        let mut client = Self {
            tx: Some(tx),
            dispatchers: Vec::with_capacity(connections.len()),
            endpoints: connections.iter().map(|c| c.endpoint().to_string()).collect(),
            queue_capacity,
        };
        for (idx, connection) in connections.into_iter().enumerate() {
            let rx: Receiver<Dispatch> = rx.clone();
            let spawned = thread::Builder::new()
                .name(format!("simbatch-dispatch-{idx}"))
                .spawn(move || dispatch_loop(connection, &rx, max_attempts));
            match spawned {
                Ok(handle) => client.dispatchers.push(handle),
                Err(e) => {
                    return Err(ClientError::BackendUnavailable {
                        reason: format!("failed to spawn dispatcher {idx}: {e}"),
                    }
                    .into());
                }
            }
        }
        tracing::info!(connections = client.endpoints.len(), "distributed backend started");
        Ok(client)
    }

    /// Endpoints in connection order.
    #[must_use]
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Number of remote connections.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.dispatchers.len()
    }

    /// Encodes and enqueues a batch.
    ///
    /// # Errors
    /// Transport errors if the request cannot be encoded, `QueueFull` if no
    /// slot is free.
    pub fn submit(&self, plan: &Arc<Plan>, batch_index: u64, batch_size: usize) -> SimResult<BatchHandle> {
        let request = BatchRequest::new(plan.to_spec(), batch_index, batch_size);
        let payload = request.encode()?;
        let tx = self.tx.as_ref().ok_or(ClientError::BackendUnavailable {
            reason: "distributed backend is shut down".to_string(),
        })?;

        let (handle, completer) = BatchHandle::pending(batch_index);
        let dispatch = Dispatch {
            request,
            payload,
            completer,
        };
        match tx.try_send(dispatch) {
            Ok(()) => Ok(handle),
            Err(TrySendError::Full(_)) => Err(ClientError::QueueFull {
                capacity: self.queue_capacity,
            }
            .into()),
            Err(TrySendError::Disconnected(_)) => Err(ClientError::Disconnected { batch_index }.into()),
        }
    }

    fn shutdown(&mut self) {
        drop(self.tx.take());
        for handle in self.dispatchers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for DistributedClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch_loop(mut connection: Box<dyn WorkerConnection>, rx: &Receiver<Dispatch>, max_attempts: u32) {
    while let Ok(dispatch) = rx.recv() {
        if dispatch.completer.is_cancelled() {
            tracing::debug!(batch_index = dispatch.request.batch_index, "skipping cancelled batch");
            continue;
        }
        let outcome = send_with_retry(connection.as_mut(), &dispatch, max_attempts);
        dispatch.completer.complete(outcome);
    }
}

fn send_with_retry(connection: &mut dyn WorkerConnection, dispatch: &Dispatch, max_attempts: u32) -> BatchOutcome {
    let batch_index = dispatch.request.batch_index;
    let mut attempt = 1;
    loop {
        let err = match connection.round_trip(&dispatch.payload) {
            Ok(bytes) => return BatchReply::decode(&bytes)?.into_result(&dispatch.request),
            Err(e) => SimError::from(e),
        };
        if !err.is_retryable() || attempt >= max_attempts || dispatch.completer.is_cancelled() {
            return Err(err);
        }
        tracing::warn!(
            endpoint = connection.endpoint(),
            batch_index,
            attempt,
            error = %err,
            "retrying batch request"
        );
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::client::handle::wait_all;
    use crate::executor;
    use crate::graph::{compile, ComputationContext, Input, ModelGraph, NodeRole, OpRef, OperationRegistry};

    fn plan() -> Arc<Plan> {
        let mut g = ModelGraph::new(Arc::new(OperationRegistry::standard())).with_context(ComputationContext::new(5, 21));
        g.add_node("u", OpRef::uniform(-1.0, 1.0), Vec::<Input>::new(), NodeRole::Stochastic)
            .unwrap();
        g.add_node("y", OpRef::with_params("gaussian_noise", serde_json::json!({ "std": 0.1 })), ["u"], NodeRole::Transform)
            .unwrap();
        g.freeze().unwrap();
        Arc::new(compile(&g, &["u", "y"]).unwrap())
    }

    fn loopback(name: &str) -> Box<dyn WorkerConnection> {
        let worker = Arc::new(BatchWorker::new(Arc::new(OperationRegistry::standard())));
        Box::new(LoopbackConnection::new(format!("{LOOPBACK_SCHEME}{name}"), worker))
    }

    /// Fails the first `failures` calls with a connection error.
    struct Flaky {
        inner: LoopbackConnection,
        failures: Arc<AtomicU32>,
    }

    impl WorkerConnection for Flaky {
        fn endpoint(&self) -> &str {
            self.inner.endpoint()
        }

        fn round_trip(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(TransportError::ConnectionFailed {
                    message: "reset by peer".to_string(),
                });
            }
            self.inner.round_trip(request)
        }
    }

    /// Answers every request with a reply for a different batch.
    struct Confused(LoopbackConnection);

    impl WorkerConnection for Confused {
        fn endpoint(&self) -> &str {
            self.0.endpoint()
        }

        fn round_trip(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
            let bytes = self.0.round_trip(request)?;
            let mut reply = BatchReply::decode(&bytes)?;
            reply.batch_index += 1;
            reply.encode()
        }
    }

    /// Cuts output `u` down to its first row.
    struct Truncating(LoopbackConnection);

    impl WorkerConnection for Truncating {
        fn endpoint(&self) -> &str {
            self.0.endpoint()
        }

        fn round_trip(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
            let bytes = self.0.round_trip(request)?;
            let mut reply = BatchReply::decode(&bytes)?;
            if let crate::wire::ReplyOutcome::Completed { outputs } = &mut reply.outcome {
                if let Some(u) = outputs.get_mut("u") {
                    *u = crate::array::BatchArray::from_scalars(u.values()[..1].to_vec());
                }
            }
            reply.encode()
        }
    }

    fn flaky(failures: u32) -> Box<dyn WorkerConnection> {
        let worker = Arc::new(BatchWorker::new(Arc::new(OperationRegistry::standard())));
        Box::new(Flaky {
            inner: LoopbackConnection::new("flaky", worker),
            failures: Arc::new(AtomicU32::new(failures)),
        })
    }

    fn run_one(client: &DistributedClient, plan: &Arc<Plan>, batch_index: u64) -> BatchOutcome {
        let mut handles = vec![client.submit(plan, batch_index, 5).unwrap()];
        wait_all(&mut handles, Some(Duration::from_secs(10))).unwrap();
        handles[0].take().unwrap()
    }

    #[test]
    fn no_connections_is_unavailable() {
        let err = DistributedClient::new(Vec::new(), &DistributedConfig::default()).unwrap_err();
        assert!(matches!(err, SimError::Client(ClientError::BackendUnavailable { .. })));
    }

    #[test]
    fn remote_results_equal_local_execution() {
        let client = DistributedClient::new(vec![loopback("a"), loopback("b")], &DistributedConfig::default()).unwrap();
        let plan = plan();
        let mut handles: Vec<BatchHandle> = (0..12).map(|i| client.submit(&plan, i, 5).unwrap()).collect();
        wait_all(&mut handles, Some(Duration::from_secs(10))).unwrap();
        for handle in &mut handles {
            let remote = handle.take().unwrap().unwrap();
            let local = executor::execute(&plan, remote.batch_index, 5).unwrap();
            assert_eq!(remote, local);
        }
    }

    #[test]
    fn transient_failures_are_retried() {
        let client = DistributedClient::new(vec![flaky(2)], &DistributedConfig::default()).unwrap();
        let plan = plan();
        assert!(run_one(&client, &plan, 0).is_ok());
    }

    #[test]
    fn retries_stop_at_max_attempts() {
        let config = DistributedConfig {
            max_attempts: 2,
            ..DistributedConfig::default()
        };
        let client = DistributedClient::new(vec![flaky(5)], &config).unwrap();
        let plan = plan();
        let err = run_one(&client, &plan, 0).unwrap_err();
        assert!(matches!(err, SimError::Transport(TransportError::ConnectionFailed { .. })));
    }

    #[test]
    fn unpaired_replies_are_rejected() {
        let worker = Arc::new(BatchWorker::new(Arc::new(OperationRegistry::standard())));
        let confused: Box<dyn WorkerConnection> = Box::new(Confused(LoopbackConnection::new("confused", worker)));
        let client = DistributedClient::new(vec![confused], &DistributedConfig::default()).unwrap();
        let plan = plan();
        let err = run_one(&client, &plan, 3).unwrap_err();
        assert!(matches!(
            err,
            SimError::Transport(TransportError::MismatchedReply { expected: 3, actual: 4 })
        ));
    }

    #[test]
    fn short_replies_are_malformed() {
        let worker = Arc::new(BatchWorker::new(Arc::new(OperationRegistry::standard())));
        let truncating: Box<dyn WorkerConnection> = Box::new(Truncating(LoopbackConnection::new("short", worker)));
        let client = DistributedClient::new(vec![truncating], &DistributedConfig::default()).unwrap();
        let plan = plan();
        let err = run_one(&client, &plan, 2).unwrap_err();
        assert!(matches!(
            err,
            SimError::Transport(TransportError::MalformedReply { batch_index: 2, .. })
        ));
        assert!(!err.is_retryable());
    }
}
