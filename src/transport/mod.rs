//! gRPC transport for the distributed backend.
//!
//! The RPC surface carries the JSON wire envelopes from [`crate::wire`] as
//! opaque bytes, so a gRPC worker and the in-process loopback worker speak the
//! same protocol.

use std::sync::Arc;

use tonic::transport::Channel;
use tonic::{Code, Request, Response, Status};

use crate::client::WorkerConnection;
use crate::error::TransportError;
use crate::wire::{MAX_REPLY_BYTES, MAX_REQUEST_BYTES};
use crate::worker::BatchWorker;

pub mod proto {
    #![allow(missing_docs)]
    tonic::include_proto!("simbatch");
}

use proto::sim_worker_client::SimWorkerClient;
use proto::sim_worker_server::{SimWorker, SimWorkerServer};

/// gRPC service executing batches with a [`BatchWorker`].
#[derive(Debug)]
pub struct SimWorkerService {
    worker: Arc<BatchWorker>,
}

impl SimWorkerService {
    /// Wraps `worker`.
    #[must_use]
    pub fn new(worker: Arc<BatchWorker>) -> Self {
        Self { worker }
    }

    /// Builds the tonic server with the wire size limits applied.
    #[must_use]
    pub fn into_server(self) -> SimWorkerServer<Self> {
        SimWorkerServer::new(self)
            .max_decoding_message_size(MAX_REQUEST_BYTES + 1024)
            .max_encoding_message_size(MAX_REPLY_BYTES + 1024)
    }
}

fn status_from_transport(err: TransportError) -> Status {
    match err {
        TransportError::DeserializationFailed { .. } => Status::invalid_argument(err.to_string()),
        TransportError::PayloadTooLarge { .. } => Status::resource_exhausted(err.to_string()),
        TransportError::ConnectionFailed { .. } => Status::unavailable(err.to_string()),
        TransportError::SerializationFailed { .. }
        | TransportError::ServerError { .. }
        | TransportError::MismatchedReply { .. }
        | TransportError::MalformedReply { .. } => Status::internal(err.to_string()),
    }
}

#[tonic::async_trait]
impl SimWorker for SimWorkerService {
    async fn execute_batch(
        &self,
        request: Request<proto::ExecuteBatchRequest>,
    ) -> Result<Response<proto::ExecuteBatchResponse>, Status> {
        let payload = request.into_inner().request_json;
        if payload.is_empty() {
            return Err(Status::invalid_argument("request_json is required"));
        }

        // Node evaluation is CPU-bound; keep it off the async workers.
        let worker = Arc::clone(&self.worker);
        let reply_json = tokio::task::spawn_blocking(move || worker.serve(&payload))
            .await
            .map_err(|e| Status::internal(format!("batch task failed: {e}")))?
            .map_err(status_from_transport)?;
        Ok(Response::new(proto::ExecuteBatchResponse { reply_json }))
    }
}

/// Maps a gRPC status code onto an HTTP-like code for `ServerError`.
const fn http_code(code: Code) -> u32 {
    match code {
        Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => 400,
        Code::Unauthenticated => 401,
        Code::PermissionDenied => 403,
        Code::NotFound => 404,
        Code::AlreadyExists | Code::Aborted => 409,
        Code::ResourceExhausted => 429,
        Code::Cancelled => 499,
        Code::Unimplemented => 501,
        Code::Unavailable => 503,
        Code::DeadlineExceeded => 504,
        Code::Ok | Code::Unknown | Code::Internal | Code::DataLoss => 500,
    }
}

fn transport_from_status(status: &Status) -> TransportError {
    match status.code() {
        Code::Unavailable => TransportError::ConnectionFailed {
            message: status.message().to_string(),
        },
        code => TransportError::ServerError {
            code: http_code(code),
            message: status.message().to_string(),
        },
    }
}

/// Blocking connection to a remote gRPC worker.
///
/// Owns a current-thread runtime so it can be driven from a plain dispatcher
/// thread. Must not be used from inside another tokio runtime.
#[derive(Debug)]
pub struct GrpcConnection {
    endpoint: String,
    runtime: tokio::runtime::Runtime,
    client: SimWorkerClient<Channel>,
}

impl GrpcConnection {
    /// Connects to `endpoint`, e.g. `http://127.0.0.1:50061`.
    pub fn connect(endpoint: impl Into<String>) -> Result<Self, TransportError> {
        let endpoint = endpoint.into();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| TransportError::ConnectionFailed {
                message: format!("failed to build runtime: {e}"),
            })?;
        let client = runtime
            .block_on(SimWorkerClient::connect(endpoint.clone()))
            .map_err(|e| TransportError::ConnectionFailed {
                message: format!("{endpoint}: {e}"),
            })?
            .max_decoding_message_size(MAX_REPLY_BYTES + 1024)
            .max_encoding_message_size(MAX_REQUEST_BYTES + 1024);
        tracing::debug!(%endpoint, "connected to remote worker");
        Ok(Self {
            endpoint,
            runtime,
            client,
        })
    }
}

impl WorkerConnection for GrpcConnection {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn round_trip(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        let message = proto::ExecuteBatchRequest {
            request_json: request.to_vec(),
        };
        let client = &mut self.client;
        self.runtime
            .block_on(client.execute_batch(Request::new(message)))
            .map(|response| response.into_inner().reply_json)
            .map_err(|status| transport_from_status(&status))
    }
}
