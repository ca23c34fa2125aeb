//! Error types for simbatch.
//!
//! All errors are strongly typed using thiserror, one enum per concern,
//! wrapped by [`SimError`]. Compile-time graph errors surface synchronously;
//! execution errors travel with the batch handle they belong to.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while building or compiling a model graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("Unknown node: '{name}'")]
    UnknownNode {
        name: String,
    },

    #[error("Graph contains a cycle through: {}", nodes.join(", "))]
    CyclicGraph {
        nodes: Vec<String>,
    },

    #[error("Node '{name}' already exists")]
    DuplicateNode {
        name: String,
    },

    #[error("Operation '{op}' is not registered")]
    UnknownOperation {
        op: String,
    },

    #[error("Invalid parameters for operation '{op}': {reason}")]
    InvalidParameters {
        op: String,
        reason: String,
    },

    #[error("Graph is frozen and cannot be modified")]
    Frozen,

    #[error("Graph must be frozen before compilation")]
    NotFrozen,

    #[error("At least one output node must be requested")]
    EmptyOutputs,

    #[error("Invalid plan: {reason}")]
    InvalidPlan {
        reason: String,
    },
}

/// Why a node evaluation failed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    #[error("operation failed: {message}")]
    Operation {
        message: String,
    },

    #[error("operation panicked: {message}")]
    Panic {
        message: String,
    },

    #[error("output has {actual} rows, expected batch size {expected}")]
    Shape {
        expected: usize,
        actual: usize,
    },
}

/// A single batch failed while evaluating one of its nodes.
///
/// Fatal for that batch only; no partial result is ever produced.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("Node '{node}' failed in batch {batch_index}: {cause}")]
pub struct ExecutionError {
    /// Name of the failing node.
    pub node: String,
    /// Batch the node was evaluated for.
    pub batch_index: u64,
    /// Underlying cause.
    pub cause: FailureCause,
}

/// Backend errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("Backend unavailable: {reason}")]
    BackendUnavailable {
        reason: String,
    },

    #[error("Submission queue is full (capacity {capacity})")]
    QueueFull {
        capacity: usize,
    },

    #[error("Worker disconnected before batch {batch_index} resolved")]
    Disconnected {
        batch_index: u64,
    },

    #[error("Timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Worker rejected batch {batch_index}: {message}")]
    RemoteRejected {
        batch_index: u64,
        message: String,
    },
}

/// Transport errors for the distributed backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection failed: {message}")]
    ConnectionFailed {
        message: String,
    },

    #[error("Failed to serialize request: {message}")]
    SerializationFailed {
        message: String,
    },

    #[error("Failed to deserialize payload: {message}")]
    DeserializationFailed {
        message: String,
    },

    #[error("Server error (code {code}): {message}")]
    ServerError {
        code: u32,
        message: String,
    },

    #[error("Reply for batch {actual} does not match request for batch {expected}")]
    MismatchedReply {
        expected: u64,
        actual: u64,
    },

    #[error("Reply for batch {batch_index} is malformed: {reason}")]
    MalformedReply {
        batch_index: u64,
        reason: String,
    },

    #[error("Payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge {
        size: usize,
        limit: usize,
    },
}

/// Configuration errors of the inference layer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("At least one parameter node is required")]
    NoParameters,

    #[error("Number of requested samples must be positive")]
    ZeroSamples,

    #[error("Quantile {value} is outside (0, 1]")]
    InvalidQuantile {
        value: f64,
    },

    #[error("Threshold {value} must be a finite number")]
    InvalidThreshold {
        value: f64,
    },

    #[error("Batch size must be positive")]
    ZeroBatchSize,

    #[error("Simulation budget {budget} is smaller than the batch size {batch_size}")]
    BudgetTooSmall {
        budget: u64,
        batch_size: usize,
    },

    #[error("Discrepancy node '{node}' produced rows of width {width}, expected 1")]
    DiscrepancyNotScalar {
        node: String,
        width: usize,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Top-level error type for simbatch.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl SimError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a graph error.
    #[must_use]
    pub const fn is_graph(&self) -> bool {
        matches!(self, Self::Graph(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is a client error.
    #[must_use]
    pub const fn is_client(&self) -> bool {
        matches!(self, Self::Client(_))
    }

    /// Returns true if this is a transport error.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// The failing batch, when the error is tied to one.
    #[must_use]
    pub fn batch_index(&self) -> Option<u64> {
        match self {
            Self::Execution(e) => Some(e.batch_index),
            Self::Transport(TransportError::MalformedReply { batch_index, .. }) => Some(*batch_index),
            Self::Client(ClientError::Disconnected { batch_index })
            | Self::Client(ClientError::RemoteRejected { batch_index, .. }) => Some(*batch_index),
            _ => None,
        }
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Graph(_) | Self::Validation(_) | Self::Execution(_) => false,
            Self::Client(e) => matches!(e, ClientError::Timeout { .. }),
            Self::Transport(e) => match e {
                TransportError::ConnectionFailed { .. } => true,
                TransportError::ServerError { code, .. } => *code >= 500,
                _ => false,
            },
            Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for simbatch operations.
pub type SimResult<T> = Result<T, SimError>;
