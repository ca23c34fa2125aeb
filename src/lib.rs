//! # simbatch - batched simulation engine for likelihood-free inference
//!
//! simbatch evaluates a generative model many times in independent,
//! reproducible batches and feeds the results to inference algorithms such as
//! rejection sampling.
//!
//! ## Core Concepts
//!
//! - **Model Graph**: named nodes (priors, simulators, summaries, discrepancies)
//!   connected by data dependencies
//! - **Compiled Plan**: the ordered subset of nodes needed for requested outputs
//! - **Batch**: one plan evaluation of `batch_size` replicates, keyed by index
//! - **Client**: the backend that runs batches (direct, local pool, distributed)
//! - **Batch Handler**: keeps batches in flight and yields them as they finish
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use simbatch::{Client, ClientConfig, ComputationContext, ModelGraph, NodeRole, OpRef, OperationRegistry};
//! use simbatch::inference::{Rejection, RejectionConfig, StoppingRule};
//!
//! let registry = Arc::new(OperationRegistry::standard());
//! let mut graph = ModelGraph::new(Arc::clone(&registry)).with_context(ComputationContext::new(1000, 7));
//! graph.add_node("theta", OpRef::uniform(0.0, 1.0), Vec::<simbatch::Input>::new(), NodeRole::Stochastic)?;
//! graph.add_node("d", OpRef::new("absolute_difference"), [simbatch::Input::from("theta"), 0.5.into()], NodeRole::Transform)?;
//! graph.freeze()?;
//!
//! let client = Client::from_config(&ClientConfig::default(), registry)?;
//! let config = RejectionConfig::new(["theta"], "d", 50, StoppingRule::Quantile(0.01)).with_budget(100_000);
//! let result = Rejection::new(&graph, config, client)?.sample()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]

// Core types
pub mod array;
pub mod error;
pub mod graph;

// Execution
pub mod client;
pub mod executor;
pub mod handler;
pub mod output_pool;
pub mod wire;
pub mod worker;

// Algorithms
pub mod inference;

#[cfg(feature = "transport-grpc")]
pub mod transport;

pub use array::{ArrayError, BatchArray};
pub use client::{
    BackendKind, BatchHandle, BatchOutcome, Client, ClientConfig, DirectClient, DistributedClient, DistributedConfig,
    LocalPoolClient, LocalPoolConfig, LoopbackConnection, WorkerConnection,
};
pub use error::{
    ClientError, ExecutionError, FailureCause, GraphError, SimError, SimResult, TransportError, ValidationError,
};
pub use executor::{execute, BatchResult};
pub use graph::{
    compile, ComputationContext, EvalContext, Input, ModelGraph, Node, NodeRole, OpRef, Operation, OperationError,
    OperationRegistry, Plan, PlanSpec,
};
pub use handler::{BatchHandler, BatchHandlerConfig};
pub use output_pool::OutputPool;
pub use worker::BatchWorker;
