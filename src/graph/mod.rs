//! Model graph: an arena of named nodes with edges stored as name references.
//!
//! The graph is mutable only while the model is being built. [`ModelGraph::freeze`]
//! validates every input reference; after that the graph is read-only and can be
//! compiled into any number of [`Plan`]s.

/// Graph compilation into executable plans.
pub mod compiler;
/// Node operations and the operation registry.
pub mod ops;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::GraphError;

pub use compiler::{compile, Plan, PlanSpec, SeedRule, Step, StepSpec};
pub use ops::{EvalContext, FnOperation, OpRef, Operation, OperationError, OperationFactory, OperationRegistry};

/// Role of a node in the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Fixed value, identical for every replicate.
    Constant,
    /// Random source (priors, simulators).
    Stochastic,
    /// Deterministic function of its inputs (summaries, discrepancies).
    Transform,
    /// Observed data anchor.
    Observed,
}

/// An input reference of a node.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// Output of another node.
    Node(String),
    /// A literal row broadcast to every replicate.
    Literal(Vec<f64>),
}

impl From<&str> for Input {
    fn from(name: &str) -> Self {
        Self::Node(name.to_string())
    }
}

impl From<String> for Input {
    fn from(name: String) -> Self {
        Self::Node(name)
    }
}

impl From<f64> for Input {
    fn from(value: f64) -> Self {
        Self::Literal(vec![value])
    }
}

impl From<Vec<f64>> for Input {
    fn from(values: Vec<f64>) -> Self {
        Self::Literal(values)
    }
}

/// Batch size and master seed of a computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputationContext {
    /// Replicates per batch.
    pub batch_size: usize,
    /// Master seed all node seeds derive from.
    pub seed: u64,
}

impl ComputationContext {
    /// Creates a context.
    #[must_use]
    pub const fn new(batch_size: usize, seed: u64) -> Self {
        Self { batch_size, seed }
    }
}

impl Default for ComputationContext {
    /// Batch size 1 and a fresh random seed.
    fn default() -> Self {
        Self {
            batch_size: 1,
            seed: rand::random(),
        }
    }
}

/// A named unit of computation.
#[derive(Clone)]
pub struct Node {
    name: String,
    op: OpRef,
    inputs: Vec<String>,
    role: NodeRole,
    operation: Arc<dyn Operation>,
}

impl Node {
    /// Node name, unique within its graph.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Operation reference this node was built from.
    #[must_use]
    pub const fn op(&self) -> &OpRef {
        &self.op
    }

    /// Names of the input nodes, in argument order.
    #[must_use]
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    /// Role tag.
    #[must_use]
    pub const fn role(&self) -> NodeRole {
        self.role
    }

    /// Resolved operation.
    #[must_use]
    pub fn operation(&self) -> &Arc<dyn Operation> {
        &self.operation
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("op", &self.op.name)
            .field("inputs", &self.inputs)
            .field("role", &self.role)
            .finish()
    }
}

/// A directed acyclic graph of nodes, stored in insertion order.
#[derive(Debug, Clone)]
pub struct ModelGraph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    registry: Arc<OperationRegistry>,
    context: ComputationContext,
    frozen: bool,
}

impl ModelGraph {
    /// Creates an empty graph resolving operations through `registry`.
    #[must_use]
    pub fn new(registry: Arc<OperationRegistry>) -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            registry,
            context: ComputationContext::default(),
            frozen: false,
        }
    }

    /// Sets the computation context copied into compiled plans.
    #[must_use]
    pub fn with_context(mut self, context: ComputationContext) -> Self {
        self.context = context;
        self
    }

    /// Adds a node.
    ///
    /// Literal inputs become constant nodes named `_<name>_<position>`. Input
    /// node names may refer to nodes added later; they are checked by
    /// [`freeze`](Self::freeze).
    pub fn add_node<I>(&mut self, name: impl Into<String>, op: OpRef, inputs: I, role: NodeRole) -> Result<(), GraphError>
    where
        I: IntoIterator,
        I::Item: Into<Input>,
    {
        if self.frozen {
            return Err(GraphError::Frozen);
        }
        let name = name.into();
        if self.index.contains_key(&name) {
            return Err(GraphError::DuplicateNode { name });
        }
        let operation = self.registry.resolve(&op)?;

        let mut input_names = Vec::new();
        let mut literals = Vec::new();
        for (position, input) in inputs.into_iter().map(Into::into).enumerate() {
            match input {
                Input::Node(parent) => input_names.push(parent),
                Input::Literal(row) => {
                    let constant = format!("_{name}_{position}");
                    if self.index.contains_key(&constant) {
                        return Err(GraphError::DuplicateNode { name: constant });
                    }
                    input_names.push(constant.clone());
                    literals.push((constant, row));
                }
            }
        }

        // Resolve every literal before touching the arena so a failure leaves it unchanged.
        let constants = literals
            .into_iter()
            .map(|(constant, row)| {
                let op = OpRef::constant(&row);
                let operation = self.registry.resolve(&op)?;
                Ok(Node {
                    name: constant,
                    op,
                    inputs: Vec::new(),
                    role: NodeRole::Constant,
                    operation,
                })
            })
            .collect::<Result<Vec<_>, GraphError>>()?;
        for node in constants {
            self.push(node);
        }

        self.push(Node {
            name,
            op,
            inputs: input_names,
            role,
            operation,
        });
        Ok(())
    }

    fn push(&mut self, node: Node) {
        self.index.insert(node.name.clone(), self.nodes.len());
        self.nodes.push(node);
    }

    /// Validates input references and makes the graph read-only.
    pub fn freeze(&mut self) -> Result<(), GraphError> {
        for node in &self.nodes {
            for input in &node.inputs {
                if !self.index.contains_key(input) {
                    return Err(GraphError::UnknownNode { name: input.clone() });
                }
            }
        }
        self.frozen = true;
        Ok(())
    }

    /// Returns true once [`freeze`](Self::freeze) succeeded.
    #[must_use]
    pub const fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Looks a node up by name.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    /// Arena position of a node.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Input nodes of `name`.
    pub fn parents(&self, name: &str) -> Result<Vec<&Node>, GraphError> {
        let node = self.node(name).ok_or_else(|| GraphError::UnknownNode {
            name: name.to_string(),
        })?;
        node.inputs
            .iter()
            .map(|input| {
                self.node(input).ok_or_else(|| GraphError::UnknownNode {
                    name: input.clone(),
                })
            })
            .collect()
    }

    /// Nodes in insertion order.
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Registry used to resolve operations.
    #[must_use]
    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    /// Computation context.
    #[must_use]
    pub const fn context(&self) -> ComputationContext {
        self.context
    }
}
