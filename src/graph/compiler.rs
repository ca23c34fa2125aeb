//! Compilation of a frozen [`ModelGraph`] into an executable [`Plan`].
//!
//! A plan is the topologically ordered subset of nodes needed for the
//! requested outputs. Ties between independent nodes are broken by graph
//! insertion order, so the same request always yields the same ordering.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::GraphError;

use super::ops::{OpRef, Operation, OperationRegistry};
use super::{ComputationContext, ModelGraph, NodeRole};

const SEED_DOMAIN: &[u8] = b"simbatch/node-seed/v1";

/// Deterministic seed derivation keyed by batch index and node name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedRule {
    master: u64,
}

impl SeedRule {
    /// Creates a rule from a master seed.
    #[must_use]
    pub const fn new(master: u64) -> Self {
        Self { master }
    }

    /// Master seed.
    #[must_use]
    pub const fn master(&self) -> u64 {
        self.master
    }

    /// 32-byte seed for `node` in batch `batch_index`.
    ///
    /// Distinct nodes of one batch get independent streams; re-running the
    /// same batch index reproduces them exactly.
    #[must_use]
    pub fn node_seed(&self, batch_index: u64, node: &str) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(SEED_DOMAIN);
        hasher.update(&self.master.to_le_bytes());
        hasher.update(&batch_index.to_le_bytes());
        hasher.update(node.as_bytes());
        *hasher.finalize().as_bytes()
    }
}

/// One node-evaluation step.
#[derive(Debug, Clone)]
pub struct Step {
    /// Node name.
    pub name: String,
    /// Role tag of the node.
    pub role: NodeRole,
    /// Operation reference.
    pub op: OpRef,
    /// Positions of the input steps, in argument order. Always smaller than
    /// this step's own position.
    pub inputs: Vec<usize>,
    /// Resolved operation.
    pub operation: Arc<dyn Operation>,
}

/// Serializable description of one step.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    pub role: NodeRole,
    pub op: OpRef,
    pub inputs: Vec<usize>,
}

/// Serializable description of a plan: data and operation names only.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSpec {
    pub steps: Vec<StepSpec>,
    pub outputs: Vec<String>,
    pub context: ComputationContext,
}

impl PlanSpec {
    /// Stable fingerprint of this description.
    pub fn fingerprint(&self) -> Result<String, GraphError> {
        let bytes = serde_json::to_vec(self).map_err(|e| GraphError::InvalidPlan {
            reason: format!("plan is not serializable: {e}"),
        })?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }
}

/// An immutable, ordered evaluation plan.
#[derive(Debug, Clone)]
pub struct Plan {
    steps: Vec<Step>,
    outputs: Vec<String>,
    context: ComputationContext,
    fingerprint: String,
}

impl Plan {
    /// Steps in evaluation order.
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Requested output names.
    #[must_use]
    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    /// Computation context captured at compile time.
    #[must_use]
    pub const fn context(&self) -> ComputationContext {
        self.context
    }

    /// Default replicates per batch.
    #[must_use]
    pub const fn batch_size(&self) -> usize {
        self.context.batch_size
    }

    /// Seed derivation rule.
    #[must_use]
    pub const fn seed_rule(&self) -> SeedRule {
        SeedRule::new(self.context.seed)
    }

    /// Fingerprint of the plan description.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Position of a step by node name.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the plan has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Describes this plan as data.
    #[must_use]
    pub fn to_spec(&self) -> PlanSpec {
        PlanSpec {
            steps: self
                .steps
                .iter()
                .map(|s| StepSpec {
                    name: s.name.clone(),
                    role: s.role,
                    op: s.op.clone(),
                    inputs: s.inputs.clone(),
                })
                .collect(),
            outputs: self.outputs.clone(),
            context: self.context,
        }
    }

    /// Rebuilds a plan from its description, resolving operations by name.
    pub fn from_spec(spec: PlanSpec, registry: &OperationRegistry) -> Result<Self, GraphError> {
        let fingerprint = spec.fingerprint()?;
        let mut seen = HashSet::with_capacity(spec.steps.len());
        let mut steps = Vec::with_capacity(spec.steps.len());
        for (position, step) in spec.steps.into_iter().enumerate() {
            if !seen.insert(step.name.clone()) {
                return Err(GraphError::InvalidPlan {
                    reason: format!("step '{}' appears twice", step.name),
                });
            }
            if let Some(&bad) = step.inputs.iter().find(|&&i| i >= position) {
                return Err(GraphError::InvalidPlan {
                    reason: format!("step '{}' reads step {bad} before it is evaluated", step.name),
                });
            }
            let operation = registry.resolve(&step.op)?;
            steps.push(Step {
                name: step.name,
                role: step.role,
                op: step.op,
                inputs: step.inputs,
                operation,
            });
        }
        if spec.outputs.is_empty() {
            return Err(GraphError::EmptyOutputs);
        }
        if let Some(missing) = spec.outputs.iter().find(|o| !seen.contains(*o)) {
            return Err(GraphError::UnknownNode { name: missing.clone() });
        }
        Ok(Self {
            steps,
            outputs: spec.outputs,
            context: spec.context,
            fingerprint,
        })
    }
}

/// Compiles the steps needed to compute `outputs`.
///
/// # Errors
/// - `NotFrozen` if the graph is still under construction
/// - `EmptyOutputs` if no output is requested
/// - `UnknownNode` if an output name is absent
/// - `CyclicGraph` if the graph has no topological order
pub fn compile<S: AsRef<str>>(graph: &ModelGraph, outputs: &[S]) -> Result<Plan, GraphError> {
    if !graph.is_frozen() {
        return Err(GraphError::NotFrozen);
    }
    if outputs.is_empty() {
        return Err(GraphError::EmptyOutputs);
    }

    let mut requested: Vec<String> = Vec::with_capacity(outputs.len());
    for output in outputs {
        let name = output.as_ref();
        if graph.position(name).is_none() {
            return Err(GraphError::UnknownNode { name: name.to_string() });
        }
        if !requested.iter().any(|r| r == name) {
            requested.push(name.to_string());
        }
    }

    let order = topological_order(graph)?;

    // Ancestor closure of the requested outputs.
    let nodes = graph.nodes();
    let mut needed = vec![false; nodes.len()];
    let mut stack: Vec<usize> = requested.iter().filter_map(|r| graph.position(r)).collect();
    while let Some(i) = stack.pop() {
        if needed[i] {
            continue;
        }
        needed[i] = true;
        for input in nodes[i].inputs() {
            let j = graph
                .position(input)
                .ok_or_else(|| GraphError::UnknownNode { name: input.clone() })?;
            stack.push(j);
        }
    }

    let mut step_of: HashMap<usize, usize> = HashMap::new();
    let mut steps = Vec::new();
    for i in order.into_iter().filter(|&i| needed[i]) {
        let node = &nodes[i];
        let inputs = node
            .inputs()
            .iter()
            .map(|input| {
                graph
                    .position(input)
                    .and_then(|j| step_of.get(&j).copied())
                    .ok_or_else(|| GraphError::UnknownNode { name: input.clone() })
            })
            .collect::<Result<Vec<_>, _>>()?;
        step_of.insert(i, steps.len());
        steps.push(Step {
            name: node.name().to_string(),
            role: node.role(),
            op: node.op().clone(),
            inputs,
            operation: Arc::clone(node.operation()),
        });
    }

    let mut plan = Plan {
        steps,
        outputs: requested,
        context: graph.context(),
        fingerprint: String::new(),
    };
    plan.fingerprint = plan.to_spec().fingerprint()?;
    Ok(plan)
}

/// Kahn's algorithm over the whole graph, ready nodes taken in insertion order.
fn topological_order(graph: &ModelGraph) -> Result<Vec<usize>, GraphError> {
    let nodes = graph.nodes();
    let mut pending: Vec<usize> = nodes.iter().map(|n| n.inputs().len()).collect();
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        for input in node.inputs() {
            let j = graph
                .position(input)
                .ok_or_else(|| GraphError::UnknownNode { name: input.clone() })?;
            children[j].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&i| pending[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &child in &children[i] {
            pending[child] -= 1;
            if pending[child] == 0 {
                ready.insert(child);
            }
        }
    }

    if order.len() < nodes.len() {
        let cyclic = (0..nodes.len())
            .filter(|&i| pending[i] > 0)
            .map(|i| nodes[i].name().to_string())
            .collect();
        return Err(GraphError::CyclicGraph { nodes: cyclic });
    }
    Ok(order)
}
