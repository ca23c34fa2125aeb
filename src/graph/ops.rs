//! Node operations and the named operation registry.
//!
//! Operations are referenced by name (`OpRef`) and resolved through an
//! [`OperationRegistry`]. A remote worker holding the same registrations can
//! rebuild any plan from its description alone.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal, Uniform};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::array::{ArrayError, BatchArray};
use crate::error::GraphError;

/// Error returned by a node operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    #[error("expected {expected} inputs, got {actual}")]
    Arity {
        expected: usize,
        actual: usize,
    },

    #[error("input widths differ: {left} vs {right}")]
    WidthMismatch {
        left: usize,
        right: usize,
    },

    #[error(transparent)]
    Shape(#[from] ArrayError),

    #[error("{0}")]
    Failed(String),
}

impl OperationError {
    /// Creates a free-form failure.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Per-evaluation context handed to every operation.
pub struct EvalContext<'a> {
    /// Index of the batch being evaluated.
    pub batch_index: u64,
    /// Number of replicates to produce.
    pub batch_size: usize,
    /// Generator seeded from (plan seed, batch index, node name).
    pub rng: &'a mut StdRng,
}

/// A pure function from input arrays to one output array.
pub trait Operation: Send + Sync + fmt::Debug {
    /// Evaluates the operation for one batch.
    fn evaluate(&self, inputs: &[&BatchArray], ctx: &mut EvalContext<'_>) -> Result<BatchArray, OperationError>;
}

/// Name plus parameters of a registered operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpRef {
    /// Registry key.
    pub name: String,
    /// Operation parameters, interpreted by the factory.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl OpRef {
    /// References an operation without parameters.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: serde_json::Value::Null,
        }
    }

    /// References an operation with parameters.
    #[must_use]
    pub fn with_params(name: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    /// `constant` broadcasting `row` to every replicate.
    #[must_use]
    pub fn constant(row: &[f64]) -> Self {
        Self::with_params("constant", serde_json::json!({ "value": row }))
    }

    /// `uniform` over `[low, high)`.
    #[must_use]
    pub fn uniform(low: f64, high: f64) -> Self {
        Self::with_params("uniform", serde_json::json!({ "low": low, "high": high }))
    }

    /// `normal` with the given mean and standard deviation.
    #[must_use]
    pub fn normal(mean: f64, std: f64) -> Self {
        Self::with_params("normal", serde_json::json!({ "mean": mean, "std": std }))
    }
}

type EvalFn = dyn Fn(&[&BatchArray], &mut EvalContext<'_>) -> Result<BatchArray, OperationError> + Send + Sync;

/// Operation backed by a closure.
#[derive(Clone)]
pub struct FnOperation {
    name: String,
    f: Arc<EvalFn>,
}

impl FnOperation {
    /// Wraps a closure.
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[&BatchArray], &mut EvalContext<'_>) -> Result<BatchArray, OperationError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Arc::new(f),
        }
    }
}

impl fmt::Debug for FnOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnOperation").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Operation for FnOperation {
    fn evaluate(&self, inputs: &[&BatchArray], ctx: &mut EvalContext<'_>) -> Result<BatchArray, OperationError> {
        (self.f)(inputs, ctx)
    }
}

/// Builds an operation from its parameters.
pub type OperationFactory = Arc<dyn Fn(&serde_json::Value) -> Result<Arc<dyn Operation>, GraphError> + Send + Sync>;

/// Named operation factories.
#[derive(Clone, Default)]
pub struct OperationRegistry {
    factories: HashMap<String, OperationFactory>,
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("OperationRegistry").field("operations", &names).finish()
    }
}

impl OperationRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the standard operation library.
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register("constant", |p| Ok(Arc::new(Constant::from_params(p)?) as Arc<dyn Operation>));
        registry.register("uniform", |p| Ok(Arc::new(UniformOp::from_params(p)?) as Arc<dyn Operation>));
        registry.register("normal", |p| Ok(Arc::new(NormalOp::from_params(p)?) as Arc<dyn Operation>));
        registry.register("gaussian_noise", |p| {
            Ok(Arc::new(GaussianNoise::from_params(p)?) as Arc<dyn Operation>)
        });
        registry.register("add", |_| Ok(Arc::new(Add) as Arc<dyn Operation>));
        registry.register("mean", |_| Ok(Arc::new(RowMean) as Arc<dyn Operation>));
        registry.register("absolute_difference", |_| {
            Ok(Arc::new(AbsoluteDifference) as Arc<dyn Operation>)
        });
        registry.register("euclidean", |_| Ok(Arc::new(Euclidean) as Arc<dyn Operation>));
        registry
    }

    /// Registers a parameterised factory, replacing any previous one.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&serde_json::Value) -> Result<Arc<dyn Operation>, GraphError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Registers a parameterless closure operation.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&[&BatchArray], &mut EvalContext<'_>) -> Result<BatchArray, OperationError> + Send + Sync + 'static,
    {
        let name = name.into();
        let op: Arc<dyn Operation> = Arc::new(FnOperation::new(name.clone(), f));
        self.register(name, move |_| Ok(Arc::clone(&op)));
    }

    /// Returns true if `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Instantiates the referenced operation.
    pub fn resolve(&self, op: &OpRef) -> Result<Arc<dyn Operation>, GraphError> {
        let factory = self.factories.get(&op.name).ok_or_else(|| GraphError::UnknownOperation {
            op: op.name.clone(),
        })?;
        factory(&op.params)
    }
}

fn parse_params<T: DeserializeOwned>(op: &str, params: &serde_json::Value) -> Result<T, GraphError> {
    serde_json::from_value(params.clone()).map_err(|e| GraphError::InvalidParameters {
        op: op.to_string(),
        reason: e.to_string(),
    })
}

fn expect_arity(inputs: &[&BatchArray], expected: usize) -> Result<(), OperationError> {
    if inputs.len() == expected {
        Ok(())
    } else {
        Err(OperationError::Arity {
            expected,
            actual: inputs.len(),
        })
    }
}

fn expect_same_width(a: &BatchArray, b: &BatchArray) -> Result<(), OperationError> {
    if a.width() == b.width() {
        Ok(())
    } else {
        Err(OperationError::WidthMismatch {
            left: a.width(),
            right: b.width(),
        })
    }
}

// ----------------------------------------------------------------------------
// Standard library
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ConstantValue {
    Scalar(f64),
    Row(Vec<f64>),
}

#[derive(Debug, Deserialize)]
struct ConstantParams {
    value: ConstantValue,
}

/// Broadcasts a fixed row to every replicate.
#[derive(Debug, Clone)]
pub struct Constant {
    row: Vec<f64>,
}

impl Constant {
    fn from_params(params: &serde_json::Value) -> Result<Self, GraphError> {
        let p: ConstantParams = parse_params("constant", params)?;
        let row = match p.value {
            ConstantValue::Scalar(v) => vec![v],
            ConstantValue::Row(r) => r,
        };
        if row.is_empty() {
            return Err(GraphError::InvalidParameters {
                op: "constant".to_string(),
                reason: "value must not be empty".to_string(),
            });
        }
        Ok(Self { row })
    }
}

impl Operation for Constant {
    fn evaluate(&self, inputs: &[&BatchArray], ctx: &mut EvalContext<'_>) -> Result<BatchArray, OperationError> {
        expect_arity(inputs, 0)?;
        Ok(BatchArray::broadcast(&self.row, ctx.batch_size)?)
    }
}

#[derive(Debug, Deserialize)]
struct UniformParams {
    low: f64,
    high: f64,
}

/// Draws from `Uniform[low, high)`.
#[derive(Debug, Clone)]
pub struct UniformOp {
    dist: Uniform<f64>,
}

impl UniformOp {
    fn from_params(params: &serde_json::Value) -> Result<Self, GraphError> {
        let p: UniformParams = parse_params("uniform", params)?;
        if !(p.low.is_finite() && p.high.is_finite() && p.low < p.high) {
            return Err(GraphError::InvalidParameters {
                op: "uniform".to_string(),
                reason: format!("require finite low < high, got [{}, {})", p.low, p.high),
            });
        }
        Ok(Self {
            dist: Uniform::new(p.low, p.high),
        })
    }
}

impl Operation for UniformOp {
    fn evaluate(&self, inputs: &[&BatchArray], ctx: &mut EvalContext<'_>) -> Result<BatchArray, OperationError> {
        expect_arity(inputs, 0)?;
        let values = (0..ctx.batch_size).map(|_| self.dist.sample(&mut *ctx.rng)).collect();
        Ok(BatchArray::from_scalars(values))
    }
}

#[derive(Debug, Deserialize)]
struct NormalParams {
    mean: f64,
    std: f64,
}

/// Draws from `Normal(mean, std)`.
#[derive(Debug, Clone)]
pub struct NormalOp {
    dist: Normal<f64>,
}

impl NormalOp {
    fn from_params(params: &serde_json::Value) -> Result<Self, GraphError> {
        let p: NormalParams = parse_params("normal", params)?;
        let dist = Normal::new(p.mean, p.std).map_err(|e| GraphError::InvalidParameters {
            op: "normal".to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { dist })
    }
}

impl Operation for NormalOp {
    fn evaluate(&self, inputs: &[&BatchArray], ctx: &mut EvalContext<'_>) -> Result<BatchArray, OperationError> {
        expect_arity(inputs, 0)?;
        let values = (0..ctx.batch_size).map(|_| self.dist.sample(&mut *ctx.rng)).collect();
        Ok(BatchArray::from_scalars(values))
    }
}

#[derive(Debug, Deserialize)]
struct NoiseParams {
    std: f64,
}

/// Adds independent `Normal(0, std)` noise to every input value.
#[derive(Debug, Clone)]
pub struct GaussianNoise {
    dist: Normal<f64>,
}

impl GaussianNoise {
    fn from_params(params: &serde_json::Value) -> Result<Self, GraphError> {
        let p: NoiseParams = parse_params("gaussian_noise", params)?;
        let dist = Normal::new(0.0, p.std).map_err(|e| GraphError::InvalidParameters {
            op: "gaussian_noise".to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { dist })
    }
}

impl Operation for GaussianNoise {
    fn evaluate(&self, inputs: &[&BatchArray], ctx: &mut EvalContext<'_>) -> Result<BatchArray, OperationError> {
        expect_arity(inputs, 1)?;
        let x = inputs[0];
        let values = x.values().iter().map(|v| v + self.dist.sample(&mut *ctx.rng)).collect();
        Ok(BatchArray::new(x.width(), values)?)
    }
}

/// Element-wise sum of two inputs.
#[derive(Debug, Clone, Copy)]
pub struct Add;

impl Operation for Add {
    fn evaluate(&self, inputs: &[&BatchArray], _ctx: &mut EvalContext<'_>) -> Result<BatchArray, OperationError> {
        expect_arity(inputs, 2)?;
        expect_same_width(inputs[0], inputs[1])?;
        let values = inputs[0]
            .values()
            .iter()
            .zip(inputs[1].values())
            .map(|(a, b)| a + b)
            .collect();
        Ok(BatchArray::new(inputs[0].width(), values)?)
    }
}

/// Mean of each row.
#[derive(Debug, Clone, Copy)]
pub struct RowMean;

impl Operation for RowMean {
    fn evaluate(&self, inputs: &[&BatchArray], _ctx: &mut EvalContext<'_>) -> Result<BatchArray, OperationError> {
        expect_arity(inputs, 1)?;
        let width = inputs[0].width() as f64;
        Ok(inputs[0].map_rows(|r| r.iter().sum::<f64>() / width))
    }
}

/// Row-wise L1 distance between two inputs.
#[derive(Debug, Clone, Copy)]
pub struct AbsoluteDifference;

impl Operation for AbsoluteDifference {
    fn evaluate(&self, inputs: &[&BatchArray], _ctx: &mut EvalContext<'_>) -> Result<BatchArray, OperationError> {
        expect_arity(inputs, 2)?;
        expect_same_width(inputs[0], inputs[1])?;
        let values = inputs[0]
            .rows()
            .zip(inputs[1].rows())
            .map(|(a, b)| a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum())
            .collect();
        Ok(BatchArray::from_scalars(values))
    }
}

/// Row-wise L2 distance between two inputs.
#[derive(Debug, Clone, Copy)]
pub struct Euclidean;

impl Operation for Euclidean {
    fn evaluate(&self, inputs: &[&BatchArray], _ctx: &mut EvalContext<'_>) -> Result<BatchArray, OperationError> {
        expect_arity(inputs, 2)?;
        expect_same_width(inputs[0], inputs[1])?;
        let values = inputs[0]
            .rows()
            .zip(inputs[1].rows())
            .map(|(a, b)| a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f64>().sqrt())
            .collect();
        Ok(BatchArray::from_scalars(values))
    }
}
