//! In-memory store of node outputs, keyed by node name and batch index.

use std::collections::{BTreeMap, HashMap};

use crate::array::BatchArray;
use crate::error::ValidationError;
use crate::executor::BatchResult;
use crate::graph::ComputationContext;

/// Per-node batch store.
///
/// Only nodes with a store are recorded. Adding the same batch twice keeps
/// the first copy.
#[derive(Debug, Clone, Default)]
pub struct OutputPool {
    stores: HashMap<String, BTreeMap<u64, BatchArray>>,
    context: Option<ComputationContext>,
}

impl OutputPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a pool with an empty store for each of `nodes`.
    #[must_use]
    pub fn with_stores<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stores: nodes.into_iter().map(|n| (n.into(), BTreeMap::new())).collect(),
            context: None,
        }
    }

    /// Adds an empty store for `node`.
    ///
    /// # Errors
    /// `InvalidConfig` if the store already exists.
    pub fn add_store(&mut self, node: impl Into<String>) -> Result<(), ValidationError> {
        let node = node.into();
        if self.stores.contains_key(&node) {
            return Err(ValidationError::InvalidConfig {
                reason: format!("store for node '{node}' already exists"),
            });
        }
        self.stores.insert(node, BTreeMap::new());
        Ok(())
    }

    /// Removes the store for `node` and returns its batches.
    pub fn remove_store(&mut self, node: &str) -> Option<BTreeMap<u64, BatchArray>> {
        self.stores.remove(node)
    }

    /// Returns true if `node` has a store.
    #[must_use]
    pub fn has_store(&self, node: &str) -> bool {
        self.stores.contains_key(node)
    }

    /// Returns true if batch `batch_index` is stored for `node`.
    #[must_use]
    pub fn contains(&self, node: &str, batch_index: u64) -> bool {
        self.stores.get(node).is_some_and(|s| s.contains_key(&batch_index))
    }

    /// Records the outputs of `result` for every node with a store.
    pub fn add_batch(&mut self, result: &BatchResult) {
        for (node, store) in &mut self.stores {
            if let Some(array) = result.outputs.get(node) {
                store.entry(result.batch_index).or_insert_with(|| array.clone());
            }
        }
    }

    /// Stored outputs of batch `batch_index`, keyed by node.
    #[must_use]
    pub fn get_batch(&self, batch_index: u64) -> BTreeMap<&str, &BatchArray> {
        self.stores
            .iter()
            .filter_map(|(node, store)| store.get(&batch_index).map(|a| (node.as_str(), a)))
            .collect()
    }

    /// Drops batch `batch_index` from every store.
    pub fn remove_batch(&mut self, batch_index: u64) {
        for store in self.stores.values_mut() {
            store.remove(&batch_index);
        }
    }

    /// Largest number of batches held by any store.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stores.values().map(BTreeMap::len).max().unwrap_or(0)
    }

    /// Returns true if no store holds a batch.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every stored batch, keeping the stores.
    pub fn clear(&mut self) {
        for store in self.stores.values_mut() {
            store.clear();
        }
    }

    /// Names of the stored nodes, sorted.
    #[must_use]
    pub fn outputs(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.stores.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Computation context the stored batches were produced with.
    #[must_use]
    pub const fn context(&self) -> Option<ComputationContext> {
        self.context
    }

    /// Sets the context. Allowed once.
    ///
    /// # Errors
    /// `InvalidConfig` if a context is already set.
    pub fn set_context(&mut self, context: ComputationContext) -> Result<(), ValidationError> {
        if self.context.is_some() {
            return Err(ValidationError::InvalidConfig {
                reason: "output pool context is already set".to_string(),
            });
        }
        self.context = Some(context);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(batch_index: u64, value: f64) -> BatchResult {
        BatchResult {
            batch_index,
            batch_size: 2,
            outputs: [
                ("theta".to_string(), BatchArray::from_scalars(vec![value, value])),
                ("d".to_string(), BatchArray::from_scalars(vec![-value, -value])),
            ]
            .into_iter()
            .collect(),
        }
    }

    #[test]
    fn records_only_stored_nodes() {
        let mut pool = OutputPool::with_stores(["theta"]);
        pool.add_batch(&batch(0, 1.0));
        assert!(pool.contains("theta", 0));
        assert!(!pool.contains("d", 0));
        assert_eq!(pool.get_batch(0).len(), 1);
    }

    #[test]
    fn add_batch_is_idempotent() {
        let mut pool = OutputPool::with_stores(["theta"]);
        pool.add_batch(&batch(3, 1.0));
        pool.add_batch(&batch(3, 2.0));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.get_batch(3)["theta"].values(), &[1.0, 1.0]);
    }

    #[test]
    fn len_is_the_largest_store() {
        let mut pool = OutputPool::with_stores(["theta"]);
        pool.add_batch(&batch(0, 1.0));
        pool.add_batch(&batch(1, 1.0));
        pool.add_store("d").unwrap();
        pool.add_batch(&batch(2, 1.0));
        assert_eq!(pool.len(), 3);

        pool.remove_batch(2);
        assert_eq!(pool.len(), 2);
        assert!(!pool.contains("d", 2));

        pool.clear();
        assert!(pool.is_empty());
        assert_eq!(pool.outputs(), vec!["d", "theta"]);
    }

    #[test]
    fn duplicate_store_is_rejected() {
        let mut pool = OutputPool::new();
        pool.add_store("theta").unwrap();
        assert!(pool.add_store("theta").is_err());
        assert!(pool.remove_store("theta").is_some());
        assert!(!pool.has_store("theta"));
    }

    #[test]
    fn context_is_set_once() {
        let mut pool = OutputPool::new();
        pool.set_context(ComputationContext::new(2, 7)).unwrap();
        assert!(pool.set_context(ComputationContext::new(2, 8)).is_err());
        assert_eq!(pool.context(), Some(ComputationContext::new(2, 7)));
    }
}
