//! An insertion-ordered directed acyclic graph with deferred insertion.
//!
//! Values whose dependencies are not yet present are parked in a deferred set
//! and promoted as soon as every dependency has been inserted. Iteration
//! yields values in an order where dependencies precede their dependents; a
//! graph with unpromoted entries is invalid and refuses to iterate, which is
//! how both cycles and missing nodes surface.

use crate::error::{BuildError, Result};
use indexmap::IndexMap;
use std::{fmt, hash::Hash};

#[derive(Debug, Clone)]
pub struct Dag<K, V> {
    graph: IndexMap<K, V>,
    deferred: Vec<(K, V, Vec<K>)>,
}

impl<K, V> Default for Dag<K, V> {
    fn default() -> Self {
        Self { graph: IndexMap::new(), deferred: Vec::new() }
    }
}

impl<K, V> Dag<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an item into the graph under `key`, ordered after all of `deps`.
    ///
    /// If any dependency is not present yet, the item is deferred; it will be
    /// promoted automatically once its dependencies arrive.
    pub fn add(&mut self, key: K, value: V, deps: impl IntoIterator<Item = K>) -> Result<()> {
        if self.graph.contains_key(&key) || self.deferred.iter().any(|(k, ..)| *k == key) {
            return Err(BuildError::internal(format!(
                "duplicate item in dependency graph: {key:?}"
            )));
        }
        let deps: Vec<K> = deps.into_iter().collect();
        if deps.iter().any(|dep| !self.graph.contains_key(dep)) {
            self.deferred.push((key, value, deps));
            return Ok(());
        }
        self.graph.insert(key, value);

        // Keep promoting deferred entries until a pass adds nothing.
        loop {
            let mut promoted = Vec::new();
            for (idx, (_, _, deps)) in self.deferred.iter().enumerate() {
                if deps.iter().all(|dep| self.graph.contains_key(dep)) {
                    promoted.push(idx);
                }
            }
            if promoted.is_empty() {
                break;
            }
            let mut removed = 0;
            for idx in promoted {
                let (key, value, _) = self.deferred.remove(idx - removed);
                removed += 1;
                self.graph.insert(key, value);
            }
        }
        Ok(())
    }

    /// True iff every added item has had its dependencies resolved.
    ///
    /// A false result means the graph contains a cycle or references a node
    /// that was never added.
    pub fn is_valid(&self) -> bool {
        self.deferred.is_empty()
    }

    /// Number of items added, including deferred ones.
    pub fn len(&self) -> usize {
        self.graph.len() + self.deferred.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &K) -> bool {
        self.graph.contains_key(key) || self.deferred.iter().any(|(k, ..)| k == key)
    }

    /// Iterate values in dependency order.
    ///
    /// Fails if the graph is invalid, naming the deferred keys.
    pub fn iter(&self) -> Result<impl Iterator<Item = &V>> {
        self.ensure_valid()?;
        Ok(self.graph.values())
    }

    /// Consume the graph, yielding values in dependency order.
    pub fn into_ordered(self) -> Result<Vec<V>> {
        self.ensure_valid()?;
        Ok(self.graph.into_values().collect())
    }

    fn ensure_valid(&self) -> Result<()> {
        if !self.is_valid() {
            return Err(BuildError::UnresolvedDependencies(
                self.deferred.iter().map(|(k, ..)| format!("{k:?}")).collect(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_node(dag: &mut Dag<i32, i32>, value: i32, deps: &[i32]) {
        dag.add(value, value, deps.iter().copied()).unwrap();
    }

    #[test]
    fn orders_dependencies_first() {
        let mut dag = Dag::new();
        add_node(&mut dag, 1, &[2, 3, 4, 5]);
        add_node(&mut dag, 3, &[4, 5]);
        add_node(&mut dag, 5, &[]);
        add_node(&mut dag, 2, &[3, 4, 5]);
        add_node(&mut dag, 4, &[5]);
        assert_eq!(dag.len(), 5);
        assert!(dag.is_valid());
        let order: Vec<i32> = dag.iter().unwrap().copied().collect();
        assert_eq!(order, vec![5, 4, 3, 2, 1]);
    }

    #[test]
    fn circular_dependency_invalidates() {
        let mut dag = Dag::new();
        add_node(&mut dag, 1, &[2, 3, 4, 5]);
        add_node(&mut dag, 3, &[4, 5]);
        add_node(&mut dag, 5, &[1]);
        add_node(&mut dag, 2, &[3, 4, 5]);
        add_node(&mut dag, 4, &[5]);
        assert!(!dag.is_valid());
        assert_eq!(dag.len(), 5);
        assert!(dag.iter().is_err());
    }

    #[test]
    fn missing_dependency_invalidates() {
        let mut dag = Dag::new();
        add_node(&mut dag, 1, &[2, 3, 4, 5]);
        add_node(&mut dag, 3, &[4, 5]);
        add_node(&mut dag, 5, &[]);
        add_node(&mut dag, 2, &[3, 4, 5]);
        assert!(!dag.is_valid());
        assert_eq!(dag.len(), 4);
        assert!(dag.iter().is_err());
    }

    #[test]
    fn values_keyed_separately_from_payload() {
        struct Wrapped(i32);
        let mut dag: Dag<i32, Wrapped> = Dag::new();
        dag.add(1, Wrapped(1), [2, 3, 4, 5]).unwrap();
        dag.add(3, Wrapped(3), [4, 5]).unwrap();
        dag.add(5, Wrapped(5), []).unwrap();
        dag.add(2, Wrapped(2), [3, 4, 5]).unwrap();
        dag.add(4, Wrapped(4), [5]).unwrap();
        assert_eq!(dag.len(), 5);
        let order: Vec<i32> = dag.iter().unwrap().map(|w| w.0).collect();
        assert_eq!(order, vec![5, 4, 3, 2, 1]);
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let mut dag = Dag::new();
        add_node(&mut dag, 1, &[]);
        assert!(dag.add(1, 1, []).is_err());
    }
}
