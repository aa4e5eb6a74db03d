//! Foreign-key dependency graph and write order.
//!
//! Nodes are entity types; there is one edge from a referenced type to every
//! type holding a to-one foreign key into it. The write order is a
//! topological order of that graph (Kahn's algorithm), so a type is always
//! flushed before any type whose rows reference it.
//!
//! Ready nodes are drained in name order, so the result is deterministic for
//! a given schema. Self-references impose no order between types and are
//! ignored. Any other cycle is rejected with
//! [`ContractViolation::SchemaCycle`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use relcache_types::{EntityName, SchemaRegistry};

use crate::error::ContractViolation;

/// Dependency graph over entity types.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaGraph {
    /// Referenced type -> types referencing it.
    dependents: BTreeMap<EntityName, BTreeSet<EntityName>>,
    /// Number of distinct referenced types per type.
    in_degree: BTreeMap<EntityName, usize>,
}

impl SchemaGraph {
    /// Build the graph from every to-one relation in `registry`.
    pub fn build(registry: &SchemaRegistry) -> Self {
        let mut graph = Self::default();
        for schema in registry.iter() {
            graph.in_degree.entry(schema.name.clone()).or_insert(0);
            graph.dependents.entry(schema.name.clone()).or_default();
        }
        for schema in registry.iter() {
            for relation in schema.to_one_relations() {
                if relation.target == schema.name {
                    continue;
                }
                let newly_added = graph
                    .dependents
                    .entry(relation.target.clone())
                    .or_default()
                    .insert(schema.name.clone());
                if newly_added {
                    let degree = graph.in_degree.entry(schema.name.clone()).or_insert(0);
                    *degree = degree.saturating_add(1);
                }
            }
        }
        graph
    }

    /// Types that `name` holds a foreign key into (self excluded).
    pub fn dependencies_of(&self, name: &EntityName) -> BTreeSet<&EntityName> {
        self.dependents
            .iter()
            .filter(|(_, dependents)| dependents.contains(name))
            .map(|(referenced, _)| referenced)
            .collect()
    }

    /// Dependency-first write order.
    pub fn write_order(&self) -> Result<Vec<EntityName>, ContractViolation> {
        let mut in_degree = self.in_degree.clone();
        let mut ready: BTreeSet<EntityName> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| name.clone())
            .collect();

        let mut order = Vec::with_capacity(in_degree.len());
        while let Some(name) = ready.pop_first() {
            if let Some(dependents) = self.dependents.get(&name) {
                for dependent in dependents {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            ready.insert(dependent.clone());
                        }
                    }
                }
            }
            order.push(name);
        }

        if order.len() != in_degree.len() {
            let cyclic: Vec<EntityName> = in_degree
                .into_iter()
                .filter(|(_, degree)| *degree > 0)
                .map(|(name, _)| name)
                .collect();
            return Err(ContractViolation::SchemaCycle(cyclic));
        }
        Ok(order)
    }
}

/// Schema registry shared by every session of a process, with the write
/// order computed once on first use.
#[derive(Debug)]
pub struct Catalog {
    registry: SchemaRegistry,
    write_order: OnceLock<Result<Vec<EntityName>, ContractViolation>>,
}

impl Catalog {
    /// Wrap a validated registry.
    pub const fn new(registry: SchemaRegistry) -> Self {
        Self {
            registry,
            write_order: OnceLock::new(),
        }
    }

    /// The underlying registry.
    pub const fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Memoized dependency-first write order.
    pub fn write_order(&self) -> Result<&[EntityName], ContractViolation> {
        self.write_order
            .get_or_init(|| {
                let order = SchemaGraph::build(&self.registry).write_order();
                if let Ok(order) = &order {
                    tracing::debug!(types = order.len(), "computed entity write order");
                }
                order
            })
            .as_deref()
            .map_err(Clone::clone)
    }
}
