//! Dependency ordering over tool specs.
//!
//! An edge `A -> B` means "B depends on A": A must converge before B is
//! attempted. Ordering uses Kahn's algorithm with the ready set drained in
//! input order, so independent specs keep the order they were declared in.

use std::collections::{BTreeSet, HashMap};

use crate::error::{ConfigError, ConfigResult};
use crate::spec::ToolSpec;

/// Validated dependency graph, indexed by position in the input list.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    names: Vec<String>,
    /// `spec -> specs it depends on`
    upstream: Vec<Vec<usize>>,
    /// `spec -> specs that depend on it`
    downstream: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build the graph, rejecting duplicate names and unknown or self
    /// references.
    pub fn build(specs: &[ToolSpec]) -> ConfigResult<Self> {
        let mut index: HashMap<&str, usize> = HashMap::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            if index.insert(spec.name.as_str(), i).is_some() {
                return Err(ConfigError::DuplicateName {
                    name: spec.name.clone(),
                });
            }
        }

        let mut upstream = vec![Vec::new(); specs.len()];
        let mut downstream = vec![Vec::new(); specs.len()];
        for (i, spec) in specs.iter().enumerate() {
            for dep in &spec.depends_on {
                let &d = index
                    .get(dep.as_str())
                    .ok_or_else(|| ConfigError::UnknownDependency {
                        spec: spec.name.clone(),
                        dependency: dep.clone(),
                    })?;
                if d == i {
                    return Err(ConfigError::DependencyCycle {
                        specs: vec![spec.name.clone()],
                    });
                }
                if !upstream[i].contains(&d) {
                    upstream[i].push(d);
                    downstream[d].push(i);
                }
            }
        }

        Ok(Self {
            names: specs.iter().map(|s| s.name.clone()).collect(),
            upstream,
            downstream,
        })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, idx: usize) -> &str {
        &self.names[idx]
    }

    /// Direct dependencies of the spec at `idx`.
    pub fn dependencies_of(&self, idx: usize) -> &[usize] {
        &self.upstream[idx]
    }

    /// Spec indices with dependencies before dependents; ties go to the
    /// spec declared first.
    ///
    /// Returns [`ConfigError::DependencyCycle`] naming every spec that could
    /// not be ordered.
    pub fn topological_order(&self) -> ConfigResult<Vec<usize>> {
        let mut in_degree: Vec<usize> = self.upstream.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = (0..self.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut sorted = Vec::with_capacity(self.len());

        while let Some(node) = ready.pop_first() {
            sorted.push(node);
            for &dependent in &self.downstream[node] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if sorted.len() != self.len() {
            let specs = (0..self.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| self.names[i].clone())
                .collect();
            return Err(ConfigError::DependencyCycle { specs });
        }

        Ok(sorted)
    }
}

/// Validate `specs` and return their convergence order.
pub fn plan_order(specs: &[ToolSpec]) -> ConfigResult<Vec<usize>> {
    for spec in specs {
        spec.validate()?;
    }
    DependencyGraph::build(specs)?.topological_order()
}
