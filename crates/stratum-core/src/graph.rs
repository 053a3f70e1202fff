//! Dependency graph
//!
//! Nodes live in an index-addressable arena keyed by id. Each node stores the
//! ids it depends on; dependents are derived from those edges and never set
//! by callers. The same graph orders tool calls inside an orchestrator batch
//! and tasks inside a plan.
//!
//! `add_node` only back-fills dependents for dependencies that already exist.
//! Insert in dependency order, or call [`DependencyGraph::recompute_dependents`]
//! once every node is in.

use std::collections::HashMap;

use crate::error::{Result, StratumError};

#[derive(Debug, Clone)]
pub struct DependencyNode {
    pub id: String,
    /// Tool name for calls, title for tasks
    pub label: String,
    pub dependencies: Vec<String>,
    dependents: Vec<String>,
}

impl DependencyNode {
    pub fn dependents(&self) -> &[String] {
        &self.dependents
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Done,
}

#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    nodes: Vec<DependencyNode>,
    index: HashMap<String, usize>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node. Fails on a duplicate id.
    pub fn add_node(
        &mut self,
        id: impl Into<String>,
        label: impl Into<String>,
        dependencies: Vec<String>,
    ) -> Result<()> {
        let id = id.into();
        if self.index.contains_key(&id) {
            return Err(StratumError::Validation(format!("duplicate node id '{id}'")));
        }

        for dep in &dependencies {
            if let Some(&dep_idx) = self.index.get(dep) {
                self.nodes[dep_idx].dependents.push(id.clone());
            }
        }

        self.index.insert(id.clone(), self.nodes.len());
        self.nodes.push(DependencyNode {
            id,
            label: label.into(),
            dependencies,
            dependents: Vec::new(),
        });
        Ok(())
    }

    /// Rebuild every node's dependents from the dependency edges.
    pub fn recompute_dependents(&mut self) {
        for node in &mut self.nodes {
            node.dependents.clear();
        }
        for idx in 0..self.nodes.len() {
            let id = self.nodes[idx].id.clone();
            for dep in self.nodes[idx].dependencies.clone() {
                if let Some(&dep_idx) = self.index.get(&dep) {
                    self.nodes[dep_idx].dependents.push(id.clone());
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn node(&self, id: &str) -> Option<&DependencyNode> {
        self.index.get(id).map(|&idx| &self.nodes[idx])
    }

    pub fn nodes(&self) -> impl Iterator<Item = &DependencyNode> {
        self.nodes.iter()
    }

    /// Dependencies that point at ids never added to the graph, as `(node, missing)`.
    pub fn missing_dependencies(&self) -> Vec<(String, String)> {
        self.nodes
            .iter()
            .flat_map(|node| {
                node.dependencies
                    .iter()
                    .filter(|dep| !self.index.contains_key(*dep))
                    .map(|dep| (node.id.clone(), dep.clone()))
            })
            .collect()
    }

    /// Find a dependency cycle. The path starts and ends at the cycle's entry node.
    pub fn detect_cycle(&self) -> Option<Vec<String>> {
        self.walk().err()
    }

    /// Order nodes so every node follows all of its dependencies.
    pub fn topological_sort(&self) -> Result<Vec<String>> {
        self.walk()
            .map(|order| {
                order
                    .into_iter()
                    .map(|idx| self.nodes[idx].id.clone())
                    .collect()
            })
            .map_err(|path| StratumError::CyclicDependency { path })
    }

    /// Group nodes into batches that can run concurrently.
    ///
    /// A node's level is one more than the highest level among its
    /// dependencies, zero for roots.
    pub fn execution_levels(&self) -> Result<Vec<Vec<String>>> {
        let order = self
            .walk()
            .map_err(|path| StratumError::CyclicDependency { path })?;

        let mut level_of = vec![0usize; self.nodes.len()];
        let mut levels: Vec<Vec<String>> = Vec::new();

        for idx in order {
            let level = self.nodes[idx]
                .dependencies
                .iter()
                .filter_map(|dep| self.index.get(dep))
                .map(|&dep_idx| level_of[dep_idx] + 1)
                .max()
                .unwrap_or(0);
            level_of[idx] = level;

            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(self.nodes[idx].id.clone());
        }

        Ok(levels)
    }

    /// Nodes with no dependencies.
    pub fn root_nodes(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.dependencies.is_empty())
            .map(|n| n.id.as_str())
            .collect()
    }

    /// Direct dependents of a node.
    pub fn dependents(&self, id: &str) -> &[String] {
        self.node(id).map(|n| n.dependents()).unwrap_or(&[])
    }

    /// Every node reachable through dependents, in breadth-first order.
    pub fn transitive_dependents(&self, id: &str) -> Vec<String> {
        let mut seen = vec![false; self.nodes.len()];
        let mut queue: std::collections::VecDeque<usize> = self
            .dependents(id)
            .iter()
            .filter_map(|d| self.index.get(d).copied())
            .collect();
        let mut out = Vec::new();

        while let Some(idx) = queue.pop_front() {
            if std::mem::replace(&mut seen[idx], true) {
                continue;
            }
            out.push(self.nodes[idx].id.clone());
            for dep in &self.nodes[idx].dependents {
                if let Some(&next) = self.index.get(dep) {
                    if !seen[next] {
                        queue.push_back(next);
                    }
                }
            }
        }

        out
    }

    /// Post-order depth-first walk over all nodes in insertion order.
    /// Returns node indices in dependency order, or the cycle path.
    fn walk(&self) -> std::result::Result<Vec<usize>, Vec<String>> {
        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = Vec::new();

        for start in 0..self.nodes.len() {
            if marks[start] == Mark::Unvisited {
                self.visit(start, &mut marks, &mut stack, &mut order)?;
            }
        }

        Ok(order)
    }

    fn visit(
        &self,
        idx: usize,
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
        order: &mut Vec<usize>,
    ) -> std::result::Result<(), Vec<String>> {
        marks[idx] = Mark::Visiting;
        stack.push(idx);

        for dep in &self.nodes[idx].dependencies {
            let Some(&dep_idx) = self.index.get(dep) else {
                continue;
            };
            match marks[dep_idx] {
                Mark::Done => {}
                Mark::Unvisited => self.visit(dep_idx, marks, stack, order)?,
                Mark::Visiting => {
                    let entry = stack.iter().position(|&i| i == dep_idx).unwrap_or(0);
                    let mut path: Vec<String> = stack[entry..]
                        .iter()
                        .map(|&i| self.nodes[i].id.clone())
                        .collect();
                    path.push(self.nodes[dep_idx].id.clone());
                    return Err(path);
                }
            }
        }

        stack.pop();
        marks[idx] = Mark::Done;
        order.push(idx);
        Ok(())
    }
}
