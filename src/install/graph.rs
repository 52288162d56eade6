// src/install/graph.rs

//! Build graph for an installer run
//!
//! Nodes are the specs that still have to be installed, keyed by DAG hash.
//! `parent_to_child` and `child_to_parent` are kept as exact transposes of
//! each other. A node is ready once it has no children left; finishing a
//! node removes it and may make its parents ready.
//!
//! Already-installed specs are pruned during construction by splicing their
//! parents directly onto their children, so the nodes that remain keep the
//! ordering constraints they had through the pruned ones.

use super::database::InstalledSet;
use crate::config::InstallPolicy;
use crate::error::{Error, Result};
use crate::spec::{DepTypes, Spec};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// What to build out of the requested specs
#[derive(Debug, Clone)]
pub struct GraphOptions {
    pub install_policy: InstallPolicy,
    /// Build the requested specs themselves
    pub install_package: bool,
    /// Build their missing dependencies
    pub install_deps: bool,
    /// Hashes to rebuild even if installed
    pub overwrite: HashSet<String>,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            install_policy: InstallPolicy::Auto,
            install_package: true,
            install_deps: true,
            overwrite: HashSet::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct BuildGraph {
    roots: HashSet<String>,
    nodes: HashMap<String, Spec>,
    parent_to_child: HashMap<String, HashSet<String>>,
    child_to_parent: HashMap<String, HashSet<String>>,
}

impl BuildGraph {
    pub fn new(specs: &[Spec], installed: &dyn InstalledSet, options: &GraphOptions) -> Result<Self> {
        let mut graph = Self {
            roots: specs.iter().map(|s| s.dag_hash().to_string()).collect(),
            ..Default::default()
        };

        let mut pruned = HashSet::new();
        let mut stack: Vec<Spec> = specs.to_vec();
        for spec in specs {
            graph.insert_node(spec);
        }

        while let Some(spec) = stack.pop() {
            let key = spec.dag_hash().to_string();
            let is_root = graph.roots.contains(&key);
            let is_installed = !options.overwrite.contains(&key) && installed.is_installed(&key);

            let deptypes = if is_installed || options.install_policy == InstallPolicy::CacheOnly {
                DepTypes::LINK | DepTypes::RUN
            } else {
                DepTypes::BUILD | DepTypes::LINK | DepTypes::RUN
            };
            if is_installed || (is_root && !options.install_package) {
                pruned.insert(key.clone());
            }

            for child in spec.dependencies(deptypes) {
                let child_key = child.dag_hash().to_string();
                let new = graph.insert_node(&child);
                graph.add_edge(&key, &child_key);
                if new {
                    stack.push(child);
                }
            }
        }

        for key in &pruned {
            graph.splice_out(key);
        }
        debug!(
            "Build graph has {} nodes after pruning {}",
            graph.nodes.len(),
            pruned.len()
        );

        if !options.install_deps {
            let mut deps: Vec<&Spec> = graph
                .nodes
                .iter()
                .filter(|(key, _)| !graph.roots.contains(*key))
                .map(|(_, spec)| spec)
                .collect();
            deps.sort_by(|a, b| a.name().cmp(b.name()));
            if let Some(dep) = deps.first() {
                return Err(Error::InstallFailed(format!(
                    "{} is a dependency that is not installed; install dependencies first or \
                     allow them to be installed",
                    dep.cformat()
                )));
            }
        }
        Ok(graph)
    }

    /// Returns whether the node is new
    fn insert_node(&mut self, spec: &Spec) -> bool {
        let key = spec.dag_hash().to_string();
        if self.nodes.contains_key(&key) {
            return false;
        }
        self.parent_to_child.insert(key.clone(), HashSet::new());
        self.child_to_parent.insert(key.clone(), HashSet::new());
        self.nodes.insert(key, spec.clone());
        true
    }

    fn add_edge(&mut self, parent: &str, child: &str) {
        if let Some(children) = self.parent_to_child.get_mut(parent) {
            children.insert(child.to_string());
        }
        if let Some(parents) = self.child_to_parent.get_mut(child) {
            parents.insert(parent.to_string());
        }
    }

    /// Remove a node, connecting each of its parents to each of its children
    fn splice_out(&mut self, key: &str) {
        let children = self.parent_to_child.remove(key).unwrap_or_default();
        let parents = self.child_to_parent.remove(key).unwrap_or_default();
        for parent in &parents {
            if let Some(set) = self.parent_to_child.get_mut(parent) {
                set.remove(key);
                set.extend(children.iter().cloned());
            }
        }
        for child in &children {
            if let Some(set) = self.child_to_parent.get_mut(child) {
                set.remove(key);
                set.extend(parents.iter().cloned());
            }
        }
        self.nodes.remove(key);
    }

    /// Nodes with nothing left to wait for, in name order
    pub fn ready(&self) -> Vec<String> {
        let mut ready: Vec<&Spec> = self
            .parent_to_child
            .iter()
            .filter(|(_, children)| children.is_empty())
            .filter_map(|(key, _)| self.nodes.get(key))
            .collect();
        ready.sort_by(|a, b| a.name().cmp(b.name()).then(a.dag_hash().cmp(b.dag_hash())));
        ready.into_iter().map(|s| s.dag_hash().to_string()).collect()
    }

    /// Remove a finished node; returns the parents that became ready
    pub fn enqueue_parents(&mut self, key: &str) -> Vec<String> {
        self.nodes.remove(key);
        self.parent_to_child.remove(key);
        let Some(parents) = self.child_to_parent.remove(key) else {
            return Vec::new();
        };

        let mut ready = Vec::new();
        for parent in parents {
            if let Some(children) = self.parent_to_child.get_mut(&parent) {
                children.remove(key);
                if children.is_empty() {
                    ready.push(parent);
                }
            }
        }
        ready.sort();
        ready
    }

    pub fn get(&self, key: &str) -> Option<&Spec> {
        self.nodes.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn is_root(&self, key: &str) -> bool {
        self.roots.contains(key)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Specs still in the graph
    pub fn specs(&self) -> impl Iterator<Item = &Spec> {
        self.nodes.values()
    }

    pub fn children(&self, key: &str) -> Option<&HashSet<String>> {
        self.parent_to_child.get(key)
    }

    pub fn parents(&self, key: &str) -> Option<&HashSet<String>> {
        self.child_to_parent.get(key)
    }

    /// Whether the two adjacency maps are exact transposes over `nodes`
    pub fn is_consistent(&self) -> bool {
        let keys: HashSet<&String> = self.nodes.keys().collect();
        if self.parent_to_child.keys().collect::<HashSet<_>>() != keys
            || self.child_to_parent.keys().collect::<HashSet<_>>() != keys
        {
            return false;
        }
        let forward = self.parent_to_child.iter().all(|(parent, children)| {
            children.iter().all(|child| {
                self.child_to_parent
                    .get(child)
                    .is_some_and(|parents| parents.contains(parent))
            })
        });
        let backward = self.child_to_parent.iter().all(|(child, parents)| {
            parents.iter().all(|parent| {
                self.parent_to_child
                    .get(parent)
                    .is_some_and(|children| children.contains(child))
            })
        });
        forward && backward
    }
}
