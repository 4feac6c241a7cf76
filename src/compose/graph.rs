//! Dependency ordering for compose instances

use super::config::ProjectConfig;
use crate::error::{ComposeError, Result};
use indexmap::IndexMap;
use std::collections::HashSet;
use std::str::FromStr;

/// What to do when a requested instance depends on one that is neither
/// requested nor already running
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DependencyPolicy {
    /// Fail before anything is created
    #[default]
    Require,
    /// Pull the missing dependencies into the request
    Include,
    /// Warn and carry on
    Ignore,
}

impl FromStr for DependencyPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "require" => Ok(DependencyPolicy::Require),
            "include" => Ok(DependencyPolicy::Include),
            "ignore" => Ok(DependencyPolicy::Ignore),
            other => Err(format!(
                "unknown dependency policy '{}' (expected require, include or ignore)",
                other
            )),
        }
    }
}

impl std::fmt::Display for DependencyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyPolicy::Require => write!(f, "require"),
            DependencyPolicy::Include => write!(f, "include"),
            DependencyPolicy::Ignore => write!(f, "ignore"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Placed,
}

/// Graph of `depends_on` edges, in declaration order
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: IndexMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Create a graph from `(name, depends_on)` pairs given in declaration order
    pub fn new<I, S>(declared: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<String>)>,
        S: Into<String>,
    {
        Self {
            edges: declared
                .into_iter()
                .map(|(name, deps)| (name.into(), deps))
                .collect(),
        }
    }

    /// Build the graph of a project
    pub fn from_config(config: &ProjectConfig) -> Self {
        Self::new(
            config
                .instances
                .iter()
                .map(|(name, service)| (name.clone(), service.depends_on.clone())),
        )
    }

    /// Direct dependencies of an instance
    pub fn dependencies(&self, name: &str) -> &[String] {
        self.edges.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Creation order: every dependency precedes its dependents, unrelated
    /// instances keep their declaration order
    pub fn order(&self) -> Result<Vec<String>> {
        let mut marks: IndexMap<&str, Mark> = IndexMap::new();
        let mut path: Vec<&str> = Vec::new();
        let mut order = Vec::with_capacity(self.edges.len());

        for name in self.edges.keys() {
            self.place(name, &mut marks, &mut path, &mut order)?;
        }

        Ok(order)
    }

    /// Shutdown order, the reverse of creation order
    pub fn shutdown_order(&self) -> Result<Vec<String>> {
        let mut order = self.order()?;
        order.reverse();
        Ok(order)
    }

    /// Creation order restricted to `names`
    pub fn order_of(&self, names: &[String]) -> Result<Vec<String>> {
        let wanted: HashSet<&str> = names.iter().map(String::as_str).collect();
        Ok(self
            .order()?
            .into_iter()
            .filter(|name| wanted.contains(name.as_str()))
            .collect())
    }

    /// Direct dependencies of `names` that are neither requested nor
    /// running, as `(instance, dependency)` pairs in creation order
    pub fn unmet_dependencies(
        &self,
        names: &[String],
        running: &HashSet<String>,
    ) -> Result<Vec<(String, String)>> {
        let requested: HashSet<&str> = names.iter().map(String::as_str).collect();
        let mut unmet = Vec::new();

        for name in self.order_of(names)? {
            for dep in self.dependencies(&name) {
                if !requested.contains(dep.as_str()) && !running.contains(dep) {
                    unmet.push((name.clone(), dep.clone()));
                }
            }
        }

        Ok(unmet)
    }

    /// Transitive dependencies of `names` that have to be added to the
    /// request, in creation order. Running instances satisfy their
    /// dependents and are not descended into.
    pub fn missing_dependencies(
        &self,
        names: &[String],
        running: &HashSet<String>,
    ) -> Result<Vec<String>> {
        let requested: HashSet<&str> = names.iter().map(String::as_str).collect();
        let mut needed: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = names.iter().map(String::as_str).collect();

        while let Some(name) = stack.pop() {
            for dep in self.dependencies(name) {
                if requested.contains(dep.as_str()) || running.contains(dep) {
                    continue;
                }
                if needed.insert(dep.as_str()) {
                    stack.push(dep.as_str());
                }
            }
        }

        Ok(self
            .order()?
            .into_iter()
            .filter(|name| needed.contains(name.as_str()))
            .collect())
    }

    fn place<'a>(
        &'a self,
        name: &'a str,
        marks: &mut IndexMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        match marks.get(name) {
            Some(Mark::Placed) => return Ok(()),
            Some(Mark::InProgress) => {
                let start = path.iter().position(|n| *n == name).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
                cycle.push(name.to_string());
                return Err(ComposeError::CircularDependency(cycle));
            }
            None => {}
        }

        let deps = self.edges.get(name).ok_or_else(|| {
            ComposeError::Config(format!("unknown instance '{}' in depends_on", name))
        })?;

        marks.insert(name, Mark::InProgress);
        path.push(name);

        for dep in deps {
            self.place(dep, marks, path, order)?;
        }

        path.pop();
        marks.insert(name, Mark::Placed);
        order.push(name.to_string());

        Ok(())
    }
}
