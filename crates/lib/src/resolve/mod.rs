//! Dependency resolution.
//!
//! Orders a recipe set so that every recipe comes after the recipes it depends
//! on. Among recipes whose dependencies are all placed, the name that sorts
//! first goes next, which keeps plans identical across runs.

mod plan;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;
use tracing::debug;

use crate::recipe::{RecipeError, RecipeSet};

pub use plan::ResolvedPlan;

/// Errors that can occur while resolving a build order.
#[derive(Debug, Error)]
pub enum ResolveError {
  #[error("dependency cycle between recipes: {}", members.join(", "))]
  CyclicDependency { members: Vec<String> },

  #[error("recipe '{recipe}' depends on unknown recipe '{dependency}'")]
  UnknownDependency { recipe: String, dependency: String },

  #[error(transparent)]
  Recipe(#[from] RecipeError),
}

/// Resolve every recipe in the set into a build order.
///
/// # Errors
///
/// Returns `UnknownDependency` if a dependency names no recipe in the set, and
/// `CyclicDependency` naming the members of a cycle if one exists. No partial
/// plan is produced in either case.
pub fn resolve(recipes: &RecipeSet) -> Result<ResolvedPlan, ResolveError> {
  let mut graph: DiGraph<&str, ()> = DiGraph::new();
  let mut nodes: BTreeMap<&str, NodeIndex> = BTreeMap::new();

  for name in recipes.names() {
    nodes.insert(name, graph.add_node(name));
  }

  // Edge from each recipe to each of its dependencies
  for recipe in recipes.iter() {
    let from = nodes[recipe.name.as_str()];
    for dep in &recipe.dependencies {
      let to = nodes.get(dep.as_str()).ok_or_else(|| ResolveError::UnknownDependency {
        recipe: recipe.name.clone(),
        dependency: dep.clone(),
      })?;
      graph.add_edge(from, *to, ());
    }
  }

  let mut unresolved: HashMap<NodeIndex, usize> = graph
    .node_indices()
    .map(|idx| (idx, graph.neighbors_directed(idx, Direction::Outgoing).count()))
    .collect();

  let mut ready: BTreeSet<&str> = unresolved
    .iter()
    .filter(|&(_, &count)| count == 0)
    .map(|(&idx, _)| graph[idx])
    .collect();

  let mut order = Vec::with_capacity(graph.node_count());
  while let Some(name) = ready.pop_first() {
    order.push(name);
    for dependent in graph.neighbors_directed(nodes[name], Direction::Incoming) {
      if let Some(count) = unresolved.get_mut(&dependent) {
        *count -= 1;
        if *count == 0 {
          ready.insert(graph[dependent]);
        }
      }
    }
  }

  if order.len() < graph.node_count() {
    return Err(ResolveError::CyclicDependency {
      members: find_cycle(&graph),
    });
  }

  debug!(order = ?order, "resolved build order");

  let ordered = order
    .into_iter()
    .filter_map(|name| recipes.get(name).cloned())
    .collect();
  Ok(ResolvedPlan::from_ordered(ordered))
}

/// Resolve the named roots and everything they transitively depend on.
pub fn resolve_roots<S: AsRef<str>>(recipes: &RecipeSet, roots: &[S]) -> Result<ResolvedPlan, ResolveError> {
  let closure = recipes.closure(roots)?;

  // A dependency missing from the full set is dropped by `closure`; report it here.
  for recipe in closure.iter() {
    if let Some(dep) = recipe.dependencies.iter().find(|dep| !recipes.contains(dep)) {
      return Err(ResolveError::UnknownDependency {
        recipe: recipe.name.clone(),
        dependency: dep.clone(),
      });
    }
  }

  resolve(&closure)
}

/// Sorted members of the first cycle (by smallest member name).
fn find_cycle(graph: &DiGraph<&str, ()>) -> Vec<String> {
  tarjan_scc(graph)
    .into_iter()
    .filter(|component| component.len() > 1 || graph.contains_edge(component[0], component[0]))
    .map(|component| {
      let mut members: Vec<String> = component.iter().map(|&idx| graph[idx].to_string()).collect();
      members.sort();
      members
    })
    .min()
    .unwrap_or_default()
}
