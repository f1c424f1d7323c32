use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::recipe::Recipe;

/// Recipes in a valid build order: every recipe comes after all of its dependencies.
#[derive(Debug, Clone)]
pub struct ResolvedPlan {
  order: Vec<Recipe>,
  index: HashMap<String, usize>,
  /// Direct dependencies of each recipe, as plan positions.
  dependencies: Vec<Vec<usize>>,
  /// Direct dependents of each recipe, as plan positions.
  dependents: Vec<Vec<usize>>,
}

impl ResolvedPlan {
  /// Build a plan from recipes that are already topologically ordered.
  ///
  /// Dependencies outside `order` are ignored; the resolver guarantees there are none.
  pub(super) fn from_ordered(order: Vec<Recipe>) -> Self {
    let index: HashMap<String, usize> = order.iter().enumerate().map(|(i, r)| (r.name.clone(), i)).collect();

    let mut dependencies = vec![Vec::new(); order.len()];
    let mut dependents = vec![Vec::new(); order.len()];
    for (pos, recipe) in order.iter().enumerate() {
      for dep in &recipe.dependencies {
        if let Some(&dep_pos) = index.get(dep) {
          dependencies[pos].push(dep_pos);
          dependents[dep_pos].push(pos);
        }
      }
    }
    for list in dependents.iter_mut() {
      list.sort_unstable();
    }

    Self {
      order,
      index,
      dependencies,
      dependents,
    }
  }

  pub fn recipes(&self) -> &[Recipe] {
    &self.order
  }

  pub fn iter(&self) -> impl Iterator<Item = &Recipe> {
    self.order.iter()
  }

  pub fn names(&self) -> Vec<&str> {
    self.order.iter().map(|r| r.name.as_str()).collect()
  }

  pub fn len(&self) -> usize {
    self.order.len()
  }

  pub fn is_empty(&self) -> bool {
    self.order.is_empty()
  }

  pub fn get(&self, name: &str) -> Option<&Recipe> {
    self.position(name).map(|pos| &self.order[pos])
  }

  /// Position of a recipe in the build order.
  pub fn position(&self, name: &str) -> Option<usize> {
    self.index.get(name).copied()
  }

  /// Plan positions of the direct dependencies of the recipe at `pos`.
  pub fn dependency_positions(&self, pos: usize) -> &[usize] {
    &self.dependencies[pos]
  }

  /// Plan positions of the direct dependents of the recipe at `pos`.
  pub fn dependent_positions(&self, pos: usize) -> &[usize] {
    &self.dependents[pos]
  }

  /// Every recipe that directly or transitively depends on `name`, in plan order.
  pub fn transitive_dependents(&self, name: &str) -> Vec<&str> {
    let Some(start) = self.position(name) else {
      return Vec::new();
    };

    let mut seen: BTreeSet<usize> = BTreeSet::new();
    let mut queue: VecDeque<usize> = self.dependents[start].iter().copied().collect();
    while let Some(pos) = queue.pop_front() {
      if seen.insert(pos) {
        queue.extend(self.dependents[pos].iter().copied());
      }
    }

    seen.into_iter().map(|pos| self.order[pos].name.as_str()).collect()
  }

  /// Group recipes into levels that can run in parallel.
  ///
  /// Every recipe's dependencies are in earlier waves. Names within a wave are
  /// in plan order.
  pub fn waves(&self) -> Vec<Vec<&str>> {
    let mut level = vec![0usize; self.order.len()];
    // Dependencies always precede dependents, so one forward pass suffices.
    for (pos, deps) in self.dependencies.iter().enumerate() {
      let depth = deps.iter().map(|&dep| level[dep] + 1).max().unwrap_or(0);
      level[pos] = depth;
    }

    let depth = level.iter().copied().max().map_or(0, |max| max + 1);
    let mut waves: Vec<Vec<&str>> = vec![Vec::new(); depth];
    for (pos, recipe) in self.order.iter().enumerate() {
      waves[level[pos]].push(recipe.name.as_str());
    }
    waves
  }
}
