//! Types for orchestrated runs.
//!
//! This module defines the error type, the failure classification used for
//! exit codes, and the summary produced when a run finishes.

use serde::Serialize;
use thiserror::Error;

use crate::build::manifest::{BuildKey, ManifestError};
use crate::build::{BuildArtifact, BuildError};
use crate::config::ConfigError;
use crate::fetch::FetchError;
use crate::prefix::PrefixLockError;
use crate::recipe::RecipeError;
use crate::resolve::ResolveError;

/// Errors that can occur while orchestrating a run.
#[derive(Debug, Error)]
pub enum ExecuteError {
  #[error(transparent)]
  Recipe(#[from] RecipeError),

  #[error(transparent)]
  Resolve(#[from] ResolveError),

  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error(transparent)]
  Build(#[from] BuildError),

  #[error(transparent)]
  Manifest(#[from] ManifestError),

  #[error(transparent)]
  Lock(#[from] PrefixLockError),

  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  /// A recipe task panicked or was aborted.
  #[error("task for '{recipe}' did not complete: {message}")]
  Task { recipe: String, message: String },
}

/// Coarse category of a failure, used to pick process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureClass {
  /// Invalid recipes, unknown names or dependency cycles.
  Recipe,
  /// Download or checksum failures.
  Fetch,
  /// Build step failures.
  Build,
  Other,
}

impl ExecuteError {
  pub fn class(&self) -> FailureClass {
    match self {
      ExecuteError::Recipe(_) | ExecuteError::Resolve(_) => FailureClass::Recipe,
      ExecuteError::Fetch(_) => FailureClass::Fetch,
      ExecuteError::Build(BuildError::Manifest(_)) => FailureClass::Other,
      ExecuteError::Build(_) => FailureClass::Build,
      ExecuteError::Manifest(_)
      | ExecuteError::Lock(_)
      | ExecuteError::Config(_)
      | ExecuteError::Io(_)
      | ExecuteError::Task { .. } => FailureClass::Other,
    }
  }
}

/// A recipe whose fetch or build failed.
#[derive(Debug)]
pub struct RecipeFailure {
  pub recipe: String,
  pub error: ExecuteError,
}

/// A recipe that was not attempted because a dependency failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRecipe {
  pub recipe: String,
  /// The failed recipe this one (transitively) depends on.
  pub failed_dependency: String,
}

/// Whether a planned recipe would be reused or built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanAction {
  Reuse,
  Build,
}

/// One recipe of a plan preview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedRecipe {
  pub name: String,
  pub version: String,
  pub dependencies: Vec<String>,
  pub build_key: BuildKey,
  pub action: PlanAction,
  /// Parallel level, starting at 0. Dependencies are always in earlier waves.
  pub wave: usize,
}

/// Outcome of a finished run.
#[derive(Debug, Default)]
pub struct RunSummary {
  /// Recipe names in build order.
  pub plan: Vec<String>,
  pub built: Vec<BuildArtifact>,
  pub reused: Vec<BuildArtifact>,
  pub failed: Vec<RecipeFailure>,
  pub skipped: Vec<SkippedRecipe>,
  /// Recipes never dispatched because the run stopped early.
  pub not_started: Vec<String>,
  pub cancelled: bool,
}

impl RunSummary {
  /// True if every planned recipe was built or reused.
  pub fn is_success(&self) -> bool {
    self.failed.is_empty() && self.skipped.is_empty() && self.not_started.is_empty() && !self.cancelled
  }

  pub fn total(&self) -> usize {
    self.built.len() + self.reused.len() + self.failed.len() + self.skipped.len() + self.not_started.len()
  }

  /// The most severe failure class in the run, if anything failed.
  ///
  /// Build failures outrank fetch failures, which outrank everything else.
  pub fn failure_class(&self) -> Option<FailureClass> {
    if self.failed.is_empty() {
      return self.cancelled.then_some(FailureClass::Other);
    }
    let classes: Vec<FailureClass> = self.failed.iter().map(|f| f.error.class()).collect();
    [FailureClass::Build, FailureClass::Fetch, FailureClass::Recipe]
      .into_iter()
      .find(|class| classes.contains(class))
      .or(Some(FailureClass::Other))
  }

  pub fn failure(&self, recipe: &str) -> Option<&ExecuteError> {
    self.failed.iter().find(|f| f.recipe == recipe).map(|f| &f.error)
  }

  pub fn skipped_because(&self, recipe: &str) -> Option<&str> {
    self
      .skipped
      .iter()
      .find(|s| s.recipe == recipe)
      .map(|s| s.failed_dependency.as_str())
  }
}
