use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::hash::HashAlgorithm;

/// Variables available to build steps and recipe `env` values.
pub const BUILD_VARIABLES: &[&str] = &[
  "install_dir",
  "embedded_dir",
  "artifact_dir",
  "name",
  "version",
  "project_dir",
  "jobs",
];

/// Variables expanded when a recipe is loaded (source URL, `relative_path`, `artifact_path`).
pub const LOAD_VARIABLES: &[&str] = &["name", "version"];

/// Default subpath of the install prefix a recipe writes to.
///
/// Recipes sharing it never build concurrently.
pub const DEFAULT_ARTIFACT_PATH: &str = "embedded";

/// Expected digest of a fetched source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Checksum {
  pub algorithm: HashAlgorithm,
  /// Lowercase hex digest.
  pub value: String,
}

impl std::fmt::Display for Checksum {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}:{}", self.algorithm, self.value)
  }
}

/// Where a recipe's source comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceRef {
  /// A remote (or `file://`) archive verified against a published checksum.
  Url { url: String, checksum: Checksum },
  /// A local directory or archive, hashed in place.
  Path { path: PathBuf },
}

impl std::fmt::Display for SourceRef {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      SourceRef::Url { url, .. } => f.write_str(url),
      SourceRef::Path { path } => write!(f, "{}", path.display()),
    }
  }
}

/// An immutable, validated description of one buildable component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
  pub name: String,
  pub version: String,
  pub source: SourceRef,
  pub dependencies: BTreeSet<String>,
  /// Shell command templates, executed in order.
  pub build_steps: Vec<String>,
  /// Directory inside the unpacked source in which steps run.
  pub relative_path: Option<String>,
  /// Extra environment for build steps (values are templates).
  pub env: BTreeMap<String, String>,
  /// Subpath of the install prefix this recipe's build writes to.
  pub artifact_path: String,
}

impl Recipe {
  /// `name-version`, used for working directory and log names.
  pub fn display_id(&self) -> String {
    format!("{}-{}", self.name, self.version)
  }
}

/// Errors raised while loading and validating recipe definitions.
#[derive(Debug, Error)]
pub enum RecipeError {
  #[error("failed to read recipes from {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse {origin}: {message}")]
  Parse { origin: String, message: String },

  #[error("invalid recipe '{name}' in {origin}: {reason}")]
  InvalidRecipe {
    origin: String,
    name: String,
    reason: String,
  },

  #[error("duplicate recipe '{name}' (defined in {first} and {second})")]
  DuplicateRecipe {
    name: String,
    first: String,
    second: String,
  },

  #[error("unknown recipe '{0}'")]
  UnknownRecipe(String),
}
