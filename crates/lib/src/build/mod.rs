//! Recipe builds.
//!
//! A build unpacks a fetched source into an isolated working directory under
//! the install prefix, expands each build step's variables and runs the steps
//! in order through a shell. The first failing step aborts the build. Step
//! output is appended to the recipe's log file.
//!
//! # Submodules
//!
//! - [`extract`] - archive unpacking and source tree copying
//! - [`manifest`] - build keys and the per-prefix build manifest

pub mod extract;
pub mod manifest;
mod step;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::consts::{CAPTURED_OUTPUT_LIMIT, SOURCE_DATE_EPOCH};
use crate::fetch::{FetchedSource, SourceKind};
use crate::placeholder::{PlaceholderError, Variables, substitute};
use crate::prefix::InstallPrefix;
use crate::recipe::Recipe;

use extract::ExtractError;
use manifest::{BuildKey, ManifestEntry, ManifestError, ManifestStore};
use step::{StepStatus, output_tail, run_step};

/// Step execution settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfig {
  /// Shell that runs each step as `<shell> -c <step>`.
  pub shell: String,
  /// Kill steps that run longer than this.
  pub step_timeout: Option<Duration>,
  /// Leave working directories in place after the build.
  pub keep_work_dirs: bool,
  /// Value of the `jobs` variable.
  pub jobs: usize,
}

impl Default for BuildConfig {
  fn default() -> Self {
    Self {
      shell: default_shell().to_string(),
      step_timeout: None,
      keep_work_dirs: false,
      jobs: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
    }
  }
}

#[cfg(unix)]
fn default_shell() -> &'static str {
  "/bin/sh"
}

#[cfg(windows)]
fn default_shell() -> &'static str {
  "powershell.exe"
}

/// Errors that can occur while building a recipe.
#[derive(Debug, Error)]
pub enum BuildError {
  /// A step exited unsuccessfully. Remaining steps were not run.
  #[error("build of '{recipe}' failed at step {step_index} (exit code {})", exit_code.map_or("none".to_string(), |c| c.to_string()))]
  BuildFailed {
    recipe: String,
    /// Zero-based index into the recipe's build steps.
    step_index: usize,
    exit_code: Option<i32>,
    /// Tail of the failing step's combined output.
    captured_output: String,
  },

  #[error("build of '{recipe}' timed out at step {step_index} after {}", humantime::format_duration(*timeout))]
  StepTimeout {
    recipe: String,
    step_index: usize,
    timeout: Duration,
    captured_output: String,
  },

  #[error("failed to unpack source of '{recipe}': {source}")]
  Extract {
    recipe: String,
    #[source]
    source: ExtractError,
  },

  #[error("relative path '{path}' not found in source of '{recipe}'")]
  MissingRelativePath { recipe: String, path: String },

  #[error("failed to expand variables for '{recipe}': {source}")]
  Placeholder {
    recipe: String,
    #[source]
    source: PlaceholderError,
  },

  #[error("I/O error building '{recipe}' at {path}: {source}")]
  Io {
    recipe: String,
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error(transparent)]
  Manifest(#[from] ManifestError),
}

impl BuildError {
  /// Captured step output, for errors raised by a step.
  pub fn captured_output(&self) -> Option<&str> {
    match self {
      BuildError::BuildFailed { captured_output, .. } | BuildError::StepTimeout { captured_output, .. } => {
        Some(captured_output)
      }
      _ => None,
    }
  }

  /// Index of the step that failed, if a step failed.
  pub fn step_index(&self) -> Option<usize> {
    match self {
      BuildError::BuildFailed { step_index, .. } | BuildError::StepTimeout { step_index, .. } => Some(*step_index),
      _ => None,
    }
  }
}

/// A completed (or reused) build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildArtifact {
  pub name: String,
  pub version: String,
  pub source_hash: String,
  pub build_key: BuildKey,
  /// Absolute artifact directory under the install prefix.
  pub path: PathBuf,
  pub reused: bool,
  #[serde(with = "duration_millis")]
  pub duration: Duration,
}

impl BuildArtifact {
  /// An artifact taken over from a manifest entry.
  pub fn reused(entry: &ManifestEntry) -> Self {
    Self {
      name: entry.name.clone(),
      version: entry.version.clone(),
      source_hash: entry.source_hash.clone(),
      build_key: entry.build_key.clone(),
      path: entry.artifact_path.clone(),
      reused: true,
      duration: Duration::ZERO,
    }
  }
}

mod duration_millis {
  use std::time::Duration;

  pub fn serialize<S: serde::Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
  }
}

/// Runs recipe builds into an install prefix.
pub struct Builder {
  prefix: InstallPrefix,
  config: BuildConfig,
  manifest: Arc<ManifestStore>,
}

impl Builder {
  pub fn new(prefix: InstallPrefix, config: BuildConfig, manifest: Arc<ManifestStore>) -> Self {
    Self {
      prefix,
      config,
      manifest,
    }
  }

  pub fn prefix(&self) -> &InstallPrefix {
    &self.prefix
  }

  pub fn manifest(&self) -> &ManifestStore {
    &self.manifest
  }

  /// Build a recipe from its fetched source and record it in the manifest.
  ///
  /// # Errors
  ///
  /// A non-zero step exit yields `BuildFailed` with the step index, exit code
  /// and the tail of the step's output; steps after it are not run.
  pub async fn build(
    &self,
    recipe: &Recipe,
    source: &FetchedSource,
    build_key: &BuildKey,
  ) -> Result<BuildArtifact, BuildError> {
    let started = Instant::now();
    let name = recipe.name.as_str();
    let io_err = |path: &Path| {
      let path = path.to_path_buf();
      move |source| BuildError::Io {
        recipe: name.to_string(),
        path,
        source,
      }
    };

    let work_root = self.prefix.work_dir();
    tokio::fs::create_dir_all(&work_root).await.map_err(io_err(&work_root))?;
    tokio::fs::create_dir_all(self.prefix.logs_dir())
      .await
      .map_err(io_err(&self.prefix.logs_dir()))?;

    let work = tempfile::Builder::new()
      .prefix(&format!("{}-", recipe.display_id()))
      .tempdir_in(&work_root)
      .map_err(io_err(&work_root))?;
    debug!(recipe = %name, work_dir = %work.path().display(), "created work directory");

    let result = self.build_in(recipe, source, work.path()).await;

    if self.config.keep_work_dirs {
      let kept = work.keep();
      info!(recipe = %name, work_dir = %kept.display(), "keeping work directory");
    } else if let Err(e) = work.close() {
      warn!(recipe = %name, error = %e, "failed to remove work directory");
    }

    let path = result?;
    let entry = ManifestEntry {
      name: recipe.name.clone(),
      version: recipe.version.clone(),
      source_hash: source.content_hash.clone(),
      build_key: build_key.clone(),
      artifact_path: path.clone(),
      completed_at_unix: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
    };
    self.manifest.record(entry)?;

    let duration = started.elapsed();
    info!(recipe = %name, version = %recipe.version, duration_ms = duration.as_millis() as u64, "build complete");

    Ok(BuildArtifact {
      name: recipe.name.clone(),
      version: recipe.version.clone(),
      source_hash: source.content_hash.clone(),
      build_key: build_key.clone(),
      path,
      reused: false,
      duration,
    })
  }

  /// Unpack and run steps inside `work`. Returns the artifact directory.
  async fn build_in(&self, recipe: &Recipe, source: &FetchedSource, work: &Path) -> Result<PathBuf, BuildError> {
    let name = recipe.name.as_str();
    let io_err = |path: &Path| {
      let path = path.to_path_buf();
      move |source| BuildError::Io {
        recipe: name.to_string(),
        path,
        source,
      }
    };

    let src_dir = work.join("src");
    let tmp_dir = work.join("tmp");
    tokio::fs::create_dir_all(&tmp_dir).await.map_err(io_err(&tmp_dir))?;

    unpack(recipe, source, &src_dir).await?;
    let project_dir = project_dir(recipe, &src_dir)?;

    let artifact_dir = self.prefix.artifact_dir(&recipe.artifact_path);
    tokio::fs::create_dir_all(&artifact_dir)
      .await
      .map_err(io_err(&artifact_dir))?;

    let variables = self.variables(recipe, &artifact_dir, &project_dir);
    let env = self.step_env(recipe, &variables, &tmp_dir)?;

    let log_path = self.prefix.log_file(name);
    let mut log = tokio::fs::OpenOptions::new()
      .create(true)
      .append(true)
      .open(&log_path)
      .await
      .map_err(io_err(&log_path))?;

    for (step_index, template) in recipe.build_steps.iter().enumerate() {
      let script = substitute(template, &variables).map_err(|source| BuildError::Placeholder {
        recipe: name.to_string(),
        source,
      })?;

      info!(recipe = %name, step = step_index, "running build step");
      debug!(recipe = %name, step = step_index, script = %script, "step script");

      let header = format!("==> {} step {}: {}\n", recipe.display_id(), step_index, script);
      log.write_all(header.as_bytes()).await.map_err(io_err(&log_path))?;

      let result = run_step(&self.config.shell, &script, &project_dir, &env, self.config.step_timeout)
        .await
        .map_err(io_err(&project_dir))?;

      log.write_all(&result.output).await.map_err(io_err(&log_path))?;
      log.flush().await.map_err(io_err(&log_path))?;

      match result.status {
        StepStatus::Exited(status) if status.success() => {}
        StepStatus::Exited(status) => {
          warn!(recipe = %name, step = step_index, code = ?status.code(), "build step failed");
          return Err(BuildError::BuildFailed {
            recipe: name.to_string(),
            step_index,
            exit_code: status.code(),
            captured_output: output_tail(&result.output, CAPTURED_OUTPUT_LIMIT),
          });
        }
        StepStatus::TimedOut => {
          let timeout = self.config.step_timeout.unwrap_or_default();
          warn!(recipe = %name, step = step_index, "build step timed out");
          return Err(BuildError::StepTimeout {
            recipe: name.to_string(),
            step_index,
            timeout,
            captured_output: output_tail(&result.output, CAPTURED_OUTPUT_LIMIT),
          });
        }
      }
    }

    Ok(artifact_dir)
  }

  fn variables(&self, recipe: &Recipe, artifact_dir: &Path, project_dir: &Path) -> Variables {
    Variables::new()
      .with("install_dir", self.prefix.root().to_string_lossy())
      .with("embedded_dir", self.prefix.embedded_dir().to_string_lossy())
      .with("artifact_dir", artifact_dir.to_string_lossy())
      .with("name", recipe.name.as_str())
      .with("version", recipe.version.as_str())
      .with("project_dir", project_dir.to_string_lossy())
      .with("jobs", self.config.jobs.to_string())
  }

  /// The complete environment for a recipe's steps.
  fn step_env(&self, recipe: &Recipe, variables: &Variables, tmp_dir: &Path) -> Result<BTreeMap<String, String>, BuildError> {
    let mut env = BTreeMap::new();

    let mut path_entries = vec![self.prefix.embedded_dir().join("bin")];
    if let Some(inherited) = std::env::var_os("PATH") {
      path_entries.extend(std::env::split_paths(&inherited));
    }
    let path = std::env::join_paths(path_entries)
      .map(|p| p.to_string_lossy().into_owned())
      .unwrap_or_default();
    env.insert("PATH".to_string(), path);

    let tmp = tmp_dir.to_string_lossy().into_owned();
    for key in ["TMPDIR", "TMP", "TEMP", "HOME"] {
      env.insert(key.to_string(), tmp.clone());
    }
    env.insert("LANG".to_string(), "C".to_string());
    env.insert("LC_ALL".to_string(), "C".to_string());
    env.insert("SOURCE_DATE_EPOCH".to_string(), SOURCE_DATE_EPOCH.to_string());

    #[cfg(windows)]
    for key in ["SYSTEMROOT", "COMSPEC", "PATHEXT"] {
      if let Ok(value) = std::env::var(key) {
        env.insert(key.to_string(), value);
      }
    }

    for (key, template) in &recipe.env {
      let value = substitute(template, variables).map_err(|source| BuildError::Placeholder {
        recipe: recipe.name.clone(),
        source,
      })?;
      env.insert(key.clone(), value);
    }

    Ok(env)
  }
}

async fn unpack(recipe: &Recipe, source: &FetchedSource, dest: &Path) -> Result<(), BuildError> {
  let kind = source.kind;
  let from = source.path.clone();
  let to = dest.to_path_buf();

  let result = tokio::task::spawn_blocking(move || match kind {
    SourceKind::Directory => extract::copy_tree(&from, &to),
    SourceKind::File => extract::unpack_archive(&from, &to),
  })
  .await
  .map_err(|e| BuildError::Io {
    recipe: recipe.name.clone(),
    path: dest.to_path_buf(),
    source: std::io::Error::other(e),
  })?;

  result.map_err(|source| BuildError::Extract {
    recipe: recipe.name.clone(),
    source,
  })
}

/// Directory the steps run in: `relative_path` if set, else the archive's
/// single top-level directory, else the unpacked root.
fn project_dir(recipe: &Recipe, src_dir: &Path) -> Result<PathBuf, BuildError> {
  if let Some(relative) = &recipe.relative_path {
    let dir = src_dir.join(relative);
    if !dir.is_dir() {
      return Err(BuildError::MissingRelativePath {
        recipe: recipe.name.clone(),
        path: relative.clone(),
      });
    }
    return Ok(dir);
  }

  let single = extract::single_top_level_dir(src_dir).map_err(|source| BuildError::Io {
    recipe: recipe.name.clone(),
    path: src_dir.to_path_buf(),
    source,
  })?;
  Ok(single.unwrap_or_else(|| src_dir.to_path_buf()))
}
