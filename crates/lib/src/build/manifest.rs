//! Build manifest: the record of completed builds in an install prefix.
//!
//! # Storage Layout
//!
//! ```text
//! <prefix>/.kiln/
//! └── manifest.json   # BuildManifest: one entry per recipe name
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::recipe::Recipe;

/// Current manifest format version.
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ManifestError {
  #[error("failed to read build manifest {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse build manifest {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("unsupported build manifest version {0}")]
  UnsupportedVersion(u32),

  #[error("failed to write build manifest {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Identity of a build's inputs. Equal keys mean an existing artifact can be reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildKey(pub String);

impl std::fmt::Display for BuildKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl BuildKey {
  /// Compute the key of a recipe build.
  ///
  /// Covers everything that can change the installed result: name, version,
  /// source hash, steps, environment, source subdirectory, artifact subpath and
  /// the keys of the direct dependencies (which transitively cover theirs).
  pub fn compute<'a>(
    recipe: &Recipe,
    source_hash: &str,
    dependency_keys: impl IntoIterator<Item = (&'a str, &'a BuildKey)>,
  ) -> Self {
    let mut hasher = Sha256::new();
    let mut field = |tag: &str, value: &str| {
      hasher.update(tag.as_bytes());
      hasher.update([0u8]);
      hasher.update((value.len() as u64).to_le_bytes());
      hasher.update(value.as_bytes());
    };

    field("name", &recipe.name);
    field("version", &recipe.version);
    field("source", source_hash);
    for step in &recipe.build_steps {
      field("step", step);
    }
    for (key, value) in &recipe.env {
      field("env", key);
      field("env-value", value);
    }
    field("relative_path", recipe.relative_path.as_deref().unwrap_or(""));
    field("artifact_path", &recipe.artifact_path);

    let mut deps: Vec<(&str, &BuildKey)> = dependency_keys.into_iter().collect();
    deps.sort();
    for (name, key) in deps {
      field("dep", name);
      field("dep-key", &key.0);
    }

    BuildKey(hex::encode(hasher.finalize()))
  }
}

/// One completed build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
  pub name: String,
  pub version: String,
  pub source_hash: String,
  pub build_key: BuildKey,
  /// Absolute artifact directory.
  pub artifact_path: PathBuf,
  pub completed_at_unix: u64,
}

/// Serialized manifest contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildManifest {
  pub version: u32,
  pub entries: BTreeMap<String, ManifestEntry>,
}

impl Default for BuildManifest {
  fn default() -> Self {
    Self {
      version: MANIFEST_VERSION,
      entries: BTreeMap::new(),
    }
  }
}

impl BuildManifest {
  /// Load a manifest, returning an empty one if the file does not exist.
  pub fn load(path: &Path) -> Result<Self, ManifestError> {
    let content = match fs::read_to_string(path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
      Err(source) => {
        return Err(ManifestError::Read {
          path: path.to_path_buf(),
          source,
        });
      }
    };

    let manifest: BuildManifest = serde_json::from_str(&content).map_err(|source| ManifestError::Parse {
      path: path.to_path_buf(),
      source,
    })?;

    if manifest.version != MANIFEST_VERSION {
      return Err(ManifestError::UnsupportedVersion(manifest.version));
    }
    Ok(manifest)
  }

  /// Write the manifest atomically (temp file in the same directory, then rename).
  pub fn save(&self, path: &Path) -> Result<(), ManifestError> {
    let write_err = |source| ManifestError::Write {
      path: path.to_path_buf(),
      source,
    };

    let dir = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(dir).map_err(write_err)?;

    let content = serde_json::to_string_pretty(self).map_err(|e| write_err(io::Error::other(e)))?;
    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    io::Write::write_all(&mut temp, content.as_bytes()).map_err(write_err)?;
    temp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
  }

  pub fn get(&self, name: &str) -> Option<&ManifestEntry> {
    self.entries.get(name)
  }
}

/// Shared, write-through handle on a prefix's manifest.
///
/// Concurrent builds record through one handle so every save contains all
/// entries recorded so far.
#[derive(Debug)]
pub struct ManifestStore {
  path: PathBuf,
  manifest: Mutex<BuildManifest>,
}

impl ManifestStore {
  pub fn open(path: impl Into<PathBuf>) -> Result<Self, ManifestError> {
    let path = path.into();
    let manifest = BuildManifest::load(&path)?;
    Ok(Self {
      path,
      manifest: Mutex::new(manifest),
    })
  }

  pub fn get(&self, name: &str) -> Option<ManifestEntry> {
    self.lock().get(name).cloned()
  }

  /// Insert or replace an entry and persist the manifest.
  pub fn record(&self, entry: ManifestEntry) -> Result<(), ManifestError> {
    let mut manifest = self.lock();
    manifest.entries.insert(entry.name.clone(), entry);
    manifest.save(&self.path)
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, BuildManifest> {
    self.manifest.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}
