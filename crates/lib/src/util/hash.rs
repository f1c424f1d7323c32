//! Hashing utilities for source verification and build reuse.
//!
//! This module provides:
//! - `HashAlgorithm`: the digest families accepted in recipe checksums
//! - `ObjectHash`: a truncated 20-character hash for cache directory names
//! - `ContentHash`: a full hex digest for content verification
//! - `hash_directory()`: deterministic directory hashing
//! - `hash_file()` / `hash_bytes()`: single file and byte hashing

use std::fs;
use std::io::Read;
use std::path::Path;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::consts::OBJ_HASH_PREFIX_LEN;

/// Digest algorithm of a published checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
  Sha256,
  /// Legacy upstreams still publish md5 sums only.
  Md5,
}

impl HashAlgorithm {
  /// Length of the lowercase hex encoding of a digest.
  pub fn hex_len(self) -> usize {
    match self {
      HashAlgorithm::Sha256 => 64,
      HashAlgorithm::Md5 => 32,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      HashAlgorithm::Sha256 => "sha256",
      HashAlgorithm::Md5 => "md5",
    }
  }

  fn hasher(self) -> Box<dyn digest_shim::DynHasher> {
    match self {
      HashAlgorithm::Sha256 => Box::new(Sha256::new()),
      HashAlgorithm::Md5 => Box::new(Md5::new()),
    }
  }
}

impl std::fmt::Display for HashAlgorithm {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

mod digest_shim {
  use sha2::Digest;

  /// Object-safe view over the `Digest` implementations we use.
  pub trait DynHasher: Send {
    fn update(&mut self, data: &[u8]);
    fn finalize_hex(self: Box<Self>) -> String;
  }

  impl<D: Digest + Send> DynHasher for D {
    fn update(&mut self, data: &[u8]) {
      Digest::update(self, data);
    }

    fn finalize_hex(self: Box<Self>) -> String {
      hex::encode(Digest::finalize(*self))
    }
  }
}

/// A truncated hash identifying a cache object.
///
/// The hash is a 20-character truncated SHA-256, short enough to keep paths readable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectHash(pub String);

impl std::fmt::Display for ObjectHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl ObjectHash {
  /// Truncated SHA-256 of the given parts, separated by NUL bytes.
  pub fn of_parts(parts: &[&str]) -> Self {
    let mut hasher = Sha256::new();
    for part in parts {
      hasher.update(part.as_bytes());
      hasher.update([0u8]);
    }
    let full = hex::encode(hasher.finalize());
    ObjectHash(full[..OBJ_HASH_PREFIX_LEN].to_string())
  }
}

/// A full lowercase hex digest used for content verification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Error during file or directory hashing.
#[derive(Debug, thiserror::Error)]
pub enum DirHashError {
  #[error("failed to walk directory: {message}")]
  WalkDir { message: String },

  #[error("failed to read file {path}: {message}")]
  ReadFile { path: String, message: String },

  #[error("failed to read symlink {path}: {message}")]
  ReadSymlink { path: String, message: String },
}

/// Compute a deterministic SHA-256 hash of a directory's contents.
///
/// The hash covers file contents, directory structure and symlink targets, but
/// not metadata such as timestamps or permissions. Entries are sorted by path.
/// Entries whose file name appears in `exclude` are skipped along with their children.
pub fn hash_directory(path: &Path, exclude: &[&str]) -> Result<ContentHash, DirHashError> {
  let mut entries: Vec<(String, String)> = Vec::new();

  let walker = WalkDir::new(path).sort_by_file_name().into_iter().filter_entry(|e| {
    e.file_name()
      .to_str()
      .map(|name| !exclude.contains(&name))
      .unwrap_or(true)
  });

  for entry in walker {
    let entry = entry.map_err(|e| DirHashError::WalkDir { message: e.to_string() })?;
    let entry_path = entry.path();

    let rel_path = entry_path
      .strip_prefix(path)
      .unwrap_or(entry_path)
      .to_string_lossy()
      .replace('\\', "/");

    if rel_path.is_empty() {
      continue;
    }

    let file_type = entry.file_type();
    let entry_hash = if file_type.is_file() {
      let content_hash = hash_file(entry_path, HashAlgorithm::Sha256)?;
      format!("F:{}:{}", rel_path, content_hash.0)
    } else if file_type.is_dir() {
      format!("D:{}", rel_path)
    } else if file_type.is_symlink() {
      let target = fs::read_link(entry_path).map_err(|e| DirHashError::ReadSymlink {
        path: entry_path.display().to_string(),
        message: e.to_string(),
      })?;
      let target_hash = hash_bytes(target.to_string_lossy().as_bytes(), HashAlgorithm::Sha256);
      format!("L:{}:{}", rel_path, target_hash.0)
    } else {
      // sockets, devices, fifos
      continue;
    };

    entries.push((rel_path, entry_hash));
  }

  entries.sort_by(|a, b| a.0.cmp(&b.0));

  let mut hasher = Sha256::new();
  for (_, entry_hash) in entries {
    hasher.update(entry_hash.as_bytes());
    hasher.update(b"\n");
  }

  Ok(ContentHash(hex::encode(hasher.finalize())))
}

/// Hash a file's contents with the given algorithm.
pub fn hash_file(path: &Path, algorithm: HashAlgorithm) -> Result<ContentHash, DirHashError> {
  let read_err = |e: std::io::Error| DirHashError::ReadFile {
    path: path.display().to_string(),
    message: e.to_string(),
  };

  let mut file = fs::File::open(path).map_err(read_err)?;
  let mut hasher = algorithm.hasher();
  let mut buffer = [0u8; 8192];

  loop {
    let bytes_read = file.read(&mut buffer).map_err(read_err)?;
    if bytes_read == 0 {
      break;
    }
    hasher.update(&buffer[..bytes_read]);
  }

  Ok(ContentHash(hasher.finalize_hex()))
}

/// Hash arbitrary bytes with the given algorithm.
pub fn hash_bytes(data: &[u8], algorithm: HashAlgorithm) -> ContentHash {
  let mut hasher = algorithm.hasher();
  hasher.update(data);
  ContentHash(hasher.finalize_hex())
}
