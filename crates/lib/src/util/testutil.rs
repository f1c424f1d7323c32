//! Test utilities for kiln-lib.
//!
//! Builders for recipes and in-memory archives shared by unit tests.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::PathBuf;

use flate2::Compression;
use flate2::write::GzEncoder;

use crate::recipe::{Checksum, DEFAULT_ARTIFACT_PATH, Recipe, SourceRef};
use crate::util::hash::{HashAlgorithm, hash_bytes};

/// A recipe with a local path source and no build steps.
pub fn path_recipe(name: &str, deps: &[&str]) -> Recipe {
  Recipe {
    name: name.to_string(),
    version: "1.0".to_string(),
    source: SourceRef::Path {
      path: PathBuf::from("/nonexistent").join(name),
    },
    dependencies: deps.iter().map(|d| d.to_string()).collect::<BTreeSet<_>>(),
    build_steps: Vec::new(),
    relative_path: None,
    env: BTreeMap::new(),
    artifact_path: DEFAULT_ARTIFACT_PATH.to_string(),
  }
}

pub fn sha256_checksum(body: &[u8]) -> Checksum {
  Checksum {
    algorithm: HashAlgorithm::Sha256,
    value: hash_bytes(body, HashAlgorithm::Sha256).0,
  }
}

/// Build a gzip-compressed tarball from `(path, contents)` pairs.
pub fn tar_gz(entries: &[(&str, &str)]) -> Vec<u8> {
  let encoder = GzEncoder::new(Vec::new(), Compression::default());
  let mut builder = tar::Builder::new(encoder);

  for (path, contents) in entries {
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o755);
    header.set_cksum();
    builder.append_data(&mut header, path, contents.as_bytes()).unwrap();
  }

  let mut encoder = builder.into_inner().unwrap();
  encoder.flush().unwrap();
  encoder.finish().unwrap()
}
