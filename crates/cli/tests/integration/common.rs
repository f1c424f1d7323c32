//! Shared test helpers for CLI integration tests.

use std::io::Write;
use std::path::PathBuf;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use flate2::Compression;
use flate2::write::GzEncoder;
use kiln_lib::util::hash::{HashAlgorithm, hash_bytes};
use tempfile::TempDir;

/// A library installed into `embedded/lib` by copying its source tree.
pub const LIBFOO: &str = r#"
[[recipe]]
name = "libfoo"
version = "1.2"
build = [
  "mkdir -p #{embedded_dir}/lib",
  "cp libfoo.a #{embedded_dir}/lib/libfoo-#{version}.a",
]

[recipe.source]
path = "src/libfoo"
"#;

/// An application that refuses to build unless libfoo is installed.
pub const APP: &str = r#"
[[recipe]]
name = "app"
version = "0.3"
dependencies = ["libfoo"]
build = [
  "test -f #{embedded_dir}/lib/libfoo-1.2.a",
  "mkdir -p #{embedded_dir}/bin",
  "cp app.sh #{embedded_dir}/bin/app",
]

[recipe.source]
path = "src/app"
"#;

/// Isolated test environment.
///
/// Each test gets its own recipe directory, install prefix and source cache.
pub struct TestEnv {
  pub temp: TempDir,
}

impl TestEnv {
  pub fn new() -> Self {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir_all(temp.path().join("recipes")).unwrap();
    Self { temp }
  }

  /// Environment with the libfoo and app recipes and their source trees.
  pub fn with_app() -> Self {
    let env = Self::new();
    env.write_file("recipes/src/libfoo/libfoo.a", "archive");
    env.write_file("recipes/src/app/app.sh", "#!/bin/sh\necho app\n");
    env.write_recipe("libfoo.toml", LIBFOO);
    env.write_recipe("app.toml", APP);
    env
  }

  /// Write a file relative to the temp directory.
  pub fn write_file(&self, relative_path: &str, content: &str) {
    let path = self.temp.path().join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
  }

  pub fn write_recipe(&self, file: &str, content: &str) {
    self.write_file(&format!("recipes/{file}"), content);
  }

  pub fn recipes_path(&self) -> PathBuf {
    self.temp.path().join("recipes")
  }

  pub fn prefix_path(&self) -> PathBuf {
    let p = self.temp.path().join("prefix");
    std::fs::create_dir_all(&p).unwrap();
    dunce::canonicalize(&p).unwrap_or(p)
  }

  pub fn cache_path(&self) -> PathBuf {
    self.temp.path().join("cache")
  }

  /// Publish a tarball under `mirror/` and return its `file://` URL and sha256.
  pub fn publish(&self, filename: &str, entries: &[(&str, &str)]) -> (String, String) {
    let bytes = tar_gz(entries);
    let dir = self.temp.path().join("mirror");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dunce::canonicalize(&dir).unwrap().join(filename);
    std::fs::write(&path, &bytes).unwrap();
    (
      format!("file://{}", path.display()),
      hash_bytes(&bytes, HashAlgorithm::Sha256).0,
    )
  }

  /// Get a pre-configured Command for the kiln binary.
  ///
  /// Sets `KILN_PREFIX` and `KILN_CACHE_DIR` to isolated paths and points
  /// `--recipes` at this environment's recipe directory.
  pub fn kiln_cmd(&self) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("kiln");
    cmd.env("KILN_PREFIX", self.prefix_path());
    cmd.env("KILN_CACHE_DIR", self.cache_path());
    cmd.env_remove("KILN_JOBS");
    cmd.env_remove("KILN_KEEP_GOING");
    cmd.arg("--recipes").arg(self.recipes_path());
    cmd
  }
}

pub fn tar_gz(entries: &[(&str, &str)]) -> Vec<u8> {
  let encoder = GzEncoder::new(Vec::new(), Compression::default());
  let mut builder = tar::Builder::new(encoder);
  for (path, contents) in entries {
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, path, contents.as_bytes()).unwrap();
  }
  let mut encoder = builder.into_inner().unwrap();
  encoder.flush().unwrap();
  encoder.finish().unwrap()
}
