//! Shared fixtures for library integration tests.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use flate2::Compression;
use flate2::write::GzEncoder;
use kiln_lib::fetch::{FetchConfig, Fetcher, HttpTransport};
use kiln_lib::util::hash::{HashAlgorithm, hash_bytes};
use kiln_lib::{Config, Orchestrator, RecipeSet};
use tempfile::TempDir;

/// An isolated workspace: recipe directory, source mirror, prefix and cache.
pub struct Workspace {
  pub temp: TempDir,
}

impl Workspace {
  pub fn new() -> Self {
    let temp = TempDir::new().unwrap();
    for dir in ["recipes", "mirror"] {
      std::fs::create_dir_all(temp.path().join(dir)).unwrap();
    }
    Self { temp }
  }

  pub fn path(&self) -> &Path {
    self.temp.path()
  }

  pub fn recipes_dir(&self) -> PathBuf {
    self.path().join("recipes")
  }

  pub fn prefix(&self) -> PathBuf {
    self.path().join("prefix")
  }

  pub fn write_recipe(&self, file: &str, toml: &str) {
    std::fs::write(self.recipes_dir().join(file), toml).unwrap();
  }

  /// Publish a tarball in the local mirror and return its `file://` URL and sha256.
  pub fn publish(&self, filename: &str, entries: &[(&str, &str)]) -> (String, String) {
    let bytes = tar_gz(entries);
    let path = self.path().join("mirror").join(filename);
    std::fs::write(&path, &bytes).unwrap();
    let url = reqwest::Url::from_file_path(&path).unwrap().to_string();
    (url, hash_bytes(&bytes, HashAlgorithm::Sha256).0)
  }

  pub fn load(&self) -> RecipeSet {
    RecipeSet::load(&self.recipes_dir()).unwrap()
  }

  pub fn config(&self) -> Config {
    let mut config = Config::default();
    config.install_prefix = self.prefix();
    config.cache_dir = self.path().join("cache");
    config.parallelism = 2;
    config.fetch = FetchConfig {
      attempts: 1,
      ..FetchConfig::default()
    };
    config
  }

  pub fn orchestrator(&self) -> Orchestrator {
    self.orchestrator_with(self.config())
  }

  pub fn orchestrator_with(&self, config: Config) -> Orchestrator {
    let transport = Arc::new(HttpTransport::new(Duration::from_secs(5)).unwrap());
    let fetcher = Fetcher::with_transport(&config.cache_dir, config.fetch.clone(), transport);
    Orchestrator::with_fetcher(config, Arc::new(fetcher))
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
