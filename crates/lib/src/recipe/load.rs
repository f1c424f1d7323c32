//! TOML recipe loading and validation.
//!
//! A recipe file holds one or more `[[recipe]]` tables:
//!
//! ```toml
//! [[recipe]]
//! name = "setuptools"
//! version = "3.6"
//! dependencies = ["python"]
//! relative_path = "setuptools-#{version}"
//! build = [
//!   "#{install_dir}/embedded/bin/python setup.py install --prefix=#{install_dir}/embedded",
//! ]
//!
//! [recipe.source]
//! url = "https://pypi.python.org/packages/source/s/setuptools/setuptools-#{version}.tar.gz"
//! md5 = "8f3a1dcdc14313c8334eb6af4f66ea0a"
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::placeholder::{self, Variables};
use crate::util::hash::HashAlgorithm;

use super::types::{
  BUILD_VARIABLES, Checksum, DEFAULT_ARTIFACT_PATH, LOAD_VARIABLES, Recipe, RecipeError, SourceRef,
};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecipeFile {
  #[serde(default)]
  recipe: Vec<RawRecipe>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRecipe {
  name: Option<String>,
  version: Option<String>,
  source: Option<RawSource>,
  #[serde(default)]
  dependencies: Vec<String>,
  #[serde(default, alias = "build_steps")]
  build: Vec<String>,
  relative_path: Option<String>,
  #[serde(default)]
  env: BTreeMap<String, String>,
  artifact_path: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSource {
  url: Option<String>,
  path: Option<PathBuf>,
  sha256: Option<String>,
  md5: Option<String>,
}

/// Parse recipes from TOML text.
///
/// `origin` names the text in error messages. Relative `path` sources are
/// resolved against `base_dir` when given.
pub fn load_str(content: &str, origin: &str, base_dir: Option<&Path>) -> Result<Vec<Recipe>, RecipeError> {
  let file: RecipeFile = toml::from_str(content).map_err(|e| RecipeError::Parse {
    origin: origin.to_string(),
    message: e.message().to_string(),
  })?;

  file
    .recipe
    .into_iter()
    .enumerate()
    .map(|(index, raw)| validate(raw, index, origin, base_dir))
    .collect()
}

/// Load recipes from a single TOML file.
pub fn load_file(path: &Path) -> Result<Vec<Recipe>, RecipeError> {
  debug!(path = %path.display(), "loading recipe file");
  let content = std::fs::read_to_string(path).map_err(|source| RecipeError::Io {
    path: path.to_path_buf(),
    source,
  })?;
  load_str(&content, &path.display().to_string(), path.parent())
}

/// Paths of `*.toml` files directly inside `dir`, sorted.
pub(super) fn recipe_files(dir: &Path) -> Result<Vec<PathBuf>, RecipeError> {
  let io_err = |source| RecipeError::Io {
    path: dir.to_path_buf(),
    source,
  };

  let mut files = Vec::new();
  for entry in std::fs::read_dir(dir).map_err(io_err)? {
    let path = entry.map_err(io_err)?.path();
    if path.is_file() && path.extension().is_some_and(|ext| ext == "toml") {
      files.push(path);
    }
  }
  files.sort();
  Ok(files)
}

fn validate(raw: RawRecipe, index: usize, origin: &str, base_dir: Option<&Path>) -> Result<Recipe, RecipeError> {
  let display_name = raw.name.clone().unwrap_or_else(|| format!("#{}", index + 1));
  let invalid = |reason: String| RecipeError::InvalidRecipe {
    origin: origin.to_string(),
    name: display_name.clone(),
    reason,
  };

  let name = raw.name.ok_or_else(|| invalid("missing required field 'name'".to_string()))?;
  validate_name(&name).map_err(&invalid)?;

  let version = raw
    .version
    .ok_or_else(|| invalid("missing required field 'version'".to_string()))?;
  validate_version(&version).map_err(&invalid)?;

  let load_vars = Variables::new().with("name", name.as_str()).with("version", version.as_str());
  let expand_load = |field: &str, template: &str| -> Result<String, RecipeError> {
    check_variables(template, LOAD_VARIABLES).map_err(|reason| invalid(format!("{field}: {reason}")))?;
    placeholder::substitute(template, &load_vars).map_err(|e| invalid(format!("{field}: {e}")))
  };

  let raw_source = raw
    .source
    .ok_or_else(|| invalid("missing required field 'source'".to_string()))?;
  let source = match (raw_source.url, raw_source.path) {
    (Some(url), None) => {
      let url = expand_load("source.url", &url)?;
      validate_url(&url).map_err(&invalid)?;
      let checksum = match (raw_source.sha256, raw_source.md5) {
        (Some(value), None) => parse_checksum(HashAlgorithm::Sha256, &value),
        (None, Some(value)) => parse_checksum(HashAlgorithm::Md5, &value),
        (None, None) => Err("url source requires a 'sha256' or 'md5' checksum".to_string()),
        (Some(_), Some(_)) => Err("source must declare exactly one of 'sha256' or 'md5'".to_string()),
      }
      .map_err(&invalid)?;
      SourceRef::Url { url, checksum }
    }
    (None, Some(path)) => {
      if raw_source.sha256.is_some() || raw_source.md5.is_some() {
        return Err(invalid("path sources are hashed in place and take no checksum".to_string()));
      }
      if path.as_os_str().is_empty() {
        return Err(invalid("source.path must not be empty".to_string()));
      }
      let path = match base_dir {
        Some(base) if path.is_relative() => base.join(path),
        _ => path,
      };
      SourceRef::Path { path }
    }
    (Some(_), Some(_)) => return Err(invalid("source must declare exactly one of 'url' or 'path'".to_string())),
    (None, None) => return Err(invalid("source must declare 'url' or 'path'".to_string())),
  };

  let mut dependencies = BTreeSet::new();
  for dep in raw.dependencies {
    if dep == name {
      return Err(invalid("recipe depends on itself".to_string()));
    }
    validate_name(&dep).map_err(|reason| invalid(format!("dependency '{dep}': {reason}")))?;
    dependencies.insert(dep);
  }

  for (index, step) in raw.build.iter().enumerate() {
    check_variables(step, BUILD_VARIABLES).map_err(|reason| invalid(format!("build step {index}: {reason}")))?;
  }

  for (key, value) in &raw.env {
    if key.is_empty() || key.contains('=') {
      return Err(invalid(format!("invalid environment variable name '{key}'")));
    }
    check_variables(value, BUILD_VARIABLES).map_err(|reason| invalid(format!("env.{key}: {reason}")))?;
  }

  let relative_path = raw
    .relative_path
    .map(|path| {
      let path = expand_load("relative_path", &path)?;
      validate_subpath(&path).map_err(|reason| invalid(format!("relative_path: {reason}")))?;
      Ok::<_, RecipeError>(path)
    })
    .transpose()?;

  let artifact_path = match raw.artifact_path {
    Some(path) => expand_load("artifact_path", &path)?,
    None => DEFAULT_ARTIFACT_PATH.to_string(),
  };
  validate_subpath(&artifact_path).map_err(|reason| invalid(format!("artifact_path: {reason}")))?;
  let artifact_path = normalize_subpath(&artifact_path);
  if artifact_path.is_empty() {
    return Err(invalid("artifact_path must name a directory below the install prefix".to_string()));
  }
  if Path::new(&artifact_path).starts_with(crate::consts::STATE_DIR) {
    return Err(invalid(format!(
      "artifact_path must not point into {}",
      crate::consts::STATE_DIR
    )));
  }

  Ok(Recipe {
    name,
    version,
    source,
    dependencies,
    build_steps: raw.build,
    relative_path,
    env: raw.env,
    artifact_path,
  })
}

fn validate_name(name: &str) -> Result<(), String> {
  if name.is_empty() {
    return Err("name must not be empty".to_string());
  }
  if name.chars().any(|c| c.is_whitespace() || c == '/' || c == '\\') {
    return Err(format!("name '{name}' must not contain whitespace or path separators"));
  }
  if name == "." || name == ".." {
    return Err(format!("name '{name}' is reserved"));
  }
  Ok(())
}

/// Versions end up in work directory names, so they are held to the same path rules as names.
fn validate_version(version: &str) -> Result<(), String> {
  if version.trim().is_empty() {
    return Err("version must not be empty".to_string());
  }
  if version.contains(['/', '\\']) {
    return Err(format!("version '{version}' must not contain path separators"));
  }
  if version == "." || version == ".." {
    return Err(format!("version '{version}' is reserved"));
  }
  Ok(())
}

fn validate_url(url: &str) -> Result<(), String> {
  let parsed = reqwest::Url::parse(url).map_err(|e| format!("malformed source url '{url}': {e}"))?;
  match parsed.scheme() {
    "http" | "https" | "file" => Ok(()),
    other => Err(format!("unsupported url scheme '{other}' in '{url}'")),
  }
}

fn parse_checksum(algorithm: HashAlgorithm, value: &str) -> Result<Checksum, String> {
  let value = value.trim().to_ascii_lowercase();
  if value.len() != algorithm.hex_len() || !value.chars().all(|c| c.is_ascii_hexdigit()) {
    return Err(format!(
      "{algorithm} checksum must be {} hex characters, got '{value}'",
      algorithm.hex_len()
    ));
  }
  Ok(Checksum { algorithm, value })
}

/// Reject absolute paths and parent-directory components.
fn validate_subpath(path: &str) -> Result<(), String> {
  if path.trim().is_empty() {
    return Err("path must not be empty".to_string());
  }
  let candidate = Path::new(path);
  for component in candidate.components() {
    match component {
      Component::Normal(_) | Component::CurDir => {}
      _ => return Err(format!("'{path}' must be a relative path without '..'")),
    }
  }
  Ok(())
}

/// Join the normal components of an already validated subpath with `/`.
fn normalize_subpath(path: &str) -> String {
  Path::new(path)
    .components()
    .filter_map(|c| match c {
      Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
      _ => None,
    })
    .collect::<Vec<_>>()
    .join("/")
}

fn check_variables(template: &str, allowed: &[&str]) -> Result<(), String> {
  let names = placeholder::variables_in(template).map_err(|e| e.to_string())?;
  match names.iter().find(|name| !allowed.contains(&name.as_str())) {
    Some(unknown) => Err(format!(
      "unknown variable '#{{{unknown}}}' (available: {})",
      allowed.join(", ")
    )),
    None => Ok(()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const SETUPTOOLS: &str = r##"
[[recipe]]
name = "setuptools"
version = "3.6"
dependencies = ["python"]
relative_path = "setuptools-#{version}"
build = [
  "#{install_dir}/embedded/bin/python setup.py install --prefix=#{install_dir}/embedded",
]

[recipe.source]
url = "https://pypi.python.org/packages/source/s/setuptools/setuptools-#{version}.tar.gz"
md5 = "8F3A1DCDC14313C8334EB6AF4F66EA0A"
"##;

  fn load_one(content: &str) -> Result<Recipe, RecipeError> {
    load_str(content, "test.toml", None).map(|mut recipes| recipes.remove(0))
  }

  fn reason(err: RecipeError) -> String {
    match err {
      RecipeError::InvalidRecipe { reason, .. } => reason,
      other => panic!("expected InvalidRecipe, got {other:?}"),
    }
  }

  #[test]
  fn loads_omnibus_style_recipe() {
    let recipe = load_one(SETUPTOOLS).unwrap();

    assert_eq!(recipe.name, "setuptools");
    assert_eq!(recipe.version, "3.6");
    assert_eq!(recipe.dependencies, BTreeSet::from(["python".to_string()]));
    assert_eq!(recipe.relative_path.as_deref(), Some("setuptools-3.6"));
    assert_eq!(recipe.artifact_path, "embedded");
    assert_eq!(recipe.build_steps.len(), 1);
    assert_eq!(
      recipe.source,
      SourceRef::Url {
        url: "https://pypi.python.org/packages/source/s/setuptools/setuptools-3.6.tar.gz".to_string(),
        checksum: Checksum {
          algorithm: HashAlgorithm::Md5,
          value: "8f3a1dcdc14313c8334eb6af4f66ea0a".to_string(),
        },
      }
    );
  }

  #[test]
  fn missing_name_is_invalid() {
    let err = load_one(
      r#"
[[recipe]]
version = "1"
source = { path = "src" }
"#,
    )
    .unwrap_err();
    assert!(reason(err).contains("'name'"));
  }

  #[test]
  fn version_with_path_separator_is_invalid() {
    let err = load_one(
      r#"
[[recipe]]
name = "openssl"
version = "1.0.1/fips"
source = { path = "src" }
"#,
    )
    .unwrap_err();
    assert!(reason(err).contains("path separators"));

    let err = load_one(
      r#"
[[recipe]]
name = "openssl"
version = ".."
source = { path = "src" }
"#,
    )
    .unwrap_err();
    assert!(reason(err).contains("reserved"));
  }

  #[test]
  fn missing_source_is_invalid() {
    let err = load_one(
      r#"
[[recipe]]
name = "a"
version = "1"
"#,
    )
    .unwrap_err();
    assert!(reason(err).contains("'source'"));
  }

  #[test]
  fn self_dependency_is_invalid() {
    let err = load_one(
      r#"
[[recipe]]
name = "a"
version = "1"
dependencies = ["a"]
source = { path = "src" }
"#,
    )
    .unwrap_err();
    assert!(reason(err).contains("depends on itself"));
  }

  #[test]
  fn url_without_checksum_is_invalid() {
    let err = load_one(
      r#"
[[recipe]]
name = "a"
version = "1"
source = { url = "https://example.com/a.tar.gz" }
"#,
    )
    .unwrap_err();
    assert!(reason(err).contains("checksum"));
  }

  #[test]
  fn checksum_of_wrong_length_is_invalid() {
    let err = load_one(
      r#"
[[recipe]]
name = "a"
version = "1"
source = { url = "https://example.com/a.tar.gz", sha256 = "abc" }
"#,
    )
    .unwrap_err();
    assert!(reason(err).contains("64 hex characters"));
  }

  #[test]
  fn unsupported_scheme_is_invalid() {
    let err = load_one(
      r#"
[[recipe]]
name = "a"
version = "1"
source = { url = "ftp://example.com/a.tar.gz", md5 = "8f3a1dcdc14313c8334eb6af4f66ea0a" }
"#,
    )
    .unwrap_err();
    assert!(reason(err).contains("ftp"));
  }

  #[test]
  fn url_and_path_together_are_invalid() {
    let err = load_one(
      r#"
[[recipe]]
name = "a"
version = "1"
source = { url = "https://example.com/a.tar.gz", path = "src", md5 = "8f3a1dcdc14313c8334eb6af4f66ea0a" }
"#,
    )
    .unwrap_err();
    assert!(reason(err).contains("exactly one"));
  }

  #[test]
  fn unknown_build_variable_is_invalid() {
    let err = load_one(
      r##"
[[recipe]]
name = "a"
version = "1"
source = { path = "src" }
build = ["make PREFIX=#{prefixx}"]
"##,
    )
    .unwrap_err();
    assert!(reason(err).contains("prefixx"));
  }

  #[test]
  fn build_variable_in_url_is_invalid() {
    let err = load_one(
      r##"
[[recipe]]
name = "a"
version = "1"
source = { url = "https://example.com/#{install_dir}.tar.gz", md5 = "8f3a1dcdc14313c8334eb6af4f66ea0a" }
"##,
    )
    .unwrap_err();
    assert!(reason(err).contains("install_dir"));
  }

  #[test]
  fn artifact_path_cannot_escape_prefix() {
    for path in ["../outside", "/abs", ".kiln/work", "./.kiln", "."] {
      let content = format!(
        r#"
[[recipe]]
name = "a"
version = "1"
source = {{ path = "src" }}
artifact_path = "{path}"
"#
      );
      assert!(load_one(&content).is_err(), "{path} should be rejected");
    }
  }

  #[test]
  fn artifact_path_is_normalized() {
    let recipe = load_one(
      r#"
[[recipe]]
name = "a"
version = "1"
source = { path = "src" }
artifact_path = "./opt/#{name}/"
"#,
    )
    .unwrap();
    assert_eq!(recipe.artifact_path, "opt/a");
  }

  #[test]
  fn relative_path_source_resolves_against_base_dir() {
    let recipes = load_str(
      r#"
[[recipe]]
name = "a"
version = "1"
source = { path = "vendor/a" }
"#,
      "recipes/a.toml",
      Some(Path::new("/recipes")),
    )
    .unwrap();

    assert_eq!(
      recipes[0].source,
      SourceRef::Path {
        path: PathBuf::from("/recipes/vendor/a")
      }
    );
  }

  #[test]
  fn unknown_field_is_parse_error() {
    let err = load_str(
      r#"
[[recipe]]
name = "a"
version = "1"
source = { path = "src" }
colour = "blue"
"#,
      "test.toml",
      None,
    )
    .unwrap_err();
    assert!(matches!(err, RecipeError::Parse { .. }));
  }

  #[test]
  fn empty_file_has_no_recipes() {
    assert!(load_str("", "empty.toml", None).unwrap().is_empty());
  }
}
