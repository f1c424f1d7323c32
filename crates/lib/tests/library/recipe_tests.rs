//! Loading recipe directories and resolving them.

use kiln_lib::recipe::{RecipeError, SourceRef};
use kiln_lib::util::hash::HashAlgorithm;
use kiln_lib::{RecipeSet, ResolveError, resolve, resolve_roots};

use super::common::Workspace;

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

const PYTHON: &str = r#"
[[recipe]]
name = "python"
version = "2.7.6"

[recipe.source]
path = "python-src"
"#;

#[test]
fn loads_directory_of_recipes() {
  let ws = Workspace::new();
  ws.write_recipe("setuptools.toml", SETUPTOOLS);
  ws.write_recipe("python.toml", PYTHON);
  std::fs::write(ws.recipes_dir().join("notes.txt"), "ignored").unwrap();

  let recipes = ws.load();
  assert_eq!(recipes.names().collect::<Vec<_>>(), vec!["python", "setuptools"]);

  let setuptools = recipes.get("setuptools").unwrap();
  assert_eq!(setuptools.relative_path.as_deref(), Some("setuptools-3.6"));
  match &setuptools.source {
    SourceRef::Url { url, checksum } => {
      assert!(url.ends_with("setuptools-3.6.tar.gz"));
      assert_eq!(checksum.algorithm, HashAlgorithm::Md5);
      assert_eq!(checksum.value, "8f3a1dcdc14313c8334eb6af4f66ea0a");
    }
    other => panic!("expected url source, got {other:?}"),
  }

  // Relative path sources resolve against the recipe file's directory.
  let python = recipes.get("python").unwrap();
  assert_eq!(
    python.source,
    SourceRef::Path {
      path: ws.recipes_dir().join("python-src")
    }
  );

  let plan = resolve(&recipes).unwrap();
  assert_eq!(plan.names(), vec!["python", "setuptools"]);
}

#[test]
fn duplicate_names_across_files_are_rejected() {
  let ws = Workspace::new();
  ws.write_recipe("a.toml", PYTHON);
  ws.write_recipe("b.toml", PYTHON);

  match RecipeSet::load(&ws.recipes_dir()) {
    Err(RecipeError::DuplicateRecipe { name, first, second }) => {
      assert_eq!(name, "python");
      assert!(first.ends_with("a.toml"));
      assert!(second.ends_with("b.toml"));
    }
    other => panic!("expected DuplicateRecipe, got {other:?}"),
  }
}

#[test]
fn invalid_recipe_names_the_problem() {
  let ws = Workspace::new();
  ws.write_recipe(
    "bad.toml",
    r#"
[[recipe]]
name = "broken"
version = "1.0"
build = ["make #{nonsense}"]

[recipe.source]
path = "src"
"#,
  );

  let err = RecipeSet::load(&ws.recipes_dir()).unwrap_err();
  assert!(matches!(err, RecipeError::InvalidRecipe { ref name, .. } if name == "broken"));
  assert!(err.to_string().contains("nonsense"));
}

#[test]
fn three_recipe_cycle_is_reported() {
  let ws = Workspace::new();
  for (name, dep) in [("A", "B"), ("B", "C"), ("C", "A")] {
    ws.write_recipe(
      &format!("{name}.toml"),
      &format!(
        r#"
[[recipe]]
name = "{name}"
version = "1"
dependencies = ["{dep}"]

[recipe.source]
path = "src"
"#
      ),
    );
  }

  match resolve(&ws.load()) {
    Err(ResolveError::CyclicDependency { members }) => assert_eq!(members, vec!["A", "B", "C"]),
    other => panic!("expected CyclicDependency, got {other:?}"),
  }
}

#[test]
fn missing_dependency_is_reported_for_roots() {
  let ws = Workspace::new();
  ws.write_recipe("setuptools.toml", SETUPTOOLS);

  assert!(matches!(
    resolve_roots(&ws.load(), &["setuptools"]),
    Err(ResolveError::UnknownDependency { ref dependency, .. }) if dependency == "python"
  ));
}
