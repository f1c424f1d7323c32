//! End-to-end runs against a local `file://` mirror.

use std::fs;

use kiln_lib::build::BuildError;
use kiln_lib::fetch::FetchError;
use kiln_lib::{ExecuteError, FailureClass, RunSummary};

use super::common::Workspace;

const FAKE_PYTHON: &str = "#!/bin/sh\necho \"$@\" >> \"$(dirname \"$0\")/../python-invocations.log\"\n";

fn publish_python_and_setuptools(ws: &Workspace) {
  let (python_url, python_sha) = ws.publish("python-2.7.6.tar.gz", &[("Python-2.7.6/python", FAKE_PYTHON)]);
  let (setuptools_url, setuptools_sha) = ws.publish(
    "setuptools-3.6.tar.gz",
    &[("setuptools-3.6/setup.py", "# setup"), ("setuptools-3.6/README", "readme")],
  );

  ws.write_recipe(
    "python.toml",
    &format!(
      r#"
[[recipe]]
name = "python"
version = "2.7.6"
build = [
  "mkdir -p #{{embedded_dir}}/bin",
  "cp python #{{embedded_dir}}/bin/python",
  "chmod +x #{{embedded_dir}}/bin/python",
]

[recipe.source]
url = "{python_url}"
sha256 = "{python_sha}"
"#
    ),
  );

  ws.write_recipe(
    "setuptools.toml",
    &format!(
      r##"
[[recipe]]
name = "setuptools"
version = "3.6"
dependencies = ["python"]
relative_path = "setuptools-#{{version}}"
build = ["#{{install_dir}}/embedded/bin/python setup.py install --prefix=#{{install_dir}}/embedded"]

[recipe.source]
url = "{setuptools_url}"
sha256 = "{setuptools_sha}"
"##
    ),
  );
}

async fn run_all(ws: &Workspace) -> RunSummary {
  let recipes = ws.load();
  let mut run = ws.orchestrator().run(&recipes, &[] as &[&str]).await.unwrap();
  while run.next_artifact().await.is_some() {}
  run.finish().await.unwrap()
}

#[tokio::test]
async fn builds_dependency_chain_from_mirror() {
  let ws = Workspace::new();
  publish_python_and_setuptools(&ws);

  let summary = run_all(&ws).await;

  assert!(summary.is_success(), "failures: {:?}", summary.failed);
  assert_eq!(summary.plan, vec!["python", "setuptools"]);
  let built: Vec<&str> = summary.built.iter().map(|a| a.name.as_str()).collect();
  assert_eq!(built, vec!["python", "setuptools"]);

  let embedded = ws.prefix().join("embedded");
  let invocations = fs::read_to_string(embedded.join("python-invocations.log")).unwrap();
  assert_eq!(
    invocations.trim(),
    format!("setup.py install --prefix={}", embedded.display())
  );

  let manifest = fs::read_to_string(ws.prefix().join(".kiln/manifest.json")).unwrap();
  assert!(manifest.contains("\"setuptools\""));
  assert!(ws.prefix().join(".kiln/logs/setuptools.log").exists());
}

#[tokio::test]
async fn rerun_reuses_without_fetching() {
  let ws = Workspace::new();
  publish_python_and_setuptools(&ws);
  assert!(run_all(&ws).await.is_success());

  // With the mirror gone, any fetch would fail.
  fs::remove_dir_all(ws.path().join("mirror")).unwrap();
  fs::remove_dir_all(ws.path().join("cache")).unwrap();

  let summary = run_all(&ws).await;
  assert!(summary.is_success(), "failures: {:?}", summary.failed);
  assert!(summary.built.is_empty());
  assert_eq!(summary.reused.len(), 2);
}

#[tokio::test]
async fn corrupt_download_fails_with_checksum_mismatch() {
  let ws = Workspace::new();
  let (url, _) = ws.publish("tool-1.0.tar.gz", &[("tool-1.0/file", "contents")]);
  ws.write_recipe(
    "tool.toml",
    &format!(
      r#"
[[recipe]]
name = "tool"
version = "1.0"
build = ["true"]

[recipe.source]
url = "{url}"
sha256 = "{}"
"#,
      "0".repeat(64)
    ),
  );

  let summary = run_all(&ws).await;

  assert!(matches!(
    summary.failure("tool"),
    Some(ExecuteError::Fetch(FetchError::ChecksumMismatch { .. }))
  ));
  assert_eq!(summary.failure_class(), Some(FailureClass::Fetch));
  let sources = ws.path().join("cache/sources");
  let cached_files = walkdir::WalkDir::new(&sources)
    .into_iter()
    .filter_map(Result::ok)
    .filter(|e| e.file_type().is_file())
    .count();
  assert_eq!(cached_files, 0);
}

#[tokio::test]
async fn failed_step_reports_output_and_skips_dependents() {
  let ws = Workspace::new();
  publish_python_and_setuptools(&ws);
  let python = fs::read_to_string(ws.recipes_dir().join("python.toml")).unwrap();
  fs::write(
    ws.recipes_dir().join("python.toml"),
    python.replace("\"chmod +x", "\"echo configure: error >&2; exit 2\",\n  \"chmod +x"),
  )
  .unwrap();

  let summary = run_all(&ws).await;

  match summary.failure("python") {
    Some(ExecuteError::Build(BuildError::BuildFailed {
      step_index,
      exit_code,
      captured_output,
      ..
    })) => {
      assert_eq!(*step_index, 2);
      assert_eq!(*exit_code, Some(2));
      assert!(captured_output.contains("configure: error"));
    }
    other => panic!("expected BuildFailed, got {other:?}"),
  }
  assert_eq!(summary.skipped_because("setuptools"), Some("python"));
  assert_eq!(summary.failure_class(), Some(FailureClass::Build));
}
