//! Status command integration tests.

use predicates::prelude::*;

use super::common::TestEnv;

#[test]
fn status_lists_installed_components() {
  let env = TestEnv::with_app();
  env.kiln_cmd().arg("build").assert().success();

  env
    .kiln_cmd()
    .arg("status")
    .assert()
    .success()
    .stdout(predicate::str::contains("Components: 2"))
    .stdout(predicate::str::contains("libfoo 1.2"))
    .stdout(predicate::str::contains("app 0.3"));
}

#[test]
fn status_json_lists_manifest_entries() {
  let env = TestEnv::with_app();
  env.kiln_cmd().arg("build").arg("libfoo").assert().success();

  let output = env.kiln_cmd().args(["status", "-o", "json"]).output().unwrap();
  assert!(output.status.success());

  let status: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  let components = status["components"].as_array().unwrap();
  assert_eq!(components.len(), 1);
  assert_eq!(components[0]["name"], "libfoo");
  assert_eq!(components[0]["version"], "1.2");
}
