//! Plan command integration tests.

use predicates::prelude::*;

use super::common::TestEnv;

#[test]
fn plan_lists_recipes_to_build() {
  let env = TestEnv::with_app();

  env
    .kiln_cmd()
    .arg("plan")
    .assert()
    .success()
    .stdout(predicate::str::contains("libfoo 1.2"))
    .stdout(predicate::str::contains("(build) → libfoo"))
    .stdout(predicate::str::contains("Wave 2"))
    .stdout(predicate::str::contains("To build: 2"))
    .stdout(predicate::str::contains("Waves: 2"));

  assert!(!env.prefix_path().join("embedded").exists());
}

#[test]
fn plan_after_build_is_up_to_date() {
  let env = TestEnv::with_app();
  env.kiln_cmd().arg("build").assert().success();

  env
    .kiln_cmd()
    .arg("plan")
    .assert()
    .success()
    .stdout(predicate::str::contains("To build: 0"))
    .stdout(predicate::str::contains("Up to date: 2"));
}

#[test]
fn plan_json_is_in_build_order() {
  let env = TestEnv::with_app();

  let output = env.kiln_cmd().args(["plan", "--output", "json"]).output().unwrap();
  assert!(output.status.success());

  let planned: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  let names: Vec<&str> = planned
    .as_array()
    .unwrap()
    .iter()
    .map(|r| r["name"].as_str().unwrap())
    .collect();
  assert_eq!(names, vec!["libfoo", "app"]);
  assert_eq!(planned[1]["action"], "build");
  assert_eq!(planned[1]["dependencies"], serde_json::json!(["libfoo"]));
  assert_eq!(planned[0]["wave"], 0);
  assert_eq!(planned[1]["wave"], 1);
}
