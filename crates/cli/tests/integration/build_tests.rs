//! Build command integration tests.

use predicates::prelude::*;

use super::common::TestEnv;

#[test]
fn build_installs_in_dependency_order() {
  let env = TestEnv::with_app();

  env
    .kiln_cmd()
    .arg("build")
    .assert()
    .success()
    .stdout(predicate::str::contains("libfoo 1.2 built"))
    .stdout(predicate::str::contains("app 0.3 built"))
    .stdout(predicate::str::contains("Build complete"));

  let embedded = env.prefix_path().join("embedded");
  assert!(embedded.join("lib/libfoo-1.2.a").exists());
  assert!(embedded.join("bin/app").exists());
}

#[test]
fn rebuild_is_up_to_date() {
  let env = TestEnv::with_app();
  env.kiln_cmd().arg("build").assert().success();

  env
    .kiln_cmd()
    .arg("build")
    .assert()
    .success()
    .stdout(predicate::str::contains("Built: 0"))
    .stdout(predicate::str::contains("Up to date: 2"));
}

#[test]
fn changed_dependency_rebuilds_dependents() {
  let env = TestEnv::with_app();
  env.kiln_cmd().arg("build").assert().success();

  env.write_file("recipes/src/libfoo/libfoo.a", "archive v2");

  env
    .kiln_cmd()
    .arg("build")
    .assert()
    .success()
    .stdout(predicate::str::contains("Built: 2"));
}

#[test]
fn root_limits_build_to_its_dependencies() {
  let env = TestEnv::with_app();

  env
    .kiln_cmd()
    .arg("build")
    .arg("libfoo")
    .assert()
    .success()
    .stdout(predicate::str::contains("Built: 1"));

  assert!(!env.prefix_path().join("embedded/bin/app").exists());
}

#[test]
fn failed_step_exits_with_build_error() {
  let env = TestEnv::with_app();
  env.write_recipe(
    "libfoo.toml",
    r#"
[[recipe]]
name = "libfoo"
version = "1.2"
build = ["echo 'ld: cannot find -lbar' >&2", "exit 1"]

[recipe.source]
path = "src/libfoo"
"#,
  );

  env
    .kiln_cmd()
    .arg("build")
    .assert()
    .code(4)
    .stderr(predicate::str::contains("libfoo failed"))
    .stderr(predicate::str::contains("ld: cannot find -lbar"))
    .stderr(predicate::str::contains("app skipped: dependency libfoo failed"));
}

#[test]
fn bad_checksum_exits_with_fetch_error() {
  let env = TestEnv::new();
  let (url, _) = env.publish("tool-1.0.tar.gz", &[("tool-1.0/README", "tool")]);
  env.write_recipe(
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
      "ab".repeat(32)
    ),
  );

  env
    .kiln_cmd()
    .arg("build")
    .assert()
    .code(3)
    .stderr(predicate::str::contains("checksum mismatch"));
}

#[test]
fn json_summary_reports_artifacts() {
  let env = TestEnv::with_app();

  let output = env.kiln_cmd().args(["build", "-o", "json"]).output().unwrap();
  assert!(output.status.success());

  let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(summary["success"], true);
  assert_eq!(summary["plan"], serde_json::json!(["libfoo", "app"]));
  assert_eq!(summary["built"].as_array().unwrap().len(), 2);
}
