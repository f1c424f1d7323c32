//! Fetch command integration tests.

use predicates::prelude::*;

use super::common::TestEnv;

fn tool_recipe(url: &str, sha256: &str) -> String {
  format!(
    r#"
[[recipe]]
name = "tool"
version = "1.0"
relative_path = "tool-#{{version}}"

[recipe.source]
url = "{url}"
sha256 = "{sha256}"
"#
  )
}

#[test]
fn fetch_downloads_then_uses_cache() {
  let env = TestEnv::new();
  let (url, sha256) = env.publish("tool-1.0.tar.gz", &[("tool-1.0/README", "tool")]);
  env.write_recipe("tool.toml", &tool_recipe(&url, &sha256));

  env
    .kiln_cmd()
    .arg("fetch")
    .assert()
    .success()
    .stdout(predicate::str::contains("tool sha256:"))
    .stdout(predicate::str::contains("(cached)").not());

  env
    .kiln_cmd()
    .arg("fetch")
    .assert()
    .success()
    .stdout(predicate::str::contains("(cached)"));

  assert!(env.cache_path().join("sources").exists());
}

#[test]
fn fetch_with_wrong_checksum_exits_with_fetch_error() {
  let env = TestEnv::new();
  let (url, _) = env.publish("tool-1.0.tar.gz", &[("tool-1.0/README", "tool")]);
  env.write_recipe("tool.toml", &tool_recipe(&url, &"0".repeat(64)));

  env
    .kiln_cmd()
    .arg("fetch")
    .assert()
    .code(3)
    .stderr(predicate::str::contains("tool:"));
}

#[test]
fn fetch_does_not_build() {
  let env = TestEnv::with_app();

  env.kiln_cmd().arg("fetch").assert().success();

  assert!(!env.prefix_path().join("embedded").exists());
}
