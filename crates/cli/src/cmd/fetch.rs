//! Implementation of the `kiln fetch` command.
//!
//! Downloads and verifies the sources of the selected recipes into the cache
//! without building anything.

use anyhow::{Context, Result};
use serde_json::json;

use kiln_lib::{FailureClass, Orchestrator};

use crate::GlobalArgs;
use crate::output::{print_error, print_json, print_success, truncate_hash};

pub fn cmd_fetch(args: &GlobalArgs, roots: &[String]) -> Result<Option<FailureClass>> {
  let recipes = args.load_recipes()?;
  let config = args.config()?;
  let orchestrator = Orchestrator::new(config)?;

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let results = rt.block_on(orchestrator.fetch_sources(&recipes, roots))?;
  let failures = results.iter().filter(|(_, result)| result.is_err()).count();

  if args.output.is_json() {
    let items: Vec<_> = results
      .iter()
      .map(|(name, result)| match result {
        Ok(source) => json!({
          "recipe": name,
          "path": source.path,
          "content_hash": source.content_hash,
          "cached": source.from_cache,
        }),
        Err(err) => json!({ "recipe": name, "error": err.to_string() }),
      })
      .collect();
    print_json(&items)?;
  } else {
    for (name, result) in &results {
      match result {
        Ok(source) => {
          let origin = if source.from_cache { " (cached)" } else { "" };
          print_success(&format!("{} {}{}", name, truncate_hash(&source.content_hash), origin));
        }
        Err(err) => print_error(&format!("{}: {}", name, err)),
      }
    }
  }

  Ok((failures > 0).then_some(FailureClass::Fetch))
}
