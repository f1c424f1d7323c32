//! Status command implementation.
//!
//! Lists the components recorded in the install prefix's build manifest.

use anyhow::{Context, Result};
use serde_json::json;

use kiln_lib::build::manifest::BuildManifest;
use kiln_lib::{FailureClass, InstallPrefix};

use crate::GlobalArgs;
use crate::output::{print_info, print_json, print_stat, print_success, symbols, truncate_hash};

pub fn cmd_status(args: &GlobalArgs) -> Result<Option<FailureClass>> {
  let config = args.config()?;
  let prefix = InstallPrefix::new(&config.install_prefix);
  let manifest_path = prefix.manifest_path();
  let manifest = BuildManifest::load(&manifest_path)
    .with_context(|| format!("Failed to read build manifest: {}", manifest_path.display()))?;

  if args.output.is_json() {
    let json_output = json!({
      "prefix": prefix.root(),
      "components": manifest.entries.values().collect::<Vec<_>>(),
    });
    print_json(&json_output)?;
    return Ok(None);
  }

  if manifest.entries.is_empty() {
    print_info(&format!(
      "Nothing installed in {}. Run 'kiln build' to build recipes.",
      prefix.root().display()
    ));
    return Ok(None);
  }

  print_success(&format!("Prefix: {}", prefix.root().display()));
  print_stat("Components", &manifest.entries.len().to_string());
  println!();
  for entry in manifest.entries.values() {
    println!(
      "  {} {} {} [{}] {}",
      symbols::INFO,
      entry.name,
      entry.version,
      truncate_hash(&entry.build_key.0),
      entry.artifact_path.display()
    );
  }

  Ok(None)
}
