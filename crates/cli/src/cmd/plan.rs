//! Implementation of the `kiln plan` command.
//!
//! Resolves the recipe set and reports which recipes would be rebuilt and which
//! are already up to date, grouped into waves of recipes that can build in
//! parallel. Nothing is fetched or built.

use anyhow::{Context, Result};

use kiln_lib::execute::{PlanAction, PlannedRecipe};
use kiln_lib::{FailureClass, Orchestrator};

use crate::GlobalArgs;
use crate::output::{print_info, print_json, print_stat, symbols, truncate_hash};

pub fn cmd_plan(args: &GlobalArgs, roots: &[String]) -> Result<Option<FailureClass>> {
  let recipes = args.load_recipes()?;
  let config = args.config()?;
  let orchestrator = Orchestrator::new(config)?;

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let planned = rt.block_on(orchestrator.preview(&recipes, roots))?;

  if args.output.is_json() {
    print_json(&planned)?;
    return Ok(None);
  }

  if planned.is_empty() {
    print_info("No recipes to build");
    return Ok(None);
  }

  let waves = planned.iter().map(|r| r.wave + 1).max().unwrap_or(0);
  for wave in 0..waves {
    print_info(&format!("Wave {}", wave + 1));
    for recipe in planned.iter().filter(|r| r.wave == wave) {
      print_planned(recipe);
    }
  }

  let to_build = planned.iter().filter(|r| r.action == PlanAction::Build).count();
  println!();
  print_stat("To build", &to_build.to_string());
  print_stat("Up to date", &(planned.len() - to_build).to_string());
  print_stat("Waves", &waves.to_string());

  Ok(None)
}

fn print_planned(recipe: &PlannedRecipe) {
  let (symbol, action) = match recipe.action {
    PlanAction::Build => (symbols::BUILD, "build"),
    PlanAction::Reuse => (symbols::REUSE, "up to date"),
  };
  let deps = if recipe.dependencies.is_empty() {
    String::new()
  } else {
    format!(" {} {}", symbols::ARROW, recipe.dependencies.join(", "))
  };
  println!(
    "  {} {} {} [{}] ({}){}",
    symbol,
    recipe.name,
    recipe.version,
    truncate_hash(&recipe.build_key.0),
    action,
    deps
  );
}
