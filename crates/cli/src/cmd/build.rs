//! Implementation of the `kiln build` command.
//!
//! Runs the orchestrator over the selected recipes, reporting each artifact as
//! it completes and a summary of failures at the end.

use anyhow::{Context, Result};
use serde_json::json;

use kiln_lib::build::BuildError;
use kiln_lib::{BuildArtifact, ExecuteError, FailureClass, Orchestrator, RunSummary};

use crate::GlobalArgs;
use crate::output::{
  format_duration, print_captured, print_error, print_info, print_json, print_stat, print_success, print_warning,
  symbols, truncate_hash,
};

pub fn cmd_build(args: &GlobalArgs, roots: &[String]) -> Result<Option<FailureClass>> {
  let recipes = args.load_recipes()?;
  let config = args.config()?;
  let json = args.output.is_json();
  let orchestrator = Orchestrator::new(config)?;

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let summary = rt.block_on(async {
    let mut run = orchestrator.run(&recipes, roots).await?;
    if !json {
      print_info(&format!(
        "Building {} recipe(s) into {}",
        run.plan().len(),
        orchestrator.config().install_prefix.display()
      ));
    }

    let mut interrupted = false;
    loop {
      tokio::select! {
        artifact = run.next_artifact() => match artifact {
          Some(artifact) if !json => print_artifact(&artifact),
          Some(_) => {}
          None => break,
        },
        _ = tokio::signal::ctrl_c(), if !interrupted => {
          interrupted = true;
          print_warning("Interrupted, waiting for running builds to finish");
          run.cancel();
        }
      }
    }

    run.finish().await
  })?;

  if json {
    print_json(&summary_json(&summary))?;
  } else {
    print_summary(&summary);
  }

  Ok(summary.failure_class())
}

fn print_artifact(artifact: &BuildArtifact) {
  if artifact.reused {
    println!("  {} {} {} (up to date)", symbols::REUSE, artifact.name, artifact.version);
  } else {
    print_success(&format!(
      "{} {} built in {}",
      artifact.name,
      artifact.version,
      format_duration(artifact.duration)
    ));
  }
}

fn print_summary(summary: &RunSummary) {
  for failure in &summary.failed {
    print_error(&format!("{} failed: {}", failure.recipe, failure.error));
    if let ExecuteError::Build(err) = &failure.error
      && let Some(output) = err.captured_output()
      && !output.is_empty()
    {
      print_captured(output);
    }
  }
  for skipped in &summary.skipped {
    print_warning(&format!(
      "{} skipped: dependency {} failed",
      skipped.recipe, skipped.failed_dependency
    ));
  }
  if summary.cancelled {
    print_warning("Run cancelled");
  }

  println!();
  print_stat("Built", &summary.built.len().to_string());
  print_stat("Up to date", &summary.reused.len().to_string());
  if !summary.failed.is_empty() {
    print_stat("Failed", &summary.failed.len().to_string());
  }
  if !summary.skipped.is_empty() {
    print_stat("Skipped", &summary.skipped.len().to_string());
  }
  if !summary.not_started.is_empty() {
    print_stat("Not started", &summary.not_started.join(", "));
  }

  if summary.is_success() {
    print_success("Build complete");
  }
}

fn summary_json(summary: &RunSummary) -> serde_json::Value {
  let failed: Vec<_> = summary
    .failed
    .iter()
    .map(|failure| {
      let build = match &failure.error {
        ExecuteError::Build(err) => Some(err),
        _ => None,
      };
      json!({
        "recipe": failure.recipe,
        "class": failure.error.class(),
        "error": failure.error.to_string(),
        "step_index": build.and_then(BuildError::step_index),
        "captured_output": build.and_then(BuildError::captured_output),
      })
    })
    .collect();

  let artifact = |a: &BuildArtifact| {
    json!({
      "name": a.name,
      "version": a.version,
      "path": a.path,
      "build_key": truncate_hash(&a.build_key.0),
      "duration_ms": a.duration.as_millis() as u64,
    })
  };

  json!({
    "success": summary.is_success(),
    "plan": summary.plan,
    "built": summary.built.iter().map(artifact).collect::<Vec<_>>(),
    "reused": summary.reused.iter().map(artifact).collect::<Vec<_>>(),
    "failed": failed,
    "skipped": summary.skipped,
    "not_started": summary.not_started,
    "cancelled": summary.cancelled,
  })
}
