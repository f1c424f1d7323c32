//! kiln - build software components from dependency-ordered recipes

mod cmd;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use kiln_lib::{Config, ExecuteError, FailureClass, RecipeError, RecipeSet, ResolveError};

use crate::output::{OutputFormat, print_error};

/// kiln - dependency-driven software component builder
#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
struct Cli {
  #[command(flatten)]
  global: GlobalArgs,

  #[command(subcommand)]
  command: Commands,
}

/// Options shared by every subcommand.
#[derive(Args, Debug)]
pub struct GlobalArgs {
  /// Recipe file, or directory of `*.toml` recipe files
  #[arg(long, global = true, default_value = "recipes")]
  pub recipes: PathBuf,

  /// Install prefix [env: KILN_PREFIX]
  #[arg(long, global = true)]
  pub prefix: Option<PathBuf>,

  /// Source cache directory [env: KILN_CACHE_DIR]
  #[arg(long, global = true)]
  pub cache_dir: Option<PathBuf>,

  /// Maximum number of recipes fetched or built at once [env: KILN_JOBS]
  ///
  /// Recipes with overlapping artifact paths, such as all recipes left at the
  /// default `embedded`, still build one at a time.
  #[arg(short, long, global = true)]
  pub jobs: Option<usize>,

  /// Keep building independent recipes after a failure [env: KILN_KEEP_GOING]
  #[arg(long, global = true)]
  pub keep_going: bool,

  /// Retries for failed downloads
  #[arg(long, global = true)]
  pub retries: Option<u32>,

  /// Kill build steps that run longer than this (e.g. "10m")
  #[arg(long, global = true, value_parser = humantime::parse_duration)]
  pub step_timeout: Option<Duration>,

  /// Shell used to run build steps
  #[arg(long, global = true)]
  pub shell: Option<String>,

  /// Leave build working directories in place
  #[arg(long, global = true)]
  pub keep_work_dirs: bool,

  /// Increase log verbosity (-v debug, -vv trace)
  #[arg(short, long, global = true, action = clap::ArgAction::Count)]
  pub verbose: u8,

  /// Output format
  #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
  pub output: OutputFormat,
}

impl GlobalArgs {
  /// Engine configuration: defaults, then `KILN_*` variables, then flags.
  pub fn config(&self) -> Result<Config> {
    let mut config = Config::from_env().context("Invalid environment configuration")?;

    if let Some(prefix) = &self.prefix {
      config.install_prefix = prefix.clone();
    }
    if let Some(cache_dir) = &self.cache_dir {
      config.cache_dir = cache_dir.clone();
    }
    if let Some(jobs) = self.jobs {
      ensure!(jobs > 0, "--jobs must be at least 1");
      config.parallelism = jobs;
    }
    if self.keep_going {
      config.keep_going = true;
    }
    if let Some(retries) = self.retries {
      config.fetch.attempts = retries.saturating_add(1);
    }
    if let Some(timeout) = self.step_timeout {
      config.build.step_timeout = Some(timeout);
    }
    if let Some(shell) = &self.shell {
      config.build.shell = shell.clone();
    }
    if self.keep_work_dirs {
      config.build.keep_work_dirs = true;
    }

    Ok(config)
  }

  pub fn load_recipes(&self) -> Result<RecipeSet> {
    RecipeSet::load(&self.recipes).with_context(|| format!("Failed to load recipes from {}", self.recipes.display()))
  }
}

#[derive(Subcommand)]
enum Commands {
  /// Fetch, build and install recipes in dependency order
  Build {
    /// Recipes to build along with their dependencies (default: all)
    roots: Vec<String>,
  },

  /// Show the build order and which recipes would be rebuilt
  Plan {
    /// Recipes to plan along with their dependencies (default: all)
    roots: Vec<String>,
  },

  /// Download and verify sources without building
  Fetch {
    /// Recipes to fetch along with their dependencies (default: all)
    roots: Vec<String>,
  },

  /// List the components installed in the prefix
  Status,
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  init_tracing(cli.global.verbose);

  let result = match &cli.command {
    Commands::Build { roots } => cmd::cmd_build(&cli.global, roots),
    Commands::Plan { roots } => cmd::cmd_plan(&cli.global, roots),
    Commands::Fetch { roots } => cmd::cmd_fetch(&cli.global, roots),
    Commands::Status => cmd::cmd_status(&cli.global),
  };

  match result {
    Ok(None) => ExitCode::SUCCESS,
    Ok(Some(class)) => exit_code(class),
    Err(err) => {
      print_error(&format!("{err:#}"));
      exit_code(error_class(&err))
    }
  }
}

/// Logs go to stderr. `RUST_LOG` applies unless `-v` is given.
fn init_tracing(verbose: u8) {
  let filter = match verbose {
    0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    1 => EnvFilter::new("debug"),
    _ => EnvFilter::new("trace"),
  };

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();
}

fn exit_code(class: FailureClass) -> ExitCode {
  ExitCode::from(match class {
    FailureClass::Recipe => 2,
    FailureClass::Fetch => 3,
    FailureClass::Build => 4,
    FailureClass::Other => 1,
  })
}

fn error_class(err: &anyhow::Error) -> FailureClass {
  if let Some(err) = err.downcast_ref::<ExecuteError>() {
    return err.class();
  }
  if err.downcast_ref::<RecipeError>().is_some() || err.downcast_ref::<ResolveError>().is_some() {
    return FailureClass::Recipe;
  }
  FailureClass::Other
}
