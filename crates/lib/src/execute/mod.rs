//! Orchestrated runs.
//!
//! The orchestrator resolves a recipe set into a plan and drives it to
//! completion:
//! - recipes are dispatched in plan order once all their dependencies succeeded
//! - independent recipes run concurrently, bounded by `parallelism`
//! - a recipe whose build key matches the manifest is reused without fetching
//! - a failure skips the recipe's transitive dependents, and stops the run
//!   unless `keep_going` is set
//!
//! Completed artifacts are yielded through the [`Run`] handle as they finish.

mod claims;
pub mod types;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::build::manifest::{BuildKey, BuildManifest, ManifestStore};
use crate::build::{BuildArtifact, Builder};
use crate::config::Config;
use crate::fetch::{FetchError, FetchedSource, Fetcher};
use crate::prefix::InstallPrefix;
use crate::recipe::{Recipe, RecipeSet, SourceRef};
use crate::resolve::{ResolvedPlan, resolve, resolve_roots};

use claims::SubpathClaims;

pub use types::{
  ExecuteError, FailureClass, PlanAction, PlannedRecipe, RecipeFailure, RunSummary, SkippedRecipe,
};

/// Drives recipe plans through fetch and build.
pub struct Orchestrator {
  config: Config,
  fetcher: Arc<Fetcher>,
}

impl Orchestrator {
  /// Create an orchestrator with the default HTTP transport.
  pub fn new(config: Config) -> Result<Self, ExecuteError> {
    let fetcher = Fetcher::new(&config.cache_dir, config.fetch.clone())?;
    Ok(Self::with_fetcher(config, Arc::new(fetcher)))
  }

  pub fn with_fetcher(config: Config, fetcher: Arc<Fetcher>) -> Self {
    Self { config, fetcher }
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn prefix(&self) -> InstallPrefix {
    InstallPrefix::new(&self.config.install_prefix)
  }

  /// Resolve the plan for `roots`, or for the whole set when `roots` is empty.
  pub fn plan<S: AsRef<str>>(&self, recipes: &RecipeSet, roots: &[S]) -> Result<ResolvedPlan, ExecuteError> {
    let plan = if roots.is_empty() {
      resolve(recipes)?
    } else {
      resolve_roots(recipes, roots)?
    };
    Ok(plan)
  }

  /// Preview a run: which recipes would be reused and which built, and the
  /// wave each one falls in.
  ///
  /// Nothing is fetched or built. Path sources are hashed to compute their keys.
  pub async fn preview<S: AsRef<str>>(
    &self,
    recipes: &RecipeSet,
    roots: &[S],
  ) -> Result<Vec<PlannedRecipe>, ExecuteError> {
    let plan = self.plan(recipes, roots)?;
    let prefix = self.prefix();
    let manifest = BuildManifest::load(&prefix.manifest_path())?;
    let waves: HashMap<&str, usize> = plan
      .waves()
      .into_iter()
      .enumerate()
      .flat_map(|(wave, names)| names.into_iter().map(move |name| (name, wave)))
      .collect();

    let mut keys: Vec<BuildKey> = Vec::with_capacity(plan.len());
    let mut planned = Vec::with_capacity(plan.len());
    for (pos, recipe) in plan.iter().enumerate() {
      let source_hash = self.fetcher.source_hash(&recipe.source).await?;
      let key = BuildKey::compute(recipe, &source_hash, dependency_keys(&plan, pos, &keys));

      let action = match manifest.get(&recipe.name) {
        Some(entry) if entry.build_key == key && entry.artifact_path.is_dir() => PlanAction::Reuse,
        _ => PlanAction::Build,
      };

      planned.push(PlannedRecipe {
        name: recipe.name.clone(),
        version: recipe.version.clone(),
        dependencies: recipe.dependencies.iter().cloned().collect(),
        build_key: key.clone(),
        action,
        wave: waves.get(recipe.name.as_str()).copied().unwrap_or(0),
      });
      keys.push(key);
    }
    Ok(planned)
  }

  /// Fetch and verify the sources of a plan without building anything.
  ///
  /// Returns one result per recipe, in plan order.
  pub async fn fetch_sources<S: AsRef<str>>(
    &self,
    recipes: &RecipeSet,
    roots: &[S],
  ) -> Result<Vec<(String, Result<FetchedSource, FetchError>)>, ExecuteError> {
    let plan = self.plan(recipes, roots)?;
    let semaphore = Arc::new(Semaphore::new(self.config.parallelism.max(1)));
    let mut join_set = JoinSet::new();

    for (pos, recipe) in plan.iter().enumerate() {
      let fetcher = self.fetcher.clone();
      let semaphore = semaphore.clone();
      let source = recipe.source.clone();
      join_set.spawn(async move {
        let _permit = semaphore.acquire_owned().await;
        (pos, fetcher.fetch(&source).await)
      });
    }

    let mut results: Vec<Option<Result<FetchedSource, FetchError>>> = (0..plan.len()).map(|_| None).collect();
    while let Some(joined) = join_set.join_next().await {
      match joined {
        Ok((pos, result)) => results[pos] = Some(result),
        Err(e) => error!(error = %e, "fetch task panicked"),
      }
    }

    Ok(
      plan
        .iter()
        .zip(results)
        .filter_map(|(recipe, result)| result.map(|r| (recipe.name.clone(), r)))
        .collect(),
    )
  }

  /// Start a run over `roots` (all recipes when empty).
  ///
  /// Validation and resolution happen before this returns; an error here means
  /// nothing was fetched or built. The install prefix stays locked until the
  /// run finishes.
  pub async fn run<S: AsRef<str>>(&self, recipes: &RecipeSet, roots: &[S]) -> Result<Run, ExecuteError> {
    let plan = Arc::new(self.plan(recipes, roots)?);
    let prefix = self.prefix();
    prefix.ensure_layout()?;
    let lock = prefix.lock("build")?;
    let manifest = Arc::new(ManifestStore::open(prefix.manifest_path())?);
    let builder = Arc::new(Builder::new(prefix, self.config.build.clone(), manifest));

    info!(
      recipes = plan.len(),
      parallelism = self.config.parallelism,
      keep_going = self.config.keep_going,
      "starting run"
    );

    let (artifacts_tx, artifacts_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let driver = Driver {
      plan: plan.clone(),
      fetcher: self.fetcher.clone(),
      builder,
      claims: Arc::new(SubpathClaims::default()),
      parallelism: self.config.parallelism.max(1),
      keep_going: self.config.keep_going,
      artifacts: artifacts_tx,
      cancel: cancel_rx,
    };

    let handle = tokio::spawn(async move {
      let summary = driver.drive().await;
      drop(lock);
      summary
    });

    Ok(Run {
      plan,
      artifacts: artifacts_rx,
      cancel: cancel_tx,
      driver: handle,
    })
  }
}

/// Handle on an in-progress run.
///
/// Artifacts are yielded in completion order. Dropping the handle cancels the
/// run: in-flight builds finish and nothing new starts.
pub struct Run {
  plan: Arc<ResolvedPlan>,
  artifacts: mpsc::UnboundedReceiver<BuildArtifact>,
  cancel: watch::Sender<bool>,
  driver: JoinHandle<RunSummary>,
}

impl Run {
  pub fn plan(&self) -> &ResolvedPlan {
    &self.plan
  }

  /// The next completed (built or reused) artifact, or `None` once the run is over.
  pub async fn next_artifact(&mut self) -> Option<BuildArtifact> {
    self.artifacts.recv().await
  }

  /// Stop dispatching new recipes. In-flight work finishes.
  pub fn cancel(&self) {
    let _ = self.cancel.send(true);
  }

  /// Wait for the run to end and return its summary.
  pub async fn finish(self) -> Result<RunSummary, ExecuteError> {
    let Run { driver, cancel, .. } = self;
    let summary = driver.await.map_err(|e| ExecuteError::Task {
      recipe: "run".to_string(),
      message: e.to_string(),
    })?;
    drop(cancel);
    Ok(summary)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
  Pending,
  Running,
  Done,
  Failed,
  Skipped,
}

struct Driver {
  plan: Arc<ResolvedPlan>,
  fetcher: Arc<Fetcher>,
  builder: Arc<Builder>,
  claims: Arc<SubpathClaims>,
  parallelism: usize,
  keep_going: bool,
  artifacts: mpsc::UnboundedSender<BuildArtifact>,
  cancel: watch::Receiver<bool>,
}

impl Driver {
  async fn drive(mut self) -> RunSummary {
    let plan = self.plan.clone();
    let count = plan.len();

    let mut summary = RunSummary {
      plan: plan.names().into_iter().map(str::to_string).collect(),
      ..Default::default()
    };
    let mut state = vec![State::Pending; count];
    let mut keys: Vec<BuildKey> = vec![BuildKey(String::new()); count];
    let mut waiting: Vec<usize> = (0..count).map(|pos| plan.dependency_positions(pos).len()).collect();
    let mut ready: BTreeSet<usize> = (0..count).filter(|&pos| waiting[pos] == 0).collect();

    let semaphore = Arc::new(Semaphore::new(self.parallelism));
    let mut join_set: JoinSet<Result<BuildArtifact, ExecuteError>> = JoinSet::new();
    let mut tasks: HashMap<tokio::task::Id, usize> = HashMap::new();
    let mut stopping = false;

    loop {
      if !stopping {
        while let Some(&pos) = ready.first() {
          let Ok(permit) = semaphore.clone().try_acquire_owned() else {
            break;
          };
          ready.pop_first();
          state[pos] = State::Running;

          let dep_keys: Vec<(String, BuildKey)> = plan
            .dependency_positions(pos)
            .iter()
            .map(|&dep| (plan.recipes()[dep].name.clone(), keys[dep].clone()))
            .collect();
          let recipe = plan.recipes()[pos].clone();
          let fetcher = self.fetcher.clone();
          let builder = self.builder.clone();
          let claims = self.claims.clone();

          debug!(recipe = %recipe.name, "dispatching recipe");
          let handle = join_set.spawn(async move {
            let _permit = permit;
            realize(&recipe, &dep_keys, &fetcher, &builder, &claims).await
          });
          tasks.insert(handle.id(), pos);
        }
      }

      if join_set.is_empty() {
        break;
      }

      tokio::select! {
        changed = self.cancel.changed(), if !stopping => {
          // A dropped handle counts as cancellation.
          if changed.is_err() || *self.cancel.borrow() {
            warn!("run cancelled, waiting for in-flight recipes");
            stopping = true;
            summary.cancelled = true;
          }
        }
        Some(joined) = join_set.join_next_with_id() => {
          let (pos, result) = match joined {
            Ok((id, result)) => (tasks.remove(&id), result),
            Err(e) => (
              tasks.remove(&e.id()),
              Err(ExecuteError::Task {
                recipe: String::new(),
                message: e.to_string(),
              }),
            ),
          };
          let Some(pos) = pos else { continue };
          let name = plan.recipes()[pos].name.clone();

          match result {
            Ok(artifact) => {
              state[pos] = State::Done;
              keys[pos] = artifact.build_key.clone();
              for &dependent in plan.dependent_positions(pos) {
                waiting[dependent] -= 1;
                if waiting[dependent] == 0 && state[dependent] == State::Pending {
                  ready.insert(dependent);
                }
              }

              let _ = self.artifacts.send(artifact.clone());
              if artifact.reused {
                summary.reused.push(artifact);
              } else {
                summary.built.push(artifact);
              }
            }
            Err(mut err) => {
              if let ExecuteError::Task { recipe, .. } = &mut err {
                *recipe = name.clone();
              }
              error!(recipe = %name, error = %err, "recipe failed");
              state[pos] = State::Failed;

              for dependent in plan.transitive_dependents(&name) {
                if let Some(dep_pos) = plan.position(dependent)
                  && state[dep_pos] == State::Pending
                {
                  warn!(recipe = %dependent, failed_dependency = %name, "skipping recipe due to failed dependency");
                  state[dep_pos] = State::Skipped;
                  ready.remove(&dep_pos);
                  summary.skipped.push(SkippedRecipe {
                    recipe: dependent.to_string(),
                    failed_dependency: name.clone(),
                  });
                }
              }

              summary.failed.push(RecipeFailure { recipe: name, error: err });
              if !self.keep_going && !stopping {
                info!("stopping run after failure");
                stopping = true;
              }
            }
          }
        }
      }
    }

    summary.not_started = (0..count)
      .filter(|&pos| state[pos] == State::Pending)
      .map(|pos| plan.recipes()[pos].name.clone())
      .collect();
    summary.skipped.sort_by_key(|s| plan.position(&s.recipe));

    info!(
      built = summary.built.len(),
      reused = summary.reused.len(),
      failed = summary.failed.len(),
      skipped = summary.skipped.len(),
      not_started = summary.not_started.len(),
      "run complete"
    );
    summary
  }
}

/// Reuse, or fetch and build, one recipe.
async fn realize(
  recipe: &Recipe,
  dep_keys: &[(String, BuildKey)],
  fetcher: &Fetcher,
  builder: &Builder,
  claims: &Arc<SubpathClaims>,
) -> Result<BuildArtifact, ExecuteError> {
  // Path sources are hashed by fetching them; URL sources are keyed by their checksum.
  let mut fetched = None;
  let source_hash = match &recipe.source {
    SourceRef::Url { checksum, .. } => checksum.to_string(),
    SourceRef::Path { .. } => {
      let source = fetcher.fetch(&recipe.source).await?;
      let hash = source.content_hash.clone();
      fetched = Some(source);
      hash
    }
  };

  let key = BuildKey::compute(
    recipe,
    &source_hash,
    dep_keys.iter().map(|(name, key)| (name.as_str(), key)),
  );

  if let Some(entry) = builder.manifest().get(&recipe.name)
    && entry.build_key == key
    && entry.artifact_path.is_dir()
  {
    info!(recipe = %recipe.name, version = %recipe.version, "reusing existing artifact");
    return Ok(BuildArtifact::reused(&entry));
  }

  let source = match fetched {
    Some(source) => source,
    None => fetcher.fetch(&recipe.source).await?,
  };

  let _claim = claims.claim(&recipe.artifact_path).await;
  info!(recipe = %recipe.name, version = %recipe.version, "building");
  Ok(builder.build(recipe, &source, &key).await?)
}

/// Keys of the direct dependencies of the recipe at `pos`, given the keys of earlier recipes.
fn dependency_keys<'a>(
  plan: &'a ResolvedPlan,
  pos: usize,
  keys: &'a [BuildKey],
) -> impl Iterator<Item = (&'a str, &'a BuildKey)> {
  plan
    .dependency_positions(pos)
    .iter()
    .map(move |&dep| (plan.recipes()[dep].name.as_str(), &keys[dep]))
}
