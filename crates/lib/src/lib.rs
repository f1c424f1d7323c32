//! kiln-lib: a dependency-driven software component builder
//!
//! This crate provides the engine behind the `kiln` CLI:
//! - `Recipe`: an immutable description of one component (source, dependencies, build steps)
//! - `Fetcher`: verified, cached retrieval of recipe sources
//! - `resolve`: dependency ordering of a recipe set into a `ResolvedPlan`
//! - `Builder`: unpacking a source and running its build steps into an install prefix
//! - `Orchestrator`: driving a plan with reuse, concurrency and failure policy

pub mod build;
pub mod config;
pub mod consts;
pub mod execute;
pub mod fetch;
pub mod placeholder;
pub mod prefix;
pub mod recipe;
pub mod resolve;
pub mod util;

pub use build::{BuildArtifact, BuildConfig, BuildError, Builder};
pub use config::Config;
pub use execute::{ExecuteError, FailureClass, Orchestrator, Run, RunSummary};
pub use fetch::{FetchConfig, FetchError, FetchedSource, Fetcher};
pub use prefix::InstallPrefix;
pub use recipe::{Recipe, RecipeError, RecipeSet, SourceRef};
pub use resolve::{ResolveError, ResolvedPlan, resolve, resolve_roots};
