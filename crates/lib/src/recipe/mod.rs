//! Recipe model, loading and validation.
//!
//! Recipes are plain immutable values: they are validated once when loaded and
//! carry no behavior of their own.

mod load;
mod types;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use tracing::info;

pub use load::{load_file, load_str};
pub use types::{
  BUILD_VARIABLES, Checksum, DEFAULT_ARTIFACT_PATH, LOAD_VARIABLES, Recipe, RecipeError, SourceRef,
};

/// A validated collection of recipes with unique names.
#[derive(Debug, Clone, Default)]
pub struct RecipeSet {
  recipes: BTreeMap<String, Recipe>,
}

impl RecipeSet {
  /// Build a set from recipes tagged with the place they were loaded from.
  ///
  /// # Errors
  ///
  /// Returns `DuplicateRecipe` when two recipes share a name.
  pub fn from_loaded(loaded: impl IntoIterator<Item = (Recipe, String)>) -> Result<Self, RecipeError> {
    let mut recipes = BTreeMap::new();
    let mut origins: BTreeMap<String, String> = BTreeMap::new();

    for (recipe, origin) in loaded {
      if let Some(first) = origins.get(&recipe.name) {
        return Err(RecipeError::DuplicateRecipe {
          name: recipe.name,
          first: first.clone(),
          second: origin,
        });
      }
      origins.insert(recipe.name.clone(), origin);
      recipes.insert(recipe.name.clone(), recipe);
    }

    Ok(Self { recipes })
  }

  /// Build a set from recipes that share one origin.
  pub fn from_recipes(recipes: impl IntoIterator<Item = Recipe>, origin: &str) -> Result<Self, RecipeError> {
    Self::from_loaded(recipes.into_iter().map(|r| (r, origin.to_string())))
  }

  /// Load a recipe file, or every `*.toml` file in a directory.
  pub fn load(path: &Path) -> Result<Self, RecipeError> {
    let files = if path.is_dir() {
      load::recipe_files(path)?
    } else {
      vec![path.to_path_buf()]
    };

    let mut loaded = Vec::new();
    for file in &files {
      let origin = file.display().to_string();
      loaded.extend(load_file(file)?.into_iter().map(|r| (r, origin.clone())));
    }

    let set = Self::from_loaded(loaded)?;
    info!(path = %path.display(), files = files.len(), recipes = set.len(), "loaded recipes");
    Ok(set)
  }

  pub fn get(&self, name: &str) -> Option<&Recipe> {
    self.recipes.get(name)
  }

  pub fn contains(&self, name: &str) -> bool {
    self.recipes.contains_key(name)
  }

  pub fn len(&self) -> usize {
    self.recipes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.recipes.is_empty()
  }

  /// Recipes in name order.
  pub fn iter(&self) -> impl Iterator<Item = &Recipe> {
    self.recipes.values()
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.recipes.keys().map(String::as_str)
  }

  /// The named roots plus everything they transitively depend on.
  ///
  /// Dependencies that name no known recipe are left out; resolution reports them.
  ///
  /// # Errors
  ///
  /// Returns `UnknownRecipe` when a root is not in the set.
  pub fn closure<S: AsRef<str>>(&self, roots: &[S]) -> Result<RecipeSet, RecipeError> {
    let mut selected: BTreeSet<&str> = BTreeSet::new();
    let mut stack: Vec<&str> = Vec::new();

    for root in roots {
      let root = root.as_ref();
      let (name, _) = self
        .recipes
        .get_key_value(root)
        .ok_or_else(|| RecipeError::UnknownRecipe(root.to_string()))?;
      stack.push(name.as_str());
    }

    while let Some(name) = stack.pop() {
      if !selected.insert(name) {
        continue;
      }
      if let Some(recipe) = self.recipes.get(name) {
        for dep in &recipe.dependencies {
          if let Some((dep_name, _)) = self.recipes.get_key_value(dep) {
            stack.push(dep_name.as_str());
          }
        }
      }
    }

    let recipes = selected
      .into_iter()
      .filter_map(|name| self.recipes.get(name).map(|r| (name.to_string(), r.clone())))
      .collect();

    Ok(RecipeSet { recipes })
  }
}

impl FromIterator<Recipe> for RecipeSet {
  /// Collects recipes, keeping the last definition of a repeated name.
  ///
  /// Use [`RecipeSet::from_recipes`] when duplicates must be rejected.
  fn from_iter<T: IntoIterator<Item = Recipe>>(iter: T) -> Self {
    Self {
      recipes: iter.into_iter().map(|r| (r.name.clone(), r)).collect(),
    }
  }
}
