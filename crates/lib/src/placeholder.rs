//! Placeholder parsing and substitution for recipe templates.
//!
//! Recipe URLs, working directories, environment values and build steps may
//! reference values that are only known when a build runs, such as the install
//! prefix. This module handles parsing those templates and substituting values.
//!
//! # Placeholder Format
//!
//! `#{name}` where `name` is made of ASCII letters, digits and underscores.
//!
//! # Shell Syntax
//!
//! A `#` that is not followed by `{` passes through unchanged, so shell comments
//! and `$VAR`/`${VAR}` expansions work without escaping.
//!
//! # Escaping
//!
//! Use `##{` to produce a literal `#{`.
//!
//! # Example
//!
//! ```
//! use kiln_lib::placeholder::{parse, Segment};
//!
//! let segments = parse("#{install_dir}/embedded/bin:$PATH").unwrap();
//! assert_eq!(segments, vec![
//!     Segment::Variable("install_dir".to_string()),
//!     Segment::Literal("/embedded/bin:$PATH".to_string()),
//! ]);
//! ```

use std::collections::BTreeMap;

use thiserror::Error;

/// A segment of parsed text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
  /// Literal text (no placeholders)
  Literal(String),

  /// A variable to be resolved
  Variable(String),
}

/// Errors that can occur during placeholder parsing or resolution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaceholderError {
  #[error("unclosed placeholder at position {0}")]
  Unclosed(usize),

  #[error("malformed placeholder name '{0}'")]
  Malformed(String),

  #[error("unknown variable '{0}'")]
  Unknown(String),
}

/// Resolves variable names to values during substitution.
pub trait Resolver {
  fn resolve_var(&self, name: &str) -> Result<&str, PlaceholderError>;
}

/// A resolver backed by an ordered map of variable values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variables(BTreeMap<String, String>);

impl Variables {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
    self.0.insert(name.into(), value.into());
    self
  }

  pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.set(name, value);
    self
  }

  pub fn get(&self, name: &str) -> Option<&str> {
    self.0.get(name).map(String::as_str)
  }
}

impl Resolver for Variables {
  fn resolve_var(&self, name: &str) -> Result<&str, PlaceholderError> {
    self.get(name).ok_or_else(|| PlaceholderError::Unknown(name.to_string()))
  }
}

/// Parse a template into literal and variable segments.
///
/// # Errors
///
/// Returns an error if a placeholder is unclosed or its name contains characters
/// other than ASCII alphanumerics and underscores.
pub fn parse(input: &str) -> Result<Vec<Segment>, PlaceholderError> {
  let mut segments = Vec::new();
  let mut literal = String::new();
  let mut chars = input.char_indices().peekable();

  while let Some((pos, ch)) = chars.next() {
    if ch != '#' {
      literal.push(ch);
      continue;
    }

    match chars.peek() {
      Some((_, '#')) => {
        chars.next();
        if let Some((_, '{')) = chars.peek() {
          // ##{ -> literal #{
          chars.next();
          literal.push_str("#{");
        } else {
          literal.push_str("##");
        }
      }
      Some((_, '{')) => {
        chars.next();

        let mut name = String::new();
        let mut found_close = false;
        for (_, c) in chars.by_ref() {
          if c == '}' {
            found_close = true;
            break;
          }
          name.push(c);
        }

        if !found_close {
          return Err(PlaceholderError::Unclosed(pos));
        }
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
          return Err(PlaceholderError::Malformed(name));
        }

        if !literal.is_empty() {
          segments.push(Segment::Literal(std::mem::take(&mut literal)));
        }
        segments.push(Segment::Variable(name));
      }
      _ => literal.push('#'),
    }
  }

  if !literal.is_empty() {
    segments.push(Segment::Literal(literal));
  }

  Ok(segments)
}

/// Names of all variables referenced by a template, in order of first appearance.
pub fn variables_in(input: &str) -> Result<Vec<String>, PlaceholderError> {
  let mut names: Vec<String> = Vec::new();
  for segment in parse(input)? {
    if let Segment::Variable(name) = segment
      && !names.contains(&name)
    {
      names.push(name);
    }
  }
  Ok(names)
}

/// Substitute all placeholders in a template using the provided resolver.
pub fn substitute(input: &str, resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  let mut result = String::with_capacity(input.len());
  for segment in parse(input)? {
    match segment {
      Segment::Literal(text) => result.push_str(&text),
      Segment::Variable(name) => result.push_str(resolver.resolve_var(&name)?),
    }
  }
  Ok(result)
}
