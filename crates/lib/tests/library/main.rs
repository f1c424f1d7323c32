//! Library integration tests.

mod common;
mod recipe_tests;
#[cfg(unix)]
mod run_tests;
