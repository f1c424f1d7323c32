mod common;

#[cfg(unix)]
mod build_tests;
#[cfg(unix)]
mod fetch_tests;
#[cfg(unix)]
mod plan_tests;
#[cfg(unix)]
mod status_tests;
