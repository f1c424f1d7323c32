mod build;
mod fetch;
mod plan;
mod status;

pub use build::cmd_build;
pub use fetch::cmd_fetch;
pub use plan::cmd_plan;
pub use status::cmd_status;
