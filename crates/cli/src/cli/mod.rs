pub mod commands;

pub use commands::{CacheArgs, CliArgs, Commands, PlanArgs, PublishArgs};
