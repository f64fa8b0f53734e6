#[allow(clippy::module_inception)]
mod parse;
mod process;

pub use parse::{parser, LoggingConfig, SupervisorConfig, DEFAULT_CONFIG_PATH};
pub use process::ProcessSpec;
