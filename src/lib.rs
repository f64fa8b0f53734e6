// Re-export modules for both binary and tests
pub mod control;
pub mod logger;
pub mod parse;
pub mod runtime;
pub mod shell;
pub mod worker;

pub use parse::ProcessSpec;
pub use runtime::{should_restart, Supervisor, SupervisorEvent};
pub use worker::{ExitKind, Worker, WorkerState};
