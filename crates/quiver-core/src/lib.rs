#![deny(clippy::all, warnings)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

mod config;
mod effects;
mod error;
mod extractor;
mod orchestrator;
mod outcome;
mod process;
mod registry;
mod store;
#[cfg(test)]
pub(crate) mod test_effects;

pub use config::{Paths, Timeouts};
pub use effects::{
    Effects, EntryPointExecutor, IsolationProvider, PackageInstaller, RuntimeHandle,
    SharedEffects, SystemEffects,
};
pub use error::CoreError;
pub use extractor::extract;
pub use orchestrator::Orchestrator;
pub use outcome::{CommandStatus, ExecutionOutcome};
pub use process::{run_command, run_command_passthrough, CommandTimeout, RunOutput};
pub use registry::{Registry, DEFAULT_KIT};
pub use store::{EnsureMode, EnvStatus, EnvironmentRecord, EnvironmentStore};
