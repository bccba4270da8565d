//! Run summaries, their on-disk history and exit codes

mod failure;
mod history;
mod run_summary;

pub use failure::ExitCode;
pub use history::{HistoryLoad, RunHistory};
pub use run_summary::{RunSummary, WorkflowTally};
