//! Long-running services and per-cycle logic

pub mod cap_check;
pub mod execution;
pub mod orchestrator;
pub mod snapshot;
pub mod stats;
pub mod time_mode;

pub use cap_check::{evaluate_cap, CapCheckService, CapOutcome};
pub use execution::{ExecutionService, PlacedOrder};
pub use orchestrator::Orchestrator;
pub use snapshot::{Snapshot, SnapshotCache, SnapshotWorker};
pub use stats::{apply_night_session_reset, compute_quantile, StatsService};
pub use time_mode::TimeModeService;
