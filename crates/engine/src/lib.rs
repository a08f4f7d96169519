pub mod controller;
pub mod error;
pub mod executor;
pub mod ladder;
pub mod replay;
pub mod runner;
pub mod schedule;
pub mod state_store;
pub mod watchers;

#[cfg(test)]
pub(crate) mod testkit;

pub use controller::{ControllerConfig, LadderController, PollOutcome, RecoveryOutcome};
pub use error::EngineError;
pub use executor::{OrderExecutor, Placement, UnwindReport};
pub use ladder::{HedgeDistance, Ladder, LadderConfig, LadderState, Phase, RungPlan, RungTag};
pub use replay::{run_replay, ReplayConfig, ReplaySummary};
pub use runner::{RunSummary, Runner, RunnerConfig};
pub use schedule::{seconds_to_next_candle, CandleClock};
pub use state_store::{LadderSnapshot, StateStore};
pub use watchers::{HaltFlag, WatcherConfig};
