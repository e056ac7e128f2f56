//! Exploration of the state space of an application: the state graph, the
//! dependency relation used for reduction, and the safety, liveness and
//! communication-determinism checkers.

pub mod app;
pub mod automaton;
pub mod comm_determinism;
pub mod context;
pub mod dot;
mod error;
pub mod liveness;
pub mod parallel;
pub mod process_app;
pub mod record;
pub mod replay;
pub mod safety;
#[cfg(test)]
mod scripted;
pub mod session;
pub mod state;
pub mod transition;
pub mod visited;

pub use app::{RemoteApp, Step};
pub use automaton::Automaton;
pub use comm_determinism::CommDeterminismChecker;
pub use context::{ExplorationContext, ExploreConfig, ReductionMode, Stats};
pub use error::{ExploreError, Verdict};
pub use liveness::LivenessChecker;
pub use parallel::ParallelExplorer;
pub use process_app::ProcessApp;
pub use record::{RecordTrace, Trace};
pub use replay::Replayer;
pub use safety::SafetyChecker;
pub use session::{Outcome, Session, SessionOptions, run};
pub use state::State;
pub use transition::{Transition, depends};
