use crate::record::Trace;
use sonde_remote::RemoteError;
use sonde_snapshot::SnapshotError;
use sonde_types::{ExitStatus, InvariantError};
use sonde_wire::WireError;
use std::error::Error;
use std::fmt;
use std::io;
use tracing::info;

/// Failure of the checker itself. Ends the run with ERROR, or with
/// PROGRAM_CRASH when the application is gone.
#[derive(Debug)]
pub enum ExploreError {
    Wire(WireError),
    Remote(RemoteError),
    Snapshot(SnapshotError),
    Invariant(InvariantError),
    /// The application answered something the protocol does not allow here.
    Protocol(String),
    Config(String),
    Property {
        path: String,
        reason: String,
    },
    Replay(String),
    Io {
        context: &'static str,
        source: io::Error,
    },
}

impl ExploreError {
    /// True when the failure means the application died.
    pub fn is_process_death(&self) -> bool {
        match self {
            Self::Remote(e) => e.is_process_death(),
            Self::Snapshot(e) => e.is_process_death(),
            Self::Wire(WireError::Closed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ExploreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wire(e) => write!(f, "control channel: {e}"),
            Self::Remote(e) => write!(f, "application: {e}"),
            Self::Snapshot(e) => write!(f, "snapshot: {e}"),
            Self::Invariant(e) => write!(f, "{e}"),
            Self::Protocol(reason) => write!(f, "protocol violation: {reason}"),
            Self::Config(reason) => write!(f, "invalid configuration: {reason}"),
            Self::Property { path, reason } => write!(f, "property file {path}: {reason}"),
            Self::Replay(reason) => write!(f, "replay: {reason}"),
            Self::Io { context, source } => write!(f, "{context}: {source}"),
        }
    }
}

impl Error for ExploreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Wire(e) => Some(e),
            Self::Remote(e) => Some(e),
            Self::Snapshot(e) => Some(e),
            Self::Invariant(e) => Some(e),
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<WireError> for ExploreError {
    fn from(e: WireError) -> Self {
        Self::Wire(e)
    }
}

impl From<RemoteError> for ExploreError {
    fn from(e: RemoteError) -> Self {
        Self::Remote(e)
    }
}

impl From<SnapshotError> for ExploreError {
    fn from(e: SnapshotError) -> Self {
        Self::Snapshot(e)
    }
}

impl From<InvariantError> for ExploreError {
    fn from(e: InvariantError) -> Self {
        Self::Invariant(e)
    }
}

/// Property violation found by an exploration. Ends the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// An assertion of the application failed.
    Safety { trace: Trace },
    Deadlock { trace: Trace },
    /// Acceptance cycle of the property automaton.
    Liveness { trace: Trace },
    NonDeterminism {
        send: Option<String>,
        recv: Option<String>,
        trace: Trace,
    },
    ProgramCrash { reason: String, trace: Trace },
    DataRace { trace: Trace },
}

impl Verdict {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Self::Safety { .. } | Self::Liveness { .. } => ExitStatus::Safety,
            Self::Deadlock { .. } => ExitStatus::Deadlock,
            Self::NonDeterminism { .. } => ExitStatus::NonDeterminism,
            Self::ProgramCrash { .. } => ExitStatus::ProgramCrash,
            Self::DataRace { .. } => ExitStatus::DataRace,
        }
    }

    pub fn trace(&self) -> &Trace {
        match self {
            Self::Safety { trace }
            | Self::Deadlock { trace }
            | Self::Liveness { trace }
            | Self::NonDeterminism { trace, .. }
            | Self::ProgramCrash { trace, .. }
            | Self::DataRace { trace } => trace,
        }
    }

    /// Logs the banner of the violation and its counter-example.
    pub fn log(&self) {
        match self {
            Self::Safety { .. } => {
                info!("**************************");
                info!("*** PROPERTY NOT VALID ***");
                info!("**************************");
            }
            Self::Deadlock { .. } => {
                info!("**************************");
                info!("*** DEADLOCK DETECTED ***");
                info!("**************************");
            }
            Self::Liveness { trace } => {
                info!("*-*-*-*-*-*-*-*-*-*-*-*-*-*-*-*-*-*-*-*-*-*");
                info!("|             ACCEPTANCE CYCLE            |");
                info!("*-*-*-*-*-*-*-*-*-*-*-*-*-*-*-*-*-*-*-*-*-*");
                info!("Counter-example that violates formula (depth {}):", trace.len());
            }
            Self::NonDeterminism { send, recv, .. } => {
                let kind = if recv.is_some() && send.is_some() {
                    "Non-deterministic"
                } else {
                    "Non-send-deterministic"
                };
                info!("*********************************************************");
                info!("***** {kind} communications pattern *****");
                info!("*********************************************************");
                for diff in [send, recv].into_iter().flatten() {
                    info!("{diff}");
                }
            }
            Self::ProgramCrash { reason, .. } => {
                info!("**************************");
                info!("** PROGRAM CRASH **");
                info!("**************************");
                info!("{reason}");
            }
            Self::DataRace { .. } => {
                info!("**************************");
                info!("*** DATA RACE DETECTED ***");
                info!("**************************");
            }
        }
        self.trace().log();
    }

    /// Verdict for an application that died while being explored.
    pub fn crash(error: &ExploreError, trace: Trace) -> Self {
        Self::ProgramCrash {
            reason: error.to_string(),
            trace,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Safety { .. } => f.write_str("assertion failure"),
            Self::Deadlock { .. } => f.write_str("deadlock"),
            Self::Liveness { .. } => f.write_str("acceptance cycle"),
            Self::NonDeterminism { .. } => f.write_str("non-deterministic communications"),
            Self::ProgramCrash { reason, .. } => write!(f, "program crash: {reason}"),
            Self::DataRace { .. } => f.write_str("data race"),
        }
    }
}
