use crate::ExploreError;
use crate::app::{RemoteApp, Step};
use crate::dot::DotWriter;
use crate::state::State;
use crate::transition::Transition;
use sonde_snapshot::{CaptureOptions, PageStore, Snapshot, StorageKind};
use sonde_types::{ActorId, StateNum};
use sonde_wire::ActorStatus;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReductionMode {
    /// Every interleaving is explored.
    None,
    #[default]
    Dpor,
    /// Recognized, not supported.
    Udpor,
    /// DPOR with the root's actors split across workers.
    Parallel,
}

impl ReductionMode {
    pub fn reduces(self) -> bool {
        self != Self::None
    }
}

impl FromStr for ReductionMode {
    type Err = ExploreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "dpor" => Ok(Self::Dpor),
            "udpor" => Ok(Self::Udpor),
            "parallel" => Ok(Self::Parallel),
            other => Err(ExploreError::Config(format!(
                "unknown reduction mode {other:?} (expected none, dpor, udpor or parallel)"
            ))),
        }
    }
}

impl fmt::Display for ReductionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Dpor => "dpor",
            Self::Udpor => "udpor",
            Self::Parallel => "parallel",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExploreConfig {
    /// Snapshot every n-th state; 0 never does (replay from the initial state).
    pub checkpoint: u64,
    pub storage: StorageKind,
    pub reduction: ReductionMode,
    pub max_depth: usize,
    /// Bound on kept visited states; 0 disables state-equality pruning.
    pub max_visited: usize,
    pub hash: bool,
    /// Errors tolerated before the exploration fails.
    pub max_errors: u64,
    pub soft_timeout: Option<Duration>,
    pub send_determinism: bool,
    pub comms_determinism: bool,
}

impl Default for ExploreConfig {
    fn default() -> Self {
        Self {
            checkpoint: 0,
            storage: StorageKind::Dense,
            reduction: ReductionMode::Dpor,
            max_depth: 1000,
            max_visited: 0,
            hash: false,
            max_errors: 0,
            soft_timeout: None,
            send_determinism: false,
            comms_determinism: false,
        }
    }
}

impl ExploreConfig {
    pub fn validate(&self) -> Result<(), ExploreError> {
        if self.reduction == ReductionMode::Udpor {
            return Err(ExploreError::Config(
                "udpor reduction is not supported, use dpor or none".to_string(),
            ));
        }
        if self.max_depth == 0 {
            return Err(ExploreError::Config("max depth must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn checks_determinism(&self) -> bool {
        self.send_determinism || self.comms_determinism
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub expanded_states: u64,
    pub visited_states: u64,
    pub executed_transitions: u64,
    pub backtracks: u64,
    pub expanded_pairs: u64,
    pub visited_pairs: u64,
}

impl Stats {
    pub fn merge(&mut self, other: &Stats) {
        self.expanded_states += other.expanded_states;
        self.visited_states += other.visited_states;
        self.executed_transitions += other.executed_transitions;
        self.backtracks += other.backtracks;
        self.expanded_pairs += other.expanded_pairs;
        self.visited_pairs += other.visited_pairs;
    }

    pub fn log(&self) {
        if self.expanded_pairs > 0 {
            info!("Expanded pairs = {}", self.expanded_pairs);
            info!("Visited pairs = {}", self.visited_pairs);
        } else {
            info!("Expanded states = {}", self.expanded_states);
            info!("Visited states = {}", self.visited_states);
        }
        info!("Executed transitions = {}", self.executed_transitions);
        debug!(backtracks = self.backtracks, "exploration statistics");
    }
}

/// Everything one exploration shares: the application, the page store its
/// snapshots live in, the counters, and the way back to earlier states.
pub struct ExplorationContext {
    app: Box<dyn RemoteApp>,
    config: ExploreConfig,
    store: PageStore,
    pub stats: Stats,
    initial: Option<Arc<Snapshot>>,
    last_num: u64,
    dot: Option<DotWriter>,
    started: Instant,
    stop: Option<Arc<AtomicBool>>,
}

impl ExplorationContext {
    pub fn new(app: Box<dyn RemoteApp>, config: ExploreConfig) -> Self {
        Self {
            app,
            config,
            store: PageStore::new(),
            stats: Stats::default(),
            initial: None,
            last_num: 0,
            dot: None,
            started: Instant::now(),
            stop: None,
        }
    }

    pub fn set_dot(&mut self, dot: DotWriter) {
        self.dot = Some(dot);
    }

    /// Raised by another exploration to make this one stop early.
    pub fn set_stop_flag(&mut self, flag: Arc<AtomicBool>) {
        self.stop = Some(flag);
    }

    pub fn config(&self) -> &ExploreConfig {
        &self.config
    }

    pub fn app(&self) -> &dyn RemoteApp {
        self.app.as_ref()
    }

    pub fn next_num(&mut self) -> Result<StateNum, ExploreError> {
        self.last_num += 1;
        Ok(StateNum::new(self.last_num)?)
    }

    pub fn actors(&mut self) -> Result<Vec<ActorStatus>, ExploreError> {
        self.app.actors_status()
    }

    /// Root of the exploration. Its snapshot is the starting point of every replay.
    pub fn initial_state(&mut self) -> Result<State, ExploreError> {
        let num = self.next_num()?;
        let status = self.actors()?;
        let mut state = State::new(num, &status);
        let snapshot = self.snapshot(num, state.enabled_actors())?;
        self.initial = Some(snapshot.clone());
        state.set_snapshot(snapshot);
        self.stats.expanded_states += 1;
        Ok(state)
    }

    pub fn execute(&mut self, aid: ActorId, times_considered: u32) -> Result<Step, ExploreError> {
        self.stats.executed_transitions += 1;
        let step = self.app.execute(aid, times_considered)?;
        debug!(
            %aid,
            times_considered,
            transition = %step.transition,
            "executed"
        );
        Ok(step)
    }

    pub fn deadlock_check(&mut self) -> Result<bool, ExploreError> {
        self.app.deadlock_check()
    }

    pub fn should_checkpoint(&self, num: StateNum) -> bool {
        self.config.checkpoint > 0 && num.get() % self.config.checkpoint == 0
    }

    pub fn snapshot(
        &mut self,
        num: StateNum,
        enabled_actors: BTreeSet<ActorId>,
    ) -> Result<Arc<Snapshot>, ExploreError> {
        let options = CaptureOptions {
            storage: self.config.storage,
            hash: self.config.hash,
        };
        let snapshot = Snapshot::take(
            num,
            self.app.memory_mut(),
            &mut self.store,
            enabled_actors,
            options,
        )?;
        Ok(Arc::new(snapshot))
    }

    pub fn restore(&mut self, snapshot: &Snapshot) -> Result<(), ExploreError> {
        snapshot.restore(self.app.memory_mut())?;
        self.store.prune();
        Ok(())
    }

    /// Goes back to the initial state and executes `path` again.
    pub fn replay(&mut self, path: &[Transition]) -> Result<(), ExploreError> {
        let Some(initial) = self.initial.clone() else {
            return Err(ExploreError::Protocol(
                "no initial snapshot to replay from".to_string(),
            ));
        };
        self.restore(&initial)?;
        for transition in path {
            let step = self.execute(transition.aid, transition.times_considered)?;
            self.stats.visited_states += 1;
            if step.transition.aid != transition.aid {
                return Err(ExploreError::Replay(format!(
                    "actor {} ran when replaying a step of actor {}",
                    step.transition.aid, transition.aid
                )));
            }
        }
        debug!(steps = path.len(), "path replayed");
        Ok(())
    }

    /// Value of an atomic proposition: the `int` behind the symbol the
    /// application registered, or the global of that name.
    pub fn proposition(&self, name: &str) -> Result<bool, ExploreError> {
        let memory = self.app.memory();
        let address = match memory.layout().symbol(name) {
            Some(address) => address,
            None => memory.layout().resolve_global(name)?,
        };
        Ok(memory.read_i32(address)? != 0)
    }

    pub fn dot_edge(
        &mut self,
        from: StateNum,
        to: StateNum,
        transition: &Transition,
    ) -> Result<(), ExploreError> {
        match self.dot.as_mut() {
            Some(dot) => dot.edge(from, to, transition.aid, &transition.kind.to_string()),
            None => Ok(()),
        }
    }

    pub fn dot_accepting(&mut self, num: StateNum) -> Result<(), ExploreError> {
        match self.dot.as_mut() {
            Some(dot) => dot.accepting(num),
            None => Ok(()),
        }
    }

    /// The soft timeout elapsed or another exploration asked to stop.
    pub fn should_stop(&self) -> bool {
        if let Some(flag) = &self.stop
            && flag.load(Ordering::Relaxed)
        {
            return true;
        }
        self.config
            .soft_timeout
            .is_some_and(|limit| self.started.elapsed() >= limit)
    }

    /// Lets the application terminate and closes the dot output.
    pub fn finish(mut self) -> Result<Stats, ExploreError> {
        let finalized = self.app.finalize();
        if let Some(dot) = self.dot.take() {
            dot.finish()?;
        }
        finalized?;
        Ok(self.stats)
    }
}
