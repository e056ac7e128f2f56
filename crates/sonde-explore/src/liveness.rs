//! Nested depth-first search for acceptance cycles of the product of the
//! application with a Büchi automaton.

use crate::automaton::Automaton;
use crate::context::ExplorationContext;
use crate::record::Trace;
use crate::state::State;
use crate::transition::Transition;
use crate::{ExploreError, Verdict};
use sonde_snapshot::{Snapshot, snapshot_equal};
use sonde_types::StateNum;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Node of the product: an application state and an automaton state.
struct Pair {
    num: StateNum,
    automaton_state: usize,
    propositions: Vec<bool>,
    state: State,
    depth: usize,
    search_cycle: bool,
    /// Actors left to execute from this pair.
    requests: usize,
    exploration_started: bool,
}

struct VisitedPair {
    num: StateNum,
    other_num: Option<StateNum>,
    automaton_state: usize,
    propositions: Vec<bool>,
    snapshot: Arc<Snapshot>,
    actor_count: usize,
    heap_bytes_used: u64,
}

impl VisitedPair {
    fn key(&self) -> (usize, u64) {
        (self.actor_count, self.heap_bytes_used)
    }

    fn same_as(&self, other: &VisitedPair) -> Result<bool, ExploreError> {
        Ok(self.automaton_state == other.automaton_state
            && self.propositions == other.propositions
            && snapshot_equal(&self.snapshot, &other.snapshot)?)
    }
}

/// Sorted by actor count then heap usage; equal keys are compared in full.
#[derive(Default)]
struct PairSet(Vec<VisitedPair>);

impl PairSet {
    fn range(&self, key: (usize, u64)) -> std::ops::Range<usize> {
        let lo = self.0.partition_point(|p| p.key() < key);
        let hi = self.0.partition_point(|p| p.key() <= key);
        lo..hi
    }
}

pub struct LivenessChecker<'a> {
    ctx: &'a mut ExplorationContext,
    automaton: Automaton,
    stack: Vec<Pair>,
    acceptance: PairSet,
    visited: PairSet,
}

impl<'a> LivenessChecker<'a> {
    pub fn new(ctx: &'a mut ExplorationContext, automaton: Automaton) -> Self {
        Self {
            ctx,
            automaton,
            stack: Vec::new(),
            acceptance: PairSet::default(),
            visited: PairSet::default(),
        }
    }

    pub fn run(&mut self) -> Result<Option<Verdict>, ExploreError> {
        match self.explore() {
            Err(e) if e.is_process_death() => {
                let verdict = Verdict::crash(&e, self.trace());
                verdict.log();
                Ok(Some(verdict))
            }
            other => other,
        }
    }

    fn trace(&self) -> Trace {
        Trace::new(
            self.stack
                .iter()
                .filter(|p| p.exploration_started)
                .filter_map(|p| p.state.transition().cloned())
                .collect(),
        )
    }

    fn propositions(&self) -> Result<Vec<bool>, ExploreError> {
        self.automaton
            .propositions
            .iter()
            .map(|name| self.ctx.proposition(name))
            .collect()
    }

    fn explore(&mut self) -> Result<Option<Verdict>, ExploreError> {
        info!(
            states = self.automaton.states.len(),
            propositions = self.automaton.propositions.len(),
            "Check the liveness property"
        );
        let max_depth = self.ctx.config().max_depth;
        let mut root = self.ctx.initial_state()?;
        root.mark_enabled_todo(false);
        let propositions = self.propositions()?;
        let initial: Vec<usize> = self.automaton.initial_states().collect();
        for (i, automaton_state) in initial.into_iter().enumerate() {
            let num = if i == 0 { root.num() } else { self.ctx.next_num()? };
            let pair = self.new_pair(num, None, automaton_state, propositions.clone(), root.clone())?;
            self.stack.push(pair);
        }

        while let Some(current) = self.stack.last() {
            if self.ctx.should_stop() {
                info!("exploration stopped before its end");
                return Ok(None);
            }
            debug!(
                depth = current.depth,
                search_cycle = current.search_cycle,
                num = %current.num,
                requests = current.requests,
                "pair"
            );
            if current.requests == 0 {
                self.backtrack()?;
                continue;
            }
            if current.depth > max_depth {
                warn!(depth = current.depth, "/!\\ Max depth reached ! /!\\");
                self.abandon_top()?;
                continue;
            }

            if !current.exploration_started {
                let accepting = self.automaton.states[current.automaton_state].accepting;
                if accepting && self.closes_cycle()? {
                    let verdict = Verdict::Liveness {
                        trace: self.trace(),
                    };
                    verdict.log();
                    return Ok(Some(verdict));
                }
                if let Some(equal) = self.insert_visited_pair()? {
                    debug!(%equal, "pair already visited, exploration stopped on this path");
                    self.abandon_top()?;
                    continue;
                }
            }

            let Some(current) = self.stack.last_mut() else {
                break;
            };
            let Some((aid, times_considered)) = current.state.next_todo() else {
                current.requests = 0;
                continue;
            };
            if !current.exploration_started {
                self.ctx.stats.visited_pairs += 1;
            }
            let step = self.ctx.execute(aid, times_considered)?;
            let Some(current) = self.stack.last_mut() else {
                break;
            };
            current.requests = current.requests.saturating_sub(1);
            current.exploration_started = true;
            current.state.set_transition(step.transition.clone());
            if step.assertion_failed {
                let verdict = Verdict::Safety {
                    trace: self.trace(),
                };
                verdict.log();
                return Ok(Some(verdict));
            }
            self.push_successors(&step.transition)?;
        }

        info!("No property violation found.");
        Ok(None)
    }

    /// One child pair per automaton transition whose label holds after the
    /// step. Pushed in reverse so the first transition is explored first.
    fn push_successors(&mut self, incoming: &Transition) -> Result<(), ExploreError> {
        let propositions = self.propositions()?;
        let status = self.ctx.actors()?;
        let Some(current) = self.stack.last() else {
            return Ok(());
        };
        let (from, automaton_state, depth, search_cycle) = (
            current.num,
            current.automaton_state,
            current.depth,
            current.search_cycle,
        );
        let edges = self.automaton.states[automaton_state].out.clone();
        for edge in edges.iter().rev() {
            if !edge.label.eval(&propositions) {
                continue;
            }
            let num = self.ctx.next_num()?;
            let mut state = State::new(num, &status);
            state.mark_enabled_todo(false);
            let pair = self.new_pair(
                num,
                Some((depth, search_cycle)),
                edge.dst,
                propositions.clone(),
                state,
            )?;
            self.ctx.dot_edge(from, num, incoming)?;
            self.stack.push(pair);
        }
        Ok(())
    }

    fn new_pair(
        &mut self,
        num: StateNum,
        parent: Option<(usize, bool)>,
        automaton_state: usize,
        propositions: Vec<bool>,
        mut state: State,
    ) -> Result<Pair, ExploreError> {
        self.ctx.stats.expanded_pairs += 1;
        if state.snapshot().is_none() && self.ctx.should_checkpoint(num) {
            let snapshot = self.ctx.snapshot(num, state.enabled_actors())?;
            state.set_snapshot(snapshot);
        }
        let accepting = self.automaton.states[automaton_state].accepting;
        if accepting {
            self.ctx.dot_accepting(num)?;
        }
        Ok(Pair {
            num,
            automaton_state,
            propositions,
            requests: state.todo_count(),
            depth: parent.map_or(1, |(depth, _)| depth + 1),
            search_cycle: accepting || parent.is_some_and(|(_, search)| search),
            state,
            exploration_started: false,
        })
    }

    /// Visited-pair record of the pair on top of the stack, snapshotting it if needed.
    fn visited_pair(&mut self) -> Result<Option<VisitedPair>, ExploreError> {
        let Some(current) = self.stack.last() else {
            return Ok(None);
        };
        let snapshot = match current.state.snapshot() {
            Some(snapshot) => snapshot.clone(),
            None => {
                let (num, enabled) = (current.num, current.state.enabled_actors());
                let snapshot = self.ctx.snapshot(num, enabled)?;
                if let Some(current) = self.stack.last_mut() {
                    current.state.set_snapshot(snapshot.clone());
                }
                snapshot
            }
        };
        let Some(current) = self.stack.last() else {
            return Ok(None);
        };
        Ok(Some(VisitedPair {
            num: current.num,
            other_num: None,
            automaton_state: current.automaton_state,
            propositions: current.propositions.clone(),
            heap_bytes_used: snapshot.heap_bytes_used(),
            snapshot,
            actor_count: current.state.actors().len(),
        }))
    }

    /// Records the accepting pair on top of the stack. When it is reached
    /// again during a cycle search it is popped instead, and the cycle is closed.
    fn closes_cycle(&mut self) -> Result<bool, ExploreError> {
        let Some(pair) = self.visited_pair()? else {
            return Ok(false);
        };
        let search_cycle = self.stack.last().is_some_and(|p| p.search_cycle);
        let range = self.acceptance.range(pair.key());
        if search_cycle {
            for other in &self.acceptance.0[range.clone()] {
                if !other.same_as(&pair)? {
                    continue;
                }
                info!(num = %pair.num, equal = %other.num, "Pair already reached !");
                let equal = other.num;
                self.stack.pop();
                if let Some(parent) = self.stack.last()
                    && let Some(transition) = parent.state.transition().cloned()
                {
                    let from = parent.num;
                    self.ctx.dot_edge(from, equal, &transition)?;
                }
                return Ok(true);
            }
        }
        self.acceptance.0.insert(range.start, pair);
        Ok(false)
    }

    fn remove_acceptance_pair(&mut self, num: StateNum) {
        if let Some(i) = self.acceptance.0.iter().position(|p| p.num == num) {
            self.acceptance.0.remove(i);
        }
    }

    /// Returns the number of an equal visited pair, if any.
    fn insert_visited_pair(&mut self) -> Result<Option<StateNum>, ExploreError> {
        let max_visited = self.ctx.config().max_visited;
        if max_visited == 0 {
            return Ok(None);
        }
        let Some(mut pair) = self.visited_pair()? else {
            return Ok(None);
        };
        let range = self.visited.range(pair.key());
        for i in range.clone() {
            let other = &self.visited.0[i];
            if !other.same_as(&pair)? {
                continue;
            }
            let original = other.other_num.unwrap_or(other.num);
            debug!(num = %pair.num, equal = %other.num, "pair already visited");
            pair.other_num = Some(original);
            self.visited.0[i] = pair;
            return Ok(Some(original));
        }
        self.visited.0.insert(range.start, pair);
        if self.visited.0.len() > max_visited
            && let Some((oldest, _)) = self.visited.0.iter().enumerate().min_by_key(|(_, p)| p.num)
        {
            self.visited.0.remove(oldest);
        }
        Ok(None)
    }

    /// Stops exploring from the pair on top of the stack.
    fn abandon_top(&mut self) -> Result<(), ExploreError> {
        if let Some(current) = self.stack.last_mut() {
            current.requests = 0;
        }
        self.backtrack()
    }

    fn backtrack(&mut self) -> Result<(), ExploreError> {
        self.ctx.stats.backtracks += 1;
        while let Some(pair) = self.stack.pop() {
            if pair.requests > 0 {
                debug!(depth = pair.depth, "back-tracking");
                self.stack.push(pair);
                self.replay()?;
                return Ok(());
            }
            debug!(num = %pair.num, depth = pair.depth, "delete pair");
            if self.automaton.states[pair.automaton_state].accepting {
                self.remove_acceptance_pair(pair.num);
            }
        }
        Ok(())
    }

    /// Restores the pair on top of the stack, from its snapshot or by replaying
    /// the steps of the started pairs below it.
    fn replay(&mut self) -> Result<(), ExploreError> {
        let Some((top, below)) = self.stack.split_last() else {
            return Ok(());
        };
        if let Some(snapshot) = top.state.snapshot().cloned() {
            return self.ctx.restore(&snapshot);
        }
        let path: Vec<Transition> = below
            .iter()
            .filter(|p| p.exploration_started)
            .filter_map(|p| p.state.transition().cloned())
            .collect();
        self.ctx.stats.visited_pairs += path.len() as u64;
        self.ctx.replay(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExploreConfig;
    use crate::scripted::{Op, ScriptedApp};

    const EVENTUALLY_P: &str = "
        never {
        T0_init:
          if
          :: (!p) -> goto accept_S2
          :: (1) -> goto T0_init
          fi;
        accept_S2:
          if
          :: (!p) -> goto accept_S2
          fi;
        }";

    fn check(app: ScriptedApp, config: ExploreConfig) -> Option<Verdict> {
        let automaton = Automaton::parse(EVENTUALLY_P).expect("never claim");
        let mut ctx = ExplorationContext::new(Box::new(app), config);
        LivenessChecker::new(&mut ctx, automaton)
            .run()
            .expect("exploration")
    }

    #[test]
    fn cycle_that_never_sets_p_is_accepted() {
        let app = ScriptedApp::new(vec![vec![
            Op::Write { var: 1, value: 1 },
            Op::Write { var: 1, value: 2 },
        ]])
        .repeating();
        let verdict = check(app, ExploreConfig::default());
        let Some(Verdict::Liveness { trace }) = verdict else {
            panic!("expected an acceptance cycle, got {verdict:?}");
        };
        assert_eq!(trace.record().to_string(), "1;1;1");
        assert_eq!(
            Verdict::Liveness { trace }.exit_status(),
            sonde_types::ExitStatus::Safety
        );
    }

    #[test]
    fn setting_p_satisfies_the_property() {
        let app = ScriptedApp::new(vec![vec![Op::Write {
            var: crate::scripted::P,
            value: 1,
        }]])
        .repeating();
        let config = ExploreConfig {
            max_visited: 16,
            ..ExploreConfig::default()
        };
        assert_eq!(check(app, config), None);
    }
}
