//! Depth-first exploration with dynamic partial-order reduction and sleep sets.

use crate::app::Step;
use crate::context::ExplorationContext;
use crate::record::Trace;
use crate::state::{State, dependent_under};
use crate::transition::{Transition, depends};
use crate::visited::{VisitedState, VisitedStates};
use crate::{ExploreError, Verdict};
use sonde_types::{ActorId, StateNum};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Follows the steps of an exploration. Used by checkers that need more than
/// assertions and deadlocks.
pub trait Observer {
    /// A step ran from the state on top of the stack. Returning true ends the
    /// exploration with [`Observer::verdict`].
    fn executed(&mut self, transition: &Transition) -> Result<bool, ExploreError>;

    /// A state was pushed at `depth` (1 for the initial state).
    fn pushed(&mut self, depth: usize);

    /// The exploration left a leaf.
    fn backtracked(&mut self);

    /// The application is back in the state at `depth`.
    fn restored(&mut self, depth: usize);

    /// Whether the state just reached may be pruned by state equality.
    fn prunable(&self) -> bool;

    fn verdict(&self, trace: Trace) -> Verdict;
}

pub struct SafetyChecker<'a> {
    ctx: &'a mut ExplorationContext,
    observer: Option<&'a mut dyn Observer>,
    reduce: bool,
    stack: Vec<State>,
    visited: VisitedStates,
    /// Set when the state on top of the stack equals an already visited one.
    visited_state: Option<StateNum>,
    root_actors: Option<BTreeSet<ActorId>>,
    errors: u64,
}

impl<'a> SafetyChecker<'a> {
    pub fn new(ctx: &'a mut ExplorationContext) -> Self {
        let visited = VisitedStates::new(ctx.config().max_visited);
        let reduce = ctx.config().reduction.reduces();
        Self {
            ctx,
            observer: None,
            reduce,
            stack: Vec::new(),
            visited,
            visited_state: None,
            root_actors: None,
            errors: 0,
        }
    }

    /// Only these actors are tried from the initial state.
    pub fn restrict_root(&mut self, actors: BTreeSet<ActorId>) {
        self.root_actors = Some(actors);
    }

    /// Observed explorations run every interleaving.
    pub fn observe(&mut self, observer: &'a mut dyn Observer) {
        self.observer = Some(observer);
        self.reduce = false;
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
                .filter_map(|s| s.transition().cloned())
                .collect(),
        )
    }

    fn explore(&mut self) -> Result<Option<Verdict>, ExploreError> {
        let reduce = self.reduce;
        let max_depth = self.ctx.config().max_depth;
        info!(reduce, "Check a safety property");

        let mut initial = self.ctx.initial_state()?;
        match &self.root_actors {
            Some(actors) => initial.mark_todo_among(actors),
            None => initial.mark_enabled_todo(reduce),
        }
        self.stack.push(initial);
        if let Some(observer) = self.observer.as_deref_mut() {
            observer.pushed(1);
        }

        while !self.stack.is_empty() {
            if self.ctx.should_stop() {
                warn!(depth = self.stack.len(), "exploration stopped before its end");
                return Ok(None);
            }
            self.ctx.stats.visited_states += 1;

            let depth = self.stack.len();
            if depth > max_depth {
                warn!(depth, "/!\\ Max depth reached ! /!\\");
                if let Some(verdict) = self.backtrack()? {
                    return Ok(Some(verdict));
                }
                continue;
            }
            if let Some(equal) = self.visited_state.take() {
                debug!(%equal, "state already visited, exploration stopped on this path");
                if let Some(verdict) = self.backtrack()? {
                    return Ok(Some(verdict));
                }
                continue;
            }

            let Some(top) = self.stack.last_mut() else {
                break;
            };
            let Some((aid, times_considered)) = top.next_todo() else {
                debug!(depth, "no more actors to interleave");
                if let Some(verdict) = self.backtrack()? {
                    return Ok(Some(verdict));
                }
                continue;
            };
            let from = top.num();
            let step = self.ctx.execute(aid, times_considered)?;
            if let Some(verdict) = self.expand(from, step)? {
                return Ok(Some(verdict));
            }
        }

        if self.errors > 0 {
            warn!(errors = self.errors, "errors were found but tolerated");
        }
        info!("No property violation found.");
        Ok(None)
    }

    /// Pushes the state reached by `step` from the top of the stack.
    fn expand(&mut self, from: StateNum, step: Step) -> Result<Option<Verdict>, ExploreError> {
        let reduce = self.reduce;
        let Some(parent) = self.stack.last_mut() else {
            return Ok(None);
        };
        let transition = step.transition;
        parent.set_transition(transition.clone());

        let stop = match self.observer.as_deref_mut() {
            Some(observer) => observer.executed(&transition)?,
            None => false,
        };
        if stop {
            let trace = self.trace();
            if let Some(observer) = self.observer.as_deref() {
                let verdict = observer.verdict(trace);
                verdict.log();
                return Ok(Some(verdict));
            }
        }

        if step.assertion_failed {
            let verdict = Verdict::Safety {
                trace: self.trace(),
            };
            if let Some(verdict) = self.report(verdict) {
                return Ok(Some(verdict));
            }
        }

        let num = self.ctx.next_num()?;
        let status = self.ctx.actors()?;
        let Some(parent) = self.stack.last_mut() else {
            return Ok(None);
        };
        let mut child = State::child(
            num,
            &status,
            parent,
            &transition,
            dependent_under(reduce),
        );
        // a sleeping actor is never picked again, so wait until every way of
        // running its step was tried
        if reduce && parent.actor(transition.aid).is_some_and(|a| a.is_done()) {
            parent.add_sleep(transition.clone());
        }
        self.ctx.stats.expanded_states += 1;

        let checkpoint = self.ctx.should_checkpoint(num);
        let prune = self.visited.is_enabled()
            && self.observer.as_deref().is_none_or(|observer| observer.prunable());
        if checkpoint || prune {
            let snapshot = self.ctx.snapshot(num, child.enabled_actors())?;
            if prune {
                let visited = VisitedState::new(num, snapshot.clone(), status.len());
                self.visited_state = self.visited.add(visited, true)?;
            }
            if checkpoint {
                child.set_snapshot(snapshot);
            }
        }

        match self.visited_state {
            None => {
                if !step.assertion_failed {
                    child.mark_enabled_todo(reduce);
                }
                self.ctx.dot_edge(from, num, &transition)?;
            }
            Some(equal) => self.ctx.dot_edge(from, equal, &transition)?,
        }
        self.stack.push(child);
        if let Some(observer) = self.observer.as_deref_mut() {
            observer.pushed(self.stack.len());
        }
        Ok(None)
    }

    /// Counts a violation. Returns it once more were found than tolerated.
    fn report(&mut self, verdict: Verdict) -> Option<Verdict> {
        verdict.log();
        self.errors += 1;
        let max_errors = self.ctx.config().max_errors;
        if self.errors > max_errors {
            return Some(verdict);
        }
        warn!(errors = self.errors, max_errors, "error tolerated, exploring on");
        None
    }

    fn backtrack(&mut self) -> Result<Option<Verdict>, ExploreError> {
        self.ctx.stats.backtracks += 1;
        self.stack.pop();
        if let Some(observer) = self.observer.as_deref_mut() {
            observer.backtracked();
        }

        if self.ctx.deadlock_check()? {
            let verdict = Verdict::Deadlock {
                trace: self.trace(),
            };
            if let Some(verdict) = self.report(verdict) {
                return Ok(Some(verdict));
            }
        }

        let reduce = self.reduce;
        let max_depth = self.ctx.config().max_depth;
        while let Some(state) = self.stack.pop() {
            if reduce && let Some(executed) = state.transition() {
                for previous in self.stack.iter_mut().rev() {
                    let Some(earlier) = previous.transition() else {
                        break;
                    };
                    if earlier.aid == executed.aid {
                        debug!(aid = %executed.aid, "same issuer, no race");
                        break;
                    }
                    if depends(executed, earlier) {
                        debug!(
                            state = %previous.num(),
                            earlier = %earlier,
                            later = %executed,
                            "dependent transitions"
                        );
                        previous.add_race(executed.aid);
                        break;
                    }
                }
            }

            if state.has_todo() && self.stack.len() < max_depth {
                debug!(
                    num = %state.num(),
                    depth = self.stack.len() + 1,
                    "back-tracking"
                );
                self.stack.push(state);
                self.restore_top()?;
                let depth = self.stack.len();
                if let Some(observer) = self.observer.as_deref_mut() {
                    observer.restored(depth);
                }
                break;
            }
            debug!(num = %state.num(), depth = self.stack.len() + 1, "delete state");
        }
        Ok(None)
    }

    /// Brings the application back to the state on top of the stack.
    fn restore_top(&mut self) -> Result<(), ExploreError> {
        let Some((top, path)) = self.stack.split_last() else {
            return Ok(());
        };
        if let Some(snapshot) = top.snapshot().cloned() {
            return self.ctx.restore(&snapshot);
        }
        let path: Vec<_> = path.iter().filter_map(|s| s.transition().cloned()).collect();
        self.ctx.replay(&path)
    }
}
