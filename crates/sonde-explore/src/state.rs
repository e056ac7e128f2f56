use crate::transition::{Transition, depends};
use sonde_snapshot::Snapshot;
use sonde_types::{ActorId, StateNum};
use sonde_wire::ActorStatus;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Scheduling status of one actor in one state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActorState {
    pub enabled: bool,
    todo: bool,
    done: bool,
    /// Next way of executing the pending step to try.
    pub times_considered: u32,
    pub max_considered: u32,
}

impl ActorState {
    pub fn new(enabled: bool, max_considered: u32) -> Self {
        Self {
            enabled,
            max_considered: max_considered.max(1),
            ..Self::default()
        }
    }

    pub fn is_todo(&self) -> bool {
        self.todo
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn mark_todo(&mut self) {
        self.todo = true;
        self.done = false;
    }

    pub fn mark_done(&mut self) {
        self.todo = false;
        self.done = true;
    }

    /// Value to execute the step with; the actor is done once every value was tried.
    fn consider(&mut self) -> u32 {
        let value = self.times_considered;
        self.times_considered += 1;
        if self.times_considered >= self.max_considered {
            self.mark_done();
        }
        value
    }
}

/// One node of the exploration stack.
#[derive(Debug, Clone)]
pub struct State {
    num: StateNum,
    actors: BTreeMap<ActorId, ActorState>,
    /// Transition last executed from this state.
    transition: Option<Transition>,
    snapshot: Option<Arc<Snapshot>>,
    sleep: BTreeMap<ActorId, Transition>,
}

impl State {
    pub fn new(num: StateNum, status: &[ActorStatus]) -> Self {
        let actors = status
            .iter()
            .map(|s| (s.aid, ActorState::new(s.enabled, s.max_considered)))
            .collect();
        Self {
            num,
            actors,
            transition: None,
            snapshot: None,
            sleep: BTreeMap::new(),
        }
    }

    /// Child reached from `parent` through `incoming`. Sleeping transitions of the
    /// parent that are independent of `incoming` keep sleeping here.
    pub fn child(
        num: StateNum,
        status: &[ActorStatus],
        parent: &State,
        incoming: &Transition,
        dependent: impl Fn(&Transition, &Transition) -> bool,
    ) -> Self {
        let mut state = Self::new(num, status);
        for (aid, sleeping) in &parent.sleep {
            if dependent(incoming, sleeping) {
                continue;
            }
            state.sleep.insert(*aid, sleeping.clone());
            if let Some(actor) = state.actors.get_mut(aid) {
                actor.mark_done();
            }
        }
        state
    }

    pub fn num(&self) -> StateNum {
        self.num
    }

    pub fn actors(&self) -> &BTreeMap<ActorId, ActorState> {
        &self.actors
    }

    pub fn actor(&self, aid: ActorId) -> Option<&ActorState> {
        self.actors.get(&aid)
    }

    pub fn enabled_actors(&self) -> BTreeSet<ActorId> {
        self.actors
            .iter()
            .filter(|(_, a)| a.enabled)
            .map(|(aid, _)| *aid)
            .collect()
    }

    pub fn transition(&self) -> Option<&Transition> {
        self.transition.as_ref()
    }

    pub fn set_transition(&mut self, transition: Transition) {
        self.transition = Some(transition);
    }

    pub fn snapshot(&self) -> Option<&Arc<Snapshot>> {
        self.snapshot.as_ref()
    }

    pub fn set_snapshot(&mut self, snapshot: Arc<Snapshot>) {
        self.snapshot = Some(snapshot);
    }

    pub fn sleep_set(&self) -> &BTreeMap<ActorId, Transition> {
        &self.sleep
    }

    pub fn add_sleep(&mut self, transition: Transition) {
        self.sleep.insert(transition.aid, transition);
    }

    pub fn mark_todo(&mut self, aid: ActorId) {
        if let Some(actor) = self.actors.get_mut(&aid) {
            actor.mark_todo();
        }
    }

    /// Marks the first enabled actor that is not done, or every such actor.
    pub fn mark_enabled_todo(&mut self, only_first: bool) {
        for actor in self.actors.values_mut() {
            if actor.enabled && !actor.done {
                actor.mark_todo();
                if only_first {
                    break;
                }
            }
        }
    }

    /// Marks every enabled actor of `aids`.
    pub fn mark_todo_among(&mut self, aids: &BTreeSet<ActorId>) {
        for (aid, actor) in self.actors.iter_mut() {
            if actor.enabled && !actor.done && aids.contains(aid) {
                actor.mark_todo();
            }
        }
    }

    pub fn todo_count(&self) -> usize {
        self.actors
            .iter()
            .filter(|(aid, a)| a.todo && a.enabled && !self.sleep.contains_key(aid))
            .count()
    }

    pub fn has_todo(&self) -> bool {
        self.todo_count() > 0
    }

    /// Picks the next actor to run: the first one that is todo, enabled and
    /// not sleeping. Returns it with the value to execute its step with.
    pub fn next_todo(&mut self) -> Option<(ActorId, u32)> {
        let sleep = &self.sleep;
        let (aid, actor) = self
            .actors
            .iter_mut()
            .find(|(aid, a)| a.todo && a.enabled && !sleep.contains_key(aid))?;
        Some((*aid, actor.consider()))
    }

    /// Race reversal for a transition executed later on the same path: the
    /// issuer has to be tried from here too. Falls back to every enabled actor
    /// when the issuer cannot run in this state.
    pub fn add_race(&mut self, issuer: ActorId) {
        match self.actors.get_mut(&issuer) {
            Some(actor) if actor.enabled => {
                if !actor.done {
                    actor.mark_todo();
                }
            }
            _ => {
                for actor in self.actors.values_mut() {
                    if actor.enabled && !actor.done {
                        actor.mark_todo();
                    }
                }
            }
        }
    }
}

/// Dependency check honouring the reduction mode: without reduction every
/// pair is dependent.
pub fn dependent_under(reduce: bool) -> impl Fn(&Transition, &Transition) -> bool {
    move |a, b| !reduce || depends(a, b)
}
