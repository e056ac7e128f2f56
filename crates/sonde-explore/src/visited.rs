use sonde_snapshot::{Snapshot, SnapshotError, snapshot_equal};
use sonde_types::StateNum;
use std::sync::Arc;
use tracing::debug;

/// A state kept for equality pruning.
#[derive(Debug, Clone)]
pub struct VisitedState {
    pub num: StateNum,
    /// First state of the chain of equal states this one replaced.
    pub other_num: Option<StateNum>,
    pub snapshot: Arc<Snapshot>,
    actor_count: usize,
    heap_bytes_used: u64,
}

impl VisitedState {
    pub fn new(num: StateNum, snapshot: Arc<Snapshot>, actor_count: usize) -> Self {
        let heap_bytes_used = snapshot.heap_bytes_used();
        Self {
            num,
            other_num: None,
            snapshot,
            actor_count,
            heap_bytes_used,
        }
    }

    fn key(&self) -> (usize, u64) {
        (self.actor_count, self.heap_bytes_used)
    }

    /// Number under which this state is reported.
    pub fn original_num(&self) -> StateNum {
        self.other_num.unwrap_or(self.num)
    }
}

/// Bounded set of visited states, ordered by actor count then heap usage so
/// only states that may be equal get compared.
#[derive(Debug)]
pub struct VisitedStates {
    states: Vec<VisitedState>,
    max: usize,
}

impl VisitedStates {
    /// `max` of 0 disables pruning.
    pub fn new(max: usize) -> Self {
        Self {
            states: Vec::new(),
            max,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max > 0
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Inserts `state`. When `compare` is set and an equal state is already
    /// there, it is replaced by the new one and its number is returned.
    pub fn add(
        &mut self,
        mut state: VisitedState,
        compare: bool,
    ) -> Result<Option<StateNum>, SnapshotError> {
        let key = state.key();
        let lo = self.states.partition_point(|s| s.key() < key);
        let hi = self.states.partition_point(|s| s.key() <= key);

        if compare {
            for i in lo..hi {
                let old = &self.states[i];
                if !snapshot_equal(&old.snapshot, &state.snapshot)? {
                    continue;
                }
                let original = old.original_num();
                debug!(
                    num = %state.num,
                    equal_to = %old.num,
                    %original,
                    "state already visited"
                );
                state.other_num = Some(original);
                self.states[i] = state;
                return Ok(Some(original));
            }
        }

        self.states.insert(lo, state);
        self.purge();
        Ok(None)
    }

    fn purge(&mut self) {
        if self.max == 0 || self.states.len() <= self.max {
            return;
        }
        if let Some((oldest, _)) = self.states.iter().enumerate().min_by_key(|(_, s)| s.num) {
            self.states.remove(oldest);
        }
    }
}
