//! Runs a recorded counter-example again instead of exploring.

use crate::context::ExplorationContext;
use crate::record::{RecordTrace, Trace};
use crate::transition::Transition;
use crate::{ExploreError, Verdict};
use tracing::info;

pub struct Replayer<'a> {
    ctx: &'a mut ExplorationContext,
    record: RecordTrace,
    executed: Vec<Transition>,
}

impl<'a> Replayer<'a> {
    pub fn new(ctx: &'a mut ExplorationContext, record: RecordTrace) -> Self {
        Self {
            ctx,
            record,
            executed: Vec::new(),
        }
    }

    pub fn run(&mut self) -> Result<Option<Verdict>, ExploreError> {
        match self.replay() {
            Err(e) if e.is_process_death() => {
                let verdict = Verdict::crash(&e, Trace::new(self.executed.clone()));
                verdict.log();
                Ok(Some(verdict))
            }
            other => other,
        }
    }

    fn replay(&mut self) -> Result<Option<Verdict>, ExploreError> {
        info!(path = %self.record, "Replaying a recorded trace");
        for item in self.record.0.clone() {
            let enabled = self
                .ctx
                .actors()?
                .iter()
                .any(|a| a.aid == item.aid && a.enabled);
            if !enabled {
                return Err(ExploreError::Replay(format!(
                    "actor {} is not enabled at step {}",
                    item.aid,
                    self.executed.len() + 1
                )));
            }
            let step = self.ctx.execute(item.aid, item.times_considered)?;
            self.ctx.stats.visited_states += 1;
            self.executed.push(step.transition);
            if step.assertion_failed {
                let verdict = Verdict::Safety {
                    trace: Trace::new(self.executed.clone()),
                };
                verdict.log();
                return Ok(Some(verdict));
            }
        }

        if self.ctx.deadlock_check()? {
            let verdict = Verdict::Deadlock {
                trace: Trace::new(self.executed.clone()),
            };
            verdict.log();
            return Ok(Some(verdict));
        }
        info!(steps = self.executed.len(), "The recorded trace ran without violation.");
        Ok(None)
    }
}
