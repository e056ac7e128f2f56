//! DPOR split across threads: each worker runs its own application and starts
//! from a share of the actors enabled in the initial state.

use crate::app::RemoteApp;
use crate::context::{ExplorationContext, ExploreConfig, Stats};
use crate::safety::SafetyChecker;
use crate::{ExploreError, Verdict};
use parking_lot::Mutex;
use sonde_types::ActorId;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::{debug, info};

/// Starts one more instance of the application.
pub type AppFactory<'f> = dyn Fn() -> Result<Box<dyn RemoteApp>, ExploreError> + Sync + 'f;

#[derive(Default)]
struct Merged {
    stats: Stats,
    verdict: Option<Verdict>,
    error: Option<ExploreError>,
}

pub struct ParallelExplorer<'f> {
    factory: &'f AppFactory<'f>,
    config: ExploreConfig,
    workers: Option<usize>,
}

/// Round-robin split of `actors` in at most `workers` non-empty shares.
pub fn split_actors(actors: &[ActorId], workers: usize) -> Vec<BTreeSet<ActorId>> {
    let workers = workers.clamp(1, actors.len().max(1));
    let mut shares = vec![BTreeSet::new(); workers];
    for (i, aid) in actors.iter().enumerate() {
        shares[i % workers].insert(*aid);
    }
    shares.retain(|share| !share.is_empty());
    shares
}

impl<'f> ParallelExplorer<'f> {
    pub fn new(factory: &'f AppFactory<'f>, config: ExploreConfig, workers: Option<usize>) -> Self {
        Self {
            factory,
            config,
            workers,
        }
    }

    pub fn run(&self) -> Result<(Option<Verdict>, Stats), ExploreError> {
        let enabled = self.root_actors()?;
        let workers = self.workers.unwrap_or(enabled.len());
        let shares = split_actors(&enabled, workers);
        info!(
            actors = enabled.len(),
            workers = shares.len(),
            "Check a safety property in parallel"
        );
        if shares.is_empty() {
            // nothing enabled at the root: one plain exploration reports it
            return self.explore_share(None, &Arc::new(AtomicBool::new(false)));
        }

        let merged = Mutex::new(Merged::default());
        let stop = Arc::new(AtomicBool::new(false));
        thread::scope(|scope| {
            for (worker, share) in shares.into_iter().enumerate() {
                let merged = &merged;
                let stop = &stop;
                scope.spawn(move || {
                    debug!(worker, actors = ?share, "worker started");
                    let outcome = self.explore_share(Some(share), stop);
                    let mut merged = merged.lock();
                    match outcome {
                        Ok((verdict, stats)) => {
                            merged.stats.merge(&stats);
                            if let Some(verdict) = verdict
                                && merged.verdict.is_none()
                            {
                                merged.verdict = Some(verdict);
                                stop.store(true, Ordering::Relaxed);
                            }
                        }
                        Err(e) => {
                            merged.error.get_or_insert(e);
                            stop.store(true, Ordering::Relaxed);
                        }
                    }
                    debug!(worker, "worker done");
                });
            }
        });

        let merged = merged.into_inner();
        if let Some(error) = merged.error {
            return Err(error);
        }
        Ok((merged.verdict, merged.stats))
    }

    /// Enabled actors of the initial state, asked to a throwaway instance.
    fn root_actors(&self) -> Result<Vec<ActorId>, ExploreError> {
        let mut probe = (self.factory)()?;
        let actors = probe
            .actors_status()?
            .into_iter()
            .filter(|a| a.enabled)
            .map(|a| a.aid)
            .collect();
        probe.finalize()?;
        Ok(actors)
    }

    fn explore_share(
        &self,
        share: Option<BTreeSet<ActorId>>,
        stop: &Arc<AtomicBool>,
    ) -> Result<(Option<Verdict>, Stats), ExploreError> {
        let app = (self.factory)()?;
        let mut ctx = ExplorationContext::new(app, self.config.clone());
        ctx.set_stop_flag(stop.clone());
        let verdict = {
            let mut checker = SafetyChecker::new(&mut ctx);
            if let Some(share) = share {
                checker.restrict_root(share);
            }
            checker.run()?
        };
        let stats = ctx.finish()?;
        Ok((verdict, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::{Op, ScriptedApp};

    fn aid(n: u64) -> ActorId {
        ActorId::new(n).expect("aid")
    }

    #[test]
    fn actors_are_dealt_round_robin() {
        let actors = [aid(1), aid(2), aid(3)];
        let shares = split_actors(&actors, 2);
        assert_eq!(shares.len(), 2);
        assert_eq!(shares[0], BTreeSet::from([aid(1), aid(3)]));
        assert_eq!(shares[1], BTreeSet::from([aid(2)]));
        assert_eq!(split_actors(&actors, 8).len(), 3);
        assert!(split_actors(&[], 4).is_empty());
    }

    #[test]
    fn workers_cover_every_root_actor() {
        let factory = || -> Result<Box<dyn RemoteApp>, ExploreError> {
            Ok(Box::new(ScriptedApp::new(vec![
                vec![Op::Send { mailbox: 1, value: 1 }],
                vec![Op::Send { mailbox: 2, value: 2 }],
            ])))
        };
        let explorer = ParallelExplorer::new(&factory, ExploreConfig::default(), None);
        let (verdict, stats) = explorer.run().expect("exploration");
        assert_eq!(verdict, None);
        assert_eq!(stats.executed_transitions, 4);
    }

    #[test]
    fn first_verdict_is_kept() {
        let factory = || -> Result<Box<dyn RemoteApp>, ExploreError> {
            Ok(Box::new(ScriptedApp::new(vec![
                vec![Op::Assert { var: 1, value: 0 }],
                vec![Op::Write { var: 1, value: 1 }],
            ])))
        };
        let explorer = ParallelExplorer::new(&factory, ExploreConfig::default(), Some(2));
        let (verdict, _) = explorer.run().expect("exploration");
        let Some(Verdict::Safety { trace }) = verdict else {
            panic!("expected an assertion failure, got {verdict:?}");
        };
        assert_eq!(trace.record().to_string(), "2;1");
    }
}
