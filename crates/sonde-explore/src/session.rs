//! One model-checking run: starts the application, picks the exploration the
//! options ask for, and reports its outcome.

use crate::app::RemoteApp;
use crate::automaton::Automaton;
use crate::comm_determinism::CommDeterminismChecker;
use crate::context::{ExplorationContext, ExploreConfig, ReductionMode, Stats};
use crate::dot::DotWriter;
use crate::liveness::LivenessChecker;
use crate::parallel::{AppFactory, ParallelExplorer};
use crate::process_app::ProcessApp;
use crate::record::RecordTrace;
use crate::replay::Replayer;
use crate::safety::SafetyChecker;
use crate::{ExploreError, Verdict};
use sonde_types::ExitStatus;
use std::path::PathBuf;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Application command line.
    pub argv: Vec<String>,
    /// Added to the application environment.
    pub env: Vec<(String, String)>,
    pub config: ExploreConfig,
    /// Never claim to check; enables the liveness exploration.
    pub property_file: Option<PathBuf>,
    /// Record trace to run instead of exploring.
    pub replay: Option<String>,
    pub dot_output: Option<PathBuf>,
    pub workers: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub verdict: Option<Verdict>,
    pub stats: Stats,
}

impl Outcome {
    pub fn exit_status(&self) -> ExitStatus {
        self.verdict
            .as_ref()
            .map_or(ExitStatus::Success, Verdict::exit_status)
    }
}

pub struct Session<'f> {
    options: SessionOptions,
    factory: &'f AppFactory<'f>,
}

/// Runs the application of `options` as a traced process.
pub fn run(options: SessionOptions) -> Result<Outcome, ExploreError> {
    let argv = options.argv.clone();
    let env = options.env.clone();
    let factory = move || -> Result<Box<dyn RemoteApp>, ExploreError> {
        Ok(Box::new(ProcessApp::spawn(&argv, &env)?))
    };
    Session::new(options, &factory).run()
}

impl<'f> Session<'f> {
    pub fn new(options: SessionOptions, factory: &'f AppFactory<'f>) -> Self {
        Self { options, factory }
    }

    pub fn run(&self) -> Result<Outcome, ExploreError> {
        let config = &self.options.config;
        config.validate()?;

        if config.reduction == ReductionMode::Parallel
            && self.options.replay.is_none()
            && self.options.property_file.is_none()
            && !config.checks_determinism()
        {
            if self.options.dot_output.is_some() {
                warn!("the dot output is not written by parallel explorations");
            }
            let explorer = ParallelExplorer::new(self.factory, config.clone(), self.options.workers);
            let (verdict, stats) = explorer.run()?;
            if verdict.is_none() {
                info!("No property violation found.");
            }
            stats.log();
            return Ok(Outcome { verdict, stats });
        }

        let mut ctx = ExplorationContext::new((self.factory)()?, config.clone());
        if let Some(path) = &self.options.dot_output {
            ctx.set_dot(DotWriter::create(path)?);
        }
        let verdict = self.explore(&mut ctx)?;
        let stats = ctx.stats;
        match ctx.finish() {
            Ok(_) => {}
            Err(e) if verdict.is_some() => debug!(%e, "application not finalized"),
            Err(e) => return Err(e),
        }
        stats.log();
        Ok(Outcome { verdict, stats })
    }

    fn explore(&self, ctx: &mut ExplorationContext) -> Result<Option<Verdict>, ExploreError> {
        if let Some(path) = &self.options.replay {
            let record = RecordTrace::parse(path)?;
            return Replayer::new(ctx, record).run();
        }
        if let Some(path) = &self.options.property_file {
            let automaton = Automaton::load(path)?;
            return LivenessChecker::new(ctx, automaton).run();
        }
        if ctx.config().checks_determinism() {
            return CommDeterminismChecker::new(ctx).run();
        }
        SafetyChecker::new(ctx).run()
    }
}
