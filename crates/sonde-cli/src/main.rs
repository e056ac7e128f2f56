use facet::Facet;
use figue as args;
use sonde_explore::{ExploreConfig, ExploreError, ReductionMode, SessionOptions};
use sonde_snapshot::StorageKind;
use sonde_types::ExitStatus;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

const LOG_ENV: &str = "SONDE_LOG";

#[derive(Facet, Debug)]
struct Cli {
    #[facet(flatten)]
    builtins: args::FigueBuiltins,
    #[facet(flatten)]
    check: CheckArgs,
}

#[derive(Facet, Debug, Default)]
struct CheckArgs {
    /// Snapshot every n-th state (0: never, replay from the initial state).
    #[facet(args::named, default)]
    checkpoint: Option<u64>,
    /// Store snapshots page by page, sharing unchanged pages.
    #[facet(args::named, default)]
    sparse_checkpoint: bool,
    /// none, dpor, udpor or parallel.
    #[facet(args::named, default)]
    reduction: Option<String>,
    /// Worker threads of the parallel reduction.
    #[facet(args::named, default)]
    workers: Option<usize>,
    /// Promela never claim to check.
    #[facet(args::named, default)]
    property_file: Option<String>,
    #[facet(args::named, default)]
    comms_determinism: bool,
    #[facet(args::named, default)]
    send_determinism: bool,
    #[facet(args::named, default)]
    max_depth: Option<usize>,
    /// Visited states kept for equality pruning (0: no pruning).
    #[facet(args::named, default)]
    visited: Option<usize>,
    #[facet(args::named, default)]
    hash: bool,
    /// Errors tolerated before the exploration fails.
    #[facet(args::named, default)]
    max_errors: Option<u64>,
    /// Seconds after which the exploration stops.
    #[facet(args::named, default)]
    soft_timeout: Option<u64>,
    #[facet(args::named, default)]
    dot_output: Option<String>,
    /// Record trace (`1;2/1;3`) to replay instead of exploring.
    #[facet(args::named, default)]
    replay: Option<String>,
    /// Extra environment for the application, `KEY=VALUE;KEY=VALUE`.
    #[facet(args::named, default)]
    setenv: Option<String>,
    /// Log filter, overrides SONDE_LOG and RUST_LOG.
    #[facet(args::named, default)]
    log: Option<String>,
    /// The application and its arguments.
    #[facet(args::positional, default)]
    command: Vec<String>,
}

fn main() {
    let status = match run() {
        Ok(status) => status,
        Err(status) => status,
    };
    std::process::exit(status.code());
}

fn run() -> Result<ExitStatus, ExitStatus> {
    let check = parse_cli().map_err(|e| {
        eprintln!("{e}");
        ExitStatus::Error
    })?;
    init_logging(check.log.as_deref());

    let options = session_options(check).map_err(|e| {
        error!("{e}");
        ExitStatus::Error
    })?;
    info!(command = ?options.argv, "Start the model checker");
    match sonde_explore::run(options) {
        Ok(outcome) => Ok(outcome.exit_status()),
        Err(e) if e.is_process_death() => {
            error!("{e}");
            Err(ExitStatus::ProgramCrash)
        }
        Err(e) => {
            error!("{e}");
            Err(ExitStatus::Error)
        }
    }
}

fn parse_cli() -> Result<CheckArgs, String> {
    let figue_config = args::builder::<Cli>()
        .map_err(|e| format!("failed to build CLI schema: {e}"))?
        .cli(|cli| cli.strict())
        .help(|h| {
            h.program_name("model-checker")
                .description("Explore the interleavings of an instrumented application")
                .version(option_env!("CARGO_PKG_VERSION").unwrap_or("dev"))
        })
        .build();
    let cli = args::Driver::new(figue_config)
        .run()
        .into_result()
        .map_err(|e| e.to_string())?;
    Ok(cli.value.check)
}

fn init_logging(flag: Option<&str>) {
    let filter = flag
        .map(tracing_subscriber::EnvFilter::try_new)
        .and_then(Result::ok)
        .or_else(|| tracing_subscriber::EnvFilter::try_from_env(LOG_ENV).ok())
        .or_else(|| tracing_subscriber::EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_setenv(text: &str) -> Result<Vec<(String, String)>, ExploreError> {
    text.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(ExploreError::Config(format!(
                "--setenv entry {entry:?} is not KEY=VALUE"
            ))),
        })
        .collect()
}

fn session_options(check: CheckArgs) -> Result<SessionOptions, ExploreError> {
    if check.command.is_empty() {
        return Err(ExploreError::Config(
            "no application to check, pass it after `--`".to_string(),
        ));
    }
    let defaults = ExploreConfig::default();
    let reduction = match check.reduction.as_deref() {
        Some(mode) => mode.parse::<ReductionMode>()?,
        None => defaults.reduction,
    };
    let config = ExploreConfig {
        checkpoint: check.checkpoint.unwrap_or(defaults.checkpoint),
        storage: if check.sparse_checkpoint {
            StorageKind::Sparse
        } else {
            StorageKind::Dense
        },
        reduction,
        max_depth: check.max_depth.unwrap_or(defaults.max_depth),
        max_visited: check.visited.unwrap_or(defaults.max_visited),
        hash: check.hash,
        max_errors: check.max_errors.unwrap_or(defaults.max_errors),
        soft_timeout: check.soft_timeout.map(Duration::from_secs),
        send_determinism: check.send_determinism,
        comms_determinism: check.comms_determinism,
    };
    config.validate()?;
    Ok(SessionOptions {
        argv: check.command,
        env: match check.setenv.as_deref() {
            Some(text) => parse_setenv(text)?,
            None => Vec::new(),
        },
        config,
        property_file: check.property_file.map(PathBuf::from),
        replay: check.replay,
        dot_output: check.dot_output.map(PathBuf::from),
        workers: check.workers,
    })
}
