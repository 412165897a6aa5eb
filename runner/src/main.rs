use benchledger::{
    Cancellation, ConfigErrors, ConnectionError, HistoryStore, IngestOutcome, LedgerConfig,
    LedgerError, Pipeline, QueryFilter, SharedConnection,
};
use benchledger_ingest::{BenchmarkData, DataJsError};
use clap::{Parser, Subcommand};
use rayon::{prelude::*, ThreadPoolBuildError, ThreadPoolBuilder};
use serde_json::json;
use std::{fs, path::PathBuf, process::ExitCode, sync::Arc};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_unwrap::ResultExt;

#[derive(Parser, Debug)]
#[command(name = "benchledger", version)]
#[command(about = "Append-only benchmark history with regression checks")]
struct Args {
    /// YAML config, defaults are used if the file doesn't exist
    #[arg(short, long, default_value = "benchledger.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest benchmark runs, one JSON ingestion record per file
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Exit with status 2 if any run regressed
        #[arg(long)]
        fail_on_regression: bool,

        /// Size of the ingestion thread pool, defaults to the number of CPUs
        #[arg(long)]
        threads: Option<usize>,
    },
    /// Print the entries of a suite as JSON lines
    Query {
        #[arg(short, long, default_value = "Benchmark")]
        suite: String,
        #[arg(long)]
        tool: Option<String>,
        #[arg(long)]
        from_commit: Option<String>,
        #[arg(long)]
        to_commit: Option<String>,
        /// earliest entry date in epoch milliseconds
        #[arg(long)]
        since: Option<i64>,
        /// latest entry date in epoch milliseconds
        #[arg(long)]
        until: Option<i64>,
    },
    /// Write the dashboard data.js
    Export {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Append the entries of an existing data.js
    Import { file: PathBuf },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    DataJs(#[from] DataJsError),
    #[error("Failed to build thread pool: {0}")]
    ThreadPool(#[from] ThreadPoolBuildError),
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match run(Args::parse()) {
        Ok(code) => code,
        Err(error) => {
            error!("{error}");

            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<ExitCode, CliError> {
    let config = if args.config.is_file() {
        LedgerConfig::load(&args.config)?
    } else {
        warn!(path = ?args.config, "Config not found, falling back to defaults");
        LedgerConfig::default()
    };

    if config.preflight_checks() {
        return Err(ConfigErrors::Preflight.into());
    }

    let store = Arc::new(HistoryStore::open(SharedConnection::open(
        &config.database.path,
    )?)?);
    let pipeline = Pipeline::new(store.clone(), config.regression.clone());

    let code = match args.command {
        Command::Ingest {
            files,
            fail_on_regression,
            threads,
        } => ingest(&pipeline, files, fail_on_regression, threads)?,
        Command::Query {
            suite,
            tool,
            from_commit,
            to_commit,
            since,
            until,
        } => {
            let filter = QueryFilter {
                from_commit,
                to_commit,
                since,
                until,
                tool,
            };

            for entry in store.query(&suite, filter)?.iter() {
                println!("{}", serde_json::to_string(entry)?);
            }

            ExitCode::SUCCESS
        }
        Command::Export { output } => {
            let output = output.unwrap_or_else(|| config.export.path.clone());

            if let Some(parent) = output.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            fs::write(&output, store.export(config.export.repo_url.clone()).to_js()?)?;
            info!(path = ?output, "Exported {} suites", store.suites().len());

            ExitCode::SUCCESS
        }
        Command::Import { file } => {
            let data = BenchmarkData::parse(&fs::read_to_string(&file)?)?;
            pipeline.import(&data)?;

            ExitCode::SUCCESS
        }
    };

    // final flush happens on close, every handle but ours has to be gone by then
    drop(pipeline);
    Arc::try_unwrap(store).unwrap_or_log().close()?;

    Ok(code)
}

fn ingest(
    pipeline: &Pipeline,
    files: Vec<PathBuf>,
    fail_on_regression: bool,
    threads: Option<usize>,
) -> Result<ExitCode, CliError> {
    let mut builder = ThreadPoolBuilder::new();
    if let Some(threads) = threads {
        builder = builder.num_threads(threads);
    }
    let pool = builder.build()?;

    debug!("Ingesting {} files on {} threads", files.len(), pool.current_num_threads());

    let cancellation = Cancellation::new();
    let results = pool.install(|| {
        files
            .par_iter()
            .map(|path| {
                let outcome = fs::read_to_string(path)
                    .map_err(CliError::from)
                    .and_then(|input| Ok(pipeline.ingest_str(&input, &cancellation)?));

                (path, outcome)
            })
            .collect::<Vec<_>>()
    });

    let mut failed = 0;
    let mut regressed = 0;

    for (path, outcome) in results {
        match outcome {
            Ok(IngestOutcome::Appended {
                suite,
                commit,
                tool,
                report,
            }) => {
                for alert in report.alerts() {
                    println!(
                        "{}",
                        json!({"suite": suite, "commit": commit, "tool": tool, "alert": alert})
                    );
                }

                if !report.is_clean() {
                    regressed += 1;
                }
            }
            Ok(IngestOutcome::AlreadyPresent { commit, tool, .. }) => {
                info!(path = ?path, "Run of {commit} ({tool}) was already recorded");
            }
            Err(error) => {
                error!(path = ?path, "Failed to ingest: {error}");
                failed += 1;
            }
        }
    }

    info!(
        "Ingested {} files, {failed} failed, {regressed} regressed",
        files.len()
    );

    Ok(if failed > 0 {
        ExitCode::FAILURE
    } else if regressed > 0 && fail_on_regression {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    })
}
