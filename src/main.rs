use clap::Parser;
use lintrun::errors::LockError;
use lintrun::executor::{LinterStatus, StatusCallback};
use lintrun::lock::LockOptions;
use lintrun::orchestrator::{self, RunOptions};
use lintrun::registry;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lintrun")]
#[command(version, about = "Run the linter fleet in parallel under an execution lock")]
struct Cli {
    /// Run only the listed linter ids (repeatable)
    #[arg(long)]
    only: Vec<String>,

    /// List the configured linters and exit
    #[arg(long)]
    list: bool,

    /// Parallel task bound (default: cores minus one)
    #[arg(long)]
    concurrency: Option<usize>,

    /// Disable change-based incremental skipping
    #[arg(long)]
    no_incremental: bool,

    /// Write the run's telemetry export to this path
    #[arg(long)]
    telemetry_out: Option<PathBuf>,

    /// Project checkout to lint (default: current directory)
    #[arg(long)]
    project_dir: Option<PathBuf>,

    /// Log directory, relative to the project unless absolute
    #[arg(long, default_value = ".lintrun/logs")]
    log_dir: PathBuf,

    /// Override the execution lock file path
    #[arg(long)]
    lock_file: Option<PathBuf>,

    /// Give up after waiting this many seconds for the execution lock
    #[arg(long)]
    lock_timeout: Option<u64>,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if cli.list {
        for linter in registry::all_linters() {
            println!("{:<14} {}", linter.id, linter.name);
        }
        return;
    }

    let project_dir = cli
        .project_dir
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    let log_dir = if cli.log_dir.is_absolute() {
        cli.log_dir.clone()
    } else {
        project_dir.join(&cli.log_dir)
    };

    let mut lock = LockOptions::default();
    if let Some(path) = cli.lock_file {
        lock = lock.with_path(path);
    }

    let on_status_change: Option<StatusCallback> = cli.verbose.then(|| {
        Arc::new(|id: &str, status: LinterStatus| {
            eprintln!("[{id}] {status}");
        }) as StatusCallback
    });

    let options = RunOptions {
        project_dir,
        log_dir,
        only: cli.only,
        concurrency: cli.concurrency,
        incremental: !cli.no_incremental,
        telemetry_out: cli.telemetry_out,
        lock,
        lock_wait_timeout: cli.lock_timeout.map(std::time::Duration::from_secs),
        on_status_change,
    };

    match orchestrator::run(options).await {
        Ok(outcome) => {
            for result in &outcome.results {
                let detail = result
                    .error
                    .as_deref()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{}ms", result.duration.as_millis()));
                println!("{:<14} {:<8} {detail}", result.id, result.status);
            }
            let s = &outcome.summary;
            println!(
                "\n{} total: {} passed, {} failed, {} errors ({}ms)",
                s.total,
                s.passed,
                s.failed,
                s.errors,
                s.duration.as_millis()
            );
            if s.failed > 0 || s.errors > 0 {
                std::process::exit(1);
            }
        }
        Err(e) => {
            if e.downcast_ref::<LockError>().is_some() {
                eprintln!("lock error: {e:#}");
                std::process::exit(2);
            }
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}
