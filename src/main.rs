//! AnalysisRunner CLI Entry Point
//!
//! # Usage
//!
//! ```bash
//! # Execute a workflow
//! analysisrunner run screen.yaml --runner-cmd ./analyze.sh
//!
//! # Preview a workflow without calling the analysis command
//! analysisrunner run screen.yaml --dry-run
//!
//! # Continue a failed or interrupted run
//! analysisrunner resume screen 6f1c... --runner-cmd ./analyze.sh
//!
//! # Analyze every ticker of a file against a shared daily quota
//! analysisrunner batch tickers.txt --keys KEY_A,KEY_B --daily-limit 25
//!
//! # Restart a stopped or interrupted batch
//! analysisrunner batch-start 0b9e... --keys KEY_A,KEY_B
//!
//! # Show a run or batch
//! analysisrunner status 6f1c...
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info, warn};

use analysisrunner::analysis::{AnalysisConfig, AnalysisRunner, CommandRunner, DryRunRunner};
use analysisrunner::batch::{BatchConfig, BatchQueue, BatchStatus, WorkKey, DEFAULT_MAX_RETRIES};
use analysisrunner::capacity::DailyKeyPool;
use analysisrunner::execution::{
    CancellationRegistry, WorkflowEngine, DEFAULT_EXPORT_DIR, DEFAULT_MAX_WORKERS,
};
use analysisrunner::store::{FileJobStore, JobStore};
use analysisrunner::workflow::{estimate_shapes, RunStatus, WorkflowRun};
use analysisrunner::{load_workflow, APP_NAME, VERSION};

/// Default directory of the job store.
const DEFAULT_STORE_DIR: &str = ".analysisrunner";

/// Default calls per key per day.
const DEFAULT_DAILY_LIMIT: u32 = 100;

/// Environment variable consulted when `--runner-cmd` is absent.
const RUNNER_CMD_ENV: &str = "ANALYSIS_RUNNER_CMD";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Run { workflow_path: String },
    Resume { workflow_id: String, run_id: String },
    Batch { keys_path: String },
    BatchStart { batch_id: String },
    Status { id: String },
}

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    command: Option<Command>,
    store_dir: PathBuf,
    export_dir: PathBuf,
    daily_limit: u32,
    keys: Vec<String>,
    max_workers: usize,
    max_retries: u32,
    runner_cmd: Option<String>,
    dry_run: bool,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command: None,
            store_dir: PathBuf::from(DEFAULT_STORE_DIR),
            export_dir: PathBuf::from(DEFAULT_EXPORT_DIR),
            daily_limit: DEFAULT_DAILY_LIMIT,
            keys: vec!["default".to_string()],
            max_workers: DEFAULT_MAX_WORKERS,
            max_retries: DEFAULT_MAX_RETRIES,
            runner_cmd: None,
            dry_run: false,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Resumable Analysis Workflows and Batches");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: analysisrunner <COMMAND> [ARGS] [OPTIONS]");
    println!();
    println!("Commands:");
    println!("  run <WORKFLOW_FILE>            Register and execute a workflow YAML file");
    println!("  resume <WORKFLOW_ID> <RUN_ID>  Continue a run after its last completed step");
    println!("  batch <KEYS_FILE>              Analyze every key of a file (one per line)");
    println!("  batch-start <BATCH_ID>         Restart a stopped, failed or interrupted batch");
    println!("  status <ID>                    Show a run or batch");
    println!();
    println!("Options:");
    println!("  --store DIR         Job store directory (default: {})", DEFAULT_STORE_DIR);
    println!("  --export-dir DIR    Default export directory (default: {})", DEFAULT_EXPORT_DIR);
    println!("  --runner-cmd CMD    Analysis command (default: ${})", RUNNER_CMD_ENV);
    println!("  --keys K1,K2        API keys sharing the daily quota");
    println!("  --daily-limit N     Calls per key per day (default: {})", DEFAULT_DAILY_LIMIT);
    println!("  --max-workers N     Parallel analysis calls per step (default: {})", DEFAULT_MAX_WORKERS);
    println!("  --max-retries N     Attempts per batch item (default: {})", DEFAULT_MAX_RETRIES);
    println!("  --dry-run           Record analysis requests instead of running them");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  analysisrunner run screen.yaml --dry-run");
    println!("  analysisrunner batch tickers.txt --keys A,B --daily-limit 25");
}

/// Returns the value following an option.
fn option_value<'a>(args: &'a [String], i: &mut usize, name: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires a value", name))
}

fn parse_number<T: std::str::FromStr>(value: &str, name: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("Invalid {} value: {}", name, value))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positional: Vec<String> = Vec::new();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--dry-run" => config.dry_run = true,
            "--verbose" | "-v" => config.verbose = true,
            "--store" => config.store_dir = PathBuf::from(option_value(args, &mut i, arg)?),
            "--export-dir" => config.export_dir = PathBuf::from(option_value(args, &mut i, arg)?),
            "--runner-cmd" => config.runner_cmd = Some(option_value(args, &mut i, arg)?.to_string()),
            "--keys" => {
                config.keys = option_value(args, &mut i, arg)?
                    .split(',')
                    .map(|k| k.trim().to_string())
                    .filter(|k| !k.is_empty())
                    .collect();
                if config.keys.is_empty() {
                    return Err("--keys requires at least one key".to_string());
                }
            }
            "--daily-limit" => {
                config.daily_limit = parse_number(option_value(args, &mut i, arg)?, arg)?;
            }
            "--max-workers" => {
                config.max_workers = parse_number(option_value(args, &mut i, arg)?, arg)?;
            }
            "--max-retries" => {
                config.max_retries = parse_number(option_value(args, &mut i, arg)?, arg)?;
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => positional.push(arg.clone()),
        }
        i += 1;
    }

    config.command = Some(parse_command(&positional)?);
    Ok(config)
}

fn parse_command(positional: &[String]) -> Result<Command, String> {
    let (name, rest) = positional
        .split_first()
        .ok_or_else(|| "Missing command".to_string())?;

    let command = match (name.as_str(), rest) {
        ("run", [path]) => Command::Run {
            workflow_path: path.clone(),
        },
        ("resume", [workflow_id, run_id]) => Command::Resume {
            workflow_id: workflow_id.clone(),
            run_id: run_id.clone(),
        },
        ("batch", [path]) => Command::Batch {
            keys_path: path.clone(),
        },
        ("batch-start", [batch_id]) => Command::BatchStart {
            batch_id: batch_id.clone(),
        },
        ("status", [id]) => Command::Status { id: id.clone() },
        ("run" | "resume" | "batch" | "batch-start" | "status", _) => {
            return Err(format!("Wrong number of arguments for '{}'", name));
        }
        _ => return Err(format!("Unknown command: {}", name)),
    };
    Ok(command)
}

/// Builds the analysis runner: recording in dry-run mode, else the
/// configured command.
fn build_runner(config: &Config) -> Result<Arc<dyn AnalysisRunner>, String> {
    if config.dry_run {
        info!("Mode: DRY RUN (analysis requests are recorded, not executed)");
        return Ok(Arc::new(DryRunRunner::new()));
    }

    let command = config
        .runner_cmd
        .clone()
        .or_else(|| env::var(RUNNER_CMD_ENV).ok())
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| format!("No analysis command: pass --runner-cmd or set {}", RUNNER_CMD_ENV))?;
    info!("Analysis command: {}", command);
    Ok(Arc::new(CommandRunner::new(command)))
}

/// Reads work keys, one per line. `KEY,Display Name` sets a label;
/// blank lines and `#` comments are ignored.
fn read_work_keys(path: &Path) -> Result<Vec<WorkKey>, Box<dyn std::error::Error>> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("Could not read keys file '{}': {}", path.display(), e))?;

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| match line.split_once(',') {
            Some((key, name)) => WorkKey::new(key.trim(), name.trim()),
            None => WorkKey::from(line),
        })
        .collect())
}

fn print_run(run: &WorkflowRun) {
    println!();
    println!("Run:       {}", run.run_id);
    println!("Workflow:  {}", run.workflow_id);
    println!("Status:    {}", run.status);
    println!(
        "Progress:  {}/{} steps ({:.0}%)",
        run.current_step_index,
        run.total_steps,
        run.progress() * 100.0
    );
    if let Some(step) = &run.last_successful_step {
        println!("Last step: {}", step);
    }
    if let Some(err) = run.last_error() {
        println!("Error:     [{}] {}", err.step_id, err.message);
    }
}

fn run_workflow(
    engine: &WorkflowEngine,
    workflow_id: &str,
    run_id: Option<&str>,
    resume: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let run = engine.execute_workflow(workflow_id, run_id, resume)?;
    print_run(&run);

    match run.status {
        RunStatus::Completed => Ok(()),
        status => Err(format!(
            "Run {} ended {}; continue it with: analysisrunner resume {} {}",
            run.run_id, status, workflow_id, run.run_id
        )
        .into()),
    }
}

fn run_batch(queue: &BatchQueue, batch_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let status = queue.run_blocking(batch_id)?;
    let job = queue.job(batch_id)?;

    println!();
    println!("Batch:     {} ({})", job.batch_id, job.name);
    println!("Status:    {}", status);
    println!(
        "Items:     {} completed, {} failed, {} skipped, {} pending",
        job.completed_items,
        job.failed_items,
        job.skipped_items,
        job.pending_items()
    );
    for item in queue.items(batch_id)?.iter().filter(|i| i.error_message.is_some()) {
        println!(
            "  {} [{}] {}",
            item.display_name,
            item.status.as_str(),
            item.error_message.as_deref().unwrap_or_default()
        );
    }

    match status {
        BatchStatus::Completed => Ok(()),
        BatchStatus::Failed => Err(job
            .error_message
            .unwrap_or_else(|| "batch failed".to_string())
            .into()),
        other => {
            warn!("Batch {} ended {}", batch_id, other);
            Ok(())
        }
    }
}

fn show_status(store: &dyn JobStore, id: &str) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(run) = store.get_run(id)? {
        print_run(&run);
        for log in store.logs(id)? {
            println!(
                "  {} {:<12} {:?} {}",
                log.timestamp.format("%H:%M:%S"),
                log.step_id,
                log.level,
                log.message
            );
        }
        return Ok(());
    }

    if let Some(job) = store.get_batch(id)? {
        let counts = store.item_counts(id)?;
        println!();
        println!("Batch:     {} ({})", job.batch_id, job.name);
        println!("Status:    {}", job.status);
        println!(
            "Items:     {} total, {} completed, {} failed, {} skipped, {} remaining",
            counts.total,
            counts.completed,
            counts.failed,
            counts.skipped,
            counts.remaining()
        );
        if let Some(eta) = job.estimated_completion {
            println!("ETA:       {}", eta.format("%Y-%m-%d %H:%M UTC"));
        }
        return Ok(());
    }

    Err(format!("No run or batch with id '{}'", id).into())
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    let store = Arc::new(FileJobStore::open(&config.store_dir)?);
    info!("Job store: {}", store.root().display());

    let Some(command) = config.command.as_ref() else {
        return Err("Missing command".into());
    };

    if let Command::Status { id } = command {
        return show_status(store.as_ref(), id);
    }

    let runner = build_runner(&config)?;
    let registry = Arc::new(CancellationRegistry::new());

    match command {
        Command::Run { workflow_path } => {
            info!("Loading workflow: {}", workflow_path);
            let workflow = load_workflow(workflow_path).map_err(|e| {
                error!("Failed to load workflow: {}", e);
                format!("Could not load workflow from '{}': {}", workflow_path, e)
            })?;

            for (step_id, shape) in estimate_shapes(&workflow) {
                info!("  {:<20} -> {}", step_id, shape);
            }

            let mut engine = WorkflowEngine::new(store, runner, registry);
            engine.set_export_dir(&config.export_dir);
            engine.set_max_workers(config.max_workers);
            engine.register_workflow(&workflow)?;
            run_workflow(&engine, &workflow.id, None, false)
        }
        Command::Resume {
            workflow_id,
            run_id,
        } => {
            let mut engine = WorkflowEngine::new(store, runner, registry);
            engine.set_export_dir(&config.export_dir);
            engine.set_max_workers(config.max_workers);
            run_workflow(&engine, workflow_id, Some(run_id), true)
        }
        Command::Batch { keys_path } => {
            let path = Path::new(keys_path);
            let keys = read_work_keys(path)?;
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "batch".to_string());

            let pool = Arc::new(DailyKeyPool::new(config.keys.clone(), config.daily_limit));
            let queue = BatchQueue::new(store, runner, pool, registry);
            let batch_config =
                BatchConfig::new(AnalysisConfig::default()).with_max_retries(config.max_retries);
            let job = queue.create_batch(&name, keys, batch_config)?;
            info!("Batch {} created; restart it later with: batch-start {}", job.batch_id, job.batch_id);
            run_batch(&queue, &job.batch_id)
        }
        Command::BatchStart { batch_id } => {
            let pool = Arc::new(DailyKeyPool::new(config.keys.clone(), config.daily_limit));
            let queue = BatchQueue::new(store, runner, pool, registry);
            run_batch(&queue, batch_id)
        }
        Command::Status { .. } => Ok(()),
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
