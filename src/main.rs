//! PlayRunner CLI Entry Point
//!
//! Validates a playbook or walks it with the built-in dry-run executor.
//!
//! # Usage
//!
//! ```bash
//! # Walk a playbook in dry-run mode
//! playrunner playbook.yaml
//!
//! # Only validate the definition
//! playrunner playbook.yaml --validate
//!
//! # Persist run state as JSON documents
//! playrunner playbook.yaml --state-dir /var/lib/playrunner
//!
//! # Tighter limits
//! playrunner playbook.yaml --step-timeout 30 --max-stack-depth 16
//! ```

use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use uuid::Uuid;

use playrunner::execution::{DryRunExecutor, Engine, EngineConfig};
use playrunner::monitoring::RecordingMetrics;
use playrunner::store::{FileRunStore, MemoryRunStore, RunStore};
use playrunner::workflow::parser::read_definition_file;
use playrunner::workflow::validator::unreachable_sequences;
use playrunner::workflow::{RunOutcome, DEFAULT_MAX_STACK_DEPTH};
use playrunner::{APP_NAME, VERSION};

/// Default playbook file used when none is specified.
const DEFAULT_PLAYBOOK: &str = "playbook.yaml";

/// Default step timeout in seconds.
const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    playbook_path: String,
    validate_only: bool,
    state_dir: Option<String>,
    step_timeout_secs: u64,
    max_stack_depth: usize,
    group: Option<String>,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            playbook_path: DEFAULT_PLAYBOOK.to_string(),
            validate_only: false,
            state_dir: None,
            step_timeout_secs: DEFAULT_STEP_TIMEOUT_SECS,
            max_stack_depth: DEFAULT_MAX_STACK_DEPTH,
            group: None,
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
    println!("Durable Playbook Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: playrunner [OPTIONS] <PLAYBOOK_FILE>");
    println!();
    println!("Arguments:");
    println!("  <PLAYBOOK_FILE>        Path to playbook YAML file");
    println!();
    println!("Options:");
    println!("  --validate             Validate the playbook and exit");
    println!("  --state-dir PATH       Persist runs as JSON files under PATH");
    println!(
        "  --step-timeout SECS    Deadline for each step (default: {})",
        DEFAULT_STEP_TIMEOUT_SECS
    );
    println!(
        "  --max-stack-depth N    Maximum nested calls (default: {})",
        DEFAULT_MAX_STACK_DEPTH
    );
    println!("  --group ID             Run as a member of group ID");
    println!("  --verbose              Enable debug logging");
    println!("  --help                 Show this help message");
    println!("  --version              Show version information");
    println!();
    println!("Examples:");
    println!("  playrunner playbook.yaml");
    println!("  playrunner playbook.yaml --validate");
    println!("  playrunner playbook.yaml --state-dir ./runs --step-timeout 30");
}

/// Returns the value following option `args[*i]`.
fn option_value<'a>(args: &'a [String], i: &mut usize, what: &str) -> Result<&'a str, String> {
    let option = &args[*i];
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires {} argument", option, what))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positional_index = 0;
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
            "--validate" => {
                config.validate_only = true;
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--state-dir" => {
                config.state_dir = Some(option_value(args, &mut i, "a path")?.to_string());
            }
            "--group" => {
                config.group = Some(option_value(args, &mut i, "an id")?.to_string());
            }
            "--step-timeout" => {
                let value = option_value(args, &mut i, "a number")?;
                config.step_timeout_secs = value
                    .parse()
                    .map_err(|_| format!("Invalid step timeout: {}", value))?;
            }
            "--max-stack-depth" => {
                let value = option_value(args, &mut i, "a number")?;
                config.max_stack_depth = value
                    .parse()
                    .map_err(|_| format!("Invalid stack depth: {}", value))?;
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                match positional_index {
                    0 => config.playbook_path = arg.clone(),
                    _ => return Err(format!("Unexpected argument: {}", arg)),
                }
                positional_index += 1;
            }
        }
        i += 1;
    }

    Ok(config)
}

fn open_store(state_dir: Option<&str>) -> Result<Arc<dyn RunStore>, Box<dyn std::error::Error>> {
    match state_dir {
        Some(dir) => {
            let store = FileRunStore::open(dir)?;
            info!("Run state directory: {}", store.dir().display());
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryRunStore::new())),
    }
}

/// Main application entry point.
async fn run() -> Result<RunOutcome, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    let (serialized, definition) = read_definition_file(&config.playbook_path).map_err(|e| {
        error!("Failed to load playbook: {}", e);
        format!(
            "Could not load playbook from '{}': {}",
            config.playbook_path, e
        )
    })?;

    for sequence in unreachable_sequences(&definition) {
        warn!("Sequence '{}' is never called", sequence);
    }

    if config.validate_only {
        println!(
            "Playbook is valid: {} sequences, {} actions",
            definition.sequences.len(),
            definition.action_count()
        );
        return Ok(RunOutcome::Succeeded);
    }

    info!("Mode: DRY RUN (steps are logged, not executed)");
    println!();

    let store = open_store(config.state_dir.as_deref())?;
    let executor = Arc::new(DryRunExecutor::new());
    let metrics = Arc::new(RecordingMetrics::new());

    let mut engine = Engine::new(store, executor.clone());
    engine.set_metrics(metrics.clone());
    engine.set_config(EngineConfig {
        step_timeout: Duration::from_secs(config.step_timeout_secs),
        max_stack_depth: config.max_stack_depth,
        ..EngineConfig::default()
    });
    let engine = Arc::new(engine);
    let event_loop = tokio::spawn(Arc::clone(&engine).run_event_loop());

    let run_id = Uuid::new_v4().to_string();
    engine.create_run(&run_id, &serialized, config.group.as_deref())?;
    engine.start_executing(&run_id).await?;
    let run = engine.wait_for_final(&run_id).await?;
    event_loop.abort();

    println!();
    let outcome = match run.result() {
        Some(result) => {
            match &result.problem {
                Some(problem) => error!("Run {} finished {}: {}", run_id, result.outcome, problem),
                None => info!("Run {} finished {}", run_id, result.outcome),
            }
            result.outcome
        }
        None => RunOutcome::Faulted,
    };

    println!("{}", metrics.summary());
    info!("Steps walked: {}", executor.executed().len());

    Ok(outcome)
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(RunOutcome::Succeeded) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
