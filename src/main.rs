//! PromptChain CLI Entry Point
//!
//! Provides command-line interface for running prompt chains.
//!
//! # Usage
//!
//! ```bash
//! # Run a chain
//! promptchain chain.yaml --input text="Rust is fast"
//!
//! # Read initial input from a YAML map
//! promptchain chain.yaml --inputs-file inputs.yaml
//!
//! # Dry run mode (echo rendered prompts instead of calling a backend)
//! promptchain chain.yaml --input text=hello --dry-run
//!
//! # Cap cost and step time
//! promptchain chain.yaml --inputs-file inputs.yaml --max-cost 0.25 --timeout 30
//! ```

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use log::{error, info, warn};

use promptchain::config::DEFAULT_STORE_DIR;
use promptchain::execution::StepSnapshot;
use promptchain::monitoring::ExecutionTimeline;
use promptchain::workflow::load_initial_input;
use promptchain::{
    load_workflow, EchoInvoker, EngineConfig, ExecutionSnapshot, FileStore, Gateway, HttpInvoker,
    InitialInput, RunStatus, StepInvoker, StepStatus, APP_NAME, VERSION,
};

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    workflow_path: Option<String>,
    inputs: Vec<(String, String)>,
    inputs_file: Option<PathBuf>,
    timeout_secs: Option<u64>,
    max_cost: Option<f64>,
    store_dir: Option<PathBuf>,
    strict: bool,
    dry_run: bool,
    verbose: bool,
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
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Prompt Workflow Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: promptchain [OPTIONS] <WORKFLOW_FILE>");
    println!();
    println!("Arguments:");
    println!("  <WORKFLOW_FILE>       Path to workflow YAML file");
    println!();
    println!("Options:");
    println!("  --input NAME=VALUE    Initial input value (repeatable)");
    println!("  --inputs-file FILE    YAML map of initial input values");
    println!("  --timeout SECS        Default per-step timeout (default: 60)");
    println!("  --max-cost X          Default aggregate cost ceiling");
    println!("  --store-dir PATH      Record store directory (default: {})", DEFAULT_STORE_DIR.display());
    println!("  --strict              Require every template variable to be mapped");
    println!("  --dry-run             Echo rendered prompts instead of calling a backend");
    println!("  --verbose             Enable debug logging");
    println!("  --help                Show this help message");
    println!("  --version             Show version information");
    println!();
    println!("Backend (HTTP, OpenAI-compatible):");
    println!("  PROMPTCHAIN_API_BASE, PROMPTCHAIN_API_KEY, PROMPTCHAIN_MODEL,");
    println!("  PROMPTCHAIN_INPUT_COST_PER_1K, PROMPTCHAIN_OUTPUT_COST_PER_1K");
    println!();
    println!("Examples:");
    println!("  promptchain chain.yaml --input text=\"hello world\"");
    println!("  promptchain chain.yaml --inputs-file inputs.yaml --dry-run");
    println!("  promptchain chain.yaml --inputs-file inputs.yaml --max-cost 0.25");
}

/// Returns the value following an option, advancing the cursor.
fn option_value<'a>(args: &'a [String], i: &mut usize, option: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires a value", option))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
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
            "--dry-run" => {
                config.dry_run = true;
            }
            "--strict" => {
                config.strict = true;
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--input" | "-i" => {
                let pair = option_value(args, &mut i, "--input")?;
                let (name, value) = pair
                    .split_once('=')
                    .ok_or_else(|| format!("Invalid input '{}', expected NAME=VALUE", pair))?;
                if name.trim().is_empty() {
                    return Err(format!("Invalid input '{}', name is empty", pair));
                }
                config.inputs.push((name.trim().to_string(), value.to_string()));
            }
            "--inputs-file" => {
                config.inputs_file = Some(PathBuf::from(option_value(args, &mut i, "--inputs-file")?));
            }
            "--timeout" => {
                let value = option_value(args, &mut i, "--timeout")?;
                config.timeout_secs = Some(
                    value
                        .parse()
                        .map_err(|_| format!("Invalid timeout value: {}", value))?,
                );
            }
            "--max-cost" => {
                let value = option_value(args, &mut i, "--max-cost")?;
                let max_cost: f64 = value
                    .parse()
                    .map_err(|_| format!("Invalid max cost value: {}", value))?;
                if !max_cost.is_finite() || max_cost < 0.0 {
                    return Err(format!("Invalid max cost value: {}", value));
                }
                config.max_cost = Some(max_cost);
            }
            "--store-dir" => {
                config.store_dir = Some(PathBuf::from(option_value(args, &mut i, "--store-dir")?));
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.workflow_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.workflow_path = Some(arg.clone());
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Merges the inputs file with `--input` values; the latter win.
fn collect_inputs(config: &Config) -> Result<InitialInput, Box<dyn std::error::Error>> {
    let mut inputs = match &config.inputs_file {
        Some(path) => {
            info!("Loading inputs: {}", path.display());
            load_initial_input(path)?
        }
        None => BTreeMap::new(),
    };

    for (name, value) in &config.inputs {
        inputs.insert(name.clone(), value.clone());
    }
    Ok(inputs)
}

fn status_label(status: StepStatus) -> colored::ColoredString {
    match status {
        StepStatus::Pending => "PENDING".dimmed(),
        StepStatus::Running => "RUNNING".cyan(),
        StepStatus::Completed => "DONE".green(),
        StepStatus::Failed => "FAILED".red().bold(),
        StepStatus::Skipped => "SKIPPED".yellow(),
    }
}

/// Prints one line per step whose status changed since the last snapshot.
fn print_step_changes(total: usize, seen: &mut Vec<StepStatus>, snapshot: &ExecutionSnapshot) {
    seen.resize(snapshot.steps.len(), StepStatus::Pending);

    for step in &snapshot.steps {
        if seen[step.position] == step.status {
            continue;
        }
        seen[step.position] = step.status;
        println!(
            "  [{}/{}] {:<20} {}{}",
            step.position + 1,
            total,
            step.step_id,
            status_label(step.status),
            step_detail(step)
        );
    }
}

fn step_detail(step: &StepSnapshot) -> String {
    match (step.status, &step.error) {
        (StepStatus::Completed, _) => format!(
            "  ({} ms, {} tokens)",
            step.duration_ms.unwrap_or(0),
            step.tokens.unwrap_or(0)
        ),
        (StepStatus::Failed, Some(failure)) => format!("  {}", failure.message),
        _ => String::new(),
    }
}

fn print_summary(snapshot: &ExecutionSnapshot) {
    println!();
    let status = match snapshot.status {
        RunStatus::Completed => snapshot.status.to_string().green().bold(),
        RunStatus::Cancelled => snapshot.status.to_string().yellow().bold(),
        _ => snapshot.status.to_string().red().bold(),
    };
    println!("Execution {}: {}", snapshot.execution_id, status);
    println!(
        "Tokens: {}   Cost: {:.4}",
        snapshot.total_tokens, snapshot.total_cost
    );

    if let Some(failure) = &snapshot.error {
        println!("Reason: {}", failure.message);
    }

    let timeline = ExecutionTimeline::from_snapshot(snapshot);
    print!("{}", timeline.gantt_chart());
    if let Some((step_id, ms)) = slowest_step(&timeline) {
        println!("Slowest step: {} ({} ms)", step_id, ms);
    }

    if let Some(output) = &snapshot.final_output {
        println!();
        println!("{}", "Final output:".bold());
        println!("{}", output);
    }
}

fn slowest_step(timeline: &ExecutionTimeline) -> Option<(String, u64)> {
    timeline
        .durations()
        .into_iter()
        .max_by_key(|(_, ms)| *ms)
}

/// Starts the chain and follows it to a terminal state.
async fn execute(config: Config, workflow_path: String) -> Result<ExecutionSnapshot, Box<dyn std::error::Error>> {
    // Load workflow
    info!("Loading workflow: {}", workflow_path);
    let workflow = load_workflow(&workflow_path).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        format!("Could not load workflow from '{}': {}", workflow_path, e)
    })?;
    info!(
        "Workflow loaded: '{}' with {} steps",
        workflow.display_name(),
        workflow.len()
    );

    let inputs = collect_inputs(&config)?;

    // Engine configuration
    let mut engine_config = EngineConfig::new();
    if let Some(secs) = config.timeout_secs {
        engine_config.set_default_step_timeout(Duration::from_secs(secs));
    }
    engine_config.set_default_cost_ceiling(config.max_cost);
    engine_config.set_strict_mappings(config.strict);

    let store_dir = config
        .store_dir
        .clone()
        .unwrap_or_else(|| DEFAULT_STORE_DIR.clone());
    let store = FileStore::open(store_dir).await?;

    let invoker: Arc<dyn StepInvoker> = if config.dry_run {
        info!("Mode: DRY RUN (prompts are echoed back)");
        Arc::new(EchoInvoker::new())
    } else {
        let http = HttpInvoker::from_env();
        info!("Backend model: {}", http.model());
        Arc::new(http)
    };

    let gateway = Gateway::new(Arc::new(store), invoker, engine_config);
    gateway.register_workflow(&workflow).await?;

    let id = gateway.start(&workflow.id, inputs).await?;
    println!();
    println!("Execution {} started", id);

    let total = workflow.len();
    let mut seen = Vec::new();

    if let Some(mut progress) = gateway.subscribe(id) {
        print_step_changes(total, &mut seen, &progress.current());

        let mut interrupted = false;
        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c(), if !interrupted => {
                    interrupted = true;
                    match signal {
                        Ok(()) => {
                            warn!("Interrupted, cancelling after the current step");
                            gateway.cancel(id).await?;
                        }
                        Err(e) => warn!("Could not listen for Ctrl-C: {}", e),
                    }
                }
                next = progress.next() => match next {
                    Some(snapshot) => print_step_changes(total, &mut seen, &snapshot),
                    None => break,
                },
            }
        }
    }

    let snapshot = gateway.wait_for_completion(id).await?;
    print_step_changes(total, &mut seen, &snapshot);
    Ok(snapshot)
}

/// Main application entry point.
fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    let Some(workflow_path) = config.workflow_path.clone() else {
        eprintln!("Error: no workflow file given");
        eprintln!();
        print_usage();
        return Err("missing <WORKFLOW_FILE>".into());
    };

    // Setup logging
    setup_logging(config.verbose);

    // Print banner
    print_banner();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let snapshot = runtime.block_on(execute(config, workflow_path))?;
    print_summary(&snapshot);

    Ok(snapshot.status == RunStatus::Completed)
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
