use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use phase_bench::bench_error::BenchError;
use phase_bench::log::LogLevel;
use phase_bench::runner::{RunParams, Runner};
use phase_bench::sandbox::{PySandbox, DEFAULT_INTERPRETER};
use phase_bench::task;
use phase_bench::types::RunOutcome;
use phase_bench::workspace::{install_signal_handlers, spawn_stdin_quit_watcher, Workspace};
use phase_bench::{log_error, log_info, rules};

/// Exit code for configuration and usage errors. Run outcomes map to their
/// own codes via `RunOutcome::exit_code`.
const EXIT_CONFIG: i32 = 1;

#[derive(Parser)]
#[command(name = "phase-bench", about = "Multi-phase hidden-requirement benchmark runner")]
struct Cli {
    /// Log verbosity level
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enumerate tasks in a directory
    List {
        /// Directory containing one subdirectory per task
        #[arg(long)]
        tasks_dir: PathBuf,
        /// Emit machine-readable JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Structurally validate a task directory
    Validate {
        /// Task directory
        #[arg(long)]
        task: PathBuf,
    },
    /// Execute one task against one agent workspace
    Run {
        /// Task directory
        #[arg(long)]
        task: PathBuf,
        /// Workspace directory (created if missing, exclusively owned)
        #[arg(long)]
        workspace: PathBuf,
        /// Identifier recorded in the run report
        #[arg(long, default_value = "anonymous")]
        agent_id: String,
        /// Seconds between solution polls in interactive mode
        #[arg(long, default_value = "0.5")]
        poll_interval: f64,
        /// Evaluate the existing solution once and stop
        #[arg(long)]
        single: bool,
        /// Interpreter binary for executed code
        #[arg(long, default_value = DEFAULT_INTERPRETER)]
        interpreter: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    phase_bench::log::set_threshold(cli.log_level);

    let result = match cli.command {
        Commands::List { tasks_dir, json } => handle_list(&tasks_dir, json),
        Commands::Validate { task } => handle_validate(&task),
        Commands::Run {
            task,
            workspace,
            agent_id,
            poll_interval,
            single,
            interpreter,
        } => {
            handle_run(
                &task,
                &workspace,
                agent_id,
                poll_interval,
                single,
                &interpreter,
            )
            .await
        }
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(EXIT_CONFIG);
        }
    }
}

fn handle_list(tasks_dir: &std::path::Path, json: bool) -> Result<i32, String> {
    let summaries = task::list_tasks(tasks_dir)?;

    if json {
        let out = serde_json::to_string_pretty(&summaries)
            .map_err(|e| format!("Failed to serialize task list: {}", e))?;
        println!("{}", out);
        return Ok(0);
    }

    if summaries.is_empty() {
        println!("No tasks found in {}", tasks_dir.display());
        return Ok(0);
    }

    println!("{:<20} {:<30} {:<10} {}", "ID", "NAME", "DIFFICULTY", "PHASES");
    for s in &summaries {
        println!(
            "{:<20} {:<30} {:<10} {}",
            s.task_id, s.name, s.difficulty, s.phases
        );
    }
    Ok(0)
}

fn handle_validate(task_dir: &std::path::Path) -> Result<i32, String> {
    let loaded = task::load_task(task_dir)?;

    match task::validate_static(&loaded, rules::archetype_names()) {
        Ok(()) => {
            println!(
                "OK: {} ({} phases, {} tests)",
                loaded.config.task_id,
                loaded.config.phases.len(),
                loaded.tests.len()
            );
            Ok(0)
        }
        Err(errors) => Err(BenchError::Validation(errors).to_string()),
    }
}

async fn handle_run(
    task_dir: &std::path::Path,
    workspace_dir: &std::path::Path,
    agent_id: String,
    poll_interval: f64,
    single: bool,
    interpreter: &str,
) -> Result<i32, String> {
    if poll_interval <= 0.0 {
        return Err("--poll-interval must be positive".to_string());
    }

    install_signal_handlers()?;

    let loaded = task::load_task(task_dir)?;
    task::validate_static(&loaded, rules::archetype_names())
        .map_err(|errors| BenchError::Validation(errors).to_string())?;

    let workspace = Workspace::open(workspace_dir)?;
    let sandbox = PySandbox::new(interpreter);

    log_info!("--- phase-bench ---");
    log_info!("[task] {} ({})", loaded.config.task_id, loaded.config.name);
    log_info!(
        "[task] {} phases, timeout {:.1}s, limits {}/{} attempts",
        loaded.config.phases.len(),
        loaded.config.execution.timeout_seconds,
        loaded.config.limits.max_attempts_per_phase,
        loaded.config.limits.max_total_attempts
    );
    log_info!("[workspace] {}", workspace.dir().display());
    if single {
        log_info!("[mode] single: evaluating the existing solution once");
    } else {
        log_info!("[mode] interactive: press q + enter (or Ctrl-C) to quit");
        spawn_stdin_quit_watcher();
    }

    let params = RunParams {
        agent_id,
        poll_interval: Duration::from_secs_f64(poll_interval),
        single,
    };

    let cancel = CancellationToken::new();
    let report = match Runner::new(&loaded, &sandbox, &workspace, params)
        .run(&cancel)
        .await
    {
        Ok(report) => report,
        Err(e) => {
            log_error!("Run failed: {}", e);
            return Ok(RunOutcome::Error.exit_code());
        }
    };

    log_info!("");
    log_info!(
        "[done] {}: {} phases completed, {} attempts, {:.1}s",
        report.overall.status,
        report.overall.phases_completed,
        report.overall.total_attempts,
        report.overall.total_duration_seconds
    );
    log_info!(
        "[done] Report written to {}",
        workspace.dir().join(phase_bench::workspace::REPORT_FILE).display()
    );

    Ok(report.overall.status.exit_code())
}
