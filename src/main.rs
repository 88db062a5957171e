use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};

use keystone::core::dag::TaskGraph;
use keystone::core::task::TaskStatus;
use keystone::execution::{
    ApproveAll, DecisionProvider, DispatchMode, LogAction, MockMarketplace, NoopSideEffect,
    Projection, SideEffect,
};
use keystone::terminal::TerminalDecisions;
use keystone::util::block_on_detached;
use keystone::{
    klog, klog_warn, Config, Coordinator, ExecuteOptions, ExecutionReport, ProjectStore, Result,
};

/// Keystone - task execution engine for physical-world projects
#[derive(Parser, Debug)]
#[command(name = "keystone")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    KEYSTONE_DEBUG=1     Enable debug logging (alternative to --debug)\n    KEYSTONE_LOG=<level> Set the log level (error, warn, info, debug, trace)"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.keystone/keystone.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Execute a project's task plan
    Run {
        /// Path to the project JSON file
        project: PathBuf,

        /// Approve every gate without asking
        #[arg(long, short = 'y')]
        approve_all: bool,

        /// Walk the plan without side effects or saving
        #[arg(long)]
        dry_run: bool,

        /// Pick each task to run by hand
        #[arg(long, short = 'i')]
        interactive: bool,

        /// Offer plan edits after each round
        #[arg(long, short = 'm')]
        modify: bool,

        /// Side-effect adapter
        #[arg(long, value_enum, default_value_t = Adapter::Mock)]
        adapter: Adapter,

        /// Per-task timeout in seconds (overrides config)
        #[arg(long)]
        task_timeout: Option<u64>,
    },

    /// Check a project's plan and normalize its dependency links
    Validate {
        /// Path to the project JSON file
        project: PathBuf,
    },

    /// Show a project's phase and task states
    Status {
        /// Path to the project JSON file
        project: PathBuf,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adapter {
    /// In-memory labor marketplace
    Mock,
    /// Record evidence and do nothing else
    Noop,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    keystone::log::init_with_debug(cli.debug);
    if cli.debug {
        if let Some(path) = keystone::log::path() {
            eprintln!("Debug log: {}", path.display());
        }
    }

    let result = match cli.command {
        Command::Run {
            project,
            approve_all,
            dry_run,
            interactive,
            modify,
            adapter,
            task_timeout,
        } => {
            let options = ExecuteOptions {
                dispatch: if interactive {
                    DispatchMode::Interactive
                } else {
                    DispatchMode::Batch
                },
                approve_all,
                dry_run,
                modify,
            };
            run_project(&project, options, adapter, task_timeout)
        }
        Command::Validate { project } => run_validate(&project),
        Command::Status { project } => run_status(&project),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_project(
    path: &Path,
    options: ExecuteOptions,
    adapter: Adapter,
    task_timeout: Option<u64>,
) -> Result<u8> {
    klog!(
        "Run command: project={}, adapter={:?}, options={:?}",
        path.display(),
        adapter,
        options
    );

    let mut config = Config::load()?;
    if let Some(secs) = task_timeout {
        config.engine.task_timeout_secs = secs;
    }
    config.validate()?;

    let project = ProjectStore::load_sync(path)?;
    println!("Project: {} ({})", project.name, project.id);
    println!("Phase:   {}", project.phase());
    println!();

    let side_effect: Arc<dyn SideEffect> = match adapter {
        Adapter::Mock => Arc::new(MockMarketplace::new()),
        Adapter::Noop => Arc::new(NoopSideEffect),
    };
    let decisions: Arc<dyn DecisionProvider> = if options.approve_all
        && options.dispatch == DispatchMode::Batch
        && !options.modify
    {
        Arc::new(ApproveAll)
    } else {
        Arc::new(TerminalDecisions)
    };
    let coordinator = Coordinator::new(side_effect, decisions, config);

    let report = block_on_detached(async {
        let cancel = coordinator.cancellation_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                klog!("Interrupt received, cancelling run");
                eprintln!("\nInterrupt received, finishing in-flight tasks...");
                cancel.cancel();
            }
        });
        coordinator.execute(project, &options).await
    })?;

    print_report(&report);

    if options.dry_run {
        println!("\nDry run: project file left unchanged.");
    } else if let Err(e) = ProjectStore::save_sync(&report.project, path) {
        klog_warn!("Failed to save project: {}", e);
        eprintln!("Warning: failed to save project: {}", e);
    }

    Ok(report.exit_code() as u8)
}

fn print_report(report: &ExecutionReport) {
    println!();
    for entry in &report.entries {
        let marker = match entry.action {
            LogAction::Started => "->",
            LogAction::Completed => "ok",
            LogAction::Failed => "!!",
            LogAction::Paused => "..",
            LogAction::Resumed => "<-",
        };
        let worker = entry
            .worker
            .as_deref()
            .map(|w| format!(" ({})", w))
            .unwrap_or_default();
        println!("  {} {}{}", marker, entry.description, worker);
    }

    println!();
    println!("Outcome: {}", report.outcome);
    println!("Phase:   {}", report.project.phase());
    for warning in &report.warnings {
        println!("Warning: {}", warning);
    }
    if !report.unreachable.is_empty() {
        let ids: Vec<&str> = report.unreachable.iter().map(|id| id.as_str()).collect();
        println!("Unreachable: {}", ids.join(", "));
    }
}

fn run_validate(path: &Path) -> Result<u8> {
    klog!("Validate command: project={}", path.display());
    let project = ProjectStore::load_sync(path)?;
    let plan = project.plan()?;

    let graph = TaskGraph::from_plan(plan);
    if let Err(e) = graph.validate() {
        println!("Invalid plan: {}", e);
        return Ok(1);
    }

    println!(
        "Plan OK: {} tasks, {} dependencies, {:.1}h, {:.2} {}",
        graph.task_count(),
        graph.dependency_count(),
        plan.total_hours(),
        plan.total_cost(),
        project.budget.currency
    );
    ProjectStore::save_sync(&project, path)?;
    Ok(0)
}

fn run_status(path: &Path) -> Result<u8> {
    klog!("Status command: project={}", path.display());
    let project = ProjectStore::load_sync(path)?;
    let plan = project.plan()?;

    println!("Project: {} ({})", project.name, project.id);
    println!(
        "Phase:   {} ({:?})",
        project.phase(),
        project.phase().stage()
    );
    println!();
    for task in &plan.tasks {
        println!("  {:<12} {} [{}]", task.status.to_string(), task.name, task.id);
    }

    let projection = Projection::from_tasks(&plan.tasks);
    println!();
    println!(
        "Completed: {}  Failed: {}  Blocked: {}",
        projection.completed.len(),
        projection.failed.len(),
        projection.blocked.len()
    );
    println!(
        "Log:       {} entries, {} started, {} failed",
        project.state.execution_log.len(),
        project.state.execution_log.count(LogAction::Started),
        project.state.execution_log.count(LogAction::Failed)
    );

    let graph = TaskGraph::from_plan(plan);
    let unreachable = graph.unreachable();
    if !unreachable.is_empty() {
        let ids: Vec<&str> = unreachable.iter().map(|id| id.as_str()).collect();
        println!("Unreachable: {}", ids.join(", "));
    }
    let pending = plan
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .count();
    println!("Pending: {}", pending);
    Ok(0)
}
