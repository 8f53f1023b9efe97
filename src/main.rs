use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{debug, error, info, warn};

mod agent;
mod agent_models;
mod artifact_io;
mod config;
mod default_config;
mod deterministic;
mod error;
mod git_ops;
mod github;
mod logging;
mod patterns;
mod state;
mod workflow;

#[cfg(test)]
#[path = "../tests/unit/support.rs"]
mod test_support;

use agent::{AgentInvoker, ClaudeCli, RetryPolicy};
use agent_models::ModelRouting;
use config::AdwConfig;
use error::{AdwError, Result};
use git_ops::GitCli;
use github::GhCli;
use logging::{LogGuard, execution_log_path, init_logging};
use state::{FileStateRepository, RunState, StateRepository, new_run_id, validate_run_id};
use workflow::{PhaseContext, TestPhaseOptions, Workspace};

#[derive(Parser, Debug)]
#[command(name = "adw")]
#[command(version, about = "Plan, build and test GitHub issues with Claude Code agents", long_about = None)]
struct Cli {
    /// Config file layered over the built-in defaults (else ./adw.toml)
    #[arg(long, global = true, env = "ADW_CONFIG")]
    config: Option<PathBuf>,

    /// Debug-level logging unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Classify the issue, create its branch and write an implementation plan
    Plan {
        issue_number: String,
        /// Reuse or name the run instead of generating an ID
        #[arg(long)]
        adw_id: Option<String>,
    },
    /// Implement the run's plan, commit and push
    Build {
        issue_number: String,
        adw_id: String,
        /// Run inside the run's registered git worktree
        #[arg(long)]
        isolated: bool,
    },
    /// Ensure planned tests exist, then run and resolve unit and E2E tests
    Test {
        issue_number: String,
        adw_id: String,
        #[arg(long)]
        skip_e2e: bool,
        #[arg(long)]
        isolated: bool,
    },
    /// Print a run's stored state as JSON
    State { adw_id: String },
}

fn workspace(isolated: bool) -> Workspace {
    if isolated {
        Workspace::Isolated
    } else {
        Workspace::Main
    }
}

/// Real collaborators for one phase invocation.
struct Runtime {
    config: AdwConfig,
    project_root: PathBuf,
    states: FileStateRepository,
    agents: AgentInvoker,
    tracker: GhCli,
    git: GitCli,
}

impl Runtime {
    fn new(config: AdwConfig, project_root: PathBuf) -> Self {
        let agents_root = config.agents_root(&project_root);
        let agents = AgentInvoker::new(
            Box::new(ClaudeCli::new(&config.agent, &agents_root)),
            ModelRouting::from_config(&config.models),
            RetryPolicy::from_config(&config.agent.retry),
        );
        Self {
            states: FileStateRepository::new(&agents_root),
            agents,
            tracker: GhCli::from_env(),
            git: GitCli,
            config,
            project_root,
        }
    }

    fn ctx(&self) -> PhaseContext<'_> {
        PhaseContext {
            config: &self.config,
            project_root: &self.project_root,
            states: &self.states,
            agents: &self.agents,
            tracker: &self.tracker,
            git: &self.git,
        }
    }
}

fn init_phase_logging(
    config: &AdwConfig,
    project_root: &Path,
    adw_id: &str,
    phase: &str,
    verbose: bool,
) -> Option<LogGuard> {
    let path = execution_log_path(&config.agents_root(project_root), adw_id, phase);
    match init_logging(Some(&path), verbose) {
        Ok(guard) => {
            if let Some(log_path) = &guard.log_path {
                debug!(path = %log_path.display(), "execution log attached");
            }
            Some(guard)
        }
        Err(err) => {
            eprintln!("warning: execution log unavailable at {}: {err}", path.display());
            None
        }
    }
}

fn check_run_id(adw_id: &str) -> Result<()> {
    validate_run_id(adw_id).map_err(AdwError::Precondition)
}

fn print_state(state: &RunState) -> Result<()> {
    println!("{}", state.to_pretty_json()?);
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let project_root = std::env::current_dir()?;
    let config = AdwConfig::load(cli.config.as_deref(), &project_root)?;

    match cli.command {
        Command::State { adw_id } => {
            if let Err(err) = init_logging(None, cli.verbose) {
                eprintln!("warning: logging unavailable: {err}");
            }
            check_run_id(&adw_id)?;
            let states = FileStateRepository::new(config.agents_root(&project_root));
            let state = states.load(&adw_id).ok_or_else(|| {
                AdwError::Precondition(format!("No state found for ADW ID: {adw_id}"))
            })?;
            print_state(&state)
        }
        Command::Plan {
            issue_number,
            adw_id,
        } => {
            let adw_id = adw_id.unwrap_or_else(new_run_id);
            check_run_id(&adw_id)?;
            let _log = init_phase_logging(
                &config,
                &project_root,
                &adw_id,
                workflow::plan::SUB_WORKFLOW,
                cli.verbose,
            );
            info!(adw_id = %adw_id, issue_number = %issue_number, "plan phase started");
            let runtime = Runtime::new(config, project_root);
            let state = workflow::run_plan(&runtime.ctx(), &issue_number, Some(adw_id.as_str()))?;
            print_state(&state)
        }
        Command::Build {
            issue_number,
            adw_id,
            isolated,
        } => {
            check_run_id(&adw_id)?;
            let workspace = workspace(isolated);
            let _log = init_phase_logging(
                &config,
                &project_root,
                &adw_id,
                workflow::build::sub_workflow_name(workspace),
                cli.verbose,
            );
            info!(adw_id = %adw_id, issue_number = %issue_number, ?workspace, "build phase started");
            let runtime = Runtime::new(config, project_root);
            let state = workflow::run_build(&runtime.ctx(), &issue_number, &adw_id, workspace)?;
            print_state(&state)
        }
        Command::Test {
            issue_number,
            adw_id,
            skip_e2e,
            isolated,
        } => {
            check_run_id(&adw_id)?;
            let options = TestPhaseOptions {
                skip_e2e,
                workspace: workspace(isolated),
            };
            let _log = init_phase_logging(
                &config,
                &project_root,
                &adw_id,
                workflow::test_phase::sub_workflow_name(options.workspace),
                cli.verbose,
            );
            info!(adw_id = %adw_id, issue_number = %issue_number, skip_e2e, "test phase started");
            let runtime = Runtime::new(config, project_root);
            let summary = workflow::run_test(&runtime.ctx(), &issue_number, &adw_id, options)?;
            print_state(&summary.state)?;
            if !summary.all_passed() {
                warn!(
                    adw_id = %adw_id,
                    unit_failures = summary.unit_failures(),
                    e2e_failures = summary.e2e_failures(),
                    "test phase finished with failures"
                );
            }
            summary.into_result().map(|_| ())
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "phase failed");
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}
