use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::agent::{AgentCommand, AgentInvoker, AgentResponse};
use crate::config::AdwConfig;
use crate::error::{AdwError, Result};
use crate::git_ops::GitOps;
use crate::github::{Issue, IssueTracker, format_issue_message};
use crate::state::{IssueClass, RunState, RunStatePatch, StateRepository};

pub mod build;
pub mod plan;
mod test_doctor;
pub mod test_phase;
mod test_runner;
mod test_writer;

pub use build::run_build;
pub use plan::run_plan;
pub use test_phase::{TestPhaseOptions, TestPhaseSummary, run_test};

pub const AGENT_OPS: &str = "ops";
pub const AGENT_CLASSIFIER: &str = "issue_classifier";
pub const AGENT_BRANCH_GENERATOR: &str = "branch_generator";
pub const AGENT_PLANNER: &str = "sdlc_planner";
pub const AGENT_IMPLEMENTOR: &str = "sdlc_implementor";
pub const AGENT_PR_CREATOR: &str = "pr_creator";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workspace {
    Main,
    Isolated,
}

/// Collaborators shared by every phase.
pub struct PhaseContext<'a> {
    pub config: &'a AdwConfig,
    pub project_root: &'a Path,
    pub states: &'a dyn StateRepository,
    pub agents: &'a AgentInvoker,
    pub tracker: &'a dyn IssueTracker,
    pub git: &'a dyn GitOps,
}

impl PhaseContext<'_> {
    pub fn comment(&self, state: &RunState, agent_name: &str, message: &str) {
        self.comment_with_session(state, agent_name, message, None);
    }

    /// Best effort: tracker failures are logged and never abort a phase.
    pub fn comment_with_session(
        &self,
        state: &RunState,
        agent_name: &str,
        message: &str,
        session_id: Option<&str>,
    ) {
        let Some(issue_number) = state.issue_number.as_deref() else {
            return;
        };
        let body = format_issue_message(&state.adw_id, agent_name, message, session_id);
        if let Err(err) = self.tracker.post_comment(issue_number, &body) {
            warn!(adw_id = %state.adw_id, error = %err, "failed to post issue comment");
        }
    }

    /// Logs and reports a fatal step failure, returning the error that halts
    /// the phase.
    pub fn fail(&self, state: &RunState, agent_name: &str, message: impl Into<String>) -> AdwError {
        let message = message.into();
        error!(adw_id = %state.adw_id, agent = agent_name, "{message}");
        self.comment(state, agent_name, &format!("❌ {message}"));
        AdwError::Agent(message)
    }

    pub fn save_state(&self, state: &RunState) -> Result<()> {
        self.states.save(state)?;
        info!(adw_id = %state.adw_id, "saved run state");
        Ok(())
    }

    pub fn post_state_snapshot(&self, state: &RunState, heading: &str) {
        match state.to_pretty_json() {
            Ok(json) => self.comment(state, AGENT_OPS, &format!("{heading}\n```json\n{json}\n```")),
            Err(err) => warn!(adw_id = %state.adw_id, error = %err, "failed to render state"),
        }
    }

    pub fn fetch_issue(&self, state: &RunState) -> Result<Issue> {
        let issue_number = state.issue_number.as_deref().ok_or_else(|| {
            AdwError::Precondition(format!("No issue number in state for {}", state.adw_id))
        })?;
        self.tracker.fetch_issue(issue_number).map_err(|err| {
            let message = format!("Failed to fetch issue #{issue_number}: {err}");
            error!(adw_id = %state.adw_id, "{message}");
            AdwError::Tracker(err)
        })
    }

    pub fn resolve_path(&self, base: Option<&Path>, relative: &str) -> PathBuf {
        let path = Path::new(relative);
        if path.is_absolute() {
            return path.to_path_buf();
        }
        base.unwrap_or(self.project_root).join(path)
    }

    /// Main workspace runs in the process directory; the isolated variant
    /// must run inside the run's registered worktree.
    pub fn working_dir(
        &self,
        state: &mut RunState,
        workspace: Workspace,
    ) -> Result<Option<PathBuf>> {
        if workspace == Workspace::Main {
            return Ok(None);
        }
        let Some(path) = state.working_directory().map(Path::to_path_buf) else {
            return Err(self.fail(
                state,
                AGENT_OPS,
                "Worktree validation failed: no worktree path in state",
            ));
        };
        if !path.is_dir() {
            return Err(self.fail(
                state,
                AGENT_OPS,
                format!("Worktree validation failed: {} does not exist", path.display()),
            ));
        }
        if !self.git.is_worktree(&path) {
            return Err(self.fail(
                state,
                AGENT_OPS,
                format!("Worktree validation failed: {} is not a git worktree", path.display()),
            ));
        }
        if state.backend_port.is_none() || state.frontend_port.is_none() {
            state.update(RunStatePatch {
                backend_port: state
                    .backend_port
                    .or(Some(self.config.worktree.backend_port)),
                frontend_port: state
                    .frontend_port
                    .or(Some(self.config.worktree.frontend_port)),
                ..RunStatePatch::default()
            });
            self.save_state(state)?;
        }
        Ok(Some(path))
    }
}

pub fn classify_issue(
    ctx: &PhaseContext<'_>,
    state: &RunState,
    issue: &Issue,
) -> std::result::Result<IssueClass, String> {
    let response = ctx.agents.invoke(
        state,
        AGENT_CLASSIFIER,
        AgentCommand::ClassifyIssue {
            issue_json: issue.to_prompt_json(),
        },
        None,
    );
    if !response.success {
        return Err(response.output);
    }
    IssueClass::find_in(&response.output)
        .ok_or_else(|| format!("Invalid command selected: {}", response.output.trim()))
}

/// Uses the stored classification, re-deriving it when absent. Classifier
/// failure degrades to `fallback`.
pub fn classification_or(
    ctx: &PhaseContext<'_>,
    state: &mut RunState,
    issue: &Issue,
    fallback: IssueClass,
) -> IssueClass {
    if let Some(class) = state.issue_class {
        return class;
    }
    let class = match classify_issue(ctx, state, issue) {
        Ok(class) => class,
        Err(err) => {
            warn!(adw_id = %state.adw_id, error = %err, fallback = fallback.slash_command(), "classification failed");
            fallback
        }
    };
    state.update(RunStatePatch {
        issue_class: Some(class),
        ..RunStatePatch::default()
    });
    class
}

pub fn generate_branch_name(
    ctx: &PhaseContext<'_>,
    state: &RunState,
    issue_class: IssueClass,
    issue: &Issue,
) -> std::result::Result<String, String> {
    let response = ctx.agents.invoke(
        state,
        AGENT_BRANCH_GENERATOR,
        AgentCommand::GenerateBranchName {
            issue_class,
            adw_id: state.adw_id.clone(),
            issue_json: issue.to_prompt_json(),
        },
        None,
    );
    if !response.success {
        return Err(response.output);
    }
    let branch = response
        .output
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .unwrap_or_default()
        .trim_matches('`')
        .to_string();
    if branch.is_empty() || branch.contains(char::is_whitespace) {
        return Err(format!("Invalid branch name: {:?}", response.output.trim()));
    }
    Ok(branch)
}

pub fn build_plan(
    ctx: &PhaseContext<'_>,
    state: &RunState,
    issue_class: IssueClass,
    issue: &Issue,
) -> AgentResponse {
    ctx.agents.invoke(
        state,
        AGENT_PLANNER,
        AgentCommand::Plan {
            issue_class,
            issue_number: state.issue_number.clone().unwrap_or_default(),
            adw_id: state.adw_id.clone(),
            issue_json: issue.to_prompt_json(),
        },
        None,
    )
}

pub fn implement_plan(
    ctx: &PhaseContext<'_>,
    state: &RunState,
    plan_file: &str,
    cwd: Option<&Path>,
) -> AgentResponse {
    ctx.agents.invoke(
        state,
        AGENT_IMPLEMENTOR,
        AgentCommand::Implement {
            plan_file: plan_file.to_string(),
        },
        cwd,
    )
}

/// Asks the commit agent for a message, then commits with it.
pub fn create_commit(
    ctx: &PhaseContext<'_>,
    state: &RunState,
    agent_name: &str,
    issue_class: IssueClass,
    issue: &Issue,
    cwd: Option<&Path>,
) -> std::result::Result<String, String> {
    let response = ctx.agents.invoke(
        state,
        &format!("{agent_name}_committer"),
        AgentCommand::Commit {
            agent_name: agent_name.to_string(),
            issue_class,
            issue_json: issue.to_prompt_json(),
        },
        cwd,
    );
    if !response.success {
        return Err(response.output);
    }
    let message = response.output.trim().to_string();
    if message.is_empty() {
        return Err("commit agent returned an empty message".to_string());
    }
    ctx.git
        .commit(&message, cwd)
        .map_err(|err| err.to_string())?;
    Ok(message)
}

pub fn push_and_sync_pr(
    ctx: &PhaseContext<'_>,
    state: &RunState,
    issue: &Issue,
    cwd: Option<&Path>,
) -> std::result::Result<(), String> {
    let branch = state
        .branch_name
        .as_deref()
        .ok_or_else(|| "No branch name in state".to_string())?;
    ctx.git.push(branch, cwd).map_err(|err| err.to_string())?;

    match ctx.git.find_pull_request(branch, cwd) {
        Ok(Some(url)) => {
            ctx.comment(state, AGENT_OPS, &format!("✅ Pull request updated: {url}"));
            return Ok(());
        }
        Ok(None) => {}
        Err(err) => warn!(adw_id = %state.adw_id, error = %err, "pull request lookup failed"),
    }

    let response = ctx.agents.invoke(
        state,
        AGENT_PR_CREATOR,
        AgentCommand::PullRequest {
            branch_name: branch.to_string(),
            issue_json: issue.to_prompt_json(),
            plan_file: state.plan_file.clone().unwrap_or_default(),
            adw_id: state.adw_id.clone(),
        },
        cwd,
    );
    if !response.success {
        return Err(format!("Error creating pull request: {}", response.output));
    }
    ctx.comment(
        state,
        AGENT_PR_CREATOR,
        &format!("✅ Pull request created: {}", response.output.trim()),
    );
    Ok(())
}

#[cfg(test)]
#[path = "../tests/unit/workflow_tests.rs"]
mod tests;
