use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::agent_models::{ModelRouting, ModelTier};
use crate::artifact_io::{read_text_file, write_text_file};
use crate::config::{AgentConfig, RetryConfig};
use crate::state::{IssueClass, RunState};

pub const RAW_OUTPUT_FILE: &str = "raw_output.jsonl";
pub const JSON_OUTPUT_FILE: &str = "raw_output.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCommand {
    ClassifyIssue {
        issue_json: String,
    },
    GenerateBranchName {
        issue_class: IssueClass,
        adw_id: String,
        issue_json: String,
    },
    Plan {
        issue_class: IssueClass,
        issue_number: String,
        adw_id: String,
        issue_json: String,
    },
    Implement {
        plan_file: String,
    },
    Commit {
        agent_name: String,
        issue_class: IssueClass,
        issue_json: String,
    },
    PullRequest {
        branch_name: String,
        issue_json: String,
        plan_file: String,
        adw_id: String,
    },
    Test,
    ResolveFailedTest {
        failure_json: String,
    },
    TestE2e {
        adw_id: String,
        agent_name: String,
        test_file: String,
    },
    ResolveFailedE2eTest {
        failure_json: String,
    },
    ExtractTestRequirements {
        plan_file: String,
    },
    ValidateTestBatch {
        batch_json: String,
    },
    CreateTest {
        context_json: String,
    },
    AugmentTest {
        context_json: String,
    },
    FixTest {
        context_json: String,
    },
    TestDoctor {
        failure_json: String,
    },
}

impl AgentCommand {
    pub fn slash_name(&self) -> &'static str {
        match self {
            Self::ClassifyIssue { .. } => "/classify_issue",
            Self::GenerateBranchName { .. } => "/generate_branch_name",
            Self::Plan { issue_class, .. } => issue_class.slash_command(),
            Self::Implement { .. } => "/implement",
            Self::Commit { .. } => "/commit",
            Self::PullRequest { .. } => "/pull_request",
            Self::Test => "/test",
            Self::ResolveFailedTest { .. } => "/resolve_failed_test",
            Self::TestE2e { .. } => "/test_e2e",
            Self::ResolveFailedE2eTest { .. } => "/resolve_failed_e2e_test",
            Self::ExtractTestRequirements { .. } => "/extract_test_requirements",
            Self::ValidateTestBatch { .. } => "/validate_test_batch",
            Self::CreateTest { .. } => "/create_test",
            Self::AugmentTest { .. } => "/augment_test",
            Self::FixTest { .. } => "/fix_test",
            Self::TestDoctor { .. } => "/test_doctor",
        }
    }

    pub fn args(&self) -> Vec<String> {
        match self {
            Self::ClassifyIssue { issue_json } => vec![issue_json.clone()],
            Self::GenerateBranchName {
                issue_class,
                adw_id,
                issue_json,
            } => vec![
                issue_class.label().to_string(),
                adw_id.clone(),
                issue_json.clone(),
            ],
            Self::Plan {
                issue_number,
                adw_id,
                issue_json,
                ..
            } => vec![issue_number.clone(), adw_id.clone(), issue_json.clone()],
            Self::Implement { plan_file } => vec![plan_file.clone()],
            Self::Commit {
                agent_name,
                issue_class,
                issue_json,
            } => vec![
                agent_name.clone(),
                issue_class.label().to_string(),
                issue_json.clone(),
            ],
            Self::PullRequest {
                branch_name,
                issue_json,
                plan_file,
                adw_id,
            } => vec![
                branch_name.clone(),
                issue_json.clone(),
                plan_file.clone(),
                adw_id.clone(),
            ],
            Self::Test => Vec::new(),
            Self::TestE2e {
                adw_id,
                agent_name,
                test_file,
            } => vec![adw_id.clone(), agent_name.clone(), test_file.clone()],
            Self::ExtractTestRequirements { plan_file } => vec![plan_file.clone()],
            Self::ResolveFailedTest { failure_json }
            | Self::ResolveFailedE2eTest { failure_json }
            | Self::TestDoctor { failure_json } => vec![failure_json.clone()],
            Self::ValidateTestBatch { batch_json } => vec![batch_json.clone()],
            Self::CreateTest { context_json }
            | Self::AugmentTest { context_json }
            | Self::FixTest { context_json } => vec![context_json.clone()],
        }
    }

    pub fn prompt(&self) -> String {
        let args = self.args();
        if args.is_empty() {
            self.slash_name().to_string()
        } else {
            format!("{} {}", self.slash_name(), args.join(" "))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRequest {
    pub command: AgentCommand,
    pub adw_id: String,
    pub agent_name: String,
    pub model: String,
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCode {
    None,
    CliNotInstalled,
    ClaudeCodeError,
    ExecutionError,
    ErrorDuringExecution,
    AgentReportedError,
}

impl RetryCode {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::ClaudeCodeError | Self::ExecutionError | Self::ErrorDuringExecution
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentResponse {
    pub output: String,
    pub success: bool,
    pub session_id: Option<String>,
    pub retry_code: RetryCode,
}

impl AgentResponse {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: true,
            session_id: None,
            retry_code: RetryCode::None,
        }
    }

    pub fn failed(output: impl Into<String>, retry_code: RetryCode) -> Self {
        Self {
            output: output.into(),
            success: false,
            session_id: None,
            retry_code,
        }
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }
}

/// One attempt against the external agent. Implementations never panic on
/// agent failure; failures come back as unsuccessful responses.
pub trait AgentRunner: Send + Sync {
    fn run(&self, request: &AgentRequest) -> AgentResponse;
}

#[derive(Debug, Clone)]
pub struct ClaudeCli {
    program: String,
    skip_permissions: bool,
    agents_root: PathBuf,
}

impl ClaudeCli {
    pub fn new(config: &AgentConfig, agents_root: impl Into<PathBuf>) -> Self {
        Self {
            program: config.program.clone(),
            skip_permissions: config.skip_permissions,
            agents_root: agents_root.into(),
        }
    }

    fn is_installed(&self) -> bool {
        Command::new(&self.program)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    fn output_dir(&self, request: &AgentRequest) -> PathBuf {
        self.agents_root
            .join(&request.adw_id)
            .join(&request.agent_name)
    }
}

impl AgentRunner for ClaudeCli {
    fn run(&self, request: &AgentRequest) -> AgentResponse {
        if !self.is_installed() {
            return AgentResponse::failed(
                format!(
                    "Error: Claude Code CLI is not installed. Expected at: {}",
                    self.program
                ),
                RetryCode::CliNotInstalled,
            );
        }
        let prompt = request.command.prompt();
        if let Err(err) = save_prompt(&self.agents_root, request, &prompt) {
            warn!(agent = %request.agent_name, error = %err, "failed to save prompt");
        }

        let output_dir = self.output_dir(request);
        let raw_path = output_dir.join(RAW_OUTPUT_FILE);
        let raw_file = match fs::create_dir_all(&output_dir).and_then(|_| File::create(&raw_path)) {
            Ok(file) => file,
            Err(err) => {
                return AgentResponse::failed(
                    format!("Error executing Claude Code: {err}"),
                    RetryCode::ExecutionError,
                );
            }
        };

        let mut command = Command::new(&self.program);
        command
            .args(build_cli_args(&prompt, &request.model, self.skip_permissions))
            .stdin(Stdio::null())
            .stdout(Stdio::from(raw_file))
            .stderr(Stdio::piped());
        if let Some(dir) = &request.working_dir {
            command.current_dir(dir);
        }
        debug!(agent = %request.agent_name, model = %request.model, "spawning claude");

        let output = match command.output() {
            Ok(output) => output,
            Err(err) => {
                return AgentResponse::failed(
                    format!("Error executing Claude Code: {err}"),
                    RetryCode::ExecutionError,
                );
            }
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return AgentResponse::failed(
                format!("Claude Code error: {stderr}"),
                RetryCode::ClaudeCodeError,
            );
        }

        let transcript = match read_text_file(&raw_path) {
            Ok(text) => text,
            Err(err) => {
                return AgentResponse::failed(
                    format!("Error reading Claude Code output: {err}"),
                    RetryCode::ExecutionError,
                );
            }
        };
        if let Err(err) = convert_transcript_to_json(&raw_path, &transcript) {
            warn!(path = %raw_path.display(), error = %err, "failed to write JSON transcript");
        }
        response_from_transcript(&transcript)
    }
}

fn build_cli_args(prompt: &str, model: &str, skip_permissions: bool) -> Vec<String> {
    let mut args = vec!["-p".to_string(), prompt.to_string()];
    append_claude_model_selection_args(&mut args, Some(model));
    args.extend([
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
    ]);
    if skip_permissions {
        args.push("--dangerously-skip-permissions".to_string());
    }
    args
}

fn append_claude_model_selection_args(args: &mut Vec<String>, model: Option<&str>) {
    if let Some(model) = model.map(str::trim).filter(|value| !value.is_empty()) {
        args.push("--model".to_string());
        args.push(model.to_string());
    }
}

/// Saves the rendered prompt next to the transcript. Prompts that do not
/// start with a slash command are skipped.
pub fn save_prompt(agents_root: &Path, request: &AgentRequest, prompt: &str) -> io::Result<()> {
    let Some(command_name) = leading_command_name(prompt) else {
        debug!(agent = %request.agent_name, "prompt has no slash command; not saved");
        return Ok(());
    };
    let path = agents_root
        .join(&request.adw_id)
        .join(&request.agent_name)
        .join("prompts")
        .join(format!("{command_name}.txt"));
    write_text_file(&path, prompt)
}

fn leading_command_name(prompt: &str) -> Option<&str> {
    let rest = prompt.strip_prefix('/')?;
    let end = rest
        .find(|ch: char| !(ch.is_alphanumeric() || ch == '_'))
        .unwrap_or(rest.len());
    (end > 0).then(|| &rest[..end])
}

pub fn parse_transcript(text: &str) -> Vec<serde_json::Value> {
    let mut messages = Vec::new();
    let mut skipped = 0usize;
    for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
        match serde_json::from_str::<serde_json::Value>(line) {
            Ok(value) => messages.push(value),
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!(skipped, "skipped malformed transcript lines");
    }
    messages
}

pub fn convert_transcript_to_json(raw_path: &Path, transcript: &str) -> io::Result<PathBuf> {
    let messages = parse_transcript(transcript);
    let json_path = raw_path.with_file_name(JSON_OUTPUT_FILE);
    let text = serde_json::to_string_pretty(&messages).map_err(io::Error::other)?;
    write_text_file(&json_path, &text)?;
    Ok(json_path)
}

/// Interprets a stream transcript: the last `result` record decides the
/// outcome; without one the raw transcript is returned as a success.
pub fn response_from_transcript(transcript: &str) -> AgentResponse {
    let messages = parse_transcript(transcript);
    let Some(result) = messages
        .iter()
        .rev()
        .find(|msg| msg.get("type").and_then(|v| v.as_str()) == Some("result"))
    else {
        return AgentResponse::ok(transcript);
    };

    let session_id = result
        .get("session_id")
        .and_then(|v| v.as_str())
        .map(ToString::to_string)
        .or_else(|| messages.iter().find_map(session_id_from_message));

    if result.get("subtype").and_then(|v| v.as_str()) == Some("error_during_execution") {
        return AgentResponse::failed(
            "Error during execution: Agent encountered an error and did not return a result",
            RetryCode::ErrorDuringExecution,
        )
        .with_session(session_id);
    }

    let is_error = result
        .get("is_error")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let output = result
        .get("result")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    if is_error {
        AgentResponse::failed(output, RetryCode::AgentReportedError).with_session(session_id)
    } else {
        AgentResponse::ok(output).with_session(session_id)
    }
}

fn session_id_from_message(value: &serde_json::Value) -> Option<String> {
    value
        .get("session_id")
        .and_then(|v| v.as_str())
        .filter(|id| looks_like_session_id(id))
        .map(ToString::to_string)
}

fn looks_like_session_id(id: &str) -> bool {
    let trimmed = id.trim();
    if trimmed.len() < 8 || trimmed.contains(char::is_whitespace) {
        return false;
    }
    trimmed
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delays: Vec<Duration>,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            delays: config.delays(),
        }
    }

    fn delay_before_retry(&self, retry_index: usize) -> Duration {
        self.delays.get(retry_index).copied().unwrap_or_default()
    }
}

/// Runs one attempt plus up to `max_retries` retries while the failure is
/// retryable, sleeping the policy delay between attempts.
pub fn invoke_with_retry(
    runner: &dyn AgentRunner,
    request: &AgentRequest,
    policy: &RetryPolicy,
) -> AgentResponse {
    let mut response = runner.run(request);
    for retry_index in 0..policy.max_retries as usize {
        if response.success || !response.retry_code.is_retryable() {
            break;
        }
        let delay = policy.delay_before_retry(retry_index);
        warn!(
            agent = %request.agent_name,
            command = request.command.slash_name(),
            attempt = retry_index + 2,
            delay_secs = delay.as_secs(),
            code = ?response.retry_code,
            "retrying agent call"
        );
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        response = runner.run(request);
    }
    response
}

pub struct AgentInvoker {
    runner: Box<dyn AgentRunner>,
    routing: ModelRouting,
    retry: RetryPolicy,
}

impl AgentInvoker {
    pub fn new(runner: Box<dyn AgentRunner>, routing: ModelRouting, retry: RetryPolicy) -> Self {
        Self {
            runner,
            routing,
            retry,
        }
    }

    pub fn resolve_model(&self, command: &AgentCommand, tier: ModelTier) -> String {
        self.routing.resolve(command.slash_name(), tier)
    }

    /// Runs `command` for the run described by `state`, choosing the model
    /// from the run's tier and retrying transient failures.
    pub fn invoke(
        &self,
        state: &RunState,
        agent_name: &str,
        command: AgentCommand,
        working_dir: Option<&Path>,
    ) -> AgentResponse {
        let model = self.resolve_model(&command, state.model_set);
        let request = AgentRequest {
            command,
            adw_id: state.adw_id.clone(),
            agent_name: agent_name.to_string(),
            model,
            working_dir: working_dir.map(Path::to_path_buf),
        };
        info!(
            adw_id = %request.adw_id,
            agent = %request.agent_name,
            command = request.command.slash_name(),
            model = %request.model,
            "invoking agent"
        );
        let response = invoke_with_retry(self.runner.as_ref(), &request, &self.retry);
        if !response.success {
            warn!(
                adw_id = %request.adw_id,
                agent = %request.agent_name,
                code = ?response.retry_code,
                "agent call failed: {}",
                response.output
            );
        }
        response
    }
}

#[cfg(test)]
#[path = "../tests/unit/agent_tests.rs"]
mod tests;
