use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::PhaseContext;
use super::test_doctor;
use crate::agent::AgentCommand;
use crate::artifact_io::parse_json_payload;
use crate::state::RunState;

pub const AGENT_TEST_RUNNER: &str = "test_runner";
pub const AGENT_E2E_TEST_RUNNER: &str = "e2e_test_runner";

pub trait TestOutcome: Clone + Serialize {
    fn test_name(&self) -> &str;
    fn passed(&self) -> bool;
    fn error(&self) -> Option<&str>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestResult {
    pub test_name: String,
    pub passed: bool,
    #[serde(default)]
    pub execution_command: String,
    #[serde(default)]
    pub test_purpose: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl TestOutcome for TestResult {
    fn test_name(&self) -> &str {
        &self.test_name
    }

    fn passed(&self) -> bool {
        self.passed
    }

    fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct E2eTestResult {
    pub test_name: String,
    pub status: String,
    #[serde(default)]
    pub test_path: String,
    #[serde(default)]
    pub screenshots: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl E2eTestResult {
    fn failed(test_name: String, test_path: String, error: String) -> Self {
        Self {
            test_name,
            status: "failed".to_string(),
            test_path,
            screenshots: Vec::new(),
            error: Some(error),
        }
    }
}

impl TestOutcome for E2eTestResult {
    fn test_name(&self) -> &str {
        &self.test_name
    }

    fn passed(&self) -> bool {
        self.status == "passed"
    }

    fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionOutcome<R> {
    pub results: Vec<R>,
    pub passed: usize,
    pub failed: usize,
    pub attempts: u32,
    pub aborted: Option<String>,
}

impl<R: TestOutcome> ResolutionOutcome<R> {
    fn from_results(results: Vec<R>, attempts: u32, aborted: Option<String>) -> Self {
        let passed = results.iter().filter(|r| r.passed()).count();
        let failed = results.len() - passed;
        Self {
            results,
            passed,
            failed,
            attempts,
            aborted,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &R> {
        self.results.iter().filter(|r| !r.passed())
    }

    /// A run that could not execute counts as at least one failure.
    pub fn failure_count(&self) -> usize {
        if self.aborted.is_some() {
            self.failed.max(1)
        } else {
            self.failed
        }
    }
}

/// A test suite that can be re-run and whose failures can be handed to a
/// resolver one at a time.
pub trait ResolvableSuite {
    type Outcome: TestOutcome;

    fn label(&self) -> &'static str;
    /// `Err` means the suite itself could not run; the loop stops.
    fn run(&mut self, attempt: u32) -> Result<Vec<Self::Outcome>, String>;
    /// Returns the resolver's own report of success.
    fn resolve(&mut self, failure: &Self::Outcome, iteration: u32, index: usize) -> bool;
    fn diagnose(&mut self, _failures: &[Self::Outcome], _iteration: u32) {}
}

/// Run, resolve failures, re-run. Stops on zero failures, on the attempt
/// limit, or when an iteration resolves nothing. The suite always runs at
/// least once, whatever the configured limit.
pub fn run_with_resolution<S: ResolvableSuite>(
    ctx: &PhaseContext<'_>,
    state: &RunState,
    suite: &mut S,
    max_attempts: u32,
) -> ResolutionOutcome<S::Outcome> {
    let label = suite.label();
    let max_attempts = max_attempts.max(1);
    let mut last_results = Vec::new();
    let mut attempt = 0;
    while attempt < max_attempts {
        attempt += 1;
        info!(adw_id = %state.adw_id, suite = label, attempt, max_attempts, "running tests");
        let results = match suite.run(attempt) {
            Ok(results) => results,
            Err(err) => {
                ctx.comment(
                    state,
                    AGENT_TEST_RUNNER,
                    &format!("❌ Error running {label} tests: {err}"),
                );
                return ResolutionOutcome::from_results(last_results, attempt, Some(err));
            }
        };
        let failures: Vec<S::Outcome> = results.iter().filter(|r| !r.passed()).cloned().collect();
        last_results = results;
        if failures.is_empty() {
            info!(adw_id = %state.adw_id, suite = label, attempt, "all tests passed");
            break;
        }
        if attempt == max_attempts {
            warn!(adw_id = %state.adw_id, suite = label, failed = failures.len(), "attempt limit reached");
            break;
        }

        ctx.comment(
            state,
            AGENT_TEST_RUNNER,
            &format!(
                "🔧 Found {} failed {label} tests. Attempting resolution...",
                failures.len()
            ),
        );
        suite.diagnose(&failures, attempt);
        let mut resolved = 0;
        for (index, failure) in failures.iter().enumerate() {
            if suite.resolve(failure, attempt, index) {
                resolved += 1;
            }
        }
        if resolved == 0 {
            warn!(adw_id = %state.adw_id, suite = label, "no failures resolved; stopping");
            break;
        }
        ctx.comment(
            state,
            AGENT_TEST_RUNNER,
            &format!(
                "🔄 Resolved {resolved}/{} {label} tests. Re-running (attempt {}/{max_attempts})",
                failures.len(),
                attempt + 1
            ),
        );
    }
    ResolutionOutcome::from_results(last_results, attempt, None)
}

fn failure_payload<R: Serialize>(failure: &R) -> String {
    serde_json::to_string_pretty(failure).unwrap_or_else(|err| format!("{{\"error\": \"{err}\"}}"))
}

pub struct UnitSuite<'c, 'a> {
    ctx: &'c PhaseContext<'a>,
    state: &'c RunState,
    cwd: Option<&'c Path>,
}

impl<'c, 'a> UnitSuite<'c, 'a> {
    pub fn new(ctx: &'c PhaseContext<'a>, state: &'c RunState, cwd: Option<&'c Path>) -> Self {
        Self { ctx, state, cwd }
    }
}

impl ResolvableSuite for UnitSuite<'_, '_> {
    type Outcome = TestResult;

    fn label(&self) -> &'static str {
        "unit"
    }

    fn run(&mut self, _attempt: u32) -> Result<Vec<TestResult>, String> {
        let response = self
            .ctx
            .agents
            .invoke(self.state, AGENT_TEST_RUNNER, AgentCommand::Test, self.cwd);
        if !response.success {
            return Err(response.output);
        }
        parse_json_payload::<Vec<TestResult>>(&response.output)
            .map_err(|err| format!("Error parsing test results: {err}"))
    }

    fn resolve(&mut self, failure: &TestResult, iteration: u32, index: usize) -> bool {
        let agent_name = format!("test_resolver_iter{iteration}_{index}");
        let response = self.ctx.agents.invoke(
            self.state,
            &agent_name,
            AgentCommand::ResolveFailedTest {
                failure_json: failure_payload(failure),
            },
            self.cwd,
        );
        report_resolution(self.ctx, self.state, &agent_name, &failure.test_name, response.success);
        response.success
    }

    fn diagnose(&mut self, failures: &[TestResult], _iteration: u32) {
        if self.ctx.config.testing.test_doctor {
            test_doctor::diagnose_failures(self.ctx, self.state, failures, self.cwd);
        }
    }
}

pub struct E2eSuite<'c, 'a> {
    ctx: &'c PhaseContext<'a>,
    state: &'c RunState,
    cwd: Option<&'c Path>,
    test_files: Vec<String>,
}

impl<'c, 'a> E2eSuite<'c, 'a> {
    pub fn new(
        ctx: &'c PhaseContext<'a>,
        state: &'c RunState,
        cwd: Option<&'c Path>,
        test_files: Vec<String>,
    ) -> Self {
        Self {
            ctx,
            state,
            cwd,
            test_files,
        }
    }

    fn run_one(&self, attempt: u32, index: usize, test_file: &str) -> E2eTestResult {
        let agent_name = format!("{AGENT_E2E_TEST_RUNNER}_{}_{index}", attempt - 1);
        let test_name = Path::new(test_file)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(test_file)
            .to_string();
        let response = self.ctx.agents.invoke(
            self.state,
            &agent_name,
            AgentCommand::TestE2e {
                adw_id: self.state.adw_id.clone(),
                agent_name: agent_name.clone(),
                test_file: test_file.to_string(),
            },
            self.cwd,
        );
        if !response.success {
            return E2eTestResult::failed(test_name, test_file.to_string(), response.output);
        }
        match parse_json_payload::<E2eTestResult>(&response.output) {
            Ok(mut result) => {
                if result.test_path.is_empty() {
                    result.test_path = test_file.to_string();
                }
                result
            }
            Err(err) => E2eTestResult::failed(
                test_name,
                test_file.to_string(),
                format!("Error parsing E2E test result: {err}"),
            ),
        }
    }
}

impl ResolvableSuite for E2eSuite<'_, '_> {
    type Outcome = E2eTestResult;

    fn label(&self) -> &'static str {
        "E2E"
    }

    fn run(&mut self, attempt: u32) -> Result<Vec<E2eTestResult>, String> {
        let mut results = Vec::new();
        for (index, test_file) in self.test_files.iter().enumerate() {
            let result = self.run_one(attempt, index, test_file);
            let failed = !result.passed();
            results.push(result);
            if failed {
                info!(adw_id = %self.state.adw_id, test_file, "stopping E2E run at first failure");
                break;
            }
        }
        Ok(results)
    }

    fn resolve(&mut self, failure: &E2eTestResult, iteration: u32, index: usize) -> bool {
        let agent_name = format!("e2e_test_resolver_iter{iteration}_{index}");
        let response = self.ctx.agents.invoke(
            self.state,
            &agent_name,
            AgentCommand::ResolveFailedE2eTest {
                failure_json: failure_payload(failure),
            },
            self.cwd,
        );
        report_resolution(self.ctx, self.state, &agent_name, &failure.test_name, response.success);
        response.success
    }
}

fn report_resolution(
    ctx: &PhaseContext<'_>,
    state: &RunState,
    agent_name: &str,
    test_name: &str,
    success: bool,
) {
    let message = if success {
        format!("✅ Successfully resolved: {test_name}")
    } else {
        format!("❌ Failed to resolve: {test_name}")
    };
    ctx.comment(state, agent_name, &message);
}

/// Every `*.md` under the E2E directory, sorted, relative to `base`.
pub fn discover_e2e_tests(base: &Path, e2e_dir: &str) -> Vec<String> {
    let dir = base.join(e2e_dir);
    let Ok(entries) = fs::read_dir(&dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "md"))
        .collect();
    files.sort();
    files
        .into_iter()
        .map(|path| {
            path.strip_prefix(base)
                .unwrap_or(&path)
                .display()
                .to_string()
        })
        .collect()
}

pub fn format_results_comment<R: TestOutcome>(label: &str, outcome: &ResolutionOutcome<R>) -> String {
    let mut lines = vec![format!(
        "📊 Final {label} test results: {} passed, {} failed (attempts: {})",
        outcome.passed, outcome.failed, outcome.attempts
    )];
    if let Some(reason) = &outcome.aborted {
        lines.push(format!("⚠️ {label} run aborted: {reason}"));
    }
    for failure in outcome.failures() {
        lines.push(format!(
            "\n❌ {}\n```json\n{}\n```",
            failure.test_name(),
            failure_payload(failure)
        ));
    }
    let passed_names: Vec<&str> = outcome
        .results
        .iter()
        .filter(|r| r.passed())
        .map(|r| r.test_name())
        .collect();
    if !passed_names.is_empty() {
        lines.push(format!("\n✅ Passed: {}", passed_names.join(", ")));
    }
    lines.join("\n")
}

#[cfg(test)]
#[path = "../../tests/unit/test_runner_tests.rs"]
mod tests;
