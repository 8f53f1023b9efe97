use std::path::Path;

use tracing::{info, warn};

use super::test_runner::{
    AGENT_E2E_TEST_RUNNER, AGENT_TEST_RUNNER, E2eSuite, E2eTestResult, ResolutionOutcome,
    TestOutcome, TestResult, UnitSuite, discover_e2e_tests, format_results_comment,
    run_with_resolution,
};
use super::test_writer::{AGENT_TEST_CREATOR, EnsuranceReport, TestEnsurance, format_report};
use super::{AGENT_OPS, PhaseContext, Workspace, classification_or, create_commit, push_and_sync_pr};
use crate::error::{AdwError, Result};
use crate::state::{IssueClass, RunState, RunStatePatch};

pub const AGENT_TEST_SUMMARY: &str = "test_summary";

const MAX_SUMMARY_ERROR_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestPhaseOptions {
    pub skip_e2e: bool,
    pub workspace: Workspace,
}

impl Default for TestPhaseOptions {
    fn default() -> Self {
        Self {
            skip_e2e: false,
            workspace: Workspace::Main,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TestPhaseSummary {
    pub state: RunState,
    pub ensurance: Option<EnsuranceReport>,
    pub unit: ResolutionOutcome<TestResult>,
    pub e2e: Option<ResolutionOutcome<E2eTestResult>>,
}

impl TestPhaseSummary {
    pub fn unit_failures(&self) -> usize {
        self.unit.failure_count()
    }

    pub fn e2e_failures(&self) -> usize {
        self.e2e.as_ref().map_or(0, ResolutionOutcome::failure_count)
    }

    pub fn all_passed(&self) -> bool {
        self.unit_failures() + self.e2e_failures() == 0
    }

    /// `Err(TestsFailed)` when any unit or E2E failure survived resolution.
    pub fn into_result(self) -> Result<Self> {
        if self.all_passed() {
            Ok(self)
        } else {
            Err(AdwError::TestsFailed {
                unit: self.unit_failures(),
                e2e: self.e2e_failures(),
            })
        }
    }
}

pub fn sub_workflow_name(workspace: Workspace) -> &'static str {
    match workspace {
        Workspace::Main => "adw_test",
        Workspace::Isolated => "adw_test_iso",
    }
}

pub fn test_branch_name(issue_number: &str, adw_id: &str) -> String {
    format!("test-issue-{issue_number}-adw-{adw_id}")
}

pub fn run_test(
    ctx: &PhaseContext<'_>,
    issue_number: &str,
    adw_id: &str,
    options: TestPhaseOptions,
) -> Result<TestPhaseSummary> {
    let Some(mut state) = ctx.states.load(adw_id) else {
        return Err(AdwError::Precondition(format!(
            "No state found for ADW ID: {adw_id}. Run the plan phase first"
        )));
    };
    if state.issue_number.is_none() {
        state.issue_number = Some(issue_number.to_string());
    }
    state.append_sub_workflow(sub_workflow_name(options.workspace));

    let cwd = ctx.working_dir(&mut state, options.workspace)?;
    if options.workspace == Workspace::Main {
        prepare_branch(ctx, &mut state, issue_number)?;
    }
    ctx.save_state(&state)?;
    ctx.comment(&state, AGENT_OPS, "✅ Starting test suite");

    let ensurance = run_ensurance(ctx, &state, cwd.as_deref());

    ctx.comment(&state, AGENT_TEST_RUNNER, "✅ Running application tests...");
    let unit = {
        let mut suite = UnitSuite::new(ctx, &state, cwd.as_deref());
        run_with_resolution(ctx, &state, &mut suite, ctx.config.testing.max_unit_attempts)
    };
    ctx.comment(&state, AGENT_TEST_RUNNER, &format_results_comment("unit", &unit));
    info!(adw_id = %state.adw_id, passed = unit.passed, failed = unit.failed, "final unit test results");

    let e2e = if unit.failure_count() > 0 {
        warn!(adw_id = %state.adw_id, "skipping E2E tests due to unit test failures");
        ctx.comment(&state, AGENT_OPS, "⚠️ Skipping E2E tests due to unit test failures");
        None
    } else if options.skip_e2e {
        info!(adw_id = %state.adw_id, "skipping E2E tests as requested");
        ctx.comment(&state, AGENT_OPS, "⚠️ Skipping E2E tests as requested via --skip-e2e flag");
        None
    } else {
        run_e2e(ctx, &state, cwd.as_deref())
    };

    let issue = ctx.fetch_issue(&state)?;
    ctx.comment(&state, AGENT_TEST_RUNNER, "✅ Committing test results");
    let issue_class = classification_or(ctx, &mut state, &issue, IssueClass::Chore);
    ctx.save_state(&state)?;
    match create_commit(ctx, &state, AGENT_TEST_RUNNER, issue_class, &issue, cwd.as_deref()) {
        Ok(message) => info!(adw_id = %state.adw_id, message, "test results committed"),
        Err(err) => {
            warn!(adw_id = %state.adw_id, error = %err, "error committing test results");
            ctx.comment(
                &state,
                AGENT_TEST_RUNNER,
                &format!("❌ Error committing test results: {err}"),
            );
        }
    }

    ctx.comment(
        &state,
        AGENT_TEST_SUMMARY,
        &format_run_summary(&unit.results, e2e.as_ref().map(|o| o.results.as_slice())),
    );

    push_and_sync_pr(ctx, &state, &issue, cwd.as_deref())
        .map_err(|err| ctx.fail(&state, AGENT_OPS, format!("Error pushing changes: {err}")))?;
    ctx.save_state(&state)?;

    let summary = TestPhaseSummary {
        state,
        ensurance,
        unit,
        e2e,
    };
    ctx.comment(&summary.state, AGENT_OPS, &final_status_message(&summary));
    Ok(summary)
}

/// Checks out the planned branch, or creates a dedicated test branch when
/// the run has none.
fn prepare_branch(ctx: &PhaseContext<'_>, state: &mut RunState, issue_number: &str) -> Result<()> {
    if let Some(branch_name) = state.branch_name.clone() {
        ctx.git.checkout(&branch_name, None).map_err(|err| {
            ctx.fail(state, AGENT_OPS, format!("Failed to checkout branch {branch_name}: {err}"))
        })?;
        info!(adw_id = %state.adw_id, branch = %branch_name, "checked out existing branch");
        return Ok(());
    }
    let issue_number = state.issue_number.clone().unwrap_or_else(|| issue_number.to_string());
    let branch_name = test_branch_name(&issue_number, &state.adw_id);
    ctx.git
        .create_branch(&branch_name, None)
        .map_err(|err| ctx.fail(state, AGENT_OPS, format!("Error creating branch: {err}")))?;
    state.update(RunStatePatch {
        branch_name: Some(branch_name.clone()),
        ..RunStatePatch::default()
    });
    ctx.comment(state, AGENT_OPS, &format!("✅ Created test branch: {branch_name}"));
    Ok(())
}

fn run_ensurance(
    ctx: &PhaseContext<'_>,
    state: &RunState,
    cwd: Option<&Path>,
) -> Option<EnsuranceReport> {
    let plan_file = state.plan_file.as_deref()?;
    if !ctx.resolve_path(cwd, plan_file).exists() {
        warn!(adw_id = %state.adw_id, plan_file, "plan file missing; skipping test ensurance");
        return None;
    }
    let report = TestEnsurance::new(ctx, state, cwd).run(plan_file);
    if !report.touched_files() {
        if !report.all_passing {
            ctx.comment(state, AGENT_TEST_CREATOR, &format_report(&report, &state.adw_id));
        }
        return Some(report);
    }
    ctx.comment(state, AGENT_TEST_CREATOR, &format_report(&report, &state.adw_id));
    let message = format!(
        "{AGENT_TEST_CREATOR}: feature: add/update unit tests\n\n\
         - Created: {} test files\n\
         - Augmented: {} test files\n\
         - All created tests passing: {}\n",
        report.created, report.augmented, report.all_passing
    );
    match ctx.git.commit(&message, cwd) {
        Ok(()) => info!(adw_id = %state.adw_id, "test files committed"),
        Err(err) => warn!(adw_id = %state.adw_id, error = %err, "failed to commit test files"),
    }
    Some(report)
}

fn run_e2e(
    ctx: &PhaseContext<'_>,
    state: &RunState,
    cwd: Option<&Path>,
) -> Option<ResolutionOutcome<E2eTestResult>> {
    let base = cwd.unwrap_or(ctx.project_root);
    let test_files = discover_e2e_tests(base, &ctx.config.testing.e2e_dir);
    if test_files.is_empty() {
        info!(adw_id = %state.adw_id, dir = %ctx.config.testing.e2e_dir, "no E2E tests found");
        ctx.comment(state, AGENT_E2E_TEST_RUNNER, "⚠️ No E2E tests found");
        return None;
    }
    ctx.comment(state, AGENT_E2E_TEST_RUNNER, "✅ Starting E2E tests...");
    let mut suite = E2eSuite::new(ctx, state, cwd, test_files);
    let outcome = run_with_resolution(ctx, state, &mut suite, ctx.config.testing.max_e2e_attempts);
    if !outcome.results.is_empty() || outcome.aborted.is_some() {
        ctx.comment(state, AGENT_E2E_TEST_RUNNER, &format_results_comment("E2E", &outcome));
    }
    info!(adw_id = %state.adw_id, passed = outcome.passed, failed = outcome.failed, "final E2E test results");
    Some(outcome)
}

fn summary_section<R: TestOutcome>(title: &str, results: &[R]) -> String {
    let passed = results.iter().filter(|r| r.passed()).count();
    let mut section = format!(
        "### {title}\n**Total Tests:** {}\n**Passed:** {passed} ✅\n**Failed:** {} ❌\n",
        results.len(),
        results.len() - passed
    );
    if !results.is_empty() {
        section.push_str("\n#### Details:\n");
    }
    for result in results {
        let status = if result.passed() { "✅" } else { "❌" };
        section.push_str(&format!("- {status} **{}**\n", result.test_name()));
        if !result.passed()
            && let Some(error) = result.error()
        {
            let truncated: String = error.chars().take(MAX_SUMMARY_ERROR_CHARS).collect();
            section.push_str(&format!("  - Error: {truncated}...\n"));
        }
    }
    section
}

pub fn format_run_summary(unit: &[TestResult], e2e: Option<&[E2eTestResult]>) -> String {
    let mut summary = String::from("## 📊 Test Run Summary\n\n");
    summary.push_str(&summary_section("Unit Tests", unit));
    if let Some(e2e) = e2e.filter(|results| !results.is_empty()) {
        summary.push('\n');
        summary.push_str(&summary_section("E2E Tests", e2e));
    }
    summary
}

fn final_status_message(summary: &TestPhaseSummary) -> String {
    if summary.all_passed() {
        let mut message = format!(
            "✅ All tests passed successfully!\n- Unit tests: {} passed\n",
            summary.unit.passed
        );
        if let Some(e2e) = summary.e2e.as_ref().filter(|o| !o.results.is_empty()) {
            message.push_str(&format!("- E2E tests: {} passed", e2e.passed));
        }
        return message;
    }
    let mut message = String::from("❌ Test suite completed with failures:\n");
    if summary.unit_failures() > 0 {
        message.push_str(&format!("- Unit tests: {} failures\n", summary.unit_failures()));
    }
    if summary.e2e_failures() > 0 {
        message.push_str(&format!("- E2E tests: {} failures", summary.e2e_failures()));
    }
    message
}
