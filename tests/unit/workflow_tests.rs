use super::*;
use crate::agent::AgentResponse;
use crate::test_support::{GitCall, Harness, write_file};

const PLAN_PATH: &str = "specs/issue-42-adw-abc123-plan.md";
const PR_URL: &str = "https://github.com/acme/app/pull/7";

fn planned_state() -> RunState {
    let mut state = RunState::new("abc123", Some("42".to_string()));
    state.update(RunStatePatch {
        branch_name: Some("feat-issue-42-adw-abc123-rate-limit".to_string()),
        plan_file: Some(PLAN_PATH.to_string()),
        issue_class: Some(IssueClass::Bug),
        ..RunStatePatch::default()
    });
    state
}

fn script_commit_and_pr(harness: &Harness, commit_message: &str) {
    harness
        .runner
        .always("/commit", AgentResponse::ok(commit_message));
    harness
        .runner
        .always("/pull_request", AgentResponse::ok(PR_URL));
}

fn script_planner(harness: &Harness) {
    harness
        .runner
        .push("/classify_issue", AgentResponse::ok("/feature"));
    harness.runner.push(
        "/generate_branch_name",
        AgentResponse::ok("feat-issue-42-adw-abc123-rate-limit"),
    );
    let root = harness.root().to_path_buf();
    harness.runner.on_call("/feature", move |_| {
        write_file(&root, PLAN_PATH, "# Plan\n");
    });
    harness.runner.push(
        "/feature",
        AgentResponse::ok(PLAN_PATH).with_session(Some("sess-9".to_string())),
    );
}

#[test]
fn plan_creates_branch_plan_commit_and_pull_request() {
    let harness = Harness::new();
    script_planner(&harness);
    script_commit_and_pr(&harness, "sdlc_planner: feature: add rate limit plan");

    let state = run_plan(&harness.ctx(), "42", Some("abc123")).expect("plan succeeds");

    assert_eq!(state.issue_class, Some(IssueClass::Feature));
    assert_eq!(
        state.branch_name.as_deref(),
        Some("feat-issue-42-adw-abc123-rate-limit")
    );
    assert_eq!(state.plan_file.as_deref(), Some(PLAN_PATH));
    assert_eq!(state.all_adws, ["adw_plan"]);
    assert_eq!(harness.states.load("abc123"), Some(state));
    assert_eq!(
        harness.git.calls(),
        [
            GitCall::CreateBranch("feat-issue-42-adw-abc123-rate-limit".to_string()),
            GitCall::Commit("sdlc_planner: feature: add rate limit plan".to_string()),
            GitCall::Push("feat-issue-42-adw-abc123-rate-limit".to_string()),
        ]
    );
    assert!(harness.tracker.has_comment_containing(
        "[ADW-BOT] abc123_sdlc_planner_sess-9: ✅ Implementation plan created"
    ));
    assert!(harness.tracker.has_comment_containing(&format!("Pull request created: {PR_URL}")));
    assert!(harness.tracker.has_comment_containing("✅ Planning phase completed"));

    let planner = &harness.runner.calls_for("/feature")[0];
    assert_eq!(planner.agent_name, AGENT_PLANNER);
    assert_eq!(planner.model, "sonnet");
}

#[test]
fn plan_without_run_id_generates_one() {
    let harness = Harness::new();
    script_planner(&harness);
    script_commit_and_pr(&harness, "sdlc_planner: feature: plan");

    let state = run_plan(&harness.ctx(), "42", None).expect("plan succeeds");
    assert_eq!(state.adw_id.len(), 8);
    assert_eq!(state.issue_number.as_deref(), Some("42"));
}

#[test]
fn plan_stops_when_classification_fails() {
    let harness = Harness::new();
    harness
        .runner
        .push("/classify_issue", AgentResponse::ok("no idea"));

    let err = run_plan(&harness.ctx(), "42", Some("abc123")).expect_err("classifier rejects");
    assert!(matches!(err, AdwError::Agent(_)));
    assert!(harness.git.calls().is_empty());
    assert!(harness.tracker.has_comment_containing("❌ Error classifying issue"));
}

#[test]
fn plan_rejects_plan_path_that_does_not_exist() {
    let harness = Harness::new();
    harness
        .runner
        .push("/classify_issue", AgentResponse::ok("/chore"));
    harness
        .runner
        .push("/generate_branch_name", AgentResponse::ok("chore-issue-42-adw-abc123-deps"));
    harness
        .runner
        .push("/chore", AgentResponse::ok("specs/nowhere.md"));

    let err = run_plan(&harness.ctx(), "42", Some("abc123")).expect_err("missing plan file");
    assert!(err.to_string().contains("Plan file does not exist: specs/nowhere.md"));
    assert!(harness.git.commits().is_empty());
    let saved = harness.states.load("abc123").expect("state persisted");
    assert_eq!(saved.plan_file, None);
    assert_eq!(saved.branch_name.as_deref(), Some("chore-issue-42-adw-abc123-deps"));
}

#[test]
fn build_requires_existing_state() {
    let harness = Harness::new();
    let err = run_build(&harness.ctx(), "42", "abc123", Workspace::Main).expect_err("no state");
    assert!(matches!(err, AdwError::Precondition(_)));
    assert!(err.to_string().contains("No state found for ADW ID: abc123"));
    assert!(harness.runner.calls().is_empty());
}

#[test]
fn build_requires_branch_and_plan() {
    let mut state = planned_state();
    state.branch_name = None;
    let harness = Harness::with_state(state);
    let err = run_build(&harness.ctx(), "42", "abc123", Workspace::Main).expect_err("no branch");
    assert!(err.to_string().contains("No branch name in state"));

    let mut state = planned_state();
    state.plan_file = None;
    let harness = Harness::with_state(state);
    let err = run_build(&harness.ctx(), "42", "abc123", Workspace::Main).expect_err("no plan");
    assert!(err.to_string().contains("No plan file in state"));
    assert!(harness.runner.calls_for("/implement").is_empty());
}

#[test]
fn build_implements_commits_and_updates_existing_pull_request() {
    let mut harness = Harness::with_state(planned_state());
    harness.git.existing_pr = Some(PR_URL.to_string());
    harness
        .runner
        .push("/implement", AgentResponse::ok("done"));
    script_commit_and_pr(&harness, "sdlc_implementor: bug: fix rate limit");

    let state = run_build(&harness.ctx(), "42", "abc123", Workspace::Main).expect("build");

    assert_eq!(state.all_adws, ["adw_build"]);
    assert_eq!(
        harness.git.calls(),
        [
            GitCall::Checkout("feat-issue-42-adw-abc123-rate-limit".to_string()),
            GitCall::Commit("sdlc_implementor: bug: fix rate limit".to_string()),
            GitCall::Push("feat-issue-42-adw-abc123-rate-limit".to_string()),
        ]
    );
    assert!(harness.runner.calls_for("/classify_issue").is_empty());
    assert!(harness.runner.calls_for("/pull_request").is_empty());
    assert!(harness.tracker.has_comment_containing(&format!("Pull request updated: {PR_URL}")));
    assert!(harness.tracker.has_comment_containing("✅ Implementation phase completed"));

    let implement = &harness.runner.calls_for("/implement")[0];
    assert_eq!(implement.agent_name, AGENT_IMPLEMENTOR);
    assert_eq!(implement.working_dir, None);
}

#[test]
fn build_falls_back_to_feature_when_classifier_fails() {
    let mut state = planned_state();
    state.issue_class = None;
    let harness = Harness::with_state(state);
    harness
        .runner
        .push("/implement", AgentResponse::ok("done"));
    script_commit_and_pr(&harness, "sdlc_implementor: feature: add limit");

    let state = run_build(&harness.ctx(), "42", "abc123", Workspace::Main).expect("build");
    assert_eq!(state.issue_class, Some(IssueClass::Feature));
    let commit = &harness.runner.calls_for("/commit")[0];
    assert!(matches!(
        commit.command,
        AgentCommand::Commit {
            issue_class: IssueClass::Feature,
            ..
        }
    ));
}

#[test]
fn build_fails_when_push_is_rejected() {
    let mut harness = Harness::with_state(planned_state());
    harness.git.fail_push = true;
    harness
        .runner
        .push("/implement", AgentResponse::ok("done"));
    script_commit_and_pr(&harness, "sdlc_implementor: bug: fix");

    let err = run_build(&harness.ctx(), "42", "abc123", Workspace::Main).expect_err("push fails");
    assert!(err.to_string().contains("Error pushing changes"));
    assert!(harness.tracker.has_comment_containing("remote rejected"));
    assert!(!harness.tracker.has_comment_containing("Implementation phase completed"));
}

#[test]
fn build_fails_when_implementation_fails() {
    let harness = Harness::with_state(planned_state());
    let err = run_build(&harness.ctx(), "42", "abc123", Workspace::Main).expect_err("implement");
    assert!(err.to_string().contains("Error implementing solution"));
    assert!(harness.git.commits().is_empty());
}

#[test]
fn isolated_build_rejects_missing_worktree() {
    let mut state = planned_state();
    state.worktree_path = Some("/definitely/not/a/worktree".to_string());
    let harness = Harness::with_state(state);
    let err =
        run_build(&harness.ctx(), "42", "abc123", Workspace::Isolated).expect_err("no worktree");
    assert!(err.to_string().contains("Worktree validation failed"));

    let harness = Harness::with_state(planned_state());
    let err = run_build(&harness.ctx(), "42", "abc123", Workspace::Isolated)
        .expect_err("no worktree path");
    assert!(err.to_string().contains("no worktree path in state"));
}

#[test]
fn isolated_build_runs_inside_worktree_with_default_ports() {
    let worktree = tempfile::tempdir().expect("worktree");
    let mut state = planned_state();
    state.worktree_path = Some(worktree.path().display().to_string());
    let harness = Harness::with_state(state);
    harness
        .runner
        .push("/implement", AgentResponse::ok("done"));
    script_commit_and_pr(&harness, "sdlc_implementor: bug: fix");

    let state = run_build(&harness.ctx(), "42", "abc123", Workspace::Isolated).expect("build");

    assert_eq!(state.backend_port, Some(9100));
    assert_eq!(state.frontend_port, Some(9200));
    assert_eq!(state.all_adws, ["adw_build_iso"]);
    assert!(!harness
        .git
        .calls()
        .iter()
        .any(|call| matches!(call, GitCall::Checkout(_))));
    let implement = &harness.runner.calls_for("/implement")[0];
    assert_eq!(implement.working_dir.as_deref(), Some(worktree.path()));
    assert!(harness.tracker.has_comment_containing("Backend: 9100, Frontend: 9200"));
}

const PASSING_UNIT: &str = r#"[{"test_name": "test_login", "passed": true, "execution_command": "pytest", "test_purpose": "login"}]"#;
const FAILING_UNIT: &str = r#"[{"test_name": "test_login", "passed": true}, {"test_name": "test_limit", "passed": false, "error": "AssertionError: 429 != 200"}]"#;

fn tested_state() -> RunState {
    let mut state = planned_state();
    state.plan_file = None;
    state
}

#[test]
fn test_phase_requires_existing_state() {
    let harness = Harness::new();
    let err = run_test(&harness.ctx(), "42", "abc123", TestPhaseOptions::default())
        .expect_err("no state");
    assert!(matches!(err, AdwError::Precondition(_)));
}

#[test]
fn passing_unit_tests_without_e2e_suite_succeed() {
    let harness = Harness::with_state(tested_state());
    harness.runner.push("/test", AgentResponse::ok(PASSING_UNIT));
    script_commit_and_pr(&harness, "test_runner: bug: test results");

    let summary = run_test(&harness.ctx(), "42", "abc123", TestPhaseOptions::default())
        .expect("test phase");

    assert!(summary.all_passed());
    assert_eq!(summary.unit.passed, 1);
    assert!(summary.e2e.is_none());
    assert!(summary.ensurance.is_none());
    assert_eq!(summary.state.all_adws, ["adw_test"]);
    assert_eq!(harness.git.commits(), ["test_runner: bug: test results"]);
    assert!(harness.tracker.has_comment_containing("No E2E tests found"));
    assert!(harness.tracker.has_comment_containing("abc123_test_summary: ## 📊 Test Run Summary"));
    assert!(harness.tracker.has_comment_containing("✅ All tests passed successfully!"));
    assert!(summary.into_result().is_ok());
}

#[test]
fn unit_failures_skip_e2e_but_still_commit_and_fail_the_phase() {
    let harness = Harness::with_state(tested_state());
    write_file(harness.root(), ".claude/commands/e2e/test_login_flow.md", "# E2E");
    harness.runner.push("/test", AgentResponse::ok(FAILING_UNIT));
    script_commit_and_pr(&harness, "test_runner: bug: test results");

    let summary = run_test(&harness.ctx(), "42", "abc123", TestPhaseOptions::default())
        .expect("test phase completes");

    assert_eq!(summary.unit_failures(), 1);
    assert!(summary.e2e.is_none());
    assert!(harness.runner.calls_for("/test_e2e").is_empty());
    assert_eq!(harness.runner.calls_for("/test").len(), 1);
    assert_eq!(harness.runner.calls_for("/resolve_failed_test").len(), 1);
    assert_eq!(harness.git.commits().len(), 1);
    assert!(harness.tracker.has_comment_containing("Skipping E2E tests due to unit test failures"));
    assert!(harness.tracker.has_comment_containing("- Unit tests: 1 failures"));
    assert!(matches!(
        summary.into_result(),
        Err(AdwError::TestsFailed { unit: 1, e2e: 0 })
    ));
}

#[test]
fn passing_unit_tests_run_discovered_e2e_tests() {
    let harness = Harness::with_state(tested_state());
    write_file(harness.root(), ".claude/commands/e2e/test_login_flow.md", "# E2E");
    harness.runner.push("/test", AgentResponse::ok(PASSING_UNIT));
    harness.runner.push(
        "/test_e2e",
        AgentResponse::ok(r#"{"test_name": "login flow", "status": "passed", "screenshots": ["a.png"]}"#),
    );
    script_commit_and_pr(&harness, "test_runner: bug: test results");

    let summary = run_test(&harness.ctx(), "42", "abc123", TestPhaseOptions::default())
        .expect("test phase");

    let e2e = summary.e2e.as_ref().expect("e2e ran");
    assert_eq!(e2e.passed, 1);
    assert_eq!(e2e.results[0].test_path, ".claude/commands/e2e/test_login_flow.md");
    assert!(summary.all_passed());
    assert!(harness.tracker.has_comment_containing("- E2E tests: 1 passed"));
}

#[test]
fn skip_flag_suppresses_e2e() {
    let harness = Harness::with_state(tested_state());
    write_file(harness.root(), ".claude/commands/e2e/test_login_flow.md", "# E2E");
    harness.runner.push("/test", AgentResponse::ok(PASSING_UNIT));
    script_commit_and_pr(&harness, "test_runner: bug: results");

    let options = TestPhaseOptions {
        skip_e2e: true,
        ..TestPhaseOptions::default()
    };
    let summary = run_test(&harness.ctx(), "42", "abc123", options).expect("test phase");
    assert!(summary.e2e.is_none());
    assert!(harness.runner.calls_for("/test_e2e").is_empty());
    assert!(harness.tracker.has_comment_containing("--skip-e2e"));
}

#[test]
fn test_phase_without_branch_creates_test_branch() {
    let mut state = tested_state();
    state.branch_name = None;
    let harness = Harness::with_state(state);
    harness.runner.push("/test", AgentResponse::ok(PASSING_UNIT));
    script_commit_and_pr(&harness, "test_runner: bug: results");

    let summary = run_test(&harness.ctx(), "42", "abc123", TestPhaseOptions::default())
        .expect("test phase");

    assert_eq!(summary.state.branch_name.as_deref(), Some("test-issue-42-adw-abc123"));
    assert_eq!(
        harness.git.calls()[0],
        GitCall::CreateBranch("test-issue-42-adw-abc123".to_string())
    );
}

#[test]
fn commit_failure_does_not_abort_test_phase() {
    let harness = Harness::with_state(tested_state());
    harness.runner.push("/test", AgentResponse::ok(PASSING_UNIT));
    harness
        .runner
        .always("/pull_request", AgentResponse::ok(PR_URL));

    let summary = run_test(&harness.ctx(), "42", "abc123", TestPhaseOptions::default())
        .expect("test phase");
    assert!(summary.all_passed());
    assert!(harness.git.commits().is_empty());
    assert!(harness.tracker.has_comment_containing("❌ Error committing test results"));
}

#[test]
fn test_phase_defaults_to_chore_when_classifier_fails() {
    let mut state = tested_state();
    state.issue_class = None;
    let harness = Harness::with_state(state);
    harness.runner.push("/test", AgentResponse::ok(PASSING_UNIT));
    script_commit_and_pr(&harness, "test_runner: chore: results");

    let summary = run_test(&harness.ctx(), "42", "abc123", TestPhaseOptions::default())
        .expect("test phase");
    assert_eq!(summary.state.issue_class, Some(IssueClass::Chore));
}

#[test]
fn plan_file_triggers_ensurance_before_unit_tests() {
    let harness = Harness::with_state(planned_state());
    write_file(harness.root(), PLAN_PATH, "# Plan\n");
    harness
        .runner
        .push("/extract_test_requirements", AgentResponse::ok("[]"));
    harness.runner.push("/test", AgentResponse::ok(PASSING_UNIT));
    script_commit_and_pr(&harness, "test_runner: bug: results");

    let summary = run_test(&harness.ctx(), "42", "abc123", TestPhaseOptions::default())
        .expect("test phase");

    let report = summary.ensurance.expect("ensurance ran");
    assert_eq!(report.total_required, 0);
    assert!(report.all_passing);
    let extract = &harness.runner.calls_for("/extract_test_requirements")[0];
    assert!(matches!(
        &extract.command,
        AgentCommand::ExtractTestRequirements { plan_file } if plan_file == PLAN_PATH
    ));
    assert_eq!(harness.git.commits(), ["test_runner: bug: results"]);
}

#[test]
fn ensurance_commits_created_tests_separately() {
    let mut harness = Harness::with_state(planned_state());
    harness.config.testing.test_command = String::new();
    write_file(harness.root(), PLAN_PATH, "# Plan\n");
    harness.runner.push(
        "/extract_test_requirements",
        AgentResponse::ok(r#"[{"test_file_path": "tests/test_limit.py"}]"#),
    );
    let root = harness.root().to_path_buf();
    harness.runner.on_call("/create_test", move |_| {
        write_file(&root, "tests/test_limit.py", "def test_limit():\n    assert True\n");
    });
    harness
        .runner
        .always("/create_test", AgentResponse::ok("created"));
    harness.runner.push("/test", AgentResponse::ok(PASSING_UNIT));
    script_commit_and_pr(&harness, "test_runner: bug: results");

    let summary = run_test(&harness.ctx(), "42", "abc123", TestPhaseOptions::default())
        .expect("test phase");

    assert_eq!(summary.ensurance.map(|r| r.created), Some(1));
    let commits = harness.git.commits();
    assert_eq!(commits.len(), 2);
    assert!(commits[0].starts_with("test_creator: feature: add/update unit tests"));
    assert!(commits[0].contains("- Created: 1 test files"));
    assert!(harness.tracker.has_comment_containing("Test Creation Complete (abc123)"));
}
