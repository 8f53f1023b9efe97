use super::*;
use crate::agent::AgentResponse;
use crate::test_support::{Harness, write_file};

fn unit(name: &str, passed: bool) -> TestResult {
    TestResult {
        test_name: name.to_string(),
        passed,
        execution_command: format!("pytest -k {name}"),
        test_purpose: String::new(),
        error: (!passed).then(|| format!("{name} failed")),
    }
}

/// Replays one scripted run per attempt and records resolver calls.
struct ScriptedSuite {
    runs: Vec<Result<Vec<TestResult>, String>>,
    resolves: bool,
    resolved: Vec<(String, u32, usize)>,
    diagnosed: u32,
}

impl ScriptedSuite {
    fn new(runs: Vec<Result<Vec<TestResult>, String>>, resolves: bool) -> Self {
        Self {
            runs,
            resolves,
            resolved: Vec::new(),
            diagnosed: 0,
        }
    }
}

impl ResolvableSuite for ScriptedSuite {
    type Outcome = TestResult;

    fn label(&self) -> &'static str {
        "unit"
    }

    fn run(&mut self, attempt: u32) -> Result<Vec<TestResult>, String> {
        self.runs
            .get(attempt as usize - 1)
            .cloned()
            .unwrap_or_else(|| Err(format!("no run scripted for attempt {attempt}")))
    }

    fn resolve(&mut self, failure: &TestResult, iteration: u32, index: usize) -> bool {
        self.resolved
            .push((failure.test_name.clone(), iteration, index));
        self.resolves
    }

    fn diagnose(&mut self, _failures: &[TestResult], _iteration: u32) {
        self.diagnosed += 1;
    }
}

fn state() -> RunState {
    RunState::new("abc123", Some("42".to_string()))
}

#[test]
fn all_passing_first_run_stops_immediately() {
    let harness = Harness::new();
    let mut suite = ScriptedSuite::new(vec![Ok(vec![unit("a", true), unit("b", true)])], true);

    let outcome = run_with_resolution(&harness.ctx(), &state(), &mut suite, 4);

    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.passed, 2);
    assert_eq!(outcome.failed, 0);
    assert!(suite.resolved.is_empty());
    assert_eq!(suite.diagnosed, 0);
}

#[test]
fn resolved_failures_trigger_a_rerun() {
    let harness = Harness::new();
    let mut suite = ScriptedSuite::new(
        vec![
            Ok(vec![unit("a", true), unit("b", false), unit("c", false)]),
            Ok(vec![unit("a", true), unit("b", true), unit("c", true)]),
        ],
        true,
    );

    let outcome = run_with_resolution(&harness.ctx(), &state(), &mut suite, 4);

    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.failure_count(), 0);
    assert_eq!(
        suite.resolved,
        [("b".to_string(), 1, 0), ("c".to_string(), 1, 1)]
    );
    assert_eq!(suite.diagnosed, 1);
    assert!(harness
        .tracker
        .has_comment_containing("Resolved 2/2 unit tests. Re-running (attempt 2/4)"));
}

#[test]
fn loop_stops_when_nothing_is_resolved() {
    let harness = Harness::new();
    let mut suite = ScriptedSuite::new(
        vec![
            Ok(vec![unit("a", false)]),
            Ok(vec![unit("a", true)]),
        ],
        false,
    );

    let outcome = run_with_resolution(&harness.ctx(), &state(), &mut suite, 4);

    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.failed, 1);
    assert_eq!(suite.resolved.len(), 1);
}

#[test]
fn attempt_limit_bounds_the_loop_even_when_resolvers_succeed() {
    let harness = Harness::new();
    let failing = || Ok(vec![unit("flaky", false)]);
    let mut suite = ScriptedSuite::new(vec![failing(), failing(), failing(), failing()], true);

    let outcome = run_with_resolution(&harness.ctx(), &state(), &mut suite, 3);

    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.failed, 1);
    assert_eq!(suite.resolved.len(), 2);
    assert_eq!(outcome.failures().next().map(|r| r.test_name.as_str()), Some("flaky"));
}

#[test]
fn zero_attempt_limit_still_runs_the_suite_once() {
    let harness = Harness::new();
    let mut suite = ScriptedSuite::new(vec![Ok(vec![unit("a", false)])], true);

    let outcome = run_with_resolution(&harness.ctx(), &state(), &mut suite, 0);

    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.failure_count(), 1);
    assert!(suite.resolved.is_empty());
}

#[test]
fn tool_error_aborts_and_counts_as_failure() {
    let harness = Harness::new();
    let mut suite = ScriptedSuite::new(vec![Err("claude not installed".to_string())], true);

    let outcome = run_with_resolution(&harness.ctx(), &state(), &mut suite, 4);

    assert_eq!(outcome.aborted.as_deref(), Some("claude not installed"));
    assert!(outcome.results.is_empty());
    assert_eq!(outcome.failure_count(), 1);
    assert!(harness
        .tracker
        .has_comment_containing("❌ Error running unit tests: claude not installed"));
}

#[test]
fn unit_suite_parses_agent_json_and_names_resolvers() {
    let harness = Harness::new();
    harness.runner.push(
        "/test",
        AgentResponse::ok(
            "```json\n[{\"test_name\": \"test_limit\", \"passed\": false, \"error\": \"429\"}]\n```",
        ),
    );
    harness.runner.push(
        "/test",
        AgentResponse::ok(r#"[{"test_name": "test_limit", "passed": true}]"#),
    );
    harness
        .runner
        .always("/resolve_failed_test", AgentResponse::ok("fixed"));
    harness
        .runner
        .always("/test_doctor", AgentResponse::ok("Total Failures: 1"));
    let state = state();
    let ctx = harness.ctx();

    let mut suite = UnitSuite::new(&ctx, &state, None);
    let outcome = run_with_resolution(&ctx, &state, &mut suite, 4);

    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.passed, 1);
    let resolver = &harness.runner.calls_for("/resolve_failed_test")[0];
    assert_eq!(resolver.agent_name, "test_resolver_iter1_0");
    match &resolver.command {
        AgentCommand::ResolveFailedTest { failure_json } => {
            assert!(failure_json.contains("\"test_limit\""));
        }
        other => panic!("unexpected command {other:?}"),
    }
    assert_eq!(harness.runner.calls_for("/test_doctor").len(), 1);
    assert!(harness.tracker.has_comment_containing("✅ Successfully resolved: test_limit"));
}

#[test]
fn unparseable_unit_output_aborts_the_loop() {
    let harness = Harness::new();
    harness
        .runner
        .push("/test", AgentResponse::ok("all good, trust me"));
    let state = state();
    let ctx = harness.ctx();

    let mut suite = UnitSuite::new(&ctx, &state, None);
    let outcome = run_with_resolution(&ctx, &state, &mut suite, 4);

    assert!(outcome
        .aborted
        .as_deref()
        .is_some_and(|reason| reason.starts_with("Error parsing test results")));
    assert_eq!(harness.runner.calls_for("/test").len(), 1);
}

#[test]
fn doctor_is_skipped_when_disabled() {
    let mut harness = Harness::new();
    harness.config.testing.test_doctor = false;
    harness
        .runner
        .push("/test", AgentResponse::ok(r#"[{"test_name": "t", "passed": false}]"#));
    let state = state();
    let ctx = harness.ctx();

    let mut suite = UnitSuite::new(&ctx, &state, None);
    run_with_resolution(&ctx, &state, &mut suite, 2);
    assert!(harness.runner.calls_for("/test_doctor").is_empty());
}

#[test]
fn e2e_run_stops_at_first_failure() {
    let harness = Harness::new();
    harness.runner.push(
        "/test_e2e",
        AgentResponse::ok(r#"{"test_name": "login", "status": "passed"}"#),
    );
    harness.runner.push(
        "/test_e2e",
        AgentResponse::ok(r#"{"test_name": "checkout", "status": "failed", "error": "button missing"}"#),
    );
    let state = state();
    let ctx = harness.ctx();
    let files = vec![
        "e2e/test_a.md".to_string(),
        "e2e/test_b.md".to_string(),
        "e2e/test_c.md".to_string(),
    ];

    let mut suite = E2eSuite::new(&ctx, &state, None, files);
    let results = suite.run(1).expect("e2e run");

    assert_eq!(results.len(), 2);
    assert!(results[0].passed());
    assert_eq!(results[1].error.as_deref(), Some("button missing"));
    let calls = harness.runner.calls_for("/test_e2e");
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].agent_name, "e2e_test_runner_0_0");
    assert_eq!(calls[1].agent_name, "e2e_test_runner_0_1");
}

#[test]
fn e2e_agent_failure_becomes_failed_result() {
    let harness = Harness::new();
    let state = state();
    let ctx = harness.ctx();

    let mut suite = E2eSuite::new(&ctx, &state, None, vec!["e2e/test_login.md".to_string()]);
    let results = suite.run(2).expect("e2e run");

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].test_name, "test_login");
    assert_eq!(results[0].status, "failed");
    assert!(results[0]
        .error
        .as_deref()
        .is_some_and(|e| e.contains("no scripted response")));
    assert_eq!(
        harness.runner.calls_for("/test_e2e")[0].agent_name,
        "e2e_test_runner_1_0"
    );
}

#[test]
fn e2e_files_are_discovered_sorted_and_relative() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_file(dir.path(), "e2e/test_b.md", "b");
    write_file(dir.path(), "e2e/test_a.md", "a");
    write_file(dir.path(), "e2e/notes.txt", "skip");

    assert_eq!(
        discover_e2e_tests(dir.path(), "e2e"),
        ["e2e/test_a.md", "e2e/test_b.md"]
    );
    assert!(discover_e2e_tests(dir.path(), "missing").is_empty());
}

#[test]
fn results_comment_lists_failures_before_passes() {
    let outcome = ResolutionOutcome::from_results(
        vec![unit("test_ok", true), unit("test_bad", false)],
        2,
        None,
    );
    let comment = format_results_comment("unit", &outcome);

    assert!(comment.starts_with("📊 Final unit test results: 1 passed, 1 failed (attempts: 2)"));
    let failure = comment.find("❌ test_bad").expect("failure block");
    let passed = comment.find("✅ Passed: test_ok").expect("passed line");
    assert!(failure < passed);
    assert!(comment.contains("\"error\": \"test_bad failed\""));
}
