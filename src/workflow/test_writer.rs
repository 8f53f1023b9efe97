use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use super::PhaseContext;
use crate::agent::AgentCommand;
use crate::artifact_io::{parse_json_payload, read_text_file};
use crate::deterministic::{TestCommandRunner, tail_chars};
use crate::state::RunState;

pub const AGENT_REQUIREMENTS_EXTRACTOR: &str = "test_requirements_extractor";
pub const AGENT_BATCH_VALIDATOR: &str = "test_batch_validator";
pub const AGENT_TEST_CREATOR: &str = "test_creator";
pub const AGENT_TEST_AUGMENTOR: &str = "test_augmentor";
pub const AGENT_TEST_FIXER: &str = "test_fixer";

const MIN_TEST_CONTENT_CHARS: usize = 10;
const MAX_ERROR_OUTPUT_CHARS: usize = 8_000;

/// One test file the plan says must exist.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TestRequirement {
    pub test_file_path: String,
    pub source_file_path: String,
    pub description: String,
    pub test_scenarios: Vec<Value>,
    pub relevant_edge_cases: Vec<Value>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct QuickAnalysis {
    pub has_imports: bool,
    pub test_count: usize,
    pub assertion_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestFileStatus {
    Missing,
    ObviouslyBroken { content: String },
    NeedsValidation { content: String, analysis: QuickAnalysis },
}

fn test_fn_pattern() -> Option<Regex> {
    Regex::new(r"def test_\w+").ok()
}

/// Cheap local heuristic; anything that survives it goes to the validator.
pub fn categorize_content(content: &str) -> TestFileStatus {
    let test_count = test_fn_pattern()
        .map(|re| re.find_iter(content).count())
        .unwrap_or(0);
    let broken = content.trim().chars().count() < MIN_TEST_CONTENT_CHARS
        || test_count == 0
        || !content.contains("assert");
    if broken {
        return TestFileStatus::ObviouslyBroken {
            content: content.to_string(),
        };
    }
    TestFileStatus::NeedsValidation {
        content: content.to_string(),
        analysis: QuickAnalysis {
            has_imports: content.contains("import"),
            test_count,
            assertion_count: content.matches("assert").count(),
        },
    }
}

pub fn categorize_test_file(path: &Path) -> TestFileStatus {
    if !path.exists() {
        return TestFileStatus::Missing;
    }
    match read_text_file(path) {
        Ok(content) => categorize_content(&content),
        Err(err) => {
            error!(path = %path.display(), error = %err, "could not read test file");
            TestFileStatus::Missing
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Categorized {
    pub missing: Vec<TestRequirement>,
    pub obviously_broken: Vec<(TestRequirement, String)>,
    pub needs_validation: Vec<(TestRequirement, String, QuickAnalysis)>,
}

pub fn categorize_requirements(requirements: &[TestRequirement], base: &Path) -> Categorized {
    let mut categorized = Categorized::default();
    for requirement in requirements {
        if requirement.test_file_path.trim().is_empty() {
            continue;
        }
        match categorize_test_file(&base.join(&requirement.test_file_path)) {
            TestFileStatus::Missing => {
                debug!(test_file = %requirement.test_file_path, "missing");
                categorized.missing.push(requirement.clone());
            }
            TestFileStatus::ObviouslyBroken { content } => {
                debug!(test_file = %requirement.test_file_path, "obviously broken");
                categorized
                    .obviously_broken
                    .push((requirement.clone(), content));
            }
            TestFileStatus::NeedsValidation { content, analysis } => {
                debug!(test_file = %requirement.test_file_path, "needs validation");
                categorized
                    .needs_validation
                    .push((requirement.clone(), content, analysis));
            }
        }
    }
    categorized
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Recommendation {
    #[default]
    Complete,
    Augment,
    Replace,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoverageAnalysis {
    pub missing_scenarios: Vec<Value>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ValidationResult {
    pub test_file_path: String,
    pub recommendation: Recommendation,
    pub coverage_analysis: CoverageAnalysis,
    pub issues: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Create,
    Augment,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestTask {
    pub kind: ActionKind,
    pub requirement: TestRequirement,
    pub existing_content: String,
    pub validation: Option<ValidationResult>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionPlan {
    pub skip: Vec<TestRequirement>,
    pub create: Vec<TestTask>,
    pub replace: Vec<TestTask>,
    pub augment: Vec<TestTask>,
}

impl ActionPlan {
    pub fn needs_work(&self) -> bool {
        !(self.create.is_empty() && self.replace.is_empty() && self.augment.is_empty())
    }

    /// Create first, then augment, then replace (replace runs as create).
    pub fn into_tasks(self) -> Vec<TestTask> {
        let mut tasks = self.create;
        tasks.extend(self.augment);
        tasks.extend(self.replace);
        tasks
    }
}

fn create_task(requirement: TestRequirement, existing_content: String) -> TestTask {
    TestTask {
        kind: ActionKind::Create,
        requirement,
        existing_content,
        validation: None,
    }
}

/// Merges local categories with the validator's verdicts. `None` means the
/// batch validation itself failed, so every candidate is augmented.
pub fn determine_actions(
    categorized: Categorized,
    validation: Option<Vec<ValidationResult>>,
) -> ActionPlan {
    let mut plan = ActionPlan {
        create: categorized
            .missing
            .into_iter()
            .map(|req| create_task(req, String::new()))
            .collect(),
        replace: categorized
            .obviously_broken
            .into_iter()
            .map(|(req, content)| create_task(req, content))
            .collect(),
        ..ActionPlan::default()
    };

    for (requirement, content, _) in categorized.needs_validation {
        let verdict = match &validation {
            Some(results) => results
                .iter()
                .find(|result| result.test_file_path == requirement.test_file_path)
                .cloned(),
            None => Some(ValidationResult {
                test_file_path: requirement.test_file_path.clone(),
                recommendation: Recommendation::Augment,
                ..ValidationResult::default()
            }),
        };
        let recommendation = verdict
            .as_ref()
            .map(|result| result.recommendation)
            .unwrap_or_default();
        match recommendation {
            Recommendation::Complete => plan.skip.push(requirement),
            Recommendation::Augment => plan.augment.push(TestTask {
                kind: ActionKind::Augment,
                requirement,
                existing_content: content,
                validation: verdict,
            }),
            Recommendation::Replace => plan.replace.push(TestTask {
                kind: ActionKind::Create,
                requirement,
                existing_content: content,
                validation: verdict,
            }),
        }
    }
    debug!(
        skip = plan.skip.len(),
        create = plan.create.len(),
        replace = plan.replace.len(),
        augment = plan.augment.len(),
        "test actions determined"
    );
    plan
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnsuranceReport {
    pub total_required: usize,
    pub already_complete: usize,
    pub created: usize,
    pub augmented: usize,
    pub failed: usize,
    pub all_passing: bool,
}

impl EnsuranceReport {
    fn nothing_required() -> Self {
        Self {
            all_passing: true,
            ..Self::default()
        }
    }

    pub fn touched_files(&self) -> bool {
        self.created + self.augmented > 0
    }
}

pub fn format_report(report: &EnsuranceReport, adw_id: &str) -> String {
    let mut summary = format!("## ✅ Test Creation Complete ({adw_id})\n\n");
    summary.push_str(&format!("**Test Files Required:** {}\n", report.total_required));
    summary.push_str(&format!("**Already Complete:** {} ✓\n", report.already_complete));
    if report.created > 0 {
        summary.push_str(&format!("**Created:** {} ✓\n", report.created));
    }
    if report.augmented > 0 {
        summary.push_str(&format!("**Augmented:** {} ✓\n", report.augmented));
    }
    if report.failed > 0 {
        summary.push_str(&format!("**Failed:** {} ❌\n", report.failed));
    }
    if report.all_passing {
        summary.push_str("\n### ✅ All created/augmented tests passing\n");
    } else {
        summary.push_str("\n### ❌ Some tests failed validation\n");
    }
    summary
}

fn format_analysis(total: usize, plan: &ActionPlan) -> String {
    let mut message = String::from("📊 Test Validation Results:\n");
    message.push_str(&format!("• {total} test files required by plan\n"));
    message.push_str(&format!("• {} tests complete and correct ✓\n", plan.skip.len()));
    if !plan.create.is_empty() {
        message.push_str(&format!("• {} tests missing (will create)\n", plan.create.len()));
    }
    if !plan.augment.is_empty() {
        message.push_str(&format!(
            "• {} tests incomplete (will augment)\n",
            plan.augment.len()
        ));
    }
    if !plan.replace.is_empty() {
        message.push_str(&format!("• {} tests broken (will replace)\n", plan.replace.len()));
    }
    message
}

/// First configured example that exists, else the first `test_*` file in
/// the example directory.
pub fn find_example_test(base: &Path, examples: &[String], glob_dir: &str) -> Option<String> {
    for candidate in examples {
        if let Ok(text) = read_text_file(&base.join(candidate)) {
            return Some(text);
        }
    }
    let entries = fs::read_dir(base.join(glob_dir)).ok()?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with("test_"))
        })
        .collect();
    files.sort();
    let found = files.iter().find_map(|path| read_text_file(path).ok());
    if found.is_none() {
        warn!(base = %base.display(), "no example test files found");
    }
    found
}

/// Runs the six-step pipeline and reports what it did. Never fails the
/// phase: every problem lands in the report's tallies.
pub struct TestEnsurance<'c, 'a> {
    ctx: &'c PhaseContext<'a>,
    state: &'c RunState,
    cwd: Option<&'c Path>,
}

impl<'c, 'a> TestEnsurance<'c, 'a> {
    pub fn new(ctx: &'c PhaseContext<'a>, state: &'c RunState, cwd: Option<&'c Path>) -> Self {
        Self { ctx, state, cwd }
    }

    fn base(&self) -> &Path {
        self.cwd.unwrap_or(self.ctx.project_root)
    }

    pub fn run(&self, plan_file: &str) -> EnsuranceReport {
        info!(adw_id = %self.state.adw_id, plan_file, "test ensurance started");
        let requirements = self.extract_requirements(plan_file);
        info!(adw_id = %self.state.adw_id, count = requirements.len(), "test files in plan");
        if requirements.is_empty() {
            info!(adw_id = %self.state.adw_id, "no test files specified in plan; skipping ensurance");
            return EnsuranceReport::nothing_required();
        }

        let categorized = categorize_requirements(&requirements, self.base());
        info!(
            adw_id = %self.state.adw_id,
            missing = categorized.missing.len(),
            broken = categorized.obviously_broken.len(),
            needs_validation = categorized.needs_validation.len(),
            "tests categorized"
        );
        let validation = if categorized.needs_validation.is_empty() {
            Some(Vec::new())
        } else {
            self.validate_batch(&categorized.needs_validation)
        };
        let plan = determine_actions(categorized, validation);
        self.ctx.comment(
            self.state,
            AGENT_TEST_CREATOR,
            &format_analysis(requirements.len(), &plan),
        );

        let already_complete = plan.skip.len();
        let outcomes = if plan.needs_work() {
            self.execute_parallel(plan.into_tasks())
        } else {
            info!(adw_id = %self.state.adw_id, "all planned tests complete");
            Vec::new()
        };

        let mut report = EnsuranceReport {
            total_required: requirements.len(),
            already_complete,
            ..EnsuranceReport::default()
        };
        for outcome in outcomes {
            if !outcome.written {
                report.failed += 1;
                continue;
            }
            if !self.validate_and_fix(outcome.index, &outcome.test_file) {
                report.failed += 1;
                continue;
            }
            match outcome.kind {
                ActionKind::Create => report.created += 1,
                ActionKind::Augment => report.augmented += 1,
            }
        }
        report.all_passing = report.failed == 0;
        info!(
            adw_id = %self.state.adw_id,
            created = report.created,
            augmented = report.augmented,
            already_complete = report.already_complete,
            failed = report.failed,
            "test ensurance complete"
        );
        report
    }

    fn extract_requirements(&self, plan_file: &str) -> Vec<TestRequirement> {
        let response = self.ctx.agents.invoke(
            self.state,
            AGENT_REQUIREMENTS_EXTRACTOR,
            AgentCommand::ExtractTestRequirements {
                plan_file: plan_file.to_string(),
            },
            self.cwd,
        );
        if !response.success {
            error!(adw_id = %self.state.adw_id, "failed to extract test requirements: {}", response.output);
            return Vec::new();
        }
        parse_json_payload::<Vec<TestRequirement>>(&response.output).unwrap_or_else(|err| {
            error!(adw_id = %self.state.adw_id, error = %err, "error parsing test requirements");
            Vec::new()
        })
    }

    fn validate_batch(
        &self,
        candidates: &[(TestRequirement, String, QuickAnalysis)],
    ) -> Option<Vec<ValidationResult>> {
        info!(adw_id = %self.state.adw_id, count = candidates.len(), "validating existing tests");
        let tests: Vec<Value> = candidates
            .iter()
            .map(|(requirement, content, analysis)| {
                let mut entry = serde_json::to_value(requirement).unwrap_or_else(|_| json!({}));
                if let Some(map) = entry.as_object_mut() {
                    map.insert("content".to_string(), json!(content));
                    map.insert("quick_analysis".to_string(), json!(analysis));
                }
                entry
            })
            .collect();
        let batch_json = serde_json::to_string_pretty(&json!({ "tests_to_validate": tests }))
            .unwrap_or_default();
        let response = self.ctx.agents.invoke(
            self.state,
            AGENT_BATCH_VALIDATOR,
            AgentCommand::ValidateTestBatch { batch_json },
            self.cwd,
        );
        if !response.success {
            error!(adw_id = %self.state.adw_id, "failed to validate tests: {}", response.output);
            return None;
        }
        match parse_json_payload::<Vec<ValidationResult>>(&response.output) {
            Ok(results) => Some(results),
            Err(err) => {
                error!(adw_id = %self.state.adw_id, error = %err, "error parsing validation results");
                None
            }
        }
    }

    fn source_code(&self, requirement: &TestRequirement) -> Option<String> {
        if requirement.source_file_path.trim().is_empty() {
            return None;
        }
        let path = self.base().join(&requirement.source_file_path);
        if !path.exists() {
            return None;
        }
        match read_text_file(&path) {
            Ok(text) => Some(text),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not read source file");
                Some(String::new())
            }
        }
    }

    fn task_command(&self, task: &TestTask, example: Option<&str>) -> AgentCommand {
        let requirement = &task.requirement;
        let mut context = match task.kind {
            ActionKind::Create => json!({
                "test_file_path": requirement.test_file_path,
                "source_file_path": requirement.source_file_path,
                "description": requirement.description,
                "test_scenarios": requirement.test_scenarios,
                "relevant_edge_cases": requirement.relevant_edge_cases,
                "testing_framework": "pytest",
            }),
            ActionKind::Augment => {
                let validation = task.validation.clone().unwrap_or_default();
                json!({
                    "test_file_path": requirement.test_file_path,
                    "existing_test_code": task.existing_content,
                    "missing_scenarios": validation.coverage_analysis.missing_scenarios,
                    "edge_cases": requirement.relevant_edge_cases,
                    "issues_to_fix": validation.issues,
                })
            }
        };
        if let Some(map) = context.as_object_mut() {
            if let Some(source) = self.source_code(requirement) {
                map.insert("source_code".to_string(), json!(source));
            }
            if task.kind == ActionKind::Create
                && let Some(example) = example
            {
                map.insert("example_test_code".to_string(), json!(example));
            }
        }
        let context_json = serde_json::to_string_pretty(&context).unwrap_or_default();
        match task.kind {
            ActionKind::Create => AgentCommand::CreateTest { context_json },
            ActionKind::Augment => AgentCommand::AugmentTest { context_json },
        }
    }

    fn execute_task(&self, index: usize, task: &TestTask, example: Option<&str>) -> TaskOutcome {
        let test_file = task.requirement.test_file_path.clone();
        let agent_name = match task.kind {
            ActionKind::Create => format!("{AGENT_TEST_CREATOR}_{index}"),
            ActionKind::Augment => format!("{AGENT_TEST_AUGMENTOR}_{index}"),
        };
        info!(adw_id = %self.state.adw_id, agent = %agent_name, test_file, kind = ?task.kind, "writing test");
        let response = self.ctx.agents.invoke(
            self.state,
            &agent_name,
            self.task_command(task, example),
            self.cwd,
        );
        if !response.success {
            error!(adw_id = %self.state.adw_id, test_file, "test writer failed: {}", response.output);
        }
        TaskOutcome {
            index,
            kind: task.kind,
            test_file,
            written: response.success,
        }
    }

    /// Bounded worker pool over a shared queue; results come back over a
    /// channel and are returned in task order.
    fn execute_parallel(&self, tasks: Vec<TestTask>) -> Vec<TaskOutcome> {
        if tasks.is_empty() {
            return Vec::new();
        }
        let testing = &self.ctx.config.testing;
        let example = find_example_test(
            self.base(),
            &testing.example_tests,
            &testing.example_test_glob_dir,
        );
        let workers = testing.ensurance_concurrency.clamp(1, tasks.len());
        info!(adw_id = %self.state.adw_id, tasks = tasks.len(), workers, "executing test tasks");

        let queue = Mutex::new(tasks.into_iter().enumerate().collect::<VecDeque<_>>());
        let (outcome_tx, outcome_rx) = mpsc::channel();
        thread::scope(|scope| {
            for _ in 0..workers {
                let queue = &queue;
                let outcome_tx = outcome_tx.clone();
                let example = example.as_deref();
                scope.spawn(move || {
                    loop {
                        let next = match queue.lock() {
                            Ok(mut pending) => pending.pop_front(),
                            Err(_) => None,
                        };
                        let Some((index, task)) = next else {
                            break;
                        };
                        let outcome = self.execute_task(index, &task, example);
                        if outcome_tx.send(outcome).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(outcome_tx);

        let mut outcomes: Vec<TaskOutcome> = outcome_rx.into_iter().collect();
        outcomes.sort_by_key(|outcome| outcome.index);
        outcomes
    }

    /// Runs the file's test command, asking the fixer to repair it up to
    /// `max_fix_attempts` times.
    fn validate_and_fix(&self, index: usize, test_file: &str) -> bool {
        let runner = TestCommandRunner::new(&self.ctx.config.testing.test_command);
        let base = self.base();
        info!(adw_id = %self.state.adw_id, test_file, "validating written test");
        let mut outcome = runner.run_for_file(test_file, base);
        if outcome.success {
            info!(adw_id = %self.state.adw_id, test_file, "all tests passing");
            return true;
        }

        let max_attempts = self.ctx.config.testing.max_fix_attempts;
        for attempt in 1..=max_attempts {
            warn!(adw_id = %self.state.adw_id, test_file, attempt, max_attempts, "tests failing; attempting fix");
            let test_code = match read_text_file(&base.join(test_file)) {
                Ok(code) => code,
                Err(err) => {
                    error!(adw_id = %self.state.adw_id, test_file, error = %err, "could not read test file");
                    return false;
                }
            };
            let context = json!({
                "test_file_path": test_file,
                "test_code": test_code,
                "error_output": tail_chars(&outcome.output, MAX_ERROR_OUTPUT_CHARS),
            });
            let response = self.ctx.agents.invoke(
                self.state,
                &format!("{AGENT_TEST_FIXER}_{index}_{attempt}"),
                AgentCommand::FixTest {
                    context_json: serde_json::to_string_pretty(&context).unwrap_or_default(),
                },
                self.cwd,
            );
            if !response.success {
                error!(adw_id = %self.state.adw_id, test_file, attempt, "fix attempt failed: {}", response.output);
                continue;
            }
            outcome = runner.run_for_file(test_file, base);
            if outcome.success {
                info!(adw_id = %self.state.adw_id, test_file, attempt, "fixed and passing");
                return true;
            }
        }
        error!(adw_id = %self.state.adw_id, test_file, "could not fix test");
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TaskOutcome {
    index: usize,
    kind: ActionKind,
    test_file: String,
    written: bool,
}

#[cfg(test)]
#[path = "../../tests/unit/test_writer_tests.rs"]
mod tests;
