use std::path::Path;

use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

use super::PhaseContext;
use super::test_runner::TestResult;
use crate::agent::AgentCommand;
use crate::artifact_io::parse_json_payload;
use crate::patterns::{PatternDocument, PatternTracker};
use crate::state::RunState;

pub const AGENT_TEST_DOCTOR: &str = "test_doctor";

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct PatternMatch {
    pub pattern_id: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Diagnosis {
    pub total_failures: u32,
    pub known_patterns: u32,
    pub new_patterns: u32,
    pub pattern_matches: Vec<PatternMatch>,
    pub new_patterns_data: Vec<PatternDocument>,
}

/// Structured JSON when the agent returns it, otherwise the headline counts
/// from its Markdown report.
pub fn parse_diagnosis(output: &str) -> Diagnosis {
    if let Ok(diagnosis) = parse_json_payload::<Diagnosis>(output) {
        return diagnosis;
    }
    Diagnosis {
        total_failures: metric(output, "Total Failures"),
        known_patterns: metric(output, "Known Patterns"),
        new_patterns: metric(output, "New Patterns"),
        ..Diagnosis::default()
    }
}

fn metric(output: &str, label: &str) -> u32 {
    let pattern = format!(r"(?i){}:\**\s*(\d+)", regex::escape(label));
    Regex::new(&pattern)
        .ok()
        .and_then(|re| re.captures(output))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

fn doctor_prompt(failures: &[TestResult]) -> String {
    let payload = serde_json::to_string_pretty(failures).unwrap_or_default();
    format!(
        "Analyze these test failures and provide diagnosis:\n\n```json\n{payload}\n```\n\n\
         Review the testing knowledge base and identify failure patterns, match them \
         against known patterns, suggest fixes with confidence levels and extract any \
         new patterns. Return the diagnosis as JSON with total_failures, known_patterns, \
         new_patterns, pattern_matches and new_patterns_data."
    )
}

/// Advisory diagnosis feeding the pattern knowledge base. Never affects the
/// resolution loop; failures are logged and dropped.
pub fn diagnose_failures(
    ctx: &PhaseContext<'_>,
    state: &RunState,
    failures: &[TestResult],
    cwd: Option<&Path>,
) -> Option<Diagnosis> {
    if failures.is_empty() {
        return None;
    }
    let response = ctx.agents.invoke(
        state,
        AGENT_TEST_DOCTOR,
        AgentCommand::TestDoctor {
            failure_json: doctor_prompt(failures),
        },
        cwd,
    );
    if !response.success {
        warn!(adw_id = %state.adw_id, "test doctor failed: {}", response.output);
        return None;
    }
    let diagnosis = parse_diagnosis(&response.output);
    let tracker = PatternTracker::new(ctx.config.knowledge_base_root(ctx.project_root));
    let now = Utc::now();

    for doc in &diagnosis.new_patterns_data {
        if let Err(err) = tracker.document_pattern(doc, now) {
            warn!(adw_id = %state.adw_id, pattern_id = %doc.pattern_id, error = %err, "failed to document pattern");
        }
    }
    let matched: Vec<String> = diagnosis
        .pattern_matches
        .iter()
        .map(|m| m.pattern_id.clone())
        .collect();
    if !matched.is_empty()
        && let Err(err) = tracker.record_occurrences(&matched, now)
    {
        warn!(adw_id = %state.adw_id, error = %err, "failed to update pattern tracker");
    }

    info!(
        adw_id = %state.adw_id,
        total = diagnosis.total_failures,
        known = diagnosis.known_patterns,
        new = diagnosis.new_patterns,
        "test doctor diagnosis"
    );
    ctx.comment_with_session(
        state,
        AGENT_TEST_DOCTOR,
        &format!(
            "🩺 Diagnosis: {} failures, {} known patterns, {} new patterns",
            diagnosis.total_failures, diagnosis.known_patterns, diagnosis.new_patterns
        ),
        response.session_id.as_deref(),
    );
    Some(diagnosis)
}
