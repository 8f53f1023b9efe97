use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::artifact_io::{
    read_text_file, read_text_file_if_exists, write_text_file, write_text_file_atomic,
};

pub const TRACKER_FILE: &str = "pattern_frequency.json";
pub const PATTERNS_DIR: &str = "failure_patterns";
pub const README_FILE: &str = "README.md";
pub const TRACKER_HEADING: &str = "## Pattern Frequency Tracker";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatternFrequency {
    pub count: u64,
    pub first_seen: String,
    #[serde(default)]
    pub last_seen: Option<String>,
    #[serde(default = "default_status")]
    pub status: String,
}

fn default_status() -> String {
    "active".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct PatternDocument {
    #[serde(rename = "id")]
    pub pattern_id: String,
    pub name: String,
    pub stack: Option<String>,
    pub error_signature: String,
    pub root_cause: String,
    pub triggers: Vec<String>,
    pub before_code: String,
    pub after_code: String,
    pub prevention_tips: Vec<String>,
    pub related_docs: Vec<String>,
    pub first_occurrence: Option<String>,
    pub occurrence: Option<String>,
    pub status: Option<String>,
}

pub type FrequencyTable = BTreeMap<String, PatternFrequency>;

/// File-backed knowledge base of recurring test-failure patterns.
#[derive(Debug, Clone)]
pub struct PatternTracker {
    root: PathBuf,
}

impl PatternTracker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn tracker_path(&self) -> PathBuf {
        self.root.join(TRACKER_FILE)
    }

    pub fn pattern_path(&self, pattern_id: &str) -> PathBuf {
        self.root.join(PATTERNS_DIR).join(format!("{pattern_id}.md"))
    }

    pub fn load_frequencies(&self) -> FrequencyTable {
        let path = self.tracker_path();
        match read_text_file_if_exists(&path) {
            Ok(Some(text)) => serde_json::from_str(&text).unwrap_or_else(|err| {
                warn!(path = %path.display(), error = %err, "pattern tracker malformed; starting fresh");
                FrequencyTable::new()
            }),
            Ok(None) => FrequencyTable::new(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "pattern tracker unreadable");
                FrequencyTable::new()
            }
        }
    }

    /// Bumps each matched pattern once per mention; unknown IDs start at one.
    pub fn record_occurrences(
        &self,
        pattern_ids: &[String],
        now: DateTime<Utc>,
    ) -> io::Result<FrequencyTable> {
        let mut table = self.load_frequencies();
        let stamp = now.to_rfc3339();
        for pattern_id in pattern_ids.iter().map(|id| id.trim()).filter(|id| !id.is_empty()) {
            let entry = table
                .entry(pattern_id.to_string())
                .or_insert_with(|| PatternFrequency {
                    count: 0,
                    first_seen: stamp.clone(),
                    last_seen: None,
                    status: default_status(),
                });
            entry.count += 1;
            entry.last_seen = Some(stamp.clone());
        }
        let text = serde_json::to_string_pretty(&table).map_err(io::Error::other)?;
        write_text_file_atomic(&self.tracker_path(), &text)?;
        self.update_readme_table(&table)?;
        Ok(table)
    }

    /// Creates the pattern document, or records another occurrence when it
    /// already exists. Returns `true` when a new document was written.
    pub fn document_pattern(&self, doc: &PatternDocument, now: DateTime<Utc>) -> io::Result<bool> {
        let pattern_id = doc.pattern_id.trim();
        if pattern_id.is_empty() || pattern_id.contains(['/', '\\']) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid pattern id: {:?}", doc.pattern_id),
            ));
        }
        let path = self.pattern_path(pattern_id);
        if path.exists() {
            info!(pattern_id, "pattern already documented; appending occurrence");
            self.append_occurrence(&path, doc, now)?;
            return Ok(false);
        }
        info!(pattern_id, "documenting new failure pattern");
        write_text_file(&path, &render_pattern_document(doc, now))?;
        Ok(true)
    }

    fn append_occurrence(&self, path: &Path, doc: &PatternDocument, now: DateTime<Utc>) -> io::Result<()> {
        let content = read_text_file(path)?;
        write_text_file(path, &with_new_occurrence(&content, doc, now))
    }

    fn update_readme_table(&self, table: &FrequencyTable) -> io::Result<()> {
        let readme = self.root.join(README_FILE);
        let Some(content) = read_text_file_if_exists(&readme)? else {
            return Ok(());
        };
        if let Some(updated) = replace_tracker_table(&content, table) {
            write_text_file(&readme, &updated)?;
        }
        Ok(())
    }
}

fn date_label(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

fn format_list(items: &[String]) -> String {
    if items.is_empty() {
        return "- (None specified)".to_string();
    }
    items
        .iter()
        .map(|item| format!("- {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_links(links: &[String]) -> String {
    if links.is_empty() {
        return "- (None)".to_string();
    }
    links
        .iter()
        .map(|link| format!("- [{link}]({link})"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_pattern_document(doc: &PatternDocument, now: DateTime<Utc>) -> String {
    let date = date_label(now);
    let stack = doc.stack.as_deref().unwrap_or("Unknown");
    let first = doc
        .first_occurrence
        .as_deref()
        .or(doc.occurrence.as_deref())
        .unwrap_or("Unknown location");
    format!(
        "# {name}\n\n\
         **Pattern ID:** `{id}`\n\
         **Frequency:** 1 occurrence ({date})\n\
         **Stack:** {stack}\n\n\
         ## Error Signature\n\n```\n{signature}\n```\n\n\
         ## Root Cause\n\n{root_cause}\n\n\
         ## Common Triggers\n\n{triggers}\n\n\
         ## Fix Pattern\n\n### Before (Fails)\n```\n{before}\n```\n\n### After (Works)\n```\n{after}\n```\n\n\
         ## Prevention\n\n{prevention}\n\n\
         ## Related\n\n{related}\n\n\
         ## Occurrences\n\n1. {first} ({date}) - DISCOVERED\n",
        name = doc.name,
        id = doc.pattern_id,
        signature = doc.error_signature,
        root_cause = doc.root_cause,
        triggers = format_list(&doc.triggers),
        before = doc.before_code,
        after = doc.after_code,
        prevention = format_list(&doc.prevention_tips),
        related = format_links(&doc.related_docs),
    )
}

fn with_new_occurrence(content: &str, doc: &PatternDocument, now: DateTime<Utc>) -> String {
    let date = date_label(now);
    let mut updated = content.to_string();
    if let Ok(frequency) = Regex::new(r"\*\*Frequency:\*\* (\d+) occurrences?[^\n]*")
        && let Some(count) = frequency
            .captures(content)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok())
    {
        let replacement = format!("**Frequency:** {} occurrences ({date})", count + 1);
        updated = frequency
            .replace(&updated, regex::NoExpand(&replacement))
            .into_owned();
    }

    let next_index = match updated.split_once("## Occurrences") {
        Some((_, section)) => {
            section
                .lines()
                .filter(|line| is_numbered_item(line))
                .count()
                + 1
        }
        None => 1,
    };
    if !updated.contains("## Occurrences") {
        updated = format!("{}\n\n## Occurrences\n", updated.trim_end());
    }
    format!(
        "{}\n{next_index}. {} ({date}) - {}\n",
        updated.trim_end(),
        doc.occurrence.as_deref().unwrap_or("Unknown location"),
        doc.status.as_deref().unwrap_or("FIXED"),
    )
}

/// Rewrites the body rows of the first table under the tracker heading, most
/// frequent first. Prose and the table's header and separator lines are kept.
/// Returns `None` when the README has no tracker table.
pub fn replace_tracker_table(content: &str, table: &FrequencyTable) -> Option<String> {
    let heading_start = content.find(TRACKER_HEADING)?;
    let section_start = heading_start + TRACKER_HEADING.len();
    let section_end = content[section_start..]
        .find("\n## ")
        .map(|idx| section_start + idx + 1)
        .unwrap_or(content.len());

    let mut offset = section_start;
    let mut lines = content[section_start..section_end]
        .split_inclusive('\n')
        .map(|line| {
            let start = offset;
            offset += line.len();
            (start, line)
        });
    lines.find(|(_, line)| is_table_line(line))?;
    let (separator_start, separator) = lines.next()?;
    if !is_table_line(separator) {
        return None;
    }
    let rows_start = separator_start + separator.len();
    let mut rows_end = rows_start;
    for (start, line) in lines {
        if !is_table_line(line) {
            break;
        }
        rows_end = start + line.len();
    }

    let mut rows: Vec<(&String, &PatternFrequency)> = table.iter().collect();
    rows.sort_by(|a, b| b.1.count.cmp(&a.1.count).then_with(|| a.0.cmp(b.0)));

    let mut body = String::new();
    if !separator.ends_with('\n') {
        body.push('\n');
    }
    if rows.is_empty() {
        body.push_str("| - | - | - | - |\n");
    }
    for (pattern_id, freq) in rows {
        let last_seen = freq
            .last_seen
            .as_deref()
            .and_then(|stamp| DateTime::parse_from_rfc3339(stamp).ok())
            .map(|stamp| stamp.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "Unknown".to_string());
        body.push_str(&format!(
            "| {pattern_id} | {} | {last_seen} | {} |\n",
            freq.count,
            title_case(&freq.status)
        ));
    }

    Some(format!(
        "{}{}{}",
        &content[..rows_start],
        body,
        &content[rows_end..]
    ))
}

fn is_table_line(line: &str) -> bool {
    line.trim_start().starts_with('|')
}

fn is_numbered_item(line: &str) -> bool {
    line.trim_start()
        .split_once(". ")
        .is_some_and(|(num, _)| !num.is_empty() && num.chars().all(|ch| ch.is_ascii_digit()))
}

fn title_case(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
#[path = "../tests/unit/patterns_tests.rs"]
mod tests;
