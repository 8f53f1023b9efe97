use std::path::Path;
use std::process::{Command, Stdio};

use tracing::debug;

pub const FILE_PLACEHOLDER: &str = "{file}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRunOutcome {
    pub success: bool,
    pub code: i32,
    pub output: String,
}

/// Runs the project's per-file test command through `bash -lc`. The template
/// may use shell syntax; the test file path is always quoted as one word.
#[derive(Debug, Clone)]
pub struct TestCommandRunner {
    template: String,
}

impl TestCommandRunner {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// `Ok(None)` when no command is configured.
    pub fn command_line(&self, test_file: &str) -> Result<Option<String>, shlex::QuoteError> {
        let template = self.template.trim();
        if template.is_empty() {
            return Ok(None);
        }
        let quoted = shlex::try_quote(test_file)?;
        if template.contains(FILE_PLACEHOLDER) {
            Ok(Some(template.replace(FILE_PLACEHOLDER, &quoted)))
        } else {
            Ok(Some(format!("{template} {quoted}")))
        }
    }

    pub fn run_for_file(&self, test_file: &str, cwd: &Path) -> TestRunOutcome {
        let command_line = match self.command_line(test_file) {
            Ok(Some(command_line)) => command_line,
            Ok(None) => {
                return TestRunOutcome {
                    success: true,
                    code: 0,
                    output: "Test command skipped: no test command configured.".to_string(),
                };
            }
            Err(err) => {
                return TestRunOutcome {
                    success: false,
                    code: -1,
                    output: format!("Test file path {test_file:?} cannot be quoted: {err}"),
                };
            }
        };
        debug!(command = %command_line, cwd = %cwd.display(), "running test command");
        let result = Command::new("bash")
            .args(["-lc", &command_line])
            .current_dir(cwd)
            .stdin(Stdio::null())
            .output();
        match result {
            Ok(output) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.trim().is_empty() {
                    if !text.is_empty() && !text.ends_with('\n') {
                        text.push('\n');
                    }
                    text.push_str(&stderr);
                }
                TestRunOutcome {
                    success: output.status.success(),
                    code: output.status.code().unwrap_or(-1),
                    output: text,
                }
            }
            Err(err) => TestRunOutcome {
                success: false,
                code: -1,
                output: format!("Test command failed to start: {err}"),
            },
        }
    }
}

/// Keeps the last `max_chars` characters, which is where test runners print
/// their failure summaries.
pub fn tail_chars(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    let start = text
        .char_indices()
        .nth(skip)
        .map(|(idx, _)| idx)
        .unwrap_or(0);
    &text[start..]
}
