use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::error::TrackerError;

pub const ADW_BOT_IDENTIFIER: &str = "[ADW-BOT]";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
}

impl Issue {
    /// Compact form handed to agents as a single prompt argument.
    pub fn to_prompt_json(&self) -> String {
        serde_json::json!({
            "number": self.number,
            "title": self.title,
            "body": self.body,
        })
        .to_string()
    }
}

pub trait IssueTracker: Send + Sync {
    fn fetch_issue(&self, issue_number: &str) -> Result<Issue, TrackerError>;
    fn post_comment(&self, issue_number: &str, body: &str) -> Result<(), TrackerError>;
}

#[derive(Debug, Clone, Default)]
pub struct GhCli {
    token: Option<String>,
}

impl GhCli {
    pub fn from_env() -> Self {
        Self {
            token: std::env::var("GITHUB_PAT")
                .ok()
                .filter(|value| !value.trim().is_empty()),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String, TrackerError> {
        let mut command = Command::new("gh");
        command.args(args);
        if let Some(token) = &self.token {
            command.env("GH_TOKEN", token);
        }
        let output = command.output().map_err(TrackerError::Spawn)?;
        if !output.status.success() {
            return Err(TrackerError::Command {
                command: args.iter().take(2).copied().collect::<Vec<_>>().join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl IssueTracker for GhCli {
    fn fetch_issue(&self, issue_number: &str) -> Result<Issue, TrackerError> {
        let stdout = self.run(&[
            "issue",
            "view",
            issue_number,
            "--json",
            "number,title,body",
        ])?;
        Ok(serde_json::from_str(&stdout)?)
    }

    fn post_comment(&self, issue_number: &str, body: &str) -> Result<(), TrackerError> {
        self.run(&["issue", "comment", issue_number, "--body", body])
            .map(|_| ())
    }
}

/// Tags every bot comment so ADW never reacts to its own messages.
pub fn format_issue_message(
    adw_id: &str,
    agent_name: &str,
    message: &str,
    session_id: Option<&str>,
) -> String {
    match session_id.filter(|id| !id.is_empty()) {
        Some(session) => {
            format!("{ADW_BOT_IDENTIFIER} {adw_id}_{agent_name}_{session}: {message}")
        }
        None => format!("{ADW_BOT_IDENTIFIER} {adw_id}_{agent_name}: {message}"),
    }
}
