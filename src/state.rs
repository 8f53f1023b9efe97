use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::agent_models::ModelTier;
use crate::artifact_io::write_text_file_atomic;

pub const STATE_FILE_NAME: &str = "adw_state.json";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum IssueClass {
    #[serde(rename = "/chore")]
    Chore,
    #[serde(rename = "/bug")]
    Bug,
    #[serde(rename = "/feature")]
    Feature,
    #[serde(rename = "/patch")]
    Patch,
}

impl IssueClass {
    pub const ALL: [IssueClass; 4] = [Self::Chore, Self::Bug, Self::Feature, Self::Patch];

    pub fn slash_command(self) -> &'static str {
        match self {
            Self::Chore => "/chore",
            Self::Bug => "/bug",
            Self::Feature => "/feature",
            Self::Patch => "/patch",
        }
    }

    pub fn label(self) -> &'static str {
        &self.slash_command()[1..]
    }

    /// Picks the first class tag mentioned in a classifier answer.
    pub fn find_in(text: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .filter_map(|class| {
                text.find(class.slash_command())
                    .filter(|&idx| tag_ends_at(text, idx + class.slash_command().len()))
                    .map(|idx| (idx, class))
            })
            .min_by_key(|(idx, _)| *idx)
            .map(|(_, class)| class)
    }
}

fn tag_ends_at(text: &str, end: usize) -> bool {
    text[end..]
        .chars()
        .next()
        .is_none_or(|ch| !(ch.is_ascii_alphanumeric() || ch == '_'))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunState {
    pub adw_id: String,
    #[serde(default)]
    pub issue_number: Option<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub plan_file: Option<String>,
    #[serde(default)]
    pub issue_class: Option<IssueClass>,
    #[serde(default)]
    pub worktree_path: Option<String>,
    #[serde(default)]
    pub backend_port: Option<u16>,
    #[serde(default)]
    pub frontend_port: Option<u16>,
    #[serde(default)]
    pub model_set: ModelTier,
    #[serde(default)]
    pub all_adws: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RunStatePatch {
    pub issue_number: Option<String>,
    pub branch_name: Option<String>,
    pub plan_file: Option<String>,
    pub issue_class: Option<IssueClass>,
    pub worktree_path: Option<String>,
    pub backend_port: Option<u16>,
    pub frontend_port: Option<u16>,
    pub model_set: Option<ModelTier>,
}

impl RunState {
    pub fn new(adw_id: impl Into<String>, issue_number: Option<String>) -> Self {
        Self {
            adw_id: adw_id.into(),
            issue_number,
            branch_name: None,
            plan_file: None,
            issue_class: None,
            worktree_path: None,
            backend_port: None,
            frontend_port: None,
            model_set: ModelTier::Base,
            all_adws: Vec::new(),
        }
    }

    pub fn update(&mut self, patch: RunStatePatch) {
        let RunStatePatch {
            issue_number,
            branch_name,
            plan_file,
            issue_class,
            worktree_path,
            backend_port,
            frontend_port,
            model_set,
        } = patch;
        if issue_number.is_some() {
            self.issue_number = issue_number;
        }
        if branch_name.is_some() {
            self.branch_name = branch_name;
        }
        if plan_file.is_some() {
            self.plan_file = plan_file;
        }
        if issue_class.is_some() {
            self.issue_class = issue_class;
        }
        if worktree_path.is_some() {
            self.worktree_path = worktree_path;
        }
        if backend_port.is_some() {
            self.backend_port = backend_port;
        }
        if frontend_port.is_some() {
            self.frontend_port = frontend_port;
        }
        if let Some(model_set) = model_set {
            self.model_set = model_set;
        }
    }

    pub fn append_sub_workflow(&mut self, name: &str) {
        if !self.all_adws.iter().any(|existing| existing == name) {
            self.all_adws.push(name.to_string());
        }
    }

    pub fn working_directory(&self) -> Option<&Path> {
        self.worktree_path.as_deref().map(Path::new)
    }

    pub fn to_pretty_json(&self) -> io::Result<String> {
        serde_json::to_string_pretty(self).map_err(io::Error::other)
    }
}

pub trait StateRepository: Send + Sync {
    /// Returns `None` when no record exists or the stored record is unreadable.
    fn load(&self, adw_id: &str) -> Option<RunState>;
    fn save(&self, state: &RunState) -> io::Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileStateRepository {
    agents_root: PathBuf,
}

impl FileStateRepository {
    pub fn new(agents_root: impl Into<PathBuf>) -> Self {
        Self {
            agents_root: agents_root.into(),
        }
    }

    pub fn state_path(&self, adw_id: &str) -> PathBuf {
        self.agents_root.join(adw_id).join(STATE_FILE_NAME)
    }
}

impl StateRepository for FileStateRepository {
    fn load(&self, adw_id: &str) -> Option<RunState> {
        let path = self.state_path(adw_id);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(adw_id, path = %path.display(), "no stored run state");
                return None;
            }
            Err(err) => {
                warn!(adw_id, path = %path.display(), error = %err, "run state unreadable");
                return None;
            }
        };
        match serde_json::from_str::<RunState>(&text) {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(adw_id, path = %path.display(), error = %err, "run state malformed");
                None
            }
        }
    }

    fn save(&self, state: &RunState) -> io::Result<()> {
        validate_run_id(&state.adw_id)
            .map_err(|msg| io::Error::new(io::ErrorKind::InvalidInput, msg))?;
        let text = state.to_pretty_json()?;
        write_text_file_atomic(&self.state_path(&state.adw_id), &text)
    }
}

pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Run IDs name directories, so they are restricted to a path-safe alphabet.
pub fn validate_run_id(adw_id: &str) -> Result<(), String> {
    let valid = !adw_id.is_empty()
        && adw_id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
    if valid {
        Ok(())
    } else {
        Err(format!("Invalid ADW ID: {adw_id:?}"))
    }
}

#[cfg(test)]
#[path = "../tests/unit/state_tests.rs"]
mod tests;
