use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::artifact_io::{load_merged_config_text, merge_default_config_with_user_overrides};

pub const CLAUDE_CODE_PATH_ENV: &str = "CLAUDE_CODE_PATH";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AdwConfig {
    pub storage: StorageConfig,
    pub agent: AgentConfig,
    pub models: ModelsConfig,
    pub testing: TestingConfig,
    pub worktree: WorktreeConfig,
    pub knowledge_base: KnowledgeBaseConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub agents_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            agents_dir: "agents".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub program: String,
    pub skip_permissions: bool,
    pub retry: RetryConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            skip_permissions: true,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub delays_secs: Vec<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delays_secs: vec![1, 3, 5],
        }
    }
}

impl RetryConfig {
    /// Delay before retry `n` (0-based). Past the configured list each delay
    /// grows by two seconds from the last one.
    pub fn delays(&self) -> Vec<Duration> {
        let mut delays: Vec<u64> = self.delays_secs.clone();
        while delays.len() < self.max_retries as usize {
            let next = delays.last().copied().unwrap_or(0) + 2;
            delays.push(next);
        }
        delays.truncate(self.max_retries as usize);
        delays.into_iter().map(Duration::from_secs).collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub default: String,
    pub commands: HashMap<String, CommandModelsConfig>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            default: "sonnet".to_string(),
            commands: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CommandModelsConfig {
    pub base: Option<String>,
    pub heavy: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TestingConfig {
    pub max_unit_attempts: u32,
    pub max_e2e_attempts: u32,
    pub ensurance_concurrency: usize,
    pub max_fix_attempts: u32,
    pub test_command: String,
    pub e2e_dir: String,
    pub example_tests: Vec<String>,
    pub example_test_glob_dir: String,
    pub test_doctor: bool,
}

impl Default for TestingConfig {
    fn default() -> Self {
        Self {
            max_unit_attempts: 4,
            max_e2e_attempts: 2,
            ensurance_concurrency: 5,
            max_fix_attempts: 2,
            test_command: "uv run pytest {file} -v --tb=short".to_string(),
            e2e_dir: ".claude/commands/e2e".to_string(),
            example_tests: vec![
                "app/server/tests/test_health.py".to_string(),
                "app/server/tests/test_api.py".to_string(),
            ],
            example_test_glob_dir: "app/server/tests".to_string(),
            test_doctor: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorktreeConfig {
    pub backend_port: u16,
    pub frontend_port: u16,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            backend_port: 9100,
            frontend_port: 9200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KnowledgeBaseConfig {
    pub root: String,
}

impl Default for KnowledgeBaseConfig {
    fn default() -> Self {
        Self {
            root: "app_docs/testing".to_string(),
        }
    }
}

impl AdwConfig {
    pub fn load(explicit: Option<&Path>, project_root: &Path) -> io::Result<Self> {
        let text = load_merged_config_text(explicit, project_root)?;
        let mut config = parse_config(&text)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> io::Result<Self> {
        let merged = merge_default_config_with_user_overrides(Some(text))?;
        parse_config(&merged)
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(program) = lookup(CLAUDE_CODE_PATH_ENV)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
        {
            self.agent.program = program;
        }
    }

    pub fn agents_root(&self, project_root: &Path) -> PathBuf {
        resolve_under(project_root, &self.storage.agents_dir)
    }

    pub fn knowledge_base_root(&self, project_root: &Path) -> PathBuf {
        resolve_under(project_root, &self.knowledge_base.root)
    }
}

fn parse_config(text: &str) -> io::Result<AdwConfig> {
    toml::from_str::<AdwConfig>(text).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

pub fn resolve_under(root: &Path, value: &str) -> PathBuf {
    let path = Path::new(value);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}
