use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::{CommandModelsConfig, ModelsConfig};

pub const FALLBACK_MODEL: &str = "sonnet";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    #[default]
    Base,
    Heavy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CommandModels {
    base: Option<String>,
    heavy: Option<String>,
}

impl CommandModels {
    fn from_config(config: CommandModelsConfig) -> Self {
        Self {
            base: normalize_model(config.base.as_deref()),
            heavy: normalize_model(config.heavy.as_deref()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelRouting {
    default_model: String,
    commands: HashMap<String, CommandModels>,
}

impl Default for ModelRouting {
    fn default() -> Self {
        Self::from_config(&ModelsConfig::default())
    }
}

impl ModelRouting {
    pub fn from_config(config: &ModelsConfig) -> Self {
        let mut commands = HashMap::new();
        for (command, models) in config.commands.clone() {
            let key = normalize_command(&command);
            if key.is_empty() {
                continue;
            }
            commands.insert(key, CommandModels::from_config(models));
        }
        Self {
            default_model: normalize_model(Some(&config.default))
                .unwrap_or_else(|| FALLBACK_MODEL.to_string()),
            commands,
        }
    }

    /// Unmapped commands fall back to the default model; a heavy tier with no
    /// heavy entry falls back to the command's base model.
    pub fn resolve(&self, command: &str, tier: ModelTier) -> String {
        let Some(models) = self.commands.get(&normalize_command(command)) else {
            return self.default_model.clone();
        };
        let picked = match tier {
            ModelTier::Base => models.base.as_ref(),
            ModelTier::Heavy => models.heavy.as_ref().or(models.base.as_ref()),
        };
        picked
            .cloned()
            .unwrap_or_else(|| self.default_model.clone())
    }
}

fn normalize_model(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

fn normalize_command(command: &str) -> String {
    let trimmed = command.trim();
    if trimmed.is_empty() || trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

#[cfg(test)]
#[path = "../tests/unit/agent_models_tests.rs"]
mod tests;
