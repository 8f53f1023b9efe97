use std::io;

#[derive(Debug, thiserror::Error)]
pub enum AdwError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("{0}")]
    Precondition(String),

    #[error("{0}")]
    Agent(String),

    #[error("Git error: {0}")]
    Git(#[from] GitError),

    #[error("Issue tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Tests failed: {unit} unit, {e2e} e2e")]
    TestsFailed { unit: usize, e2e: usize },
}

pub type Result<T> = std::result::Result<T, AdwError>;

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("failed to run `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("failed to run `gh`: {0}")]
    Spawn(#[source] io::Error),

    #[error("`gh {command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("unexpected issue payload: {0}")]
    Payload(#[from] serde_json::Error),
}
