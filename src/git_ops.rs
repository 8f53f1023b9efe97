use std::path::Path;
use std::process::Command;

use tracing::debug;

use crate::error::GitError;

pub trait GitOps: Send + Sync {
    fn create_branch(&self, name: &str, cwd: Option<&Path>) -> Result<(), GitError>;
    fn checkout(&self, name: &str, cwd: Option<&Path>) -> Result<(), GitError>;
    /// Stages everything and commits. Nothing to commit is a success.
    fn commit(&self, message: &str, cwd: Option<&Path>) -> Result<(), GitError>;
    fn push(&self, branch: &str, cwd: Option<&Path>) -> Result<(), GitError>;
    fn find_pull_request(&self, branch: &str, cwd: Option<&Path>)
    -> Result<Option<String>, GitError>;
    fn is_worktree(&self, path: &Path) -> bool;
}

#[derive(Debug, Clone, Default)]
pub struct GitCli;

impl GitCli {
    fn run(&self, program: &str, args: &[&str], cwd: Option<&Path>) -> Result<String, GitError> {
        let mut command = Command::new(program);
        command.args(args);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }
        debug!(program, ?args, "running");
        let output = command.output().map_err(|source| GitError::Spawn {
            program: program.to_string(),
            source,
        })?;
        if !output.status.success() {
            return Err(GitError::Command {
                command: format!("{program} {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn branch_exists(&self, name: &str, cwd: Option<&Path>) -> bool {
        self.run(
            "git",
            &["rev-parse", "--verify", "--quiet", &format!("refs/heads/{name}")],
            cwd,
        )
        .is_ok()
    }
}

impl GitOps for GitCli {
    fn create_branch(&self, name: &str, cwd: Option<&Path>) -> Result<(), GitError> {
        if self.branch_exists(name, cwd) {
            return self.checkout(name, cwd);
        }
        self.run("git", &["checkout", "-b", name], cwd).map(|_| ())
    }

    fn checkout(&self, name: &str, cwd: Option<&Path>) -> Result<(), GitError> {
        self.run("git", &["checkout", name], cwd).map(|_| ())
    }

    fn commit(&self, message: &str, cwd: Option<&Path>) -> Result<(), GitError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(GitError::Invalid("empty commit message".to_string()));
        }
        self.run("git", &["add", "-A"], cwd)?;
        if self.run("git", &["diff", "--cached", "--quiet"], cwd).is_ok() {
            debug!("nothing to commit");
            return Ok(());
        }
        self.run("git", &["commit", "-m", message], cwd).map(|_| ())
    }

    fn push(&self, branch: &str, cwd: Option<&Path>) -> Result<(), GitError> {
        self.run("git", &["push", "-u", "origin", branch], cwd)
            .map(|_| ())
    }

    fn find_pull_request(
        &self,
        branch: &str,
        cwd: Option<&Path>,
    ) -> Result<Option<String>, GitError> {
        let stdout = self.run(
            "gh",
            &["pr", "list", "--head", branch, "--json", "url", "--jq", ".[0].url"],
            cwd,
        )?;
        Ok(parse_pull_request_url(&stdout))
    }

    fn is_worktree(&self, path: &Path) -> bool {
        if !path.is_dir() || !path.join(".git").exists() {
            return false;
        }
        self.run("git", &["rev-parse", "--is-inside-work-tree"], Some(path))
            .map(|out| out == "true")
            .unwrap_or(false)
    }
}

fn parse_pull_request_url(stdout: &str) -> Option<String> {
    let trimmed = stdout.trim();
    (!trimmed.is_empty() && trimmed != "null").then(|| trimmed.to_string())
}
