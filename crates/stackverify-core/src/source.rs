//! Pushing application source to a remote repository.
//!
//! The engine only consumes the returned [`CommitId`], which correlates the
//! push with the build and release records it triggers.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PushError;
use crate::exec::{CommandRunner, CommandSpec};

/// Full commit hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitId(String);

impl CommitId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First seven characters, as used in release names.
    pub fn short(&self) -> &str {
        self.0.get(..7).unwrap_or(&self.0)
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What to push and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRequest {
    /// Repository cloned as the base of the push.
    pub upstream_url: String,
    pub upstream_ref: String,
    /// Remote the result is force-pushed to.
    pub target_url: String,
    pub remote_name: String,
    /// Directory overlaid on top of the clone before committing.
    pub content_dir: PathBuf,
    pub commit_message: String,
    pub author_email: String,
    pub author_name: String,
    /// `(url prefix, helper)` pair for `credential.<url>.helper`.
    pub credential_helper: Option<(String, String)>,
    pub post_buffer: u64,
}

/// Commits content and pushes it to a remote repository.
#[async_trait]
pub trait SourcePusher: Send + Sync {
    async fn push(&self, request: &PushRequest) -> Result<CommitId, PushError>;
}

/// [`SourcePusher`] driving the `git` CLI in a temporary clone.
pub struct GitSourcePusher {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    timeout: Option<Duration>,
}

impl GitSourcePusher {
    pub fn new(runner: Arc<dyn CommandRunner>, binary: impl Into<String>) -> Self {
        Self {
            runner,
            binary: binary.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    async fn git(&self, dir: Option<&Path>, args: &[&str]) -> Result<String, PushError> {
        let mut spec = CommandSpec::new(&self.binary)
            .args(args.iter().copied())
            .timeout(self.timeout);
        if let Some(dir) = dir {
            spec = spec.cwd(dir);
        }
        let output = self.runner.run(&spec).await?;
        if !output.passed() {
            return Err(PushError::Git {
                step: args.first().copied().unwrap_or_default().to_string(),
                stderr: output.diagnostic().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl SourcePusher for GitSourcePusher {
    async fn push(&self, request: &PushRequest) -> Result<CommitId, PushError> {
        let workdir = tempfile::tempdir()?;
        let dir = workdir.path();
        let dir_arg = dir.to_string_lossy().to_string();

        self.git(
            None,
            &["clone", "--branch", &request.upstream_ref, &request.upstream_url, &dir_arg],
        )
        .await?;
        let cwd = Some(dir);
        self.git(cwd, &["config", "user.email", &request.author_email]).await?;
        self.git(cwd, &["config", "user.name", &request.author_name]).await?;
        if let Some((url, helper)) = &request.credential_helper {
            let key = format!("credential.{url}.helper");
            self.git(cwd, &["config", &key, helper]).await?;
        }
        self.git(cwd, &["config", "init.defaultBranch", "main"]).await?;
        let post_buffer = request.post_buffer.to_string();
        self.git(cwd, &["config", "http.postBuffer", &post_buffer]).await?;
        self.git(cwd, &["checkout", "-b", "main"]).await?;
        self.git(cwd, &["remote", "add", &request.remote_name, &request.target_url])
            .await?;

        let from = request.content_dir.clone();
        let to = dir.to_path_buf();
        tokio::task::spawn_blocking(move || overlay_dir(&from, &to))
            .await
            .map_err(|e| PushError::Io(std::io::Error::other(e.to_string())))??;

        self.git(cwd, &["add", "."]).await?;
        self.git(cwd, &["commit", "-m", &request.commit_message, "--allow-empty"])
            .await?;
        self.git(cwd, &["push", "--all", &request.remote_name, "-f"]).await?;

        let head = self.git(cwd, &["rev-parse", "HEAD"]).await?;
        let head = head.trim();
        if head.is_empty() {
            return Err(PushError::EmptyCommit);
        }
        tracing::info!(target_repo = %request.target_url, commit = %head, "source pushed");
        Ok(CommitId::new(head))
    }
}

/// Copy `from` recursively over `to`, replacing files that exist in both.
/// `.git` directories in `from` are skipped.
pub fn overlay_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let name = entry.file_name();
        if name == ".git" {
            continue;
        }
        let target = to.join(&name);
        if entry.file_type()?.is_dir() {
            overlay_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
