//! Git audit/revert sandboxing (§4.8): detects files a step's portal
//! working tree gained that were not declared in its changeset, and
//! reverts them. Every git invocation is a thin subprocess wrapper with
//! its own timeout — there is no `git2`/libgit2 dependency here, mirroring
//! the small-wrapper-over-subprocess idiom rather than an embedded library.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

use crate::errors::{Result, RunnerError};

/// One method per porcelain operation, each spawning `git` under
/// `root` with its own timeout.
#[derive(Clone)]
pub struct Git {
    root: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            root: root.into(),
            timeout,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<(bool, String)> {
        let child = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output();

        let output = timeout(self.timeout, child).await.map_err(|_| RunnerError::Timeout {
            operation: format!("git {}", args.join(" ")),
            budget_ms: self.timeout.as_millis() as u64,
        })?;

        let output = output.map_err(|e| RunnerError::GitError {
            message: format!("failed to spawn git {}: {e}", args.join(" ")),
            failed_files: Vec::new(),
        })?;

        Ok((
            output.status.success(),
            String::from_utf8_lossy(&output.stdout).to_string(),
        ))
    }

    /// Lines are `XY <path>`: the filename starts three characters in.
    pub async fn status_porcelain(&self) -> Result<Vec<String>> {
        let (ok, stdout) = self.run(&["status", "--porcelain"]).await?;
        if !ok {
            return Err(RunnerError::GitError {
                message: "git status --porcelain exited non-zero".to_string(),
                failed_files: Vec::new(),
            });
        }
        Ok(stdout
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| line.get(3..).unwrap_or(line).trim().to_string())
            .collect())
    }

    pub async fn is_tracked(&self, path: &str) -> Result<bool> {
        let (ok, _) = self.run(&["ls-files", "--error-unmatch", path]).await?;
        Ok(ok)
    }

    pub async fn checkout_head(&self, path: &str) -> Result<()> {
        let (ok, _) = self.run(&["checkout", "HEAD", "--", path]).await?;
        if ok {
            Ok(())
        } else {
            Err(RunnerError::GitError {
                message: format!("git checkout HEAD -- {path} failed"),
                failed_files: vec![path.to_string()],
            })
        }
    }

    pub async fn clean_untracked(&self, path: &str) -> Result<()> {
        let (ok, _) = self.run(&["clean", "-f", path]).await?;
        if ok {
            Ok(())
        } else {
            Err(RunnerError::GitError {
                message: format!("git clean -f {path} failed"),
                failed_files: vec![path.to_string()],
            })
        }
    }
}

/// Returns files present in `git status --porcelain` that are not in
/// `authorized_files`.
pub async fn audit(git: &Git, authorized_files: &HashSet<String>) -> Result<Vec<String>> {
    let changed = git.status_porcelain().await?;
    Ok(changed
        .into_iter()
        .filter(|path| !authorized_files.contains(path))
        .collect())
}

/// Reverts every file in `unauthorized`: tracked files are restored to
/// `HEAD`, untracked files are deleted. Runs in chunks of
/// `revert_concurrency`, each chunk awaited before the next starts.
/// Per-file failures are collected; if any occurred, returns `git_error`
/// naming the failed files.
pub async fn revert(git: &Git, unauthorized: &[String], revert_concurrency: usize) -> Result<()> {
    if unauthorized.is_empty() {
        return Ok(());
    }
    let chunk_size = revert_concurrency.max(1);
    let mut failed = Vec::new();
    let mut succeeded = 0usize;

    for chunk in unauthorized.chunks(chunk_size) {
        let mut set = tokio::task::JoinSet::new();
        for path in chunk {
            let git = git.clone();
            let path = path.clone();
            set.spawn(async move {
                let result = revert_one(&git, &path).await;
                (path, result)
            });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(()))) => succeeded += 1,
                Ok((path, Err(_))) => failed.push(path),
                Err(_) => {} // task panicked; its file is neither counted nor retried here
            }
        }
    }

    tracing::info!(succeeded, failed = failed.len(), "git revert pass complete");

    if failed.is_empty() {
        Ok(())
    } else {
        Err(RunnerError::GitError {
            message: format!("failed to revert {} file(s)", failed.len()),
            failed_files: failed,
        })
    }
}

async fn revert_one(git: &Git, path: &str) -> Result<()> {
    if git.is_tracked(path).await? {
        git.checkout_head(path).await
    } else {
        git.clean_untracked(path).await
    }
}

/// Used by tests and by the executor to build the `authorized_files` set
/// from a [`crate::protocol::ChangesetResult`].
pub fn authorized_set(files_changed: &[String]) -> HashSet<String> {
    files_changed.iter().cloned().collect()
}
