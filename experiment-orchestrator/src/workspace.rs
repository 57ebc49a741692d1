//! Isolated workspaces, one per variant.
//!
//! The orchestrator only relies on [`WorkspaceProvisioner`]. [`GitWorktreeProvisioner`]
//! is the stock implementation: each variant gets its own `git worktree` on a
//! dedicated branch, laid out as `<workspace_root>/<experiment-slug>/<variant-slug>`
//! and checked out on `exp/<experiment-slug>/<variant-slug>`.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::slug;

#[async_trait]
pub trait WorkspaceProvisioner: Send + Sync {
    /// Create the workspace for (`experiment`, `variant`) at `base_ref`.
    ///
    /// Calling this again while the workspace exists returns the same path or
    /// fails; it never creates a second workspace for the pair.
    async fn provision(
        &self,
        experiment: &str,
        variant: &str,
        base_ref: &str,
    ) -> OrchestratorResult<PathBuf>;

    /// Remove a workspace. Best-effort; callers log failures and move on.
    async fn destroy(&self, workspace: &Path) -> OrchestratorResult<()>;
}

/// Workspaces as git worktrees of one repository
#[derive(Debug, Clone)]
pub struct GitWorktreeProvisioner {
    repo_root: PathBuf,
    workspace_root: PathBuf,
}

impl GitWorktreeProvisioner {
    pub fn new(repo_root: impl Into<PathBuf>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            workspace_root: workspace_root.into(),
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(&config.repo_root, &config.workspace_root)
    }

    pub fn workspace_path(&self, experiment: &str, variant: &str) -> PathBuf {
        self.workspace_root.join(slug(experiment)).join(slug(variant))
    }

    pub fn branch_name(experiment: &str, variant: &str) -> String {
        format!("exp/{}/{}", slug(experiment), slug(variant))
    }

    async fn git(&self, args: &[&str]) -> std::io::Result<Output> {
        debug!(?args, repo = %self.repo_root.display(), "git");
        Command::new("git")
            .current_dir(&self.repo_root)
            .args(args)
            .output()
            .await
    }

    /// Absolute paths of every worktree git knows about
    async fn registered_worktrees(&self) -> std::io::Result<Vec<PathBuf>> {
        let output = self.git(&["worktree", "list", "--porcelain"]).await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.strip_prefix("worktree "))
            .map(PathBuf::from)
            .collect())
    }

    async fn branch_exists(&self, branch: &str) -> std::io::Result<bool> {
        let reference = format!("refs/heads/{}", branch);
        let output = self
            .git(&["rev-parse", "--verify", "--quiet", &reference])
            .await?;
        Ok(output.status.success())
    }
}

fn absolute(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

#[async_trait]
impl WorkspaceProvisioner for GitWorktreeProvisioner {
    async fn provision(
        &self,
        experiment: &str,
        variant: &str,
        base_ref: &str,
    ) -> OrchestratorResult<PathBuf> {
        let fail = |message: String| OrchestratorError::provision_failed(variant, message);

        let path = absolute(&self.workspace_path(experiment, variant))
            .map_err(|e| fail(format!("cannot resolve workspace path: {}", e)))?;

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let canonical = tokio::fs::canonicalize(&path)
                .await
                .map_err(|e| fail(format!("cannot resolve {}: {}", path.display(), e)))?;
            let registered = self
                .registered_worktrees()
                .await
                .map_err(|e| fail(format!("git worktree list failed: {}", e)))?;

            if registered.iter().any(|w| w == &canonical || w == &path) {
                info!(experiment, variant, workspace = %path.display(), "reusing existing worktree");
                return Ok(path);
            }
            return Err(fail(format!(
                "{} already exists and is not a worktree of {}",
                path.display(),
                self.repo_root.display()
            )));
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| fail(format!("cannot create {}: {}", parent.display(), e)))?;
        }

        let branch = Self::branch_name(experiment, variant);
        let path_arg = path.to_string_lossy().to_string();
        let branch_exists = self
            .branch_exists(&branch)
            .await
            .map_err(|e| fail(format!("git rev-parse failed: {}", e)))?;

        // A leftover branch from an earlier cleanup is checked out again as-is
        let output = if branch_exists {
            self.git(&["worktree", "add", &path_arg, &branch]).await
        } else {
            self.git(&["worktree", "add", "-b", &branch, &path_arg, base_ref])
                .await
        }
        .map_err(|e| fail(format!("failed to run git: {}", e)))?;

        if !output.status.success() {
            return Err(fail(format!("git worktree add failed: {}", stderr_of(&output))));
        }

        info!(experiment, variant, branch = %branch, workspace = %path.display(), "worktree created");
        Ok(path)
    }

    async fn destroy(&self, workspace: &Path) -> OrchestratorResult<()> {
        let path_arg = workspace.to_string_lossy().to_string();
        let output = self
            .git(&["worktree", "remove", "--force", &path_arg])
            .await
            .map_err(|e| OrchestratorError::destroy_failed(workspace, e.to_string()))?;

        if output.status.success() {
            info!(workspace = %workspace.display(), "worktree removed");
            return Ok(());
        }

        // Directory already gone: drop git's stale bookkeeping and call it done
        if !tokio::fs::try_exists(workspace).await.unwrap_or(false) {
            warn!(workspace = %workspace.display(), "worktree directory missing, pruning");
            let _ = self.git(&["worktree", "prune"]).await;
            return Ok(());
        }

        Err(OrchestratorError::destroy_failed(workspace, stderr_of(&output)))
    }
}
