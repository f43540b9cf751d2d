//! Version-control operations, shelled out to `git`.
//!
//! The engine and workspace manager consume the narrow [`VcsRunner`]
//! capability; tests substitute a stub.

use std::path::Path;
use std::process::Command;

use crate::error::AtlasError;
use crate::exec;

/// The version-control capability the core consumes.
pub trait VcsRunner: Send + Sync {
    fn branch_exists(&self, repo: &Path, branch: &str) -> bool;
    /// Add a worktree at `path` for `branch`, creating the branch from
    /// `base` when it does not exist yet.
    fn worktree_add(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
        base: &str,
    ) -> Result<(), AtlasError>;
    fn worktree_remove(&self, repo: &Path, path: &Path, force: bool) -> Result<(), AtlasError>;
    fn stage_all(&self, dir: &Path) -> Result<(), AtlasError>;
    fn has_staged_changes(&self, dir: &Path) -> Result<bool, AtlasError>;
    fn staged_diff(&self, dir: &Path) -> Result<String, AtlasError>;
    fn commit(&self, dir: &Path, message: &str) -> Result<(), AtlasError>;
    fn push(&self, dir: &Path, branch: &str) -> Result<(), AtlasError>;
    fn recent_commits(&self, dir: &Path, count: usize) -> Result<Vec<String>, AtlasError>;
    /// Full diff of the branch against its merge base (for `view_diff`).
    fn branch_diff(&self, dir: &Path, base: &str) -> Result<String, AtlasError>;
}

/// Shells out to the `git` binary.
#[derive(Debug, Default, Clone)]
pub struct GitRunner;

impl GitRunner {
    fn git(&self, dir: &Path, args: &[&str]) -> Result<String, AtlasError> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(dir).args(args);
        let display = exec::display_command(&cmd);
        let output = exec::run(&mut cmd, None).map_err(|e| AtlasError::CommandFailed {
            command: display.clone(),
            exit_code: None,
            stderr: e.to_string(),
        })?;
        if !output.status.success() {
            return Err(AtlasError::CommandFailed {
                command: display,
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl VcsRunner for GitRunner {
    fn branch_exists(&self, repo: &Path, branch: &str) -> bool {
        self.git(
            repo,
            &[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ],
        )
        .is_ok()
    }

    fn worktree_add(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
        base: &str,
    ) -> Result<(), AtlasError> {
        let path_str = path.to_string_lossy().into_owned();
        if self.branch_exists(repo, branch) {
            self.git(repo, &["worktree", "add", path_str.as_str(), branch])?;
        } else {
            self.git(
                repo,
                &["worktree", "add", "-b", branch, path_str.as_str(), base],
            )?;
        }
        Ok(())
    }

    fn worktree_remove(&self, repo: &Path, path: &Path, force: bool) -> Result<(), AtlasError> {
        let path_str = path.to_string_lossy().into_owned();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(path_str.as_str());
        self.git(repo, &args)?;
        Ok(())
    }

    fn stage_all(&self, dir: &Path) -> Result<(), AtlasError> {
        self.git(dir, &["add", "--all"])?;
        Ok(())
    }

    fn has_staged_changes(&self, dir: &Path) -> Result<bool, AtlasError> {
        // diff --cached --quiet exits 1 when there are staged changes.
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(dir).args(["diff", "--cached", "--quiet"]);
        let display = exec::display_command(&cmd);
        let output = exec::run(&mut cmd, None).map_err(|e| AtlasError::CommandFailed {
            command: display,
            exit_code: None,
            stderr: e.to_string(),
        })?;
        Ok(!output.status.success())
    }

    fn staged_diff(&self, dir: &Path) -> Result<String, AtlasError> {
        self.git(dir, &["diff", "--cached"])
    }

    fn commit(&self, dir: &Path, message: &str) -> Result<(), AtlasError> {
        self.git(dir, &["commit", "--message", message])?;
        Ok(())
    }

    fn push(&self, dir: &Path, branch: &str) -> Result<(), AtlasError> {
        self.git(dir, &["push", "--set-upstream", "origin", branch])?;
        Ok(())
    }

    fn recent_commits(&self, dir: &Path, count: usize) -> Result<Vec<String>, AtlasError> {
        let log = self.git(
            dir,
            &["log", "--format=%s", &format!("--max-count={count}")],
        )?;
        Ok(log.lines().map(str::to_string).collect())
    }

    fn branch_diff(&self, dir: &Path, base: &str) -> Result<String, AtlasError> {
        self.git(dir, &["diff", &format!("{base}...HEAD")])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // GitRunner error mapping is exercised without a repository: any git
    // invocation in an empty directory fails with a CommandFailed carrying
    // the git stderr.
    #[test]
    fn test_git_failure_maps_to_command_failed() {
        let dir = tempfile::tempdir().unwrap();
        let runner = GitRunner;
        let err = runner.staged_diff(dir.path()).unwrap_err();
        match err {
            AtlasError::CommandFailed {
                command,
                exit_code,
                stderr,
            } => {
                assert!(command.starts_with("git"));
                assert!(exit_code.is_some());
                assert!(!stderr.is_empty());
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_branch_exists_false_outside_repo() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!GitRunner.branch_exists(dir.path(), "main"));
    }
}
