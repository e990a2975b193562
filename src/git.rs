//! Git worktree lifecycle and diff accounting.
//!
//! Each instance occupies its own worktree on its own branch, created from
//! the repo's current HEAD. Worktrees live under the state directory's
//! `worktrees/` subtree; pausing removes the worktree but keeps the branch.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use thiserror::Error;

use crate::cmd::{self, CmdError, CmdOutput};

#[derive(Debug, Error)]
pub enum GitError {
    #[error("branch {branch} is already checked out in another worktree")]
    BranchConflict { branch: String },
    #[error("`{cmd}` failed: {stderr}")]
    CommandFailed { cmd: String, stderr: String },
    #[error(transparent)]
    Subprocess(#[from] CmdError),
}

/// Lines added/removed and files touched relative to an instance's base
/// commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DiffStats {
    pub added: u64,
    pub removed: u64,
    pub changed_files: u64,
}

impl DiffStats {
    pub fn is_empty(&self) -> bool {
        self.changed_files == 0
    }
}

/// Worktree operations for one repository.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    repo_root: PathBuf,
}

impl WorktreeManager {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
        }
    }

    /// Run git with `-C dir`, requiring success.
    fn git_in(&self, dir: &Path, args: &[&str], timeout: Duration) -> Result<String, GitError> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(dir).args(args);
        let desc = cmd::describe(&cmd);
        let out = cmd::output_with_timeout(cmd, timeout)?;
        if !out.success() {
            return Err(GitError::CommandFailed {
                cmd: desc,
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(out.stdout)
    }

    fn git(&self, args: &[&str]) -> Result<String, GitError> {
        self.git_in(&self.repo_root, args, cmd::GIT_TIMEOUT)
    }

    /// Run git tolerating failure, returning the raw output.
    fn git_unchecked(&self, args: &[&str]) -> Result<CmdOutput, GitError> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&self.repo_root).args(args);
        Ok(cmd::output_with_timeout(cmd, cmd::GIT_TIMEOUT)?)
    }

    pub fn branch_exists(&self, branch: &str) -> bool {
        self.git_unchecked(&["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")])
            .map(|o| o.success())
            .unwrap_or(false)
    }

    /// Create `branch` (if absent) and check out a new worktree for it at
    /// `worktree_path`. Returns the base commit: the HEAD the worktree was
    /// created from, recorded as the diff baseline.
    ///
    /// A branch that survives from a paused instance is reused as-is; a
    /// branch checked out in another worktree is a conflict, not retried.
    pub fn setup(&self, branch: &str, worktree_path: &Path) -> Result<String, GitError> {
        self.setup_from(branch, worktree_path, "HEAD")
    }

    /// Like [`setup`](Self::setup), but a missing branch is created at
    /// `start_point` instead of HEAD. Used when a controller restart finds a
    /// record whose branch has vanished and recreates it at the recorded
    /// base commit.
    pub fn setup_from(
        &self,
        branch: &str,
        worktree_path: &Path,
        start_point: &str,
    ) -> Result<String, GitError> {
        if let Some(parent) = worktree_path.parent() {
            fs::create_dir_all(parent).map_err(|e| GitError::CommandFailed {
                cmd: format!("mkdir {}", parent.display()),
                stderr: e.to_string(),
            })?;
        }

        let wt = worktree_path.to_string_lossy();
        let out = if self.branch_exists(branch) {
            self.git_unchecked(&["worktree", "add", &wt, branch])?
        } else {
            self.git_unchecked(&["worktree", "add", "-b", branch, &wt, start_point])?
        };
        if !out.success() {
            return Err(self.classify_worktree_failure(branch, &out.stderr));
        }

        self.head_commit(worktree_path)
    }

    fn classify_worktree_failure(&self, branch: &str, stderr: &str) -> GitError {
        if stderr.contains("already checked out") || stderr.contains("already used by worktree") {
            GitError::BranchConflict {
                branch: branch.to_string(),
            }
        } else {
            GitError::CommandFailed {
                cmd: format!("git worktree add ({branch})"),
                stderr: stderr.trim().to_string(),
            }
        }
    }

    /// Remove a worktree from git's bookkeeping and from disk.
    pub fn cleanup(&self, worktree_path: &Path) -> Result<(), GitError> {
        let wt = worktree_path.to_string_lossy();
        let out = self.git_unchecked(&["worktree", "remove", "--force", &wt])?;
        if !out.success() {
            // The directory may already be gone; prune the bookkeeping and
            // clear whatever is left on disk.
            let _ = self.prune();
            if worktree_path.exists() {
                fs::remove_dir_all(worktree_path).map_err(|e| GitError::CommandFailed {
                    cmd: format!("rm -r {}", worktree_path.display()),
                    stderr: e.to_string(),
                })?;
            }
        }
        Ok(())
    }

    /// Drop dangling worktree entries. Invoked on controller startup.
    pub fn prune(&self) -> Result<(), GitError> {
        self.git(&["worktree", "prune"]).map(|_| ())
    }

    /// Delete a branch outright (instance kill). Best effort for callers
    /// that accumulate teardown errors.
    pub fn delete_branch(&self, branch: &str) -> Result<(), GitError> {
        self.git(&["branch", "-D", branch]).map(|_| ())
    }

    pub fn is_dirty(&self, worktree_path: &Path) -> Result<bool, GitError> {
        let out = self.git_in(worktree_path, &["status", "--porcelain"], cmd::GIT_TIMEOUT)?;
        Ok(!out.trim().is_empty())
    }

    /// Stage and commit everything in the worktree. No-op when clean.
    /// Returns whether a commit was made.
    pub fn commit_changes(&self, worktree_path: &Path, message: &str) -> Result<bool, GitError> {
        if !self.is_dirty(worktree_path)? {
            return Ok(false);
        }
        self.git_in(worktree_path, &["add", "-A"], cmd::GIT_TIMEOUT)?;
        self.git_in(
            worktree_path,
            &["commit", "-m", message, "--no-verify"],
            cmd::GIT_TIMEOUT,
        )?;
        Ok(true)
    }

    pub fn push_changes(
        &self,
        worktree_path: &Path,
        remote: &str,
        branch: &str,
    ) -> Result<(), GitError> {
        self.git_in(
            worktree_path,
            &["push", "-u", remote, branch],
            cmd::GIT_PUSH_TIMEOUT,
        )
        .map(|_| ())
    }

    pub fn head_commit(&self, dir: &Path) -> Result<String, GitError> {
        Ok(self
            .git_in(dir, &["rev-parse", "HEAD"], cmd::GIT_TIMEOUT)?
            .trim()
            .to_string())
    }

    /// Diff the worktree (tracked changes, committed or not) against the
    /// recorded base commit.
    ///
    /// Uses `--numstat` rather than the human-oriented `--stat` summary:
    /// exact per-file counts, machine-readable, locale-proof.
    pub fn diff_stats(&self, worktree_path: &Path, base_commit: &str) -> Result<DiffStats, GitError> {
        let out = self.git_in(
            worktree_path,
            &["diff", "--numstat", base_commit],
            cmd::GIT_TIMEOUT,
        )?;
        Ok(sum_numstat(&out))
    }
}

/// Total up a `git diff --numstat` listing.
///
/// Each row is `<added>\t<removed>\t<path>`; binary files report `-` in the
/// count columns and still count as a changed file. Anything that doesn't
/// look like a numstat row is skipped.
fn sum_numstat(output: &str) -> DiffStats {
    output.lines().filter_map(numstat_row).fold(
        DiffStats::default(),
        |acc, (added, removed)| DiffStats {
            added: acc.added + added,
            removed: acc.removed + removed,
            changed_files: acc.changed_files + 1,
        },
    )
}

/// Split one numstat row into its count columns. `None` for non-row lines;
/// binary `-` columns become zero.
fn numstat_row(line: &str) -> Option<(u64, u64)> {
    let mut cols = line.splitn(3, '\t');
    let added = cols.next()?;
    let removed = cols.next()?;
    cols.next()?; // path column must be present
    let count = |col: &str| match col.trim() {
        "-" => Some(0),
        n => n.parse().ok(),
    };
    Some((count(added)?, count(removed)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    // -- sum_numstat --

    #[test]
    fn numstat_sums_across_files() {
        let output = "3\t1\tsrc/main.rs\n5\t6\tsrc/lib.rs\n";
        let stats = sum_numstat(output);
        assert_eq!(stats.changed_files, 2);
        assert_eq!(stats.added, 8);
        assert_eq!(stats.removed, 7);
    }

    #[test]
    fn numstat_counts_binary_files_without_line_totals() {
        let output = "15\t0\tnotes.txt\n-\t-\tassets/logo.png\n";
        let stats = sum_numstat(output);
        assert_eq!(stats.changed_files, 2);
        assert_eq!(stats.added, 15);
        assert_eq!(stats.removed, 0);
    }

    #[test]
    fn numstat_keeps_tabs_in_paths() {
        // A path containing a tab only splits on the first two columns.
        let stats = sum_numstat("2\t0\todd\tname.txt\n");
        assert_eq!(stats.changed_files, 1);
        assert_eq!(stats.added, 2);
    }

    #[test]
    fn numstat_ignores_non_rows_and_empty_output() {
        assert!(sum_numstat("").is_empty());
        assert!(sum_numstat("warning: something unrelated\n").is_empty());
    }

    // -- worktree lifecycle against a scratch repo --

    fn init_repo() -> (tempfile::TempDir, WorktreeManager) {
        let dir = tempfile::tempdir().unwrap();
        let run = |args: &[&str]| {
            let out = Command::new("git")
                .arg("-C")
                .arg(dir.path())
                .args(args)
                .output()
                .unwrap();
            assert!(
                out.status.success(),
                "git {args:?}: {}",
                String::from_utf8_lossy(&out.stderr)
            );
        };
        run(&["init"]);
        run(&["config", "user.email", "cs@test"]);
        run(&["config", "user.name", "cs"]);
        fs::write(dir.path().join("README.md"), "hello\n").unwrap();
        run(&["add", "-A"]);
        run(&["commit", "-m", "init"]);
        let mgr = WorktreeManager::new(dir.path());
        (dir, mgr)
    }

    #[test]
    fn setup_creates_branch_worktree_and_records_base() {
        let (dir, mgr) = init_repo();
        let wt = dir.path().join(".claude-squad/worktrees/t1_abc");

        let base = mgr.setup("cs/t1", &wt).unwrap();
        assert!(wt.join("README.md").exists());
        assert!(mgr.branch_exists("cs/t1"));
        assert_eq!(base, mgr.head_commit(dir.path()).unwrap());
    }

    #[test]
    fn cleanup_removes_worktree_but_keeps_branch() {
        let (dir, mgr) = init_repo();
        let wt = dir.path().join("wt-keepbranch");
        mgr.setup("cs/keep", &wt).unwrap();

        mgr.cleanup(&wt).unwrap();
        assert!(!wt.exists());
        assert!(mgr.branch_exists("cs/keep"));
    }

    #[test]
    fn setup_reuses_surviving_branch() {
        let (dir, mgr) = init_repo();
        let first = dir.path().join("wt-first");
        mgr.setup("cs/again", &first).unwrap();
        mgr.cleanup(&first).unwrap();

        // Same branch, new path: the paused-then-resumed case.
        let second = dir.path().join("wt-second");
        mgr.setup("cs/again", &second).unwrap();
        assert!(second.join("README.md").exists());
    }

    #[test]
    fn setup_conflicts_when_branch_checked_out_elsewhere() {
        let (dir, mgr) = init_repo();
        let first = dir.path().join("wt-a");
        mgr.setup("cs/conflict", &first).unwrap();

        let second = dir.path().join("wt-b");
        let err = mgr.setup("cs/conflict", &second).unwrap_err();
        assert!(matches!(err, GitError::BranchConflict { .. }));
    }

    #[test]
    fn commit_changes_is_noop_when_clean() {
        let (dir, mgr) = init_repo();
        let wt = dir.path().join("wt-clean");
        mgr.setup("cs/clean", &wt).unwrap();

        assert!(!mgr.is_dirty(&wt).unwrap());
        assert!(!mgr.commit_changes(&wt, "checkpoint").unwrap());
    }

    #[test]
    fn commit_and_diff_stats_track_the_base() {
        let (dir, mgr) = init_repo();
        let wt = dir.path().join("wt-diff");
        let base = mgr.setup("cs/diff", &wt).unwrap();

        fs::write(wt.join("new.txt"), "one\ntwo\n").unwrap();
        assert!(mgr.is_dirty(&wt).unwrap());
        assert!(mgr.commit_changes(&wt, "checkpoint").unwrap());
        assert!(!mgr.is_dirty(&wt).unwrap());

        let stats = mgr.diff_stats(&wt, &base).unwrap();
        assert_eq!(stats.changed_files, 1);
        assert_eq!(stats.added, 2);
        assert_eq!(stats.removed, 0);

        // The base commit stays an ancestor of the worktree HEAD.
        let out = Command::new("git")
            .arg("-C")
            .arg(&wt)
            .args(["merge-base", "--is-ancestor", &base, "HEAD"])
            .output()
            .unwrap();
        assert!(out.status.success());
    }

    #[test]
    fn push_changes_reaches_a_local_remote() {
        let (dir, mgr) = init_repo();
        let remote = tempfile::tempdir().unwrap();
        let out = Command::new("git")
            .args(["init", "--bare"])
            .arg(remote.path())
            .output()
            .unwrap();
        assert!(out.status.success());
        let out = Command::new("git")
            .arg("-C")
            .arg(dir.path())
            .args(["remote", "add", "origin"])
            .arg(remote.path())
            .output()
            .unwrap();
        assert!(out.status.success());

        let wt = dir.path().join("wt-push");
        mgr.setup("cs/push", &wt).unwrap();
        fs::write(wt.join("p.txt"), "payload\n").unwrap();
        mgr.commit_changes(&wt, "checkpoint").unwrap();
        mgr.push_changes(&wt, "origin", "cs/push").unwrap();

        let out = Command::new("git")
            .arg("-C")
            .arg(remote.path())
            .args(["rev-parse", "--verify", "refs/heads/cs/push"])
            .output()
            .unwrap();
        assert!(out.status.success());
    }

    #[test]
    fn delete_branch_after_cleanup() {
        let (dir, mgr) = init_repo();
        let wt = dir.path().join("wt-kill");
        mgr.setup("cs/kill", &wt).unwrap();
        mgr.cleanup(&wt).unwrap();
        mgr.delete_branch("cs/kill").unwrap();
        assert!(!mgr.branch_exists("cs/kill"));
    }
}
