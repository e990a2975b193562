//! Instance lifecycle: the state machine coupling one git worktree, one
//! tmux session, and one durable record.
//!
//! Every transition orders its steps so that a crash in the middle leaves a
//! recoverable state: worktree first, then session, then the record. Start
//! rolls back in reverse order on failure; Pause and Kill surface partial
//! failures instead of aborting teardown.

use std::path::{Path, PathBuf};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::git::{DiffStats, GitError, WorktreeManager};
use crate::repo::RepoContext;
use crate::status::{Observation, Status, StatusMonitor};
use crate::tmux::{self, AttachOutcome, SessionError, TmuxSession};

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("cannot {op} instance {title:?} while it is {}", status.as_str())]
    InvalidState {
        op: &'static str,
        title: String,
        status: Status,
    },
    #[error("{step} failed for instance {title:?}: {source}")]
    Transition {
        step: &'static str,
        title: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("session for instance {0:?} disappeared")]
    SessionLost(String),
    #[error("branch {branch} is checked out elsewhere; close that worktree first")]
    BranchConflict { branch: String },
    #[error("teardown of instance {title:?} was incomplete: {}", failures.join("; "))]
    KillIncomplete {
        title: String,
        failures: Vec<String>,
    },
    #[error(transparent)]
    InvalidTitle(SessionError),
}

/// Options for creating a brand-new instance.
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub title: String,
    pub program: String,
    pub branch_prefix: String,
    pub auto_yes: bool,
}

/// Serialized form of an instance, stored in the state document's
/// `instances` array. The store treats the array as opaque; this schema is
/// owned here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub title: String,
    pub program: String,
    pub branch: String,
    pub worktree_path: PathBuf,
    pub base_commit: String,
    pub session_name: String,
    pub status: Status,
    pub auto_yes: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub diff_stats: DiffStats,
    #[serde(default)]
    pub started: bool,
}

/// One managed assistant: worktree + session + durable record + monitor.
///
/// Callers must serialize operations on a single instance; operations on
/// different instances are independent.
#[derive(Debug)]
pub struct Instance {
    title: String,
    program: String,
    branch: String,
    worktree_path: PathBuf,
    base_commit: String,
    status: Status,
    auto_yes: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    diff_stats: DiffStats,
    started: bool,

    // Runtime-only, rebuilt on load; never serialized.
    repo_root: PathBuf,
    git: WorktreeManager,
    session: TmuxSession,
    monitor: StatusMonitor,
}

impl Instance {
    /// Create a memory-only instance. Nothing touches disk until
    /// [`start`](Self::start).
    pub fn new(repo: &RepoContext, opts: NewInstance) -> Result<Self, InstanceError> {
        let sanitized = tmux::sanitize_title(&opts.title).map_err(InstanceError::InvalidTitle)?;
        let branch = format!("{}{sanitized}", opts.branch_prefix);
        let session_name = tmux::session_name(repo.hash(), &sanitized);
        // Hex timestamp suffix: a repeatedly-created title never collides.
        let worktree_path = repo
            .worktrees_dir()
            .join(format!("{sanitized}_{:x}", Utc::now().timestamp_micros()));
        let now = Utc::now();

        let monitor = StatusMonitor::new(&opts.program);
        Ok(Self {
            title: opts.title,
            program: opts.program,
            branch,
            worktree_path,
            base_commit: String::new(),
            status: Status::Loading,
            auto_yes: opts.auto_yes,
            created_at: now,
            updated_at: now,
            diff_stats: DiffStats::default(),
            started: false,
            repo_root: repo.root().to_path_buf(),
            git: WorktreeManager::new(repo.root()),
            session: TmuxSession::new(session_name),
            monitor,
        })
    }

    /// Rebuild a live instance from its persisted record.
    pub fn from_record(repo: &RepoContext, record: InstanceRecord) -> Self {
        Self {
            monitor: StatusMonitor::new(&record.program),
            session: TmuxSession::new(record.session_name),
            git: WorktreeManager::new(repo.root()),
            repo_root: repo.root().to_path_buf(),
            title: record.title,
            program: record.program,
            branch: record.branch,
            worktree_path: record.worktree_path,
            base_commit: record.base_commit,
            status: record.status,
            auto_yes: record.auto_yes,
            created_at: record.created_at,
            updated_at: record.updated_at,
            diff_stats: record.diff_stats,
            started: record.started,
        }
    }

    pub fn to_record(&self) -> InstanceRecord {
        InstanceRecord {
            title: self.title.clone(),
            program: self.program.clone(),
            branch: self.branch.clone(),
            worktree_path: self.worktree_path.clone(),
            base_commit: self.base_commit.clone(),
            session_name: self.session.name().to_string(),
            status: self.status,
            auto_yes: self.auto_yes,
            created_at: self.created_at,
            updated_at: self.updated_at,
            diff_stats: self.diff_stats,
            started: self.started,
        }
    }

    // -- accessors --

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn worktree_path(&self) -> &Path {
        &self.worktree_path
    }

    pub fn base_commit(&self) -> &str {
        &self.base_commit
    }

    pub fn session_name(&self) -> &str {
        self.session.name()
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn auto_yes(&self) -> bool {
        self.auto_yes
    }

    pub fn set_auto_yes(&mut self, enabled: bool) {
        self.auto_yes = enabled;
        self.touch();
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn is_paused(&self) -> bool {
        self.status == Status::Paused
    }

    pub fn diff_stats(&self) -> DiffStats {
        self.diff_stats
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn transition_err(
        &self,
        step: &'static str,
        source: impl Into<anyhow::Error>,
    ) -> InstanceError {
        InstanceError::Transition {
            step,
            title: self.title.clone(),
            source: source.into(),
        }
    }

    // -- lifecycle transitions --

    /// Start the instance. `first_time` creates everything from scratch with
    /// reverse-order rollback on failure; otherwise the persisted record is
    /// brought back to life after a controller restart.
    pub fn start(&mut self, first_time: bool) -> Result<(), InstanceError> {
        if first_time {
            self.start_new()
        } else {
            self.start_load()
        }
    }

    fn start_new(&mut self) -> Result<(), InstanceError> {
        if self.started {
            return Err(InstanceError::InvalidState {
                op: "start",
                title: self.title.clone(),
                status: self.status,
            });
        }

        // Step 1: worktree. Remember whether we created the branch so
        // rollback can undo exactly what this call did.
        let branch_created = !self.git.branch_exists(&self.branch);
        let base = match self.git.setup(&self.branch, &self.worktree_path) {
            Ok(base) => base,
            Err(GitError::BranchConflict { branch }) => {
                return Err(InstanceError::BranchConflict { branch });
            }
            Err(err) => return Err(self.transition_err("create worktree", err)),
        };

        // Step 2: session. Roll back step 1 on failure.
        if let Err(err) = self
            .session
            .start(&self.worktree_path, &self.program, &self.repo_root)
        {
            let _ = self.git.cleanup(&self.worktree_path);
            if branch_created {
                let _ = self.git.delete_branch(&self.branch);
            }
            return Err(self.transition_err("start session", err));
        }

        // Step 3: record. Persisting is the caller's final step.
        self.base_commit = base;
        self.status = Status::Running;
        self.started = true;
        self.monitor.reset();
        self.touch();
        Ok(())
    }

    fn start_load(&mut self) -> Result<(), InstanceError> {
        // A paused record stays paused: no worktree, no session.
        if self.is_paused() {
            return Ok(());
        }

        // Step 1: adopt the worktree if branch and directory survived,
        // otherwise recreate it (at the recorded base commit if even the
        // branch is gone).
        if !self.worktree_path.exists() || !self.git.branch_exists(&self.branch) {
            let start_point: &str =
                if self.git.branch_exists(&self.branch) || self.base_commit.is_empty() {
                    "HEAD"
                } else {
                    &self.base_commit
                };
            match self
                .git
                .setup_from(&self.branch, &self.worktree_path, start_point)
            {
                Ok(_) => {}
                Err(GitError::BranchConflict { branch }) => {
                    return Err(InstanceError::BranchConflict { branch });
                }
                Err(err) => return Err(self.transition_err("recreate worktree", err)),
            }
        }

        // Step 2: adopt the session or start afresh.
        let restored = self
            .session
            .restore()
            .map_err(|err| self.transition_err("restore session", err))?;
        if !restored {
            self.session
                .start(&self.worktree_path, &self.program, &self.repo_root)
                .map_err(|err| self.transition_err("start session", err))?;
            self.monitor.reset();
        }

        // Step 3: status stays whatever was persisted.
        self.started = true;
        Ok(())
    }

    /// Commit, tear down session and worktree, keep the branch.
    pub fn pause(&mut self) -> Result<(), InstanceError> {
        if !self.started || self.is_paused() {
            return Err(InstanceError::InvalidState {
                op: "pause",
                title: self.title.clone(),
                status: self.status,
            });
        }

        // Step 1: checkpoint whatever the assistant left behind.
        if self.worktree_path.exists() {
            let message = format!(
                "[claudesquad] checkpoint: {} at {}",
                self.title,
                Utc::now().to_rfc3339()
            );
            self.git
                .commit_changes(&self.worktree_path, &message)
                .map_err(|err| self.transition_err("commit changes", err))?;
        }

        // Step 2: release any attach client.
        self.session.detach_safely();

        // Step 3: kill the session. No rollback from here: a failure is
        // surfaced and the instance stays in its current state.
        self.session
            .kill()
            .map_err(|err| self.transition_err("kill session", err))?;

        // Step 4: drop the worktree, keep the branch.
        self.git
            .cleanup(&self.worktree_path)
            .map_err(|err| self.transition_err("remove worktree", err))?;

        // Step 5: record.
        self.status = Status::Paused;
        self.touch();
        Ok(())
    }

    /// Inverse of [`pause`](Self::pause): recreate the worktree from the
    /// preserved branch and start a fresh session.
    pub fn resume(&mut self) -> Result<(), InstanceError> {
        if !self.is_paused() {
            return Err(InstanceError::InvalidState {
                op: "resume",
                title: self.title.clone(),
                status: self.status,
            });
        }

        // Step 1: worktree from the preserved branch. The diff baseline is
        // the original base commit, so it is left untouched.
        match self.git.setup(&self.branch, &self.worktree_path) {
            Ok(_) => {}
            Err(GitError::BranchConflict { branch }) => {
                return Err(InstanceError::BranchConflict { branch });
            }
            Err(err) => return Err(self.transition_err("recreate worktree", err)),
        }

        // Step 2: session, rolling back the worktree on failure.
        if let Err(err) = self
            .session
            .start(&self.worktree_path, &self.program, &self.repo_root)
        {
            let _ = self.git.cleanup(&self.worktree_path);
            return Err(self.transition_err("start session", err));
        }

        // Step 3: record.
        self.monitor.reset();
        self.status = Status::Running;
        self.touch();
        Ok(())
    }

    /// Best-effort teardown of session, worktree, and branch. Errors are
    /// accumulated, not aborted on; the caller removes the record.
    pub fn kill(&mut self) -> Result<(), InstanceError> {
        let mut failures = Vec::new();

        if let Err(err) = self.session.kill() {
            failures.push(format!("kill session: {err}"));
        }
        if self.worktree_path.exists()
            && let Err(err) = self.git.cleanup(&self.worktree_path)
        {
            failures.push(format!("remove worktree: {err}"));
        }
        if self.started
            && self.git.branch_exists(&self.branch)
            && let Err(err) = self.git.delete_branch(&self.branch)
        {
            failures.push(format!("delete branch: {err}"));
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(InstanceError::KillIncomplete {
                title: self.title.clone(),
                failures,
            })
        }
    }

    // -- session interaction --

    /// Attach the controlling terminal to the session. Valid only while
    /// Running or Ready; does not modify state.
    pub fn attach(&mut self) -> Result<AttachOutcome, InstanceError> {
        if !matches!(self.status, Status::Running | Status::Ready) {
            return Err(InstanceError::InvalidState {
                op: "attach",
                title: self.title.clone(),
                status: self.status,
            });
        }
        match self.session.attach() {
            Ok(outcome) => Ok(outcome),
            Err(SessionError::NotFound(_)) => {
                Err(InstanceError::SessionLost(self.title.clone()))
            }
            Err(err) => Err(self.transition_err("attach", err)),
        }
    }

    /// Send literal text followed by Enter, without attaching.
    pub fn send_prompt(&self, text: &str) -> Result<(), InstanceError> {
        self.session
            .send_keys(text)
            .and_then(|()| self.session.tap_enter())
            .map_err(|err| self.transition_err("send prompt", err))
    }

    /// Answer a pending confirmation prompt.
    pub fn tap_enter(&self) -> Result<(), InstanceError> {
        self.session
            .tap_enter()
            .map_err(|err| self.transition_err("tap enter", err))
    }

    // -- monitoring --

    /// Sample the session once: did the output move, and is a known prompt
    /// on screen? Fails with [`InstanceError::SessionLost`] when the session
    /// vanished out from under us.
    pub fn has_updated(&mut self) -> Result<Observation, InstanceError> {
        let captured = self.capture_for_monitor()?;
        Ok(self.monitor.has_updated(&captured))
    }

    /// Sample the session and refresh the persisted status
    /// (Running/Ready/Loading). Paused instances are left alone.
    pub fn refresh_status(&mut self) -> Result<Status, InstanceError> {
        if self.is_paused() {
            return Ok(Status::Paused);
        }
        let captured = self.capture_for_monitor()?;
        let status = self.monitor.classify(&captured);
        if status != self.status {
            self.status = status;
            self.touch();
        }
        Ok(status)
    }

    fn capture_for_monitor(&mut self) -> Result<String, InstanceError> {
        if self.is_paused() {
            return Err(InstanceError::InvalidState {
                op: "monitor",
                title: self.title.clone(),
                status: self.status,
            });
        }
        match self.session.capture(false) {
            Ok(captured) => Ok(captured),
            Err(SessionError::NotFound(_)) => {
                Err(InstanceError::SessionLost(self.title.clone()))
            }
            Err(err) => Err(self.transition_err("capture output", err)),
        }
    }

    /// Salvage an instance whose session disappeared: checkpoint the
    /// worktree, remove it, and leave the instance Paused so Resume can
    /// bring it back.
    pub fn mark_session_lost(&mut self) -> Result<(), InstanceError> {
        tracing::error!(title = %self.title, "session lost; checkpointing and pausing");
        if self.worktree_path.exists() {
            let message = format!(
                "[claudesquad] checkpoint: {} at {}",
                self.title,
                Utc::now().to_rfc3339()
            );
            self.git
                .commit_changes(&self.worktree_path, &message)
                .map_err(|err| self.transition_err("commit changes", err))?;
            self.git
                .cleanup(&self.worktree_path)
                .map_err(|err| self.transition_err("remove worktree", err))?;
        }
        self.status = Status::Paused;
        self.touch();
        Ok(())
    }

    /// Recompute the diff against the recorded base commit.
    pub fn update_diff_stats(&mut self) -> Result<DiffStats, InstanceError> {
        if self.is_paused() || self.base_commit.is_empty() || !self.worktree_path.exists() {
            return Ok(self.diff_stats);
        }
        let stats = self
            .git
            .diff_stats(&self.worktree_path, &self.base_commit)
            .map_err(|err| self.transition_err("diff stats", err))?;
        if stats != self.diff_stats {
            self.diff_stats = stats;
            self.touch();
        }
        Ok(stats)
    }

    /// Commit and push the branch to a remote.
    pub fn push_changes(&self, remote: &str) -> Result<(), InstanceError> {
        self.git
            .push_changes(&self.worktree_path, remote, &self.branch)
            .map_err(|err| self.transition_err("push", err))
    }
}

// -- collection serialization -----------------------------------------------

/// Serialize all instances into the opaque array the store persists.
pub fn serialize_instances(instances: &[Instance]) -> anyhow::Result<Value> {
    let records: Vec<InstanceRecord> = instances.iter().map(Instance::to_record).collect();
    Ok(serde_json::to_value(records)?)
}

/// Rebuild instances from the store's opaque array.
pub fn deserialize_instances(repo: &RepoContext, value: Value) -> anyhow::Result<Vec<Instance>> {
    if value.is_null() {
        return Ok(Vec::new());
    }
    let records: Vec<InstanceRecord> = serde_json::from_value(value)
        .map_err(|e| anyhow!("stored instances are unreadable: {e}"))?;
    Ok(records
        .into_iter()
        .map(|r| Instance::from_record(repo, r))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::process::Command;

    fn scratch_repo() -> (tempfile::TempDir, RepoContext) {
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
        let repo = RepoContext::discover(dir.path()).unwrap();
        repo.ensure_state_dir().unwrap();
        (dir, repo)
    }

    fn opts(title: &str) -> NewInstance {
        NewInstance {
            title: title.to_string(),
            program: "claude".to_string(),
            branch_prefix: "claudesquad/".to_string(),
            auto_yes: false,
        }
    }

    fn tmux_available() -> bool {
        Command::new("tmux")
            .arg("-V")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[test]
    fn new_derives_branch_session_and_worktree_names() {
        let (_dir, repo) = scratch_repo();
        let inst = Instance::new(&repo, opts("my task.v2")).unwrap();

        assert_eq!(inst.branch(), "claudesquad/mytask_v2");
        assert_eq!(
            inst.session_name(),
            format!("claudesquad_{}_mytask_v2", repo.hash())
        );
        assert!(inst.worktree_path().starts_with(repo.worktrees_dir()));
        assert!(!inst.started());
    }

    #[test]
    fn new_rejects_blank_titles() {
        let (_dir, repo) = scratch_repo();
        let err = Instance::new(&repo, opts("   ")).unwrap_err();
        assert!(matches!(err, InstanceError::InvalidTitle(_)));
    }

    #[test]
    fn record_round_trip_preserves_fields() {
        let (_dir, repo) = scratch_repo();
        let mut inst = Instance::new(&repo, opts("t1")).unwrap();
        inst.set_auto_yes(true);

        let value = serialize_instances(std::slice::from_ref(&inst)).unwrap();
        let rebuilt = deserialize_instances(&repo, value).unwrap();
        assert_eq!(rebuilt.len(), 1);
        let back = &rebuilt[0];
        assert_eq!(back.title(), "t1");
        assert_eq!(back.program(), "claude");
        assert_eq!(back.branch(), inst.branch());
        assert_eq!(back.worktree_path(), inst.worktree_path());
        assert!(back.auto_yes());
        assert_eq!(back.status(), inst.status());
    }

    #[test]
    fn deserialize_tolerates_null_and_empty() {
        let (_dir, repo) = scratch_repo();
        assert!(deserialize_instances(&repo, Value::Null).unwrap().is_empty());
        assert!(
            deserialize_instances(&repo, serde_json::json!([]))
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn guards_reject_out_of_order_transitions() {
        let (_dir, repo) = scratch_repo();
        let mut inst = Instance::new(&repo, opts("guards")).unwrap();

        // Not started yet: pause and resume are both invalid.
        assert!(matches!(
            inst.pause(),
            Err(InstanceError::InvalidState { op: "pause", .. })
        ));
        assert!(matches!(
            inst.resume(),
            Err(InstanceError::InvalidState { op: "resume", .. })
        ));
        // Loading: attach is only valid in Running/Ready.
        assert!(matches!(
            inst.attach(),
            Err(InstanceError::InvalidState { op: "attach", .. })
        ));
    }

    #[test]
    fn create_start_kill_end_to_end() {
        if !tmux_available() {
            return;
        }
        let (_dir, repo) = scratch_repo();
        let mut inst = Instance::new(&repo, opts("t1")).unwrap();

        inst.start(true).unwrap();
        assert!(inst.started());
        assert_eq!(inst.status(), Status::Running);
        assert!(inst.worktree_path().exists());
        assert!(!inst.base_commit().is_empty());
        assert!(
            TmuxSession::new(inst.session_name().to_string())
                .has_session()
                .unwrap()
        );

        inst.kill().unwrap();
        assert!(!inst.worktree_path().exists());
        assert!(
            !TmuxSession::new(inst.session_name().to_string())
                .has_session()
                .unwrap()
        );
    }

    #[test]
    fn pause_resume_round_trip_preserves_work() {
        if !tmux_available() {
            return;
        }
        let (_dir, repo) = scratch_repo();
        let mut inst = Instance::new(&repo, opts("t2")).unwrap();
        inst.start(true).unwrap();

        let branch = inst.branch().to_string();
        let base = inst.base_commit().to_string();
        fs::write(inst.worktree_path().join("work.txt"), "progress\n").unwrap();

        inst.pause().unwrap();
        assert_eq!(inst.status(), Status::Paused);
        assert!(!inst.worktree_path().exists());
        assert!(
            !TmuxSession::new(inst.session_name().to_string())
                .has_session()
                .unwrap()
        );

        inst.resume().unwrap();
        assert_eq!(inst.status(), Status::Running);
        // The committed file came back on the preserved branch, and the
        // diff baseline survived the round trip.
        assert!(inst.worktree_path().join("work.txt").exists());
        assert_eq!(inst.branch(), branch);
        assert_eq!(inst.base_commit(), base);
        let stats = inst.update_diff_stats().unwrap();
        assert_eq!(stats.changed_files, 1);

        inst.kill().unwrap();
    }

    #[test]
    fn failed_start_names_the_step_and_leaves_no_branch() {
        let (_dir, repo) = scratch_repo();
        let mut inst = Instance::new(&repo, opts("rollback")).unwrap();
        // A file squatting on the worktree path makes step 1 fail.
        fs::create_dir_all(inst.worktree_path().parent().unwrap()).unwrap();
        fs::write(inst.worktree_path(), "in the way").unwrap();

        let err = inst.start(true).unwrap_err();
        assert!(matches!(
            err,
            InstanceError::Transition {
                step: "create worktree",
                ..
            }
        ));
        assert!(!inst.started());
        assert!(!WorktreeManager::new(repo.root()).branch_exists(inst.branch()));
    }
}
