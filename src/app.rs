//! Controller entry points: startup wiring, the per-repo operation surface
//! consumed by the UI collaborator, and the `reset`/`cleanup` commands.
//!
//! One controller per repo, enforced by the process lock. The controller
//! exclusively owns its instances; the store is only ever touched from
//! here (and, disjoint in time, from the daemon's lifecycle boundaries).

use std::io::{self, BufRead, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::config::Config;
use crate::daemon;
use crate::git::WorktreeManager;
use crate::instance::{self, Instance, InstanceError, NewInstance};
use crate::lock::ProcessLock;
use crate::repo::RepoContext;
use crate::status::SAMPLE_INTERVAL;
use crate::store::{FileStore, StateStorage};
use crate::tmux::{self, AttachOutcome, SessionClass, TmuxSession};

/// A running controller: lock held, store loaded, instances live.
#[derive(Debug)]
pub struct Controller {
    repo: RepoContext,
    cfg: Config,
    store: FileStore,
    instances: Vec<Instance>,
    default_program: String,
    // NOTE(lifetime): held for the whole controller lifetime; dropping it
    // releases the repo to other controllers.
    _lock: ProcessLock,
}

impl Controller {
    /// Bring up the controller for the repository at `path`.
    ///
    /// Order matters: lock first (fail fast when another controller owns
    /// the repo), then stop any daemon so the store has a single writer,
    /// then prune stale git bookkeeping, then load and revive instances.
    pub fn start(path: &Path, cfg: Config, program_override: Option<String>) -> Result<Self> {
        let repo = RepoContext::discover(path)?;
        let state_dir = repo.ensure_state_dir()?;

        let lock = ProcessLock::acquire(&state_dir)?;
        daemon::stop(&state_dir)?;
        WorktreeManager::new(repo.root()).prune()?;

        let store = FileStore::load(&state_dir)?;
        let mut instances = instance::deserialize_instances(&repo, store.get_instances())?;
        for inst in &mut instances {
            if let Err(err) = inst.start(false) {
                tracing::error!(title = %inst.title(), %err, "failed to revive instance");
            }
        }

        let default_program = program_override.unwrap_or_else(|| cfg.default_program.clone());
        let mut controller = Self {
            repo,
            cfg,
            store,
            instances,
            default_program,
            _lock: lock,
        };
        controller.persist()?;
        Ok(controller)
    }

    pub fn repo(&self) -> &RepoContext {
        &self.repo
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    fn find_mut(&mut self, title: &str) -> Result<&mut Instance> {
        self.instances
            .iter_mut()
            .find(|i| i.title() == title)
            .with_context(|| format!("no instance titled {title:?}"))
    }

    /// Create and start a new instance. Titles are unique per repo.
    pub fn create_instance(
        &mut self,
        title: &str,
        program: Option<String>,
        auto_yes: bool,
    ) -> Result<&Instance> {
        if self.instances.iter().any(|i| i.title() == title) {
            bail!("an instance titled {title:?} already exists in this repo");
        }
        let mut inst = Instance::new(
            &self.repo,
            NewInstance {
                title: title.to_string(),
                program: program.unwrap_or_else(|| self.default_program.clone()),
                branch_prefix: self.cfg.branch_prefix.clone(),
                auto_yes,
            },
        )?;
        inst.start(true)?;
        self.instances.push(inst);

        // Persisting the record is the final step; if it fails, the
        // worktree and session created above must not outlive this call.
        if let Err(persist_err) = self.persist() {
            let mut inst = self.instances.pop().expect("just pushed");
            if let Err(err) = inst.kill() {
                tracing::error!(title = %inst.title(), %err, "rollback after failed persist was incomplete");
            }
            return Err(persist_err);
        }
        Ok(self.instances.last().expect("just pushed"))
    }

    /// Attach the controlling terminal to an instance's session. Blocks
    /// until detach (Ctrl-Q) or session exit.
    pub fn attach(&mut self, title: &str) -> Result<AttachOutcome> {
        let inst = self.find_mut(title)?;
        match inst.attach() {
            Ok(AttachOutcome::SessionExited) | Err(InstanceError::SessionLost(_)) => {
                // The session died out from under us: checkpoint and offer
                // Resume instead of leaving a half-dead record.
                inst.mark_session_lost()?;
                self.persist()?;
                Ok(AttachOutcome::SessionExited)
            }
            Ok(outcome) => Ok(outcome),
            Err(err) => Err(err.into()),
        }
    }

    pub fn pause(&mut self, title: &str) -> Result<()> {
        self.find_mut(title)?.pause()?;
        self.persist()
    }

    pub fn resume(&mut self, title: &str) -> Result<()> {
        self.find_mut(title)?.resume()?;
        self.persist()
    }

    /// Tear an instance down and drop its record. Partial teardown still
    /// removes the record; the failures are reported.
    pub fn kill(&mut self, title: &str) -> Result<()> {
        let idx = self
            .instances
            .iter()
            .position(|i| i.title() == title)
            .with_context(|| format!("no instance titled {title:?}"))?;
        let result = self.instances[idx].kill();
        self.instances.remove(idx);
        self.persist()?;
        result.map_err(Into::into)
    }

    pub fn send_prompt(&mut self, title: &str, text: &str) -> Result<()> {
        self.find_mut(title)?.send_prompt(text)?;
        Ok(())
    }

    /// Write the instances back through the store.
    pub fn persist(&mut self) -> Result<()> {
        let value = instance::serialize_instances(&self.instances)?;
        self.store.save_instances(value)
    }

    /// One monitor pass over every live instance. Returns whether any
    /// status changed (and therefore was persisted).
    pub fn poll_once(&mut self) -> Result<bool> {
        let mut changed = false;
        let mut lost: Vec<String> = Vec::new();

        for inst in &mut self.instances {
            if !inst.started() || inst.is_paused() {
                continue;
            }
            let before = inst.status();
            match inst.refresh_status() {
                Ok(after) => {
                    if after != before {
                        tracing::info!(
                            title = %inst.title(),
                            from = before.as_str(),
                            to = after.as_str(),
                            "status changed"
                        );
                        changed = true;
                    }
                }
                Err(InstanceError::SessionLost(_)) => lost.push(inst.title().to_string()),
                Err(err) => tracing::warn!(title = %inst.title(), %err, "monitor sample failed"),
            }
        }

        for title in lost {
            let inst = self.find_mut(&title)?;
            if let Err(err) = inst.mark_session_lost() {
                tracing::error!(%title, %err, "failed to salvage lost session");
            }
            changed = true;
        }

        if changed {
            self.persist()?;
        }
        Ok(changed)
    }

    /// Headless drive loop: monitor every instance until SIGINT/SIGTERM.
    /// The interactive UI is a separate collaborator layered on the same
    /// operations this type exposes.
    pub fn run_headless(&mut self) -> Result<()> {
        daemon::install_shutdown_handlers();
        println!(
            "cs: managing {} instance(s) in {} (Ctrl-C to exit)",
            self.instances.len(),
            self.repo.root().display()
        );
        for inst in &self.instances {
            println!(
                "  {} {} [{}] {}",
                inst.status().symbol(),
                inst.title(),
                inst.status().as_str(),
                inst.branch()
            );
        }

        while !daemon::shutdown_requested() {
            self.poll_once()?;
            std::thread::sleep(SAMPLE_INTERVAL);
        }
        self.persist()
    }

    /// Final persist + optional daemon hand-off. Consumes the controller;
    /// the lock is released on drop, after the daemon has been spawned.
    pub fn shutdown(mut self, launch_daemon: bool) -> Result<()> {
        self.persist()?;
        if launch_daemon
            && self
                .instances
                .iter()
                .any(|i| i.started() && !i.is_paused())
        {
            daemon::spawn(self.repo.root())?;
            println!("auto-confirm daemon launched");
        }
        Ok(())
    }
}

/// Remove every trace of this tool from a repository: instances, sessions,
/// worktrees, daemon.
pub fn reset(path: &Path) -> Result<()> {
    let repo = RepoContext::discover(path)?;
    let state_dir = repo.ensure_state_dir()?;
    // Taking the lock keeps us from resetting under a live controller.
    let _lock = ProcessLock::acquire(&state_dir)?;

    daemon::stop(&state_dir)?;

    // Kill this repo's sessions (prefix match on the repo hash).
    let prefix = format!("{}{}_", tmux::SESSION_PREFIX, repo.hash());
    for name in tmux::list_squad_sessions()? {
        if name.starts_with(&prefix) {
            tracing::info!(session = %name, "killing session");
            TmuxSession::new(name).kill()?;
        }
    }

    // Drop instance records and start the document over.
    let mut store = FileStore::load(&state_dir)?;
    store.delete_all_instances()?;

    // Prune worktrees and remove the tree on disk.
    let git = WorktreeManager::new(repo.root());
    let worktrees = repo.worktrees_dir();
    if worktrees.exists() {
        for entry in std::fs::read_dir(&worktrees)?.flatten() {
            let _ = git.cleanup(&entry.path());
        }
        let _ = std::fs::remove_dir_all(&worktrees);
    }
    git.prune()?;

    // Remove the document and its siblings so the next load starts fresh.
    for entry in std::fs::read_dir(&state_dir)?.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("state.json") || name == "daemon.pid" {
            let _ = std::fs::remove_file(entry.path());
        }
    }

    println!("reset {}", repo.root().display());
    Ok(())
}

/// Host-wide orphan handling: list every claude-squad session on the tmux
/// server, classify it by its recorded repo path, and kill the dead ones.
pub fn cleanup(kill_all: bool) -> Result<()> {
    let sessions = tmux::list_squad_sessions()?;
    if sessions.is_empty() {
        println!("no claude-squad sessions on this host");
        return Ok(());
    }

    let mut orphaned: Vec<String> = Vec::new();
    for name in &sessions {
        let repo_path = tmux::session_repo_path(name)?;
        let class = tmux::classify_session(repo_path.as_deref());
        let label = match class {
            SessionClass::Active => "active",
            SessionClass::Orphaned => "orphaned",
            SessionClass::Unknown => "unknown",
        };
        println!(
            "  {name}  [{label}]  {}",
            repo_path
                .as_deref()
                .map_or_else(|| "-".to_string(), |p| p.display().to_string())
        );
        if class == SessionClass::Orphaned {
            orphaned.push(name.clone());
        }
    }

    let victims: Vec<String> = if kill_all {
        sessions
    } else {
        if orphaned.is_empty() {
            println!("nothing to clean up");
            return Ok(());
        }
        print!("kill {} orphaned session(s)? [y/N] ", orphaned.len());
        io::stdout().flush()?;
        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            println!("aborted");
            return Ok(());
        }
        orphaned
    };

    for name in victims {
        println!("killing {name}");
        TmuxSession::new(name).kill()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::process::Command;

    fn scratch_repo() -> tempfile::TempDir {
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
        dir
    }

    fn tmux_available() -> bool {
        Command::new("tmux")
            .arg("-V")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[test]
    fn start_acquires_the_lock_and_writes_default_state() {
        let dir = scratch_repo();
        let controller = Controller::start(dir.path(), Config::default(), None).unwrap();
        assert!(controller.instances().is_empty());

        let state_dir = controller.repo().state_dir();
        assert!(state_dir.join("state.json").exists());
        assert!(state_dir.join("cs.lock").exists());
        assert!(state_dir.join(".gitignore").exists());

        // Second controller in the same repo is refused.
        let err = Controller::start(dir.path(), Config::default(), None).unwrap_err();
        assert!(err.to_string().contains("another cs instance is running"));
    }

    #[test]
    fn lock_is_released_when_controller_drops() {
        let dir = scratch_repo();
        drop(Controller::start(dir.path(), Config::default(), None).unwrap());
        let again = Controller::start(dir.path(), Config::default(), None);
        assert!(again.is_ok());
    }

    #[test]
    fn create_rejects_duplicate_titles() {
        if !tmux_available() {
            return;
        }
        let dir = scratch_repo();
        let mut controller = Controller::start(dir.path(), Config::default(), None).unwrap();
        controller
            .create_instance("t1", Some("sleep 30".into()), false)
            .unwrap();
        let err = controller
            .create_instance("t1", Some("sleep 30".into()), false)
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
        controller.kill("t1").unwrap();
    }

    #[test]
    fn create_start_kill_updates_the_store() {
        if !tmux_available() {
            return;
        }
        let dir = scratch_repo();
        let mut controller = Controller::start(dir.path(), Config::default(), None).unwrap();

        controller
            .create_instance("t1", Some("sleep 30".into()), false)
            .unwrap();
        let state_dir = controller.repo().state_dir();
        let raw = fs::read_to_string(state_dir.join("state.json")).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["instances"].as_array().unwrap().len(), 1);
        assert_eq!(doc["instances"][0]["title"], "t1");

        controller.kill("t1").unwrap();
        let raw = fs::read_to_string(state_dir.join("state.json")).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["instances"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn instances_survive_controller_restart() {
        if !tmux_available() {
            return;
        }
        let dir = scratch_repo();
        {
            let mut controller = Controller::start(dir.path(), Config::default(), None).unwrap();
            controller
                .create_instance("survivor", Some("sleep 60".into()), false)
                .unwrap();
            controller.shutdown(false).unwrap();
        }
        {
            let mut controller = Controller::start(dir.path(), Config::default(), None).unwrap();
            assert_eq!(controller.instances().len(), 1);
            let inst = &controller.instances()[0];
            assert_eq!(inst.title(), "survivor");
            assert!(inst.started());
            assert!(inst.worktree_path().exists());
            controller.kill("survivor").unwrap();
        }
    }

    #[test]
    fn reset_leaves_no_traces() {
        if !tmux_available() {
            return;
        }
        let dir = scratch_repo();
        {
            let mut controller = Controller::start(dir.path(), Config::default(), None).unwrap();
            controller
                .create_instance("doomed", Some("sleep 60".into()), false)
                .unwrap();
            controller.shutdown(false).unwrap();
        }

        reset(dir.path()).unwrap();

        let repo = RepoContext::discover(dir.path()).unwrap();
        let state_dir = repo.state_dir();
        assert!(!state_dir.join("state.json").exists());
        assert!(!repo.worktrees_dir().exists());
        assert!(!state_dir.join("daemon.pid").exists());
        let prefix = format!("{}{}_", tmux::SESSION_PREFIX, repo.hash());
        assert!(
            tmux::list_squad_sessions()
                .unwrap()
                .iter()
                .all(|s| !s.starts_with(&prefix))
        );

        // And a fresh load sees the default state.
        let store = FileStore::load(&repo.ensure_state_dir().unwrap()).unwrap();
        assert_eq!(store.get_instances(), serde_json::json!([]));
        assert_eq!(store.help_screens_seen(), 0);
    }
}
