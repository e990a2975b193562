//! Auto-confirm daemon: a background per-repo process that watches stored
//! instances and answers known prompts on the user's behalf.
//!
//! The daemon runs only while no controller does: the controller stops it
//! before accepting input and relaunches it on exit when auto-confirm is
//! enabled. Its writes to the state document are confined to startup load
//! and shutdown save.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::config::Config;
use crate::instance;
use crate::repo::RepoContext;
use crate::store::{FileStore, StateStorage};

/// Repeated failures on the same instance are logged at most this often.
const ERROR_LOG_INTERVAL: Duration = Duration::from_secs(60);

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Route SIGINT/SIGTERM into the shutdown flag checked by the polling
/// loops (daemon and headless controller alike).
pub fn install_shutdown_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int);
    // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

/// Spawn the daemon for a repo as a detached re-exec of ourselves.
pub fn spawn(repo_root: &Path) -> Result<()> {
    let exe = std::env::current_exe().context("failed to determine cs executable path")?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("--daemon")
        .arg("--repo-path")
        .arg(repo_root)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    // SAFETY: setsid() creates a new session so the daemon survives the
    // controller's exit; it has no memory-safety implications.
    #[cfg(unix)]
    unsafe {
        use std::os::unix::process::CommandExt;
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
    cmd.spawn().context("failed to spawn auto-confirm daemon")?;
    Ok(())
}

/// Stop a previously launched daemon for this repo, if one is running.
/// Returns whether a live daemon was signalled.
pub fn stop(state_dir: &Path) -> Result<bool> {
    let pid_path = state_dir.join("daemon.pid");
    let Ok(content) = fs::read_to_string(&pid_path) else {
        return Ok(false);
    };
    let Ok(pid) = content.trim().parse::<i32>() else {
        let _ = fs::remove_file(&pid_path);
        return Ok(false);
    };

    // SAFETY: kill(pid, 0) only checks for existence; kill(pid, SIGTERM)
    // sends a signal. Neither touches our memory.
    let alive = unsafe { libc::kill(pid, 0) == 0 };
    if alive {
        tracing::info!(pid, "stopping auto-confirm daemon");
        // SAFETY: see above.
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
        // Give it a moment to persist and remove its own PID file.
        for _ in 0..20 {
            if !pid_path.exists() {
                return Ok(true);
            }
            thread::sleep(Duration::from_millis(50));
        }
    }
    let _ = fs::remove_file(&pid_path);
    Ok(alive)
}

/// Rate limiter for per-instance error logging.
struct ErrorThrottle {
    last_logged: HashMap<String, Instant>,
    interval: Duration,
}

impl ErrorThrottle {
    fn new(interval: Duration) -> Self {
        Self {
            last_logged: HashMap::new(),
            interval,
        }
    }

    fn should_log(&mut self, key: &str) -> bool {
        let now = Instant::now();
        match self.last_logged.get(key) {
            Some(last) if now.duration_since(*last) < self.interval => false,
            _ => {
                self.last_logged.insert(key.to_string(), now);
                true
            }
        }
    }
}

/// The daemon main loop. Blocks until SIGINT/SIGTERM.
pub fn run(repo_path: &Path, cfg: &Config) -> Result<()> {
    let repo = RepoContext::discover(repo_path)?;
    let state_dir = repo.ensure_state_dir()?;

    install_shutdown_handlers();

    let pid_path = repo.daemon_pid_path();
    fs::write(&pid_path, std::process::id().to_string())
        .with_context(|| format!("failed to write {}", pid_path.display()))?;

    let mut store = FileStore::load(&state_dir)?;
    let mut instances = instance::deserialize_instances(&repo, store.get_instances())?;
    for inst in &mut instances {
        inst.set_auto_yes(true);
    }
    tracing::info!(
        repo = %repo.root().display(),
        instances = instances.len(),
        "auto-confirm daemon started"
    );

    let mut throttle = ErrorThrottle::new(ERROR_LOG_INTERVAL);
    let interval = cfg.daemon_poll_interval();

    while !shutdown_requested() {
        for inst in &mut instances {
            if !inst.started() || inst.is_paused() {
                continue;
            }
            match inst.has_updated() {
                Ok(obs) if obs.has_prompt => {
                    tracing::debug!(title = %inst.title(), "prompt detected, confirming");
                    if let Err(err) = inst.tap_enter()
                        && throttle.should_log(inst.title())
                    {
                        tracing::warn!(title = %inst.title(), %err, "failed to confirm prompt");
                    }
                    if let Err(err) = inst.update_diff_stats()
                        && throttle.should_log(inst.title())
                    {
                        tracing::warn!(title = %inst.title(), %err, "failed to refresh diff stats");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    if throttle.should_log(inst.title()) {
                        tracing::warn!(title = %inst.title(), %err, "monitor sample failed");
                    }
                }
            }
        }
        thread::sleep(interval);
    }

    tracing::info!("auto-confirm daemon stopping");
    store.save_instances(instance::serialize_instances(&instances)?)?;
    let _ = fs::remove_file(&pid_path);
    Ok(())
}
