//! tmux session management: one detached session per instance.
//!
//! Sessions are namespaced `claudesquad_<repo-hash>_<sanitized-title>` so
//! every repo on the host shares one tmux server without collisions. The
//! canonical repo path rides along in a session-scoped environment variable
//! so orphan-detection tooling can recover it after the repo disappears.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use portable_pty::{CommandBuilder, PtySize, native_pty_system};
use thiserror::Error;

use crate::cmd::{self, CmdError, CmdOutput};

/// Prefix shared by every session this tool creates, on any repo.
pub const SESSION_PREFIX: &str = "claudesquad_";

/// Session environment variable carrying the canonical repo path.
pub const REPO_ENV_VAR: &str = "CLAUDE_SQUAD_REPO";

/// Scrollback depth configured on new sessions.
const HISTORY_LIMIT: u32 = 10_000;

/// Detach key while attached: Ctrl-Q (not Ctrl-D, which would kill the
/// assistant's shell).
const DETACH_KEY: u8 = 0x11;

/// Poll interval for the attach supervision loop (child exit, resize).
const ATTACH_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("spawn failed: {0}")]
    SpawnFailed(String),
    #[error("`{cmd}` failed: {stderr}")]
    CommandFailed { cmd: String, stderr: String },
    #[error("`{0}` timed out")]
    Timeout(String),
    #[error("title {0:?} is empty after sanitization")]
    InvalidTitle(String),
    #[error("not attached to session {0}")]
    NotAttached(String),
    #[error("attach failed: {0}")]
    Attach(String),
}

impl From<CmdError> for SessionError {
    fn from(err: CmdError) -> Self {
        match err {
            CmdError::Timeout { cmd, .. } => SessionError::Timeout(cmd),
            CmdError::Spawn { cmd, source } => SessionError::CommandFailed {
                cmd,
                stderr: source.to_string(),
            },
        }
    }
}

/// Strip whitespace and replace `.` with `_` so a title can appear in both
/// tmux session names and branch names. Empty results are rejected.
pub fn sanitize_title(title: &str) -> Result<String, SessionError> {
    let cleaned: String = title
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == '.' { '_' } else { c })
        .collect();
    if cleaned.is_empty() {
        return Err(SessionError::InvalidTitle(title.to_string()));
    }
    Ok(cleaned)
}

/// `claudesquad_<repo-hash>_<sanitized-title>`.
pub fn session_name(repo_hash: &str, sanitized_title: &str) -> String {
    format!("{SESSION_PREFIX}{repo_hash}_{sanitized_title}")
}

/// How an attach ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// The user pressed the detach key; the session is still running.
    Detached,
    /// The attach client exited on its own, so the session is gone.
    SessionExited,
}

/// Handle to one named tmux session.
#[derive(Debug, Clone)]
pub struct TmuxSession {
    name: String,
    /// Set while an attach client is pumping; detach requests flip it.
    detach: Arc<AtomicBool>,
    attached: Arc<AtomicBool>,
}

impl TmuxSession {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            detach: Arc::new(AtomicBool::new(false)),
            attached: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Exact-match target. The `=` prefix stops tmux from prefix-matching,
    /// so `foo` never resolves to `foobar`.
    fn target(&self) -> String {
        format!("={}", self.name)
    }

    fn tmux(&self, args: &[&str]) -> Result<CmdOutput, SessionError> {
        let mut cmd = Command::new("tmux");
        cmd.args(args);
        Ok(cmd::output_with_timeout(cmd, cmd::TMUX_TIMEOUT)?)
    }

    /// Create the detached session running `program` in `working_dir`, with
    /// scrollback and mouse input configured and the canonical repo path
    /// stored in the session environment.
    pub fn start(
        &self,
        working_dir: &Path,
        program: &str,
        repo_path: &Path,
    ) -> Result<(), SessionError> {
        if !working_dir.exists() {
            return Err(SessionError::SpawnFailed(format!(
                "working directory does not exist: {}",
                working_dir.display()
            )));
        }

        let wd = working_dir.to_string_lossy();
        let env = format!("{REPO_ENV_VAR}={}", repo_path.to_string_lossy());
        let out = self.tmux(&[
            "new-session", "-d", "-s", &self.name, "-c", &wd, "-e", &env, program,
        ])?;
        if !out.success() {
            return Err(SessionError::SpawnFailed(out.stderr.trim().to_string()));
        }

        // Styling knobs are non-fatal: the session works without them.
        self.set_option("history-limit", &HISTORY_LIMIT.to_string());
        self.set_option("mouse", "on");
        Ok(())
    }

    fn set_option(&self, option: &str, value: &str) {
        let target = self.target();
        match self.tmux(&["set-option", "-t", &target, option, value]) {
            Ok(out) if !out.success() => {
                tracing::warn!(
                    session = %self.name,
                    option,
                    stderr = %out.stderr.trim(),
                    "tmux set-option failed"
                );
            }
            Err(err) => tracing::warn!(session = %self.name, option, %err, "tmux set-option failed"),
            Ok(_) => {}
        }
    }

    /// Adopt an already-running session of this exact name, if one exists.
    pub fn restore(&self) -> Result<bool, SessionError> {
        self.has_session()
    }

    /// Exact-match liveness check.
    pub fn has_session(&self) -> Result<bool, SessionError> {
        let target = self.target();
        let out = self.tmux(&["has-session", "-t", &target])?;
        Ok(out.success())
    }

    /// Inject literal text into the session without attaching.
    pub fn send_keys(&self, text: &str) -> Result<(), SessionError> {
        let target = self.target();
        // -l = literal mode, -- = end of options (text may start with -)
        let out = self.tmux(&["send-keys", "-t", &target, "-l", "--", text])?;
        if !out.success() {
            return Err(SessionError::NotFound(self.name.clone()));
        }
        Ok(())
    }

    /// Send the Enter key, e.g. to answer a confirmation prompt.
    pub fn tap_enter(&self) -> Result<(), SessionError> {
        let target = self.target();
        let out = self.tmux(&["send-keys", "-t", &target, "Enter"])?;
        if !out.success() {
            return Err(SessionError::NotFound(self.name.clone()));
        }
        Ok(())
    }

    /// Dump pane contents: the visible region, or the full scrollback when
    /// `history` is set.
    pub fn capture(&self, history: bool) -> Result<String, SessionError> {
        let target = self.target();
        let out = if history {
            self.tmux(&["capture-pane", "-t", &target, "-p", "-S", "-"])?
        } else {
            self.tmux(&["capture-pane", "-t", &target, "-p"])?
        };
        if !out.success() {
            return Err(SessionError::NotFound(self.name.clone()));
        }
        Ok(out.stdout)
    }

    /// Terminate the session. Already-dead sessions are fine.
    pub fn kill(&self) -> Result<(), SessionError> {
        let target = self.target();
        let _ = self.tmux(&["kill-session", "-t", &target])?;
        Ok(())
    }

    /// Request the running attach client to stop, leaving the session alive.
    pub fn detach(&self) -> Result<(), SessionError> {
        if !self.attached.load(Ordering::SeqCst) {
            return Err(SessionError::NotAttached(self.name.clone()));
        }
        self.detach.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Like [`detach`](Self::detach), but a no-op when nothing is attached.
    pub fn detach_safely(&self) {
        self.detach.store(true, Ordering::SeqCst);
    }

    /// Attach interactively: run a tmux attach client on a fresh
    /// pseudoterminal and pump bytes between it and the controlling
    /// terminal until the user hits Ctrl-Q or the session dies.
    ///
    /// Cancel-safe: every exit path stops both pumps, reaps the client, and
    /// restores the terminal before returning.
    pub fn attach(&self) -> Result<AttachOutcome, SessionError> {
        if !self.has_session()? {
            return Err(SessionError::NotFound(self.name.clone()));
        }

        let (cols, rows) = crossterm::terminal::size().unwrap_or((80, 24));
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Attach(e.to_string()))?;

        let mut client_cmd = CommandBuilder::new("tmux");
        client_cmd.args(["attach-session", "-t", &self.target()]);
        let mut child = pair
            .slave
            .spawn_command(client_cmd)
            .map_err(|e| SessionError::Attach(e.to_string()))?;
        drop(pair.slave);

        let mut pty_writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::Attach(e.to_string()))?;
        let mut pty_reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::Attach(e.to_string()))?;

        crossterm::terminal::enable_raw_mode().map_err(|e| SessionError::Attach(e.to_string()))?;
        self.detach.store(false, Ordering::SeqCst);
        self.attached.store(true, Ordering::SeqCst);

        let cancel = Arc::clone(&self.detach);

        // Output pump: tmux client -> our terminal. Unblocks with EOF when
        // the client is killed or exits.
        let out_cancel = Arc::clone(&cancel);
        let output_pump = thread::spawn(move || {
            let mut stdout = io::stdout();
            let mut buf = [0u8; 4096];
            loop {
                match pty_reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stdout.write_all(&buf[..n]).is_err() || stdout.flush().is_err() {
                            break;
                        }
                    }
                }
                if out_cancel.load(Ordering::SeqCst) {
                    break;
                }
            }
        });

        // Input pump: our terminal -> tmux client, watching for the detach
        // key. stdin is switched to non-blocking so the pump can observe
        // cancellation instead of parking in read(2).
        let in_cancel = Arc::clone(&cancel);
        let input_pump = thread::spawn(move || {
            let _guard = NonblockingStdin::enable();
            let mut buf = [0u8; 1024];
            while !in_cancel.load(Ordering::SeqCst) {
                // SAFETY: plain read(2) into a stack buffer of the stated length.
                let n = unsafe {
                    libc::read(libc::STDIN_FILENO, buf.as_mut_ptr().cast(), buf.len())
                };
                if n > 0 {
                    let bytes = &buf[..n as usize];
                    if let Some(pos) = bytes.iter().position(|&b| b == DETACH_KEY) {
                        let _ = pty_writer.write_all(&bytes[..pos]);
                        let _ = pty_writer.flush();
                        in_cancel.store(true, Ordering::SeqCst);
                        break;
                    }
                    if pty_writer.write_all(bytes).is_err() || pty_writer.flush().is_err() {
                        break;
                    }
                } else if n == 0 {
                    break; // our own stdin closed
                } else {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::WouldBlock {
                        thread::sleep(Duration::from_millis(10));
                    } else if err.kind() != io::ErrorKind::Interrupted {
                        break;
                    }
                }
            }
        });

        // Supervise: watch for client exit and propagate window resizes.
        let mut last_size = (cols, rows);
        let mut client_exited = false;
        loop {
            if cancel.load(Ordering::SeqCst) {
                break;
            }
            match child.try_wait() {
                Ok(Some(_)) => {
                    client_exited = true;
                    cancel.store(true, Ordering::SeqCst);
                    break;
                }
                Ok(None) => {}
                Err(_) => break,
            }
            if let Ok(size) = crossterm::terminal::size()
                && size != last_size
            {
                last_size = size;
                let _ = pair.master.resize(PtySize {
                    rows: size.1,
                    cols: size.0,
                    pixel_width: 0,
                    pixel_height: 0,
                });
            }
            thread::sleep(ATTACH_POLL);
        }

        // Teardown in all cases: kill the client (detaching us from the
        // session), join both pumps, close the PTY, restore the terminal.
        if !client_exited {
            let _ = child.kill();
        }
        let _ = child.wait();
        let _ = output_pump.join();
        let _ = input_pump.join();
        drop(pair.master);
        self.attached.store(false, Ordering::SeqCst);
        let _ = crossterm::terminal::disable_raw_mode();

        if client_exited && !self.has_session()? {
            Ok(AttachOutcome::SessionExited)
        } else {
            Ok(AttachOutcome::Detached)
        }
    }
}

/// Puts stdin into non-blocking mode for the lifetime of the guard.
struct NonblockingStdin {
    original_flags: i32,
}

impl NonblockingStdin {
    fn enable() -> Self {
        // SAFETY: fcntl F_GETFL/F_SETFL on a valid fd has no memory-safety
        // implications; failures leave stdin blocking, which only degrades
        // detach latency.
        let original_flags = unsafe {
            let flags = libc::fcntl(libc::STDIN_FILENO, libc::F_GETFL);
            if flags >= 0 {
                libc::fcntl(libc::STDIN_FILENO, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
            flags
        };
        Self { original_flags }
    }
}

impl Drop for NonblockingStdin {
    fn drop(&mut self) {
        if self.original_flags >= 0 {
            // SAFETY: restores the flags read in `enable`.
            unsafe {
                libc::fcntl(libc::STDIN_FILENO, libc::F_SETFL, self.original_flags);
            }
        }
    }
}

// -- Host-wide queries (cleanup / reset) ------------------------------------

/// Every claude-squad session on this host's tmux server, across all repos.
pub fn list_squad_sessions() -> Result<Vec<String>, SessionError> {
    let mut cmd = Command::new("tmux");
    cmd.args(["list-sessions", "-F", "#{session_name}"]);
    let out = cmd::output_with_timeout(cmd, cmd::TMUX_TIMEOUT)?;
    if !out.success() {
        // No server running means no sessions.
        return Ok(Vec::new());
    }
    Ok(out
        .stdout
        .lines()
        .filter(|l| l.starts_with(SESSION_PREFIX))
        .map(ToString::to_string)
        .collect())
}

/// Read the repo path stored in a session's environment, if any.
pub fn session_repo_path(name: &str) -> Result<Option<PathBuf>, SessionError> {
    let mut cmd = Command::new("tmux");
    cmd.args(["show-environment", "-t", &format!("={name}"), REPO_ENV_VAR]);
    let out = cmd::output_with_timeout(cmd, cmd::TMUX_TIMEOUT)?;
    if !out.success() {
        return Ok(None);
    }
    Ok(parse_env_value(&out.stdout).map(PathBuf::from))
}

/// Parse `VAR=value` from `tmux show-environment` output. A leading `-`
/// means the variable is unset for the session.
fn parse_env_value(output: &str) -> Option<String> {
    let line = output.lines().next()?.trim();
    if line.starts_with('-') {
        return None;
    }
    let (_, value) = line.split_once('=')?;
    Some(value.to_string())
}

/// Classification of a host session for the `cleanup` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionClass {
    /// Recorded repo path exists on disk.
    Active,
    /// Recorded repo path no longer exists.
    Orphaned,
    /// No repo path recorded at all.
    Unknown,
}

pub fn classify_session(repo_path: Option<&Path>) -> SessionClass {
    match repo_path {
        None => SessionClass::Unknown,
        Some(p) if p.is_dir() => SessionClass::Active,
        Some(_) => SessionClass::Orphaned,
    }
}
