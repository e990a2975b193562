//! Subprocess execution helpers.
//!
//! Every external invocation (git plumbing, tmux queries) is expected to be
//! short; each one runs under a bounded timeout, and a timed-out child is
//! killed rather than waited on.

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Default timeout for tmux commands.
pub const TMUX_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for git plumbing and worktree operations.
pub const GIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for `git push`, which talks to the network.
pub const GIT_PUSH_TIMEOUT: Duration = Duration::from_secs(120);

/// Poll interval while waiting for a child to exit.
const WAIT_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum CmdError {
    #[error("`{cmd}` timed out after {}s", timeout.as_secs())]
    Timeout { cmd: String, timeout: Duration },
    #[error("failed to run `{cmd}`: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },
}

/// Captured result of a finished subprocess.
#[derive(Debug)]
pub struct CmdOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Render a command line for error messages and logs.
pub fn describe(cmd: &Command) -> String {
    let mut s = cmd.get_program().to_string_lossy().into_owned();
    for arg in cmd.get_args() {
        s.push(' ');
        s.push_str(&arg.to_string_lossy());
    }
    s
}

/// Run a command to completion with a timeout.
///
/// stdout/stderr are drained on separate threads so a chatty child (e.g.
/// `tmux capture-pane` with full scrollback) can never dead-lock on a full
/// pipe. On timeout the child is killed and reaped before returning.
pub fn output_with_timeout(mut cmd: Command, timeout: Duration) -> Result<CmdOutput, CmdError> {
    let desc = describe(&cmd);

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| CmdError::Spawn {
            cmd: desc.clone(),
            source,
        })?;

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");
    let out_handle = thread::spawn(move || read_all(stdout));
    let err_handle = thread::spawn(move || read_all(stderr));

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(CmdError::Timeout { cmd: desc, timeout });
                }
                thread::sleep(WAIT_POLL);
            }
            Err(source) => {
                let _ = child.kill();
                return Err(CmdError::Spawn { cmd: desc, source });
            }
        }
    };

    let stdout = out_handle.join().unwrap_or_default();
    let stderr = err_handle.join().unwrap_or_default();
    Ok(CmdOutput {
        status,
        stdout,
        stderr,
    })
}

fn read_all(mut source: impl Read) -> String {
    let mut buf = Vec::new();
    let _ = source.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}
