//! Output-change monitoring and prompt detection.
//!
//! The monitor fingerprints captured pane contents and classifies an
//! instance from how the fingerprint moves: changing output means the
//! assistant is working, output that has settled means it is ready, and a
//! known prompt string means it is waiting on the user.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// How long the output must stay unchanged before an instance counts as
/// settled.
pub const SETTLE_WINDOW: Duration = Duration::from_millis(750);

/// Cadence at which the controller and daemon sample sessions.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(250);

/// Lifecycle status of an instance, persisted with its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Running,
    Ready,
    Loading,
    Paused,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Running => "running",
            Status::Ready => "ready",
            Status::Loading => "loading",
            Status::Paused => "paused",
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Status::Running => "●",
            Status::Ready => "✓",
            Status::Loading => "◐",
            Status::Paused => "⏸",
        }
    }
}

/// Known assistant prompt signatures, keyed by a substring of the program
/// command line. New assistants are added by extending the table.
struct PromptSignature {
    assistant: &'static str,
    patterns: &'static [&'static str],
}

static PROMPT_SIGNATURES: &[PromptSignature] = &[
    PromptSignature {
        assistant: "claude",
        patterns: &[
            "No, and tell Claude what to do differently",
            "Do you want to proceed?",
            "Do you trust the files in this folder?",
            "Would you like to",
        ],
    },
    PromptSignature {
        assistant: "aider",
        patterns: &["(Y)es/(N)o", "Accept edits?", "[Y/n]"],
    },
    PromptSignature {
        assistant: "goose",
        patterns: &["Would you like to take this action"],
    },
];

/// Patterns any assistant may print while still starting up.
static LOADING_PATTERNS: &[&str] = &["Initializing", "Starting up", "Loading"];

/// True when the captured screen shows a confirmation prompt for the
/// assistant the instance runs. Unknown programs match no prompts.
pub fn has_prompt(program: &str, screen: &str) -> bool {
    let program = program.to_lowercase();
    PROMPT_SIGNATURES
        .iter()
        .filter(|sig| program.contains(sig.assistant))
        .flat_map(|sig| sig.patterns.iter())
        .any(|pattern| screen.contains(pattern))
}

/// True when the screen still looks like a startup banner.
pub fn looks_like_loading(screen: &str) -> bool {
    screen.trim().is_empty() || LOADING_PATTERNS.iter().any(|p| screen.contains(p))
}

/// Result of feeding one capture to the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// The output changed since the previous sample.
    pub changed: bool,
    /// A known prompt is on screen.
    pub has_prompt: bool,
}

/// Per-instance fingerprint of the last observed output.
#[derive(Debug)]
pub struct StatusMonitor {
    program: String,
    fingerprint: Option<[u8; 32]>,
    last_change: Instant,
    settle_window: Duration,
}

impl StatusMonitor {
    pub fn new(program: impl Into<String>) -> Self {
        Self::with_settle_window(program, SETTLE_WINDOW)
    }

    pub fn with_settle_window(program: impl Into<String>, settle_window: Duration) -> Self {
        Self {
            program: program.into(),
            fingerprint: None,
            last_change: Instant::now(),
            settle_window,
        }
    }

    /// Feed one captured screen; reports whether the output moved and
    /// whether a known prompt is visible.
    pub fn has_updated(&mut self, captured: &str) -> Observation {
        let digest: [u8; 32] = Sha256::digest(captured.as_bytes()).into();
        let changed = self.fingerprint != Some(digest);
        if changed {
            self.fingerprint = Some(digest);
            self.last_change = Instant::now();
        }
        Observation {
            changed,
            has_prompt: has_prompt(&self.program, captured),
        }
    }

    /// Classify a live session from the most recent capture.
    ///
    /// Paused never comes from here; that is a lifecycle decision made by
    /// the coordinator when it tears the session down.
    pub fn classify(&mut self, captured: &str) -> Status {
        let seen_before = self.fingerprint.is_some();
        let obs = self.has_updated(captured);

        if !seen_before || looks_like_loading(captured) {
            Status::Loading
        } else if obs.changed || self.last_change.elapsed() < self.settle_window {
            Status::Running
        } else {
            Status::Ready
        }
    }

    /// Forget everything observed so far (session restarted).
    pub fn reset(&mut self) {
        self.fingerprint = None;
        self.last_change = Instant::now();
    }
}
