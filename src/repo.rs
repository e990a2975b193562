//! Repository identity and the per-repo state directory.
//!
//! A repository is identified by its canonical path (symlinks resolved) and
//! a repo hash derived from it. All controller-owned artefacts for a repo
//! live in `.claude-squad/` inside the repository.

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Name of the per-repo state directory.
pub const STATE_DIR_NAME: &str = ".claude-squad";

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("repository path not found: {path}")]
    NotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),
    #[error("failed to prepare state directory at {path}: {source}")]
    StateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Canonicalize a path: absolute, symlinks resolved.
///
/// Fails if the path does not exist; never falls back to the input.
pub fn canonical(path: &Path) -> Result<PathBuf, RepoError> {
    fs::canonicalize(path).map_err(|source| RepoError::NotFound {
        path: path.to_path_buf(),
        source,
    })
}

/// First 8 lowercase hex characters of SHA-256 of the canonical path bytes.
///
/// Callers must pass an already-canonical path; two paths naming the same
/// inode tree hash identically only after [`canonical`].
pub fn repo_hash(canonical_path: &Path) -> String {
    let digest = Sha256::digest(canonical_path.to_string_lossy().as_bytes());
    hex::encode(&digest[..4])
}

/// A repository the controller operates on: canonical root + derived hash
/// and the paths of every artefact inside its state directory.
#[derive(Debug, Clone)]
pub struct RepoContext {
    root: PathBuf,
    hash: String,
}

impl RepoContext {
    /// Resolve `path` to a git repository root.
    ///
    /// The path must exist and contain a `.git` entry (directory for a
    /// normal clone, file for a linked worktree).
    pub fn discover(path: &Path) -> Result<Self, RepoError> {
        let root = canonical(path)?;
        if !root.join(".git").exists() {
            return Err(RepoError::NotAGitRepo(root));
        }
        let hash = repo_hash(&root);
        Ok(Self { root, hash })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR_NAME)
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.state_dir().join("worktrees")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir().join("cs.lock")
    }

    pub fn daemon_pid_path(&self) -> PathBuf {
        self.state_dir().join("daemon.pid")
    }

    pub fn log_path(&self) -> PathBuf {
        self.state_dir().join("cs.log")
    }

    pub fn daemon_log_path(&self) -> PathBuf {
        self.state_dir().join("daemon.log")
    }

    /// Create the state directory (0755) on first use and seed its
    /// `.gitignore` so none of the controller's artefacts show up in
    /// `git status`.
    pub fn ensure_state_dir(&self) -> Result<PathBuf, RepoError> {
        let dir = self.state_dir();
        let mk = |source| RepoError::StateDir {
            path: dir.clone(),
            source,
        };

        fs::create_dir_all(&dir).map_err(mk)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o755)).map_err(mk)?;
        }

        let gitignore = dir.join(".gitignore");
        if !gitignore.exists() {
            fs::write(&gitignore, "*\n").map_err(mk)?;
        }
        Ok(dir)
    }
}
