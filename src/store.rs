//! Per-repository JSON persistence layer.
//!
//! One document per repo (`state.json` in the state directory) holding the
//! serialized instances plus UI bits. Writes rotate the previous primary to
//! `state.json.bak` first, so at every instant at least one consistent copy
//! exists on disk; an unparsable primary is quarantined for forensics and
//! recovered from the backup.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const STATE_FILE: &str = "state.json";
const BACKUP_FILE: &str = "state.json.bak";

/// The on-disk state document, treated as a single versioned blob.
///
/// The `instances` array's element schema is owned by the instance
/// coordinator; the store round-trips it opaquely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppState {
    /// Bitmask of help screens the user has dismissed. Opaque to the core;
    /// consumed by the UI collaborator.
    #[serde(default)]
    pub help_screens_seen: u32,
    #[serde(default = "empty_instances")]
    pub instances: Value,
}

fn empty_instances() -> Value {
    Value::Array(Vec::new())
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            help_screens_seen: 0,
            instances: empty_instances(),
        }
    }
}

/// Capability set the instance coordinator depends on. Implementations may
/// vary (on-disk JSON, in-memory test double).
pub trait StateStorage {
    fn get_instances(&self) -> Value;
    fn save_instances(&mut self, instances: Value) -> Result<()>;
    fn delete_all_instances(&mut self) -> Result<()>;
    fn help_screens_seen(&self) -> u32;
    fn set_help_screens_seen(&mut self, bits: u32) -> Result<()>;
}

/// On-disk store: `state.json` + rotated `state.json.bak` in the state dir.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    state: AppState,
}

impl FileStore {
    /// Load the state document for a repo, creating the default document if
    /// none exists yet.
    ///
    /// An unparsable primary is renamed to `state.json.corrupted.<unix-ts>`;
    /// if the backup parses it is adopted (and written back as the new
    /// primary), otherwise a fresh default is used and the loss is logged.
    pub fn load(state_dir: &Path) -> Result<Self> {
        let mut store = Self {
            dir: state_dir.to_path_buf(),
            state: AppState::default(),
        };
        let primary = store.primary_path();

        if !primary.exists() {
            store.save()?;
            return Ok(store);
        }

        let raw = fs::read_to_string(&primary)
            .with_context(|| format!("failed to read {}", primary.display()))?;
        match serde_json::from_str::<AppState>(&raw) {
            Ok(state) => {
                store.state = state;
                Ok(store)
            }
            Err(parse_err) => {
                tracing::warn!("state file is corrupt: {parse_err}");
                store.recover_from_backup(&primary)?;
                Ok(store)
            }
        }
    }

    /// Quarantine the corrupt primary, then fall back to the backup or to a
    /// fresh default document.
    fn recover_from_backup(&mut self, primary: &Path) -> Result<()> {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let quarantine = self.dir.join(format!("{STATE_FILE}.corrupted.{ts}"));
        fs::rename(primary, &quarantine)
            .with_context(|| format!("failed to quarantine corrupt state file to {}", quarantine.display()))?;
        tracing::warn!("quarantined corrupt state file as {}", quarantine.display());

        let backup = self.backup_path();
        let recovered = fs::read_to_string(&backup)
            .ok()
            .and_then(|raw| serde_json::from_str::<AppState>(&raw).ok());

        match recovered {
            Some(state) => {
                tracing::info!("recovered state from backup");
                self.state = state;
            }
            None => {
                tracing::warn!("backup unusable too; previous instances are lost");
                self.state = AppState::default();
            }
        }
        self.save()
    }

    /// Write the current document to disk.
    ///
    /// The existing primary is moved to `state.json.bak` before the new
    /// bytes land, so a crash mid-write always leaves one parsable copy. On
    /// write failure the backup is restored over the primary.
    pub fn save(&self) -> Result<()> {
        let primary = self.primary_path();
        let backup = self.backup_path();

        let bytes = serde_json::to_vec_pretty(&self.state).context("failed to encode state")?;

        let had_primary = primary.exists();
        if had_primary {
            // Rotate; fall back to copy if rename fails (e.g. odd filesystems).
            if fs::rename(&primary, &backup).is_err() {
                fs::copy(&primary, &backup)
                    .with_context(|| format!("failed to back up {}", primary.display()))?;
            }
        }

        if let Err(write_err) = fs::write(&primary, &bytes) {
            if had_primary {
                let _ = fs::copy(&backup, &primary);
            }
            return Err(write_err)
                .with_context(|| format!("failed to write {}", primary.display()));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&primary, fs::Permissions::from_mode(0o644));
        }
        Ok(())
    }

    pub fn primary_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn backup_path(&self) -> PathBuf {
        self.dir.join(BACKUP_FILE)
    }
}

impl StateStorage for FileStore {
    fn get_instances(&self) -> Value {
        self.state.instances.clone()
    }

    fn save_instances(&mut self, instances: Value) -> Result<()> {
        self.state.instances = instances;
        self.save()
    }

    fn delete_all_instances(&mut self) -> Result<()> {
        self.state.instances = empty_instances();
        self.save()
    }

    fn help_screens_seen(&self) -> u32 {
        self.state.help_screens_seen
    }

    fn set_help_screens_seen(&mut self, bits: u32) -> Result<()> {
        self.state.help_screens_seen = bits;
        self.save()
    }
}

/// In-memory store for tests and for embedding without a filesystem.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: AppState,
}

impl StateStorage for MemoryStore {
    fn get_instances(&self) -> Value {
        self.state.instances.clone()
    }

    fn save_instances(&mut self, instances: Value) -> Result<()> {
        self.state.instances = instances;
        Ok(())
    }

    fn delete_all_instances(&mut self) -> Result<()> {
        self.state.instances = empty_instances();
        Ok(())
    }

    fn help_screens_seen(&self) -> u32 {
        self.state.help_screens_seen
    }

    fn set_help_screens_seen(&mut self, bits: u32) -> Result<()> {
        self.state.help_screens_seen = bits;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scratch() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn load_creates_default_document() {
        let dir = scratch();
        let store = FileStore::load(dir.path()).unwrap();
        assert_eq!(store.help_screens_seen(), 0);
        assert_eq!(store.get_instances(), json!([]));
        // The default was written out immediately.
        assert!(store.primary_path().exists());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = scratch();
        let mut store = FileStore::load(dir.path()).unwrap();
        store
            .save_instances(json!([{"title": "t1", "program": "claude"}]))
            .unwrap();
        store.set_help_screens_seen(0b101).unwrap();

        let reloaded = FileStore::load(dir.path()).unwrap();
        assert_eq!(reloaded.help_screens_seen(), 0b101);
        assert_eq!(
            reloaded.get_instances(),
            json!([{"title": "t1", "program": "claude"}])
        );
    }

    #[test]
    fn save_rotates_previous_primary_to_backup() {
        let dir = scratch();
        let mut store = FileStore::load(dir.path()).unwrap();
        store.save_instances(json!(["first"])).unwrap();
        store.save_instances(json!(["second"])).unwrap();

        let backup: AppState =
            serde_json::from_str(&fs::read_to_string(store.backup_path()).unwrap()).unwrap();
        assert_eq!(backup.instances, json!(["first"]));
        let primary: AppState =
            serde_json::from_str(&fs::read_to_string(store.primary_path()).unwrap()).unwrap();
        assert_eq!(primary.instances, json!(["second"]));
    }

    #[test]
    fn corrupt_primary_recovers_from_backup() {
        let dir = scratch();
        let mut store = FileStore::load(dir.path()).unwrap();
        store.save_instances(json!(["good"])).unwrap();
        store.save_instances(json!(["newer"])).unwrap();
        let primary = store.primary_path();
        drop(store);

        // Clobber the primary with garbage; the backup still holds "good".
        fs::write(&primary, "{").unwrap();

        let recovered = FileStore::load(dir.path()).unwrap();
        assert_eq!(recovered.get_instances(), json!(["good"]));

        // The garbage was quarantined with its original bytes.
        let quarantined: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("state.json.corrupted.")
            })
            .collect();
        assert_eq!(quarantined.len(), 1);
        assert_eq!(fs::read_to_string(quarantined[0].path()).unwrap(), "{");

        // And the primary now holds the recovered document.
        let primary_state: AppState =
            serde_json::from_str(&fs::read_to_string(&primary).unwrap()).unwrap();
        assert_eq!(primary_state.instances, json!(["good"]));
    }

    #[test]
    fn corrupt_primary_and_backup_start_fresh() {
        let dir = scratch();
        let mut store = FileStore::load(dir.path()).unwrap();
        store.save_instances(json!(["gone"])).unwrap();
        let primary = store.primary_path();
        let backup = store.backup_path();
        drop(store);

        fs::write(&primary, "{").unwrap();
        fs::write(&backup, "also not json").unwrap();

        let recovered = FileStore::load(dir.path()).unwrap();
        assert_eq!(recovered.get_instances(), json!([]));
    }

    #[test]
    fn save_instances_of_get_instances_is_a_noop() {
        let dir = scratch();
        let mut store = FileStore::load(dir.path()).unwrap();
        store.save_instances(json!([{"title": "t"}])).unwrap();
        let before = fs::read_to_string(store.primary_path()).unwrap();

        let roundtrip = store.get_instances();
        store.save_instances(roundtrip).unwrap();
        let after = fs::read_to_string(store.primary_path()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn delete_all_instances_keeps_help_bits() {
        let dir = scratch();
        let mut store = FileStore::load(dir.path()).unwrap();
        store.set_help_screens_seen(7).unwrap();
        store.save_instances(json!(["x", "y"])).unwrap();

        store.delete_all_instances().unwrap();
        let reloaded = FileStore::load(dir.path()).unwrap();
        assert_eq!(reloaded.get_instances(), json!([]));
        assert_eq!(reloaded.help_screens_seen(), 7);
    }

    #[test]
    fn memory_store_honours_the_capability_set() {
        let mut store = MemoryStore::default();
        assert_eq!(store.get_instances(), json!([]));
        store.save_instances(json!(["a"])).unwrap();
        assert_eq!(store.get_instances(), json!(["a"]));
        store.delete_all_instances().unwrap();
        assert_eq!(store.get_instances(), json!([]));
    }
}
