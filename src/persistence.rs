//! Numbered, never-overwritten session snapshots.
//!
//! Every response ends with the full session state written to
//! `<dir>/<n>.json`, `n` counting up from 1. Artifacts are never deleted or
//! overwritten: a name collision (external interference) renames the existing
//! file aside to `<name>.backup`, then `<name>.backup.newer`, appending
//! `.newer` until a free name is found. Undo and crash recovery both reduce
//! to loading one of these artifacts back.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::PersistenceError;

/// Snapshot format version this build writes and reads.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize)]
struct ArtifactRef<'a, T> {
    version: u32,
    state: &'a T,
}

// The version is checked via the probe before the state payload is decoded,
// so a shape change in `T` cannot mask a version mismatch.
#[derive(Deserialize)]
struct Artifact<T> {
    state: T,
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

/// Snapshot directory handle with the artifact counter.
///
/// The counter is recomputed by scanning the directory on open, which is what
/// makes a crashed session resumable: the next write continues the sequence.
#[derive(Debug)]
pub struct PersistenceStore {
    dir: PathBuf,
    count: u32,
}

impl PersistenceStore {
    /// Open (and create if missing) a snapshot directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut count = 0u32;
        for entry in fs::read_dir(&dir)? {
            let name = entry?.file_name();
            if let Some(name) = name.to_str() {
                if let Some(stem) = name.strip_suffix(".json") {
                    if !stem.is_empty() && stem.bytes().all(|b| b.is_ascii_digit()) {
                        count += 1;
                    }
                }
            }
        }
        debug!("opened snapshot directory {:?} with {} artifacts", dir, count);
        Ok(Self { dir, count })
    }

    /// Snapshots written so far (monotonic per directory).
    pub fn count(&self) -> u32 {
        self.count
    }

    /// The directory artifacts live in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write the next numbered artifact. Retries once on I/O failure, then
    /// the error is fatal. Returns the artifact number.
    pub fn snapshot<T: Serialize>(&mut self, state: &T) -> Result<u32, PersistenceError> {
        let n = self.count + 1;
        let path = self.artifact_path(n);
        move_aside(&path)?;

        let payload = serde_json::to_string_pretty(&ArtifactRef {
            version: SNAPSHOT_VERSION,
            state,
        })?;

        if let Err(first) = fs::write(&path, &payload) {
            warn!("snapshot write to {:?} failed, retrying once: {}", path, first);
            fs::write(&path, &payload)?;
        }
        self.count = n;
        debug!("snapshot {} written", n);
        Ok(n)
    }

    /// Load artifact `count - steps_back` (clamped to the oldest) onto the
    /// live state object.
    ///
    /// Artifacts newer than the target are renamed aside so the numbering
    /// continues from the restored point. Returns `Ok(false)` without
    /// touching anything when no snapshot exists.
    pub fn restore<T: DeserializeOwned>(
        &mut self,
        state: &mut T,
        steps_back: u32,
    ) -> Result<bool, PersistenceError> {
        if self.count == 0 {
            return Ok(false);
        }
        let target = self.count.saturating_sub(steps_back).max(1);
        for n in (target + 1)..=self.count {
            move_aside(&self.artifact_path(n))?;
        }

        let raw = fs::read_to_string(self.artifact_path(target))?;
        let probe: VersionProbe = serde_json::from_str(&raw)?;
        if probe.version != SNAPSHOT_VERSION {
            return Err(PersistenceError::Version {
                found: probe.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        let artifact: Artifact<T> = serde_json::from_str(&raw)?;
        *state = artifact.state;
        self.count = target;
        debug!("restored snapshot {}", target);
        Ok(true)
    }

    fn artifact_path(&self, n: u32) -> PathBuf {
        self.dir.join(format!("{}.json", n))
    }
}

/// Rename `path` out of the way without deleting anything: `<path>.backup`,
/// then `.backup.newer`, `.backup.newer.newer`, ... until a free name is
/// found. No-op when `path` does not exist.
pub(crate) fn move_aside(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let mut aside = path.as_os_str().to_os_string();
    aside.push(".backup");
    let mut aside = PathBuf::from(aside);
    while aside.exists() {
        let mut longer = aside.into_os_string();
        longer.push(".newer");
        aside = PathBuf::from(longer);
    }
    warn!("{:?} already exists; renaming it to {:?}", path, aside);
    fs::rename(path, aside)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestState {
        n: u32,
        words: Vec<String>,
    }

    fn state(n: u32) -> TestState {
        TestState {
            n,
            words: vec![format!("snapshot-{}", n)],
        }
    }

    #[test]
    fn test_numbering_counts_up_from_one() {
        let dir = TempDir::new().unwrap();
        let mut store = PersistenceStore::open(dir.path()).unwrap();
        assert_eq!(store.count(), 0);
        assert_eq!(store.snapshot(&state(1)).unwrap(), 1);
        assert_eq!(store.snapshot(&state(2)).unwrap(), 2);
        assert!(dir.path().join("1.json").exists());
        assert!(dir.path().join("2.json").exists());
    }

    #[test]
    fn test_open_resumes_existing_sequence() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = PersistenceStore::open(dir.path()).unwrap();
            store.snapshot(&state(1)).unwrap();
            store.snapshot(&state(2)).unwrap();
        }
        let mut store = PersistenceStore::open(dir.path()).unwrap();
        assert_eq!(store.count(), 2);
        assert_eq!(store.snapshot(&state(3)).unwrap(), 3);
    }

    #[test]
    fn test_collision_renames_existing_aside() {
        let dir = TempDir::new().unwrap();
        let mut store = PersistenceStore::open(dir.path()).unwrap();

        fs::write(dir.path().join("1.json"), "stray").unwrap();
        store.snapshot(&state(1)).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("1.json.backup")).unwrap(),
            "stray"
        );

        // A second collision with an occupied .backup name grows the chain.
        fs::write(dir.path().join("2.json"), "stray2").unwrap();
        fs::write(dir.path().join("2.json.backup"), "old backup").unwrap();
        store.snapshot(&state(2)).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("2.json.backup")).unwrap(),
            "old backup"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("2.json.backup.newer")).unwrap(),
            "stray2"
        );
    }

    #[test]
    fn test_restore_steps_back_and_renames_newer() {
        let dir = TempDir::new().unwrap();
        let mut store = PersistenceStore::open(dir.path()).unwrap();
        store.snapshot(&state(1)).unwrap();
        store.snapshot(&state(2)).unwrap();
        store.snapshot(&state(3)).unwrap();

        let mut live = state(99);
        assert!(store.restore(&mut live, 1).unwrap());
        assert_eq!(live, state(2));
        assert_eq!(store.count(), 2);
        // The discarded artifact is renamed, not deleted.
        assert!(!dir.path().join("3.json").exists());
        assert!(dir.path().join("3.json.backup").exists());

        // The sequence continues from the restored point without clobbering.
        assert_eq!(store.snapshot(&state(4)).unwrap(), 3);
        assert!(dir.path().join("3.json").exists());
        assert!(dir.path().join("3.json.backup").exists());
    }

    #[test]
    fn test_restore_clamps_to_oldest() {
        let dir = TempDir::new().unwrap();
        let mut store = PersistenceStore::open(dir.path()).unwrap();
        store.snapshot(&state(1)).unwrap();
        store.snapshot(&state(2)).unwrap();

        let mut live = state(99);
        assert!(store.restore(&mut live, 100).unwrap());
        assert_eq!(live, state(1));
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_restore_on_empty_directory_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let mut store = PersistenceStore::open(dir.path()).unwrap();
        let mut live = state(7);
        assert!(!store.restore(&mut live, 0).unwrap());
        assert_eq!(live, state(7));
    }

    #[test]
    fn test_version_mismatch_is_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("1.json"),
            r#"{"version": 99, "state": {"n": 1, "words": []}}"#,
        )
        .unwrap();
        let mut store = PersistenceStore::open(dir.path()).unwrap();
        assert_eq!(store.count(), 1);

        let mut live = state(0);
        let err = store.restore(&mut live, 0).unwrap_err();
        assert!(matches!(
            err,
            PersistenceError::Version {
                found: 99,
                expected: SNAPSHOT_VERSION
            }
        ));
        assert_eq!(live, state(0), "failed restore must not touch the state");
    }

    #[test]
    fn test_round_trip_restores_every_field() {
        let dir = TempDir::new().unwrap();
        let mut store = PersistenceStore::open(dir.path()).unwrap();
        let saved = TestState {
            n: 42,
            words: vec!["alpha".into(), "beta".into()],
        };
        store.snapshot(&saved).unwrap();

        let mut live = state(0);
        assert!(store.restore(&mut live, 0).unwrap());
        assert_eq!(live, saved);
    }

    #[test]
    fn test_write_failure_is_fatal_after_retry() {
        let dir = TempDir::new().unwrap();
        let mut store = PersistenceStore::open(dir.path()).unwrap();
        // Yank the directory out from under the store: both attempts fail.
        fs::remove_dir_all(dir.path()).unwrap();
        assert!(matches!(
            store.snapshot(&state(1)),
            Err(PersistenceError::Io(_))
        ));
    }
}
