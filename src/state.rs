//! File-backed [`StateStore`]
//!
//! Records live in `<dir>/state.json`. Every `put` rewrites the file under
//! an exclusive lock (temp file + rename), re-reading it first so records
//! written by other processes survive. Per-resource locks are exclusive
//! `fs2` locks on `<dir>/locks/<id>.lock`.

use chrono::{DateTime, Utc};
use declarative::{LockGuard, ResourceState, StateStore, StoreError};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

/// How often a waiting `lock` retries
const LOCK_POLL: Duration = Duration::from_millis(50);

const STATE_VERSION: u32 = 1;

/// On-disk layout of the state file
#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    resources: BTreeMap<String, ResourceState>,
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            updated_at: Utc::now(),
            resources: BTreeMap::new(),
        }
    }
}

pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    /// Open (or create) the store in `dir`
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(dir.join("locks")).map_err(|e| storage(&dir, &e))?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join("state.json")
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        self.dir.join("locks").join(format!("{id}.lock"))
    }

    /// Every record, keyed by id
    pub fn records(&self) -> Result<BTreeMap<String, ResourceState>, StoreError> {
        let _guard = self.file_lock(false)?;
        Ok(self.read()?.resources)
    }

    /// Store-wide lock serializing readers against the writer
    fn file_lock(&self, exclusive: bool) -> Result<File, StoreError> {
        let path = self.dir.join("state.lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| storage(&path, &e))?;
        let locked = if exclusive {
            file.lock_exclusive()
        } else {
            file.lock_shared()
        };
        locked.map_err(|e| storage(&path, &e))?;
        // Lock is released when the file is dropped
        Ok(file)
    }

    fn read(&self) -> Result<StateFile, StoreError> {
        let path = self.path();
        if !path.exists() {
            return Ok(StateFile::default());
        }
        let file = File::open(&path).map_err(|e| storage(&path, &e))?;
        let state: StateFile = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| StoreError::Storage(format!("failed to parse {}: {e}", path.display())))?;
        if state.version != STATE_VERSION {
            return Err(StoreError::Storage(format!(
                "{} has unsupported version {}",
                path.display(),
                state.version
            )));
        }
        Ok(state)
    }

    fn write(&self, state: &StateFile) -> Result<(), StoreError> {
        let path = self.path();
        let temp_path = path.with_extension("json.tmp");
        {
            let file = File::create(&temp_path).map_err(|e| storage(&temp_path, &e))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, state)
                .map_err(|e| StoreError::Storage(format!("failed to serialize state: {e}")))?;
            writer.flush().map_err(|e| storage(&temp_path, &e))?;
        }

        // Atomic rename
        fs::rename(&temp_path, &path).map_err(|e| storage(&path, &e))?;
        Ok(())
    }
}

fn storage(path: &Path, e: &std::io::Error) -> StoreError {
    StoreError::Storage(format!("{}: {e}", path.display()))
}

impl StateStore for FileStateStore {
    fn get(&self, id: &str) -> Result<Option<ResourceState>, StoreError> {
        let _guard = self.file_lock(false)?;
        Ok(self.read()?.resources.remove(id))
    }

    fn put(&self, record: ResourceState) -> Result<(), StoreError> {
        let _guard = self.file_lock(true)?;
        let mut state = self.read()?;
        log::debug!("{}: recording {:?}", record.id, record.status);
        state.resources.insert(record.id.clone(), record);
        state.updated_at = Utc::now();
        self.write(&state)
    }

    fn lock(&self, id: &str, timeout: Duration) -> Result<LockGuard<'_>, StoreError> {
        let path = self.lock_path(id);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| storage(&path, &e))?;

        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(_) if Instant::now() < deadline => thread::sleep(LOCK_POLL),
                Err(_) => {
                    return Err(StoreError::LockTimeout {
                        id: id.to_string(),
                        timeout,
                    });
                }
            }
        }

        log::debug!("{id}: state lock acquired");
        Ok(LockGuard::new(id, move || drop(file)))
    }

    fn ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.records()?.into_keys().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use declarative::{Attributes, ResourceKind, Status, Value};
    use std::sync::Arc;

    fn record(id: &str) -> ResourceState {
        ResourceState {
            id: id.into(),
            kind: ResourceKind::VirtualMachine,
            status: Status::Applied,
            backend_id: Some(format!("/vm/{id}")),
            attributes: Attributes::from([("admin_password".to_string(), Value::secret("PW_ENV"))]),
            outputs: Attributes::new(),
            dependencies: vec!["nic".into()],
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStateStore::open(dir.path()).unwrap();
            assert_eq!(store.get("vm").unwrap(), None);
            store.put(record("vm")).unwrap();
            store.put(record("db")).unwrap();
        }

        let store = FileStateStore::open(dir.path()).unwrap();
        assert_eq!(store.ids().unwrap(), vec!["db", "vm"]);
        assert_eq!(store.get("vm").unwrap().unwrap().dependencies, vec!["nic"]);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_secret_stored_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::open(dir.path()).unwrap();
        store.put(record("vm")).unwrap();

        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("PW_ENV"));
        assert_eq!(store.get("vm").unwrap().unwrap().attributes["admin_password"], Value::secret("PW_ENV"));
    }

    #[test]
    fn test_lock_times_out_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::open(dir.path()).unwrap();
        let guard = store.lock("vm", Duration::from_millis(10)).unwrap();

        let other = FileStateStore::open(dir.path()).unwrap();
        let err = other.lock("vm", Duration::from_millis(120)).unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout { ref id, .. } if id == "vm"));
        assert!(other.lock("nic", Duration::from_millis(10)).is_ok());

        drop(guard);
        assert!(other.lock("vm", Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_concurrent_puts_keep_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStateStore::open(dir.path()).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.put(record(&format!("vm{i}"))))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        assert_eq!(store.ids().unwrap().len(), 8);
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::open(dir.path()).unwrap();
        fs::write(
            store.path(),
            r#"{"version": 9, "updated_at": "2026-01-01T00:00:00Z", "resources": {}}"#,
        )
        .unwrap();
        assert!(matches!(store.ids(), Err(StoreError::Storage(_))));
    }
}
