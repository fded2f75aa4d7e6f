//! Persisted key-value store backing PCI allocation records.
//!
//! Every plugin invocation is a separate process, so exclusivity between
//! concurrent claims rests entirely on [`AllocationStore::create_if_absent`]
//! and [`AllocationStore::delete_if`] being atomic with respect to each
//! other in the backend.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::error::{SriovError, SriovResult};

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Name of the lock file inside the store directory.
const LOCK_FILE: &str = ".lock";

/// Minimal persisted key-value store with atomic create-if-absent.
pub trait AllocationStore: Send + Sync {
    /// Creates `key` with `value` unless it exists. Returns false if the key
    /// was already present.
    fn create_if_absent(&self, key: &str, value: &str) -> SriovResult<bool>;

    /// Returns true if `key` exists.
    fn exists(&self, key: &str) -> SriovResult<bool>;

    /// Reads the value of `key`.
    fn read(&self, key: &str) -> SriovResult<Option<String>>;

    /// Deletes `key`. Deleting an absent key succeeds.
    fn delete(&self, key: &str) -> SriovResult<()>;

    /// Deletes `key` only while its value is `expected`. Returns true if
    /// this call removed it.
    fn delete_if(&self, key: &str, expected: &str) -> SriovResult<bool>;
}

/// Directory-of-marker-files store: one file per key, the value as content.
///
/// Creation writes a private temp file and hard-links it into place, so a
/// record is never observable half-written and `link(2)` provides the
/// create-if-absent atomicity. Creation and conditional deletion hold an
/// exclusive `flock(2)` on the store's lock file, so no record can be
/// replaced between the compare and the delete.
#[derive(Debug, Clone)]
pub struct DirStore {
    dir: PathBuf,
}

impl DirStore {
    /// Creates a store rooted at `dir`. The directory is created lazily.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    fn ensure_dir(&self) -> SriovResult<()> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            SriovError::io(format!("failed to create store directory {}", self.dir.display()), e)
        })
    }

    fn open_lock_file(&self) -> SriovResult<fs::File> {
        self.ensure_dir()?;
        let path = self.dir.join(LOCK_FILE);
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&path)
            .map_err(|e| SriovError::io(format!("failed to open {}", path.display()), e))
    }

    /// Takes the store lock; it is held until the guard is dropped.
    #[cfg(target_os = "linux")]
    fn lock(&self) -> SriovResult<nix::fcntl::Flock<fs::File>> {
        use nix::fcntl::{Flock, FlockArg};

        let file = self.open_lock_file()?;
        Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
            SriovError::io(
                format!("failed to lock {}", self.dir.join(LOCK_FILE).display()),
                io::Error::from(errno),
            )
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn lock(&self) -> SriovResult<fs::File> {
        self.open_lock_file()
    }
}

impl AllocationStore for DirStore {
    fn create_if_absent(&self, key: &str, value: &str) -> SriovResult<bool> {
        let _lock = self.lock()?;
        let target = self.path(key);
        let temp = self.dir.join(format!(
            ".{}.{}.{}.tmp",
            key,
            std::process::id(),
            TEMP_SEQ.fetch_add(1, Ordering::Relaxed)
        ));

        let write_temp = || -> io::Result<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&temp)?;
            file.write_all(value.as_bytes())?;
            file.sync_all()
        };
        write_temp()
            .map_err(|e| SriovError::io(format!("failed to write {}", temp.display()), e))?;

        let linked = fs::hard_link(&temp, &target);
        let _ = fs::remove_file(&temp);

        match linked {
            Ok(()) => {
                debug!(key = %key, "Created allocation record");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(SriovError::io(
                format!("failed to create {}", target.display()),
                e,
            )),
        }
    }

    fn exists(&self, key: &str) -> SriovResult<bool> {
        let path = self.path(key);
        match fs::symlink_metadata(&path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SriovError::io(format!("failed to stat {}", path.display()), e)),
        }
    }

    fn read(&self, key: &str) -> SriovResult<Option<String>> {
        let path = self.path(key);
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value.trim().to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SriovError::io(format!("failed to read {}", path.display()), e)),
        }
    }

    fn delete(&self, key: &str) -> SriovResult<()> {
        let path = self.path(key);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(key = %key, "Deleted allocation record");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SriovError::io(format!("failed to remove {}", path.display()), e)),
        }
    }

    fn delete_if(&self, key: &str, expected: &str) -> SriovResult<bool> {
        let _lock = self.lock()?;
        if self.read(key)?.as_deref() != Some(expected) {
            return Ok(false);
        }
        self.delete(key)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    #[test]
    fn test_create_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path().join("pci"));

        assert!(!store.exists("0000:af:00.1").unwrap());
        assert_eq!(store.read("0000:af:00.1").unwrap(), None);

        assert!(store.create_if_absent("0000:af:00.1", "/var/run/netns/a").unwrap());
        assert!(store.exists("0000:af:00.1").unwrap());
        assert_eq!(
            store.read("0000:af:00.1").unwrap().as_deref(),
            Some("/var/run/netns/a")
        );

        assert!(!store.create_if_absent("0000:af:00.1", "/var/run/netns/b").unwrap());
        assert_eq!(
            store.read("0000:af:00.1").unwrap().as_deref(),
            Some("/var/run/netns/a")
        );

        store.delete("0000:af:00.1").unwrap();
        assert!(!store.exists("0000:af:00.1").unwrap());
        store.delete("0000:af:00.1").unwrap();
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path());
        store.create_if_absent("0000:af:00.2", "/proc/1/ns/net").unwrap();
        store.create_if_absent("0000:af:00.2", "/proc/1/ns/net").unwrap();

        let mut names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec![LOCK_FILE.to_string(), "0000:af:00.2".to_string()]);
    }

    #[test]
    fn test_delete_if_compares_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path());

        assert!(!store.delete_if("0000:af:00.1", "/var/run/netns/a").unwrap());

        store.create_if_absent("0000:af:00.1", "/var/run/netns/b").unwrap();
        assert!(!store.delete_if("0000:af:00.1", "/var/run/netns/a").unwrap());
        assert_eq!(
            store.read("0000:af:00.1").unwrap().as_deref(),
            Some("/var/run/netns/b")
        );

        assert!(store.delete_if("0000:af:00.1", "/var/run/netns/b").unwrap());
        assert!(!store.exists("0000:af:00.1").unwrap());
    }

    #[test]
    fn test_concurrent_create_has_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = DirStore::new(dir.path());
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    store
                        .create_if_absent("0000:af:00.1", &format!("/var/run/netns/{}", i))
                        .unwrap()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|created| *created)
            .count();
        assert_eq!(winners, 1);
    }
}
