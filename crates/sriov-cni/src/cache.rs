//! Per-attachment netconf cache.
//!
//! ADD writes the effective configuration, including the captured
//! `OrigVfState`, to `<dataDir>/<containerID>-<ifName>`. DEL and CHECK read
//! it back since the runtime does not pass the original state to them.

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use tracing::{debug, instrument};

use sriov_cni_common::{SriovError, SriovResult};

use crate::config::NetConf;

/// Directory backed netconf cache.
#[derive(Debug, Clone)]
pub struct NetConfCache {
    dir: PathBuf,
}

impl NetConfCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the entry for one attachment.
    pub fn path(&self, container_id: &str, ifname: &str) -> SriovResult<PathBuf> {
        for (field, value) in [("CNI_CONTAINERID", container_id), ("CNI_IFNAME", ifname)] {
            if value.is_empty() || value.contains('/') || value.starts_with('.') {
                return Err(SriovError::InvalidEnvironment {
                    variable: field.to_string(),
                    message: format!("'{}' cannot be used as a cache key", value),
                });
            }
        }
        Ok(self.dir.join(format!("{}-{}", container_id, ifname)))
    }

    /// Writes `conf` for the attachment, replacing any previous entry.
    #[instrument(skip(self, conf))]
    pub fn save(&self, container_id: &str, ifname: &str, conf: &NetConf) -> SriovResult<()> {
        let path = self.path(container_id, ifname)?;
        let bytes = conf.to_bytes()?;
        fs::create_dir_all(&self.dir).map_err(|e| {
            SriovError::io(format!("failed to create cache directory {}", self.dir.display()), e)
        })?;

        let temp = self
            .dir
            .join(format!(".{}-{}.{}.tmp", container_id, ifname, std::process::id()));
        let write = || -> io::Result<()> {
            let mut file = fs::File::create(&temp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            fs::rename(&temp, &path)
        };
        write().map_err(|e| {
            let _ = fs::remove_file(&temp);
            SriovError::io(format!("failed to write {}", path.display()), e)
        })?;

        debug!(path = %path.display(), "Saved netconf cache");
        Ok(())
    }

    /// Reads the entry for the attachment, `None` if absent.
    #[instrument(skip(self))]
    pub fn load(&self, container_id: &str, ifname: &str) -> SriovResult<Option<NetConf>> {
        let path = self.path(container_id, ifname)?;
        match fs::read(&path) {
            Ok(bytes) => NetConf::load(&bytes).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SriovError::io(format!("failed to read {}", path.display()), e)),
        }
    }

    /// Removes the entry. Removing an absent entry succeeds.
    #[instrument(skip(self))]
    pub fn remove(&self, container_id: &str, ifname: &str) -> SriovResult<()> {
        let path = self.path(container_id, ifname)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SriovError::io(format!("failed to remove {}", path.display()), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CONF: &[u8] =
        br#"{"cniVersion":"1.0.0","name":"sriov-net","type":"sriov","deviceID":"0000:af:00.1","vlan":100}"#;

    #[test]
    fn test_save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let cache = NetConfCache::new(dir.path().join("sriov"));
        let conf = NetConf::load(CONF).unwrap();

        assert_eq!(cache.load("c1", "net1").unwrap(), None);
        cache.save("c1", "net1", &conf).unwrap();
        assert!(dir.path().join("sriov/c1-net1").exists());
        assert_eq!(cache.load("c1", "net1").unwrap(), Some(conf));

        cache.remove("c1", "net1").unwrap();
        assert_eq!(cache.load("c1", "net1").unwrap(), None);
        cache.remove("c1", "net1").unwrap();
    }

    #[test]
    fn test_rejects_path_like_keys() {
        let cache = NetConfCache::new("/tmp/unused");
        assert!(cache.path("../etc", "net1").is_err());
        assert!(cache.path("c1", "").is_err());
        assert_eq!(
            cache.path("c1", "net1").unwrap(),
            PathBuf::from("/tmp/unused/c1-net1")
        );
    }

    #[test]
    fn test_corrupt_entry_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = NetConfCache::new(dir.path());
        fs::write(dir.path().join("c1-net1"), b"{truncated").unwrap();
        assert!(cache.load("c1", "net1").is_err());
    }
}
