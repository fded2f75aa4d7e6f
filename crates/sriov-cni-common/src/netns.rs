//! Network namespace liveness probe.

use std::path::Path;

use crate::error::SriovResult;

/// Answers whether a namespace path still refers to a live network namespace.
pub trait NamespaceProbe: Send + Sync {
    /// Returns `Ok(false)` when the namespace is gone, `Err` only when the
    /// probe itself failed.
    fn is_live(&self, path: &str) -> SriovResult<bool>;
}

/// Probe that checks the filesystem type behind a namespace path.
///
/// Bind-mounted namespaces live on nsfs; `/proc/<pid>/ns/net` paths resolve
/// on procfs.
#[derive(Debug, Clone, Default)]
pub struct NsfsProbe;

#[cfg(target_os = "linux")]
const NSFS_MAGIC: i64 = 0x6e73_6673;
#[cfg(target_os = "linux")]
const PROC_SUPER_MAGIC: i64 = 0x9fa0;

impl NsfsProbe {
    /// Creates a new probe.
    pub fn new() -> Self {
        Self
    }
}

#[cfg(target_os = "linux")]
impl NamespaceProbe for NsfsProbe {
    fn is_live(&self, path: &str) -> SriovResult<bool> {
        use nix::errno::Errno;
        use nix::sys::statfs::statfs;

        if path.is_empty() {
            return Ok(false);
        }

        match statfs(Path::new(path)) {
            Ok(stat) => {
                let magic = stat.filesystem_type().0 as i64;
                Ok(magic == NSFS_MAGIC || magic == PROC_SUPER_MAGIC)
            }
            Err(Errno::ENOENT) | Err(Errno::ENOTDIR) => Ok(false),
            Err(e) => Err(crate::SriovError::namespace(path, format!("statfs failed: {}", e))),
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl NamespaceProbe for NsfsProbe {
    fn is_live(&self, path: &str) -> SriovResult<bool> {
        Ok(!path.is_empty() && Path::new(path).exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_path_is_not_live() {
        let probe = NsfsProbe::new();
        assert!(!probe.is_live("/nonexistent/netns/cni-0000").unwrap());
        assert!(!probe.is_live("").unwrap());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_regular_file_is_not_a_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-netns");
        std::fs::write(&file, b"").unwrap();
        assert!(!NsfsProbe::new().is_live(file.to_str().unwrap()).unwrap());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_own_namespace_is_live() {
        assert!(NsfsProbe::new().is_live("/proc/self/ns/net").unwrap());
    }
}
