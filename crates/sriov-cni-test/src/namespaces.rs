//! Fake network namespaces.

use std::collections::HashSet;

use parking_lot::Mutex;

use sriov_cni_common::{NamespaceProbe, SriovError, SriovResult, HOST_NETNS};

/// Set of live namespace paths. The host namespace is always live.
#[derive(Debug, Default)]
pub struct FakeNamespaces {
    live: Mutex<HashSet<String>>,
    broken: Mutex<HashSet<String>>,
}

impl FakeNamespaces {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, path: &str) {
        self.live.lock().insert(path.to_string());
    }

    pub fn destroy(&self, path: &str) {
        self.live.lock().remove(path);
    }

    /// Makes probing `path` fail instead of answering.
    pub fn fail_probe(&self, path: &str) {
        self.broken.lock().insert(path.to_string());
    }
}

impl NamespaceProbe for FakeNamespaces {
    fn is_live(&self, path: &str) -> SriovResult<bool> {
        if self.broken.lock().contains(path) {
            return Err(SriovError::namespace(path, "statfs failed: EACCES"));
        }
        Ok(path == HOST_NETNS || self.live.lock().contains(path))
    }
}
