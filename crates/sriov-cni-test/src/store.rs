//! In-memory allocation store.

use std::collections::HashMap;

use parking_lot::Mutex;

use sriov_cni_common::{AllocationStore, SriovResult};

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.lock().contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.records.lock().get(key).cloned()
    }

    /// Writes a record directly, bypassing create-if-absent.
    pub fn insert(&self, key: &str, value: &str) {
        self.records.lock().insert(key.to_string(), value.to_string());
    }
}

impl AllocationStore for MemoryStore {
    fn create_if_absent(&self, key: &str, value: &str) -> SriovResult<bool> {
        let mut records = self.records.lock();
        if records.contains_key(key) {
            return Ok(false);
        }
        records.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    fn exists(&self, key: &str) -> SriovResult<bool> {
        Ok(self.contains(key))
    }

    fn read(&self, key: &str) -> SriovResult<Option<String>> {
        Ok(self.get(key))
    }

    fn delete(&self, key: &str) -> SriovResult<()> {
        self.records.lock().remove(key);
        Ok(())
    }

    fn delete_if(&self, key: &str, expected: &str) -> SriovResult<bool> {
        let mut records = self.records.lock();
        if records.get(key).map(String::as_str) != Some(expected) {
            return Ok(false);
        }
        records.remove(key);
        Ok(true)
    }
}
