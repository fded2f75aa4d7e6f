//! Host-wide exclusive claims on VF PCI addresses.
//!
//! A claim is a record `pci address -> owning namespace path` in the
//! allocation store. Records whose namespace no longer exists are stale and
//! are collected on sight. There is no in-process lock: each invocation is
//! its own process, and exclusivity rests on the store's atomic
//! create-if-absent.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use sriov_cni_common::{AllocationStore, NamespaceProbe, SriovError, SriovResult};

/// Create attempts before a claim gives up on a record that keeps being
/// replaced by stale owners.
const CLAIM_ATTEMPTS: usize = 3;

/// Allocator of VF PCI addresses to network namespaces.
#[derive(Clone)]
pub struct PciAllocator {
    store: Arc<dyn AllocationStore>,
    probe: Arc<dyn NamespaceProbe>,
}

impl std::fmt::Debug for PciAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PciAllocator").finish_non_exhaustive()
    }
}

impl PciAllocator {
    /// Creates an allocator over `store`, judging staleness with `probe`.
    pub fn new(store: Arc<dyn AllocationStore>, probe: Arc<dyn NamespaceProbe>) -> Self {
        Self { store, probe }
    }

    /// Returns the namespace owning `pci`, collecting a stale record.
    #[instrument(skip(self))]
    pub fn owner(&self, pci: &str) -> SriovResult<Option<String>> {
        let Some(netns) = self.store.read(pci)? else {
            return Ok(None);
        };

        if self.probe.is_live(&netns)? {
            return Ok(Some(netns));
        }

        self.collect_stale(pci, &netns)?;
        Ok(None)
    }

    /// Removes the record of `pci` if it still names the dead `netns`.
    fn collect_stale(&self, pci: &str, netns: &str) -> SriovResult<()> {
        if self.store.delete_if(pci, netns)? {
            warn!(pci = %pci, netns = %netns, "Namespace of allocation record is gone, released");
        } else {
            debug!(pci = %pci, netns = %netns, "Stale allocation record already replaced");
        }
        Ok(())
    }

    /// Returns true if `pci` is claimed by a live namespace.
    pub fn is_allocated(&self, pci: &str) -> SriovResult<bool> {
        Ok(self.owner(pci)?.is_some())
    }

    /// Claims `pci` for `netns`.
    ///
    /// Fails with [`SriovError::AlreadyAllocated`] if a live record exists,
    /// including one owned by `netns` itself; callers treat that case as an
    /// idempotent replay. A stale record is only removed while it still
    /// holds the dead namespace that was read, then the claim is retried.
    #[instrument(skip(self))]
    pub fn save_allocated_pci(&self, pci: &str, netns: &str) -> SriovResult<()> {
        for _ in 0..CLAIM_ATTEMPTS {
            if self.store.create_if_absent(pci, netns)? {
                info!(pci = %pci, netns = %netns, "Allocated PCI address");
                return Ok(());
            }

            let Some(recorded) = self.store.read(pci)? else {
                continue;
            };
            if self.probe.is_live(&recorded)? {
                return Err(SriovError::AlreadyAllocated {
                    pci: pci.to_string(),
                    owner: recorded,
                });
            }
            self.collect_stale(pci, &recorded)?;
        }

        let owner = self.store.read(pci)?.unwrap_or_default();
        Err(SriovError::AlreadyAllocated {
            pci: pci.to_string(),
            owner,
        })
    }

    /// Releases the claim on `pci`. Releasing an unclaimed address succeeds.
    #[instrument(skip(self))]
    pub fn delete_allocated_pci(&self, pci: &str) -> SriovResult<()> {
        self.store.delete(pci)?;
        debug!(pci = %pci, "Released PCI address");
        Ok(())
    }

    /// Releases the claim on `pci` only if `netns` holds it. Returns true
    /// if a record was removed.
    #[instrument(skip(self))]
    pub fn release_owned(&self, pci: &str, netns: &str) -> SriovResult<bool> {
        let released = self.store.delete_if(pci, netns)?;
        if released {
            debug!(pci = %pci, "Released PCI address");
        }
        Ok(released)
    }
}
