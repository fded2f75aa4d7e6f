//! PCI address to VF resolution through sysfs.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument};

use sriov_cni_common::{SriovError, SriovResult};

use crate::pci_allocator::PciAllocator;
use crate::types::{NetdevLocation, VfDevice};

/// Drivers that hand the VF to userspace; such VFs have no kernel netdev.
pub const USERSPACE_DRIVERS: &[&str] = &["vfio-pci", "uio_pci_generic", "igb_uio"];

/// Resolves VF PCI addresses to PF, VF index, driver and netdev.
#[derive(Debug, Clone)]
pub struct DeviceResolver {
    sysfs_root: PathBuf,
    allocator: PciAllocator,
}

fn link_name(path: &Path) -> io::Result<Option<String>> {
    match fs::read_link(path) {
        Ok(target) => Ok(target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// First entry of a `net/` directory, if any.
fn first_netdev(dir: &Path) -> io::Result<Option<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut names = entries
        .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
        .collect::<io::Result<Vec<_>>>()?;
    names.sort();
    Ok(names.into_iter().next())
}

impl DeviceResolver {
    /// Creates a resolver reading sysfs mounted at `sysfs_root`.
    pub fn new(sysfs_root: impl Into<PathBuf>, allocator: PciAllocator) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            allocator,
        }
    }

    fn device_dir(&self, pci: &str) -> PathBuf {
        self.sysfs_root.join("bus/pci/devices").join(pci)
    }

    /// Locates `pci` without looking at allocations.
    #[instrument(skip(self))]
    pub fn locate(&self, pci: &str) -> SriovResult<VfDevice> {
        let dev = self.device_dir(pci);
        let io_err = |what: &str, e: io::Error| {
            SriovError::io(format!("failed to read {} of {}", what, pci), e)
        };

        if !dev.exists() {
            return Err(SriovError::device_not_found(
                pci,
                format!("{} does not exist", dev.display()),
            ));
        }

        let physfn = dev.join("physfn");
        if !physfn.exists() {
            return Err(SriovError::DriverMismatch {
                device: pci.to_string(),
                message: "no physfn link, not a virtual function".to_string(),
            });
        }

        let pf = first_netdev(&physfn.join("net"))
            .map_err(|e| io_err("PF netdev", e))?
            .ok_or_else(|| {
                SriovError::device_not_found(pci, "parent PF has no network interface")
            })?;

        let mut vf_id = None;
        for entry in fs::read_dir(&physfn).map_err(|e| io_err("PF virtfn links", e))? {
            let entry = entry.map_err(|e| io_err("PF virtfn links", e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(index) = name.strip_prefix("virtfn").and_then(|i| i.parse::<u32>().ok()) else {
                continue;
            };
            if link_name(&entry.path()).map_err(|e| io_err("virtfn link", e))?.as_deref() == Some(pci) {
                vf_id = Some(index);
                break;
            }
        }
        let vf_id = vf_id.ok_or_else(|| SriovError::DriverMismatch {
            device: pci.to_string(),
            message: format!("not listed among the virtual functions of {}", pf),
        })?;

        let driver = link_name(&dev.join("driver")).map_err(|e| io_err("driver", e))?;
        let userspace = driver
            .as_deref()
            .is_some_and(|d| USERSPACE_DRIVERS.contains(&d));

        let netdev = if userspace {
            None
        } else {
            first_netdev(&dev.join("net"))
                .map_err(|e| io_err("netdev", e))?
                .map(NetdevLocation::host)
        };

        debug!(pci = %pci, pf = %pf, vf = vf_id, driver = ?driver, "Resolved VF");
        Ok(VfDevice {
            pci: pci.to_string(),
            pf,
            vf_id,
            driver,
            userspace,
            netdev,
        })
    }

    /// Locates `pci` for attachment to `netns`.
    ///
    /// A live allocation owned by another namespace means the VF is already
    /// bound elsewhere and fails with [`SriovError::AlreadyAllocated`].
    pub fn resolve(&self, pci: &str, netns: &str) -> SriovResult<VfDevice> {
        let device = self.locate(pci)?;
        if let Some(owner) = self.allocator.owner(pci)? {
            if owner != netns {
                return Err(SriovError::AlreadyAllocated {
                    pci: pci.to_string(),
                    owner,
                });
            }
        }
        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sriov_cni_test::{FakeNamespaces, FakeSysfs, MemoryStore};
    use std::sync::Arc;

    fn resolver(sysfs: &FakeSysfs) -> (DeviceResolver, PciAllocator, Arc<FakeNamespaces>) {
        let namespaces = Arc::new(FakeNamespaces::new());
        let allocator = PciAllocator::new(Arc::new(MemoryStore::new()), namespaces.clone());
        (
            DeviceResolver::new(sysfs.root(), allocator.clone()),
            allocator,
            namespaces,
        )
    }

    #[test]
    fn test_locate_kernel_vf() {
        let sysfs = FakeSysfs::new();
        sysfs.add_pf("0000:af:00.0", "enp175s0f0");
        sysfs.add_vf("0000:af:00.0", 0, "0000:af:02.0", "iavf", Some("enp175s0f0v0"));
        sysfs.add_vf("0000:af:00.0", 3, "0000:af:02.3", "iavf", Some("enp175s0f0v3"));
        let (resolver, _, _) = resolver(&sysfs);

        let device = resolver.locate("0000:af:02.3").unwrap();
        assert_eq!(
            device,
            VfDevice {
                pci: "0000:af:02.3".into(),
                pf: "enp175s0f0".into(),
                vf_id: 3,
                driver: Some("iavf".into()),
                userspace: false,
                netdev: Some(NetdevLocation::host("enp175s0f0v3")),
            }
        );
    }

    #[test]
    fn test_locate_userspace_vf() {
        let sysfs = FakeSysfs::new();
        sysfs.add_pf("0000:af:00.0", "enp175s0f0");
        sysfs.add_vf("0000:af:00.0", 1, "0000:af:02.1", "vfio-pci", None);
        let (resolver, _, _) = resolver(&sysfs);

        let device = resolver.locate("0000:af:02.1").unwrap();
        assert!(device.userspace);
        assert_eq!(device.netdev, None);
    }

    #[test]
    fn test_missing_device_and_non_vf() {
        let sysfs = FakeSysfs::new();
        sysfs.add_pf("0000:af:00.0", "enp175s0f0");
        let (resolver, _, _) = resolver(&sysfs);

        assert!(resolver.locate("0000:af:09.0").unwrap_err().is_not_found());
        assert!(matches!(
            resolver.locate("0000:af:00.0"),
            Err(SriovError::DriverMismatch { .. })
        ));
    }

    #[test]
    fn test_resolve_reports_foreign_owner() {
        let sysfs = FakeSysfs::new();
        sysfs.add_pf("0000:af:00.0", "enp175s0f0");
        sysfs.add_vf("0000:af:00.0", 0, "0000:af:02.0", "iavf", Some("enp175s0f0v0"));
        let (resolver, allocator, namespaces) = resolver(&sysfs);
        namespaces.create("/var/run/netns/a");
        allocator
            .save_allocated_pci("0000:af:02.0", "/var/run/netns/a")
            .unwrap();

        assert!(resolver.resolve("0000:af:02.0", "/var/run/netns/a").is_ok());
        match resolver.resolve("0000:af:02.0", "/var/run/netns/b") {
            Err(SriovError::AlreadyAllocated { owner, .. }) => assert_eq!(owner, "/var/run/netns/a"),
            other => panic!("Expected AlreadyAllocated, got {:?}", other),
        }

        namespaces.destroy("/var/run/netns/a");
        assert!(resolver.resolve("0000:af:02.0", "/var/run/netns/b").is_ok());
    }
}
