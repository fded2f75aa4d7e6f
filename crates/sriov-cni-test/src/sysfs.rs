//! Fake sysfs PCI tree in a scratch directory.
//!
//! Mirrors the parts of `/sys/bus/pci` the resolver reads: device
//! directories, `physfn` and `virtfnN` links, the `driver` link and `net/`
//! entries.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

#[derive(Debug)]
pub struct FakeSysfs {
    dir: TempDir,
}

impl Default for FakeSysfs {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSysfs {
    /// Creates an empty tree. Panics if the scratch directory cannot be made.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create fake sysfs");
        fs::create_dir_all(dir.path().join("bus/pci/devices")).expect("failed to create devices");
        fs::create_dir_all(dir.path().join("bus/pci/drivers")).expect("failed to create drivers");
        Self { dir }
    }

    /// Root to hand to the resolver in place of `/sys`.
    pub fn root(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    fn devices(&self) -> PathBuf {
        self.dir.path().join("bus/pci/devices")
    }

    fn device(&self, pci: &str) -> PathBuf {
        self.devices().join(pci)
    }

    /// Adds a physical function with netdev `netdev`.
    pub fn add_pf(&self, pci: &str, netdev: &str) {
        fs::create_dir_all(self.device(pci).join("net").join(netdev)).expect("failed to add PF");
    }

    /// Adds VF `index` of `pf_pci` at `vf_pci`, bound to `driver`, with an
    /// optional host netdev.
    pub fn add_vf(&self, pf_pci: &str, index: u32, vf_pci: &str, driver: &str, netdev: Option<&str>) {
        let vf = self.device(vf_pci);
        fs::create_dir_all(&vf).expect("failed to add VF");
        symlink(Path::new("..").join(pf_pci), vf.join("physfn")).expect("failed to link physfn");
        symlink(
            Path::new("..").join(vf_pci),
            self.device(pf_pci).join(format!("virtfn{}", index)),
        )
        .expect("failed to link virtfn");
        self.bind(vf_pci, driver);
        if let Some(netdev) = netdev {
            self.set_netdev(vf_pci, Some(netdev));
        }
    }

    /// Rebinds `pci` to `driver`.
    pub fn bind(&self, pci: &str, driver: &str) {
        let drivers = self.dir.path().join("bus/pci/drivers");
        fs::create_dir_all(drivers.join(driver)).expect("failed to add driver");
        let link = self.device(pci).join("driver");
        let _ = fs::remove_file(&link);
        symlink(drivers.join(driver), link).expect("failed to link driver");
    }

    /// Replaces the host netdev of `pci`; `None` when it left the host.
    pub fn set_netdev(&self, pci: &str, netdev: Option<&str>) {
        let net = self.device(pci).join("net");
        let _ = fs::remove_dir_all(&net);
        if let Some(netdev) = netdev {
            fs::create_dir_all(net.join(netdev)).expect("failed to add netdev");
        }
    }

    /// Removes a device, as on hot-unplug.
    pub fn remove(&self, pci: &str) {
        let _ = fs::remove_dir_all(self.device(pci));
    }
}
