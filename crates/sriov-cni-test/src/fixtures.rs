//! Reusable scenarios: a single VF on one PF, wired into every fake.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tempfile::TempDir;

use sriov_cni_common::{MacAddress, VfInfo, VfLinkState, VlanProto};

use crate::{FakeLinkOps, FakeNamespaces, FakeSysfs, MemoryStore, ScriptedIpam};

pub const PF_PCI: &str = "0000:af:00.0";
pub const PF_NAME: &str = "enp175s0f1";
pub const VF_PCI: &str = "0000:af:00.1";
pub const VF_INDEX: u32 = 1;
pub const VF_NAME: &str = "enp175s0f1v1";
pub const VF_DRIVER: &str = "iavf";
pub const VF_MTU: u32 = 1500;
pub const NETNS: &str = "/var/run/netns/pod-a";
pub const OTHER_NETNS: &str = "/var/run/netns/pod-b";
pub const CONTAINER_ID: &str = "3f2c8d1e9a7b";
pub const IFNAME: &str = "net1";
pub const CNI_PATH: &str = "/opt/cni/bin";

/// Host side MAC of the VF netdev before any attachment.
pub fn vf_mac() -> MacAddress {
    MacAddress::new([0x02, 0x5e, 0x10, 0x00, 0x00, 0x01])
}

/// VF attributes as a freshly created VF reports them.
pub fn vf_info(vf: u32) -> VfInfo {
    VfInfo {
        vf,
        mac: MacAddress::ZERO,
        vlan: 0,
        qos: 0,
        proto: VlanProto::Dot1Q,
        spoofchk: true,
        trust: false,
        min_tx_rate: 0,
        max_tx_rate: 0,
        link_state: VfLinkState::Auto,
    }
}

/// Builder for SR-IOV network configurations.
#[derive(Debug, Clone)]
pub struct NetConfBuilder {
    doc: Map<String, Value>,
}

impl Default for NetConfBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NetConfBuilder {
    /// `{"cniVersion":"1.0.0","name":"sriov-net","type":"sriov","deviceID":VF_PCI}`.
    pub fn new() -> Self {
        let mut doc = Map::new();
        doc.insert("cniVersion".into(), json!("1.0.0"));
        doc.insert("name".into(), json!("sriov-net"));
        doc.insert("type".into(), json!("sriov"));
        doc.insert("deviceID".into(), json!(VF_PCI));
        Self { doc }
    }

    /// Sets any top-level field.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.doc.insert(key.to_string(), value.into());
        self
    }

    /// Drops a top-level field.
    pub fn without(mut self, key: &str) -> Self {
        self.doc.remove(key);
        self
    }

    /// Adds an `ipam` section delegating to `plugin`.
    pub fn ipam(self, plugin: &str) -> Self {
        self.with("ipam", json!({ "type": plugin, "subnet": "10.56.217.0/24" }))
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.doc.clone())
    }

    pub fn build(&self) -> Vec<u8> {
        self.to_value().to_string().into_bytes()
    }
}

/// One VF ready to attach: sysfs, links, namespaces, store and IPAM all
/// agree on [`VF_PCI`] and [`NETNS`].
#[derive(Debug)]
pub struct Scenario {
    pub sysfs: FakeSysfs,
    pub links: Arc<FakeLinkOps>,
    pub namespaces: Arc<FakeNamespaces>,
    pub store: Arc<MemoryStore>,
    pub ipam: Arc<ScriptedIpam>,
    data: TempDir,
}

impl Default for Scenario {
    fn default() -> Self {
        Self::new()
    }
}

impl Scenario {
    /// Creates the scenario. Panics if scratch directories cannot be made.
    pub fn new() -> Self {
        let sysfs = FakeSysfs::new();
        sysfs.add_pf(PF_PCI, PF_NAME);
        sysfs.add_vf(PF_PCI, VF_INDEX, VF_PCI, VF_DRIVER, Some(VF_NAME));

        let links = Arc::new(FakeLinkOps::new());
        links.add_link(None, PF_NAME, MacAddress::new([0x3c, 0xfd, 0xfe, 0xa1, 0x00, 0x00]), VF_MTU);
        links.add_vf(PF_NAME, vf_info(VF_INDEX));
        links.add_link(None, VF_NAME, vf_mac(), VF_MTU);

        let namespaces = Arc::new(FakeNamespaces::new());
        namespaces.create(NETNS);
        namespaces.create(OTHER_NETNS);

        Self {
            sysfs,
            links,
            namespaces,
            store: Arc::new(MemoryStore::new()),
            ipam: Arc::new(ScriptedIpam::new()),
            data: tempfile::tempdir().expect("failed to create data dir"),
        }
    }

    /// Where the per-attachment configuration cache lives.
    pub fn data_dir(&self) -> PathBuf {
        self.data.path().to_path_buf()
    }

    /// Rebinds the VF to `vfio-pci`; its host netdev disappears.
    pub fn bind_userspace(&self) {
        self.sysfs.bind(VF_PCI, "vfio-pci");
        self.sysfs.set_netdev(VF_PCI, None);
        self.links.remove_link(None, VF_NAME);
    }

    /// Tears [`NETNS`] down the way the kernel does: the VF netdev falls
    /// back to the host under its container name.
    pub fn destroy_netns(&self) {
        let link = self.links.find_link(Some(NETNS), IFNAME);
        self.links.remove_namespace(NETNS);
        self.namespaces.destroy(NETNS);
        if let Some(link) = link {
            let mac = link.mac.unwrap_or(MacAddress::ZERO);
            self.links.add_link(None, IFNAME, mac, link.mtu);
            self.sysfs.set_netdev(VF_PCI, Some(IFNAME));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let doc: Value = serde_json::from_slice(&NetConfBuilder::new().with("vlan", 100).ipam("host-local").build()).unwrap();
        assert_eq!(doc["deviceID"], VF_PCI);
        assert_eq!(doc["vlan"], 100);
        assert_eq!(doc["ipam"]["type"], "host-local");

        let doc = NetConfBuilder::new().without("deviceID").to_value();
        assert!(doc.get("deviceID").is_none());
    }

    #[test]
    fn test_scenario_is_consistent() {
        let s = Scenario::new();
        assert!(s.links.find_link(None, VF_NAME).is_some());
        assert_eq!(s.links.vf(PF_NAME, VF_INDEX).unwrap().vf, VF_INDEX);
        assert!(s.sysfs.root().join("bus/pci/devices").join(VF_PCI).join("physfn").exists());
    }
}
