//! Core value types: VF state snapshots, desired state and device handles.

use serde::{Deserialize, Serialize};
use sriov_cni_common::{MacAddress, VfLinkState, VlanProto};

/// Snapshot of every VF attribute the plugin may touch.
///
/// Captured once before the first configuration of a VF and persisted with
/// the network configuration so that DEL can put the device back exactly as
/// it was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VfState {
    #[serde(rename = "HostIFName", default)]
    pub host_ifname: String,
    #[serde(rename = "SpoofChk", default)]
    pub spoofchk: bool,
    #[serde(rename = "Trust", default)]
    pub trust: bool,
    #[serde(rename = "AdminMAC")]
    pub admin_mac: MacAddress,
    #[serde(rename = "EffectiveMAC", default, skip_serializing_if = "Option::is_none")]
    pub effective_mac: Option<MacAddress>,
    #[serde(rename = "Vlan", default)]
    pub vlan: u16,
    #[serde(rename = "VlanQoS", default)]
    pub vlan_qos: u8,
    #[serde(rename = "VlanProto", default)]
    pub vlan_proto: VlanProto,
    #[serde(rename = "MinTxRate", default)]
    pub min_tx_rate: u32,
    #[serde(rename = "MaxTxRate", default)]
    pub max_tx_rate: u32,
    #[serde(rename = "LinkState", default)]
    pub link_state: VfLinkState,
    #[serde(rename = "MTU", default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
}

/// The attribute values requested by a network configuration.
///
/// `None` means "leave as is"; such attributes are never written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredVfState {
    pub mac: Option<MacAddress>,
    pub vlan: Option<u16>,
    pub vlan_qos: Option<u8>,
    pub vlan_proto: Option<VlanProto>,
    pub spoofchk: Option<bool>,
    pub trust: Option<bool>,
    pub min_tx_rate: Option<u32>,
    pub max_tx_rate: Option<u32>,
    pub link_state: Option<VfLinkState>,
    pub mtu: Option<u32>,
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

impl DesiredVfState {
    /// Returns true if no attribute is requested.
    pub fn is_empty(&self) -> bool {
        *self == DesiredVfState::default()
    }

    /// Lists every requested attribute whose value differs in `actual`.
    pub fn mismatches(&self, actual: &VfState) -> Vec<String> {
        let mut out = Vec::new();
        let mut field = |name: &str, expected: String, found: String| {
            if expected != found {
                out.push(format!("{}: expected {}, found {}", name, expected, found));
            }
        };

        if let Some(mac) = self.mac {
            field("mac", mac.to_string(), actual.admin_mac.to_string());
            if let Some(effective) = actual.effective_mac {
                field("effective_mac", mac.to_string(), effective.to_string());
            }
        }
        if let Some(vlan) = self.vlan {
            field("vlan", vlan.to_string(), actual.vlan.to_string());
            field(
                "vlanQoS",
                self.vlan_qos.unwrap_or(0).to_string(),
                actual.vlan_qos.to_string(),
            );
            if vlan != 0 {
                field(
                    "vlanProto",
                    self.vlan_proto.unwrap_or_default().to_string(),
                    actual.vlan_proto.to_string(),
                );
            }
        }
        if let Some(on) = self.spoofchk {
            field("spoofchk", on_off(on).into(), on_off(actual.spoofchk).into());
        }
        if let Some(on) = self.trust {
            field("trust", on_off(on).into(), on_off(actual.trust).into());
        }
        if let Some(rate) = self.min_tx_rate {
            field("min_tx_rate", rate.to_string(), actual.min_tx_rate.to_string());
        }
        if let Some(rate) = self.max_tx_rate {
            field("max_tx_rate", rate.to_string(), actual.max_tx_rate.to_string());
        }
        if let Some(state) = self.link_state {
            field("link_state", state.to_string(), actual.link_state.to_string());
        }
        if let (Some(mtu), Some(found)) = (self.mtu, actual.mtu) {
            field("mtu", mtu.to_string(), found.to_string());
        }
        out
    }
}

/// Where a VF's kernel network interface currently lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetdevLocation {
    /// `None` for the host namespace.
    pub netns: Option<String>,
    /// Interface name inside that namespace.
    pub name: String,
}

impl NetdevLocation {
    /// A netdev in the host namespace.
    pub fn host(name: impl Into<String>) -> Self {
        Self {
            netns: None,
            name: name.into(),
        }
    }

    /// A netdev inside a container namespace.
    pub fn container(netns: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            netns: Some(netns.into()),
            name: name.into(),
        }
    }
}

/// A resolved virtual function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfDevice {
    /// PCI address in `DDDD:BB:DD.F` form.
    pub pci: String,
    /// Netdev name of the parent physical function.
    pub pf: String,
    /// VF index on the PF.
    pub vf_id: u32,
    /// Bound kernel driver, if any.
    pub driver: Option<String>,
    /// Bound to a userspace (DPDK) driver; no kernel netdev.
    pub userspace: bool,
    /// Current location of the VF netdev, if it has one and it is known.
    pub netdev: Option<NetdevLocation>,
}

impl VfDevice {
    /// Human readable VF identification for logs and errors.
    pub fn describe(&self) -> String {
        format!("{} vf {} ({})", self.pf, self.vf_id, self.pci)
    }
}
