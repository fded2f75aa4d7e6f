//! Capture, apply and restore of VF attributes.
//!
//! VF attributes (admin MAC, VLAN, spoof check, trust, rates, link state)
//! are set through the parent PF in the host namespace. Netdev attributes
//! (effective MAC, MTU, name) are set on the VF's own interface wherever it
//! currently lives.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use sriov_cni_common::{LinkOp, LinkOps, SriovError, SriovResult, VlanProto, HOST_NETNS};

use crate::types::{DesiredVfState, NetdevLocation, VfDevice, VfState};

/// Reads and writes VF state through the link capability.
#[derive(Clone)]
pub struct VfStateManager {
    links: Arc<dyn LinkOps>,
}

/// Wraps a failed set operation as a device state error.
pub(crate) fn state_error(op: &LinkOp, err: SriovError) -> SriovError {
    match err {
        err @ SriovError::DeviceState { .. } => err,
        other => SriovError::device_state(op.attribute(), op.target(), other.to_string()),
    }
}

impl VfStateManager {
    pub fn new(links: Arc<dyn LinkOps>) -> Self {
        Self { links }
    }

    /// Snapshots the current state of `device`.
    ///
    /// Netdev side attributes are read only when the netdev location is
    /// known; otherwise they are left empty.
    #[instrument(skip(self, device), fields(pci = %device.pci))]
    pub async fn capture(&self, device: &VfDevice) -> SriovResult<VfState> {
        let info = self.links.vf_info(&device.pf, device.vf_id).await?;

        let (host_ifname, effective_mac, mtu) = match &device.netdev {
            Some(loc) => {
                let link = self.links.link(loc.netns.as_deref(), &loc.name).await?;
                (loc.name.clone(), link.mac, Some(link.mtu))
            }
            None => (String::new(), None, None),
        };

        Ok(VfState {
            host_ifname,
            spoofchk: info.spoofchk,
            trust: info.trust,
            admin_mac: info.mac,
            effective_mac,
            vlan: info.vlan,
            vlan_qos: info.qos,
            vlan_proto: info.proto,
            min_tx_rate: info.min_tx_rate,
            max_tx_rate: info.max_tx_rate,
            link_state: info.link_state,
            mtu,
        })
    }

    async fn set(&self, netns: Option<&str>, op: LinkOp) -> SriovResult<()> {
        self.links
            .apply(netns, &op)
            .await
            .map_err(|e| state_error(&op, e))
    }

    /// Sets VLAN, QoS and protocol in one call. Drivers without protocol
    /// support reject the call even for 802.1Q, so 802.1Q falls back to a
    /// call without protocol.
    async fn set_vlan(&self, pf: &str, vf: u32, vlan: u16, qos: u8, proto: VlanProto) -> SriovResult<()> {
        let op = LinkOp::VfVlan {
            pf: pf.to_string(),
            vf,
            vlan,
            qos,
            proto: Some(proto),
        };
        match self.links.apply(None, &op).await {
            Ok(()) => Ok(()),
            Err(err) if proto == VlanProto::Dot1Q => {
                debug!(error = %err, "VLAN protocol rejected, retrying without protocol");
                self.set(
                    None,
                    LinkOp::VfVlan {
                        pf: pf.to_string(),
                        vf,
                        vlan,
                        qos,
                        proto: None,
                    },
                )
                .await
            }
            Err(err) => Err(state_error(&op, err)),
        }
    }

    /// Sets the requested rate bounds, one call per bound.
    ///
    /// Min goes first so that lowering both never leaves min above max.
    /// When the new min exceeds the current nonzero max, max goes first
    /// instead.
    async fn set_rates(&self, pf: &str, vf: u32, min: Option<u32>, max: Option<u32>) -> SriovResult<()> {
        let max_first = match (min, max) {
            (Some(min), Some(_)) => {
                let current = self.links.vf_info(pf, vf).await?.max_tx_rate;
                current != 0 && min > current
            }
            _ => false,
        };

        let min_op = min.map(|min| LinkOp::VfRate {
            pf: pf.to_string(),
            vf,
            min: Some(min),
            max: None,
        });
        let max_op = max.map(|max| LinkOp::VfRate {
            pf: pf.to_string(),
            vf,
            min: None,
            max: Some(max),
        });
        let ops = if max_first {
            [max_op, min_op]
        } else {
            [min_op, max_op]
        };
        for op in ops.into_iter().flatten() {
            self.set(None, op).await?;
        }
        Ok(())
    }

    /// Applies every set attribute of `desired`, in a fixed order, stopping
    /// at the first failure. Nothing is undone here.
    #[instrument(skip(self, desired, device), fields(pci = %device.pci))]
    pub async fn apply(&self, desired: &DesiredVfState, device: &VfDevice) -> SriovResult<()> {
        let pf = device.pf.as_str();
        let vf = device.vf_id;
        let netdev = device.netdev.as_ref();

        if let Some(mac) = desired.mac {
            self.set(
                None,
                LinkOp::VfMac {
                    pf: pf.to_string(),
                    vf,
                    mac,
                },
            )
            .await?;
            if let Some(loc) = netdev {
                self.set(
                    loc.netns.as_deref(),
                    LinkOp::Mac {
                        link: loc.name.clone(),
                        mac,
                    },
                )
                .await?;
            }
        }

        if let Some(vlan) = desired.vlan {
            let qos = desired.vlan_qos.unwrap_or(0);
            let proto = desired.vlan_proto.unwrap_or_default();
            self.set_vlan(pf, vf, vlan, qos, proto).await?;
        }

        if let Some(on) = desired.spoofchk {
            self.set(None, LinkOp::VfSpoofChk { pf: pf.to_string(), vf, on })
                .await?;
        }

        if let Some(on) = desired.trust {
            self.set(None, LinkOp::VfTrust { pf: pf.to_string(), vf, on })
                .await?;
        }

        self.set_rates(pf, vf, desired.min_tx_rate, desired.max_tx_rate)
            .await?;

        if let Some(state) = desired.link_state {
            self.set(
                None,
                LinkOp::VfLinkState {
                    pf: pf.to_string(),
                    vf,
                    state,
                },
            )
            .await?;
        }

        if let (Some(mtu), Some(loc)) = (desired.mtu, netdev) {
            self.set(
                loc.netns.as_deref(),
                LinkOp::Mtu {
                    link: loc.name.clone(),
                    mtu,
                },
            )
            .await?;
        }

        Ok(())
    }

    /// Puts `device` back into `original` state.
    ///
    /// Every attribute is attempted even after failures. A netdev found in
    /// a container namespace is first returned to the host namespace under
    /// its original name. All failures are reported in one error.
    #[instrument(skip(self, original, device), fields(pci = %device.pci))]
    pub async fn restore(&self, original: &VfState, device: &VfDevice) -> SriovResult<()> {
        let mut restorer = Restorer {
            links: self.links.as_ref(),
            failed: Vec::new(),
            messages: Vec::new(),
        };
        let pf = device.pf.as_str();
        let vf = device.vf_id;

        let host_netdev = match &device.netdev {
            Some(loc) => restorer.return_to_host(loc, &original.host_ifname).await,
            None => None,
        };

        restorer
            .attempt(
                None,
                LinkOp::VfMac {
                    pf: pf.to_string(),
                    vf,
                    mac: original.admin_mac,
                },
            )
            .await;

        if let Err(err) = self
            .set_vlan(pf, vf, original.vlan, original.vlan_qos, original.vlan_proto)
            .await
        {
            restorer.record("vlan", err);
        }

        restorer
            .attempt(
                None,
                LinkOp::VfSpoofChk {
                    pf: pf.to_string(),
                    vf,
                    on: original.spoofchk,
                },
            )
            .await;
        restorer
            .attempt(
                None,
                LinkOp::VfTrust {
                    pf: pf.to_string(),
                    vf,
                    on: original.trust,
                },
            )
            .await;
        restorer
            .attempt(
                None,
                LinkOp::VfRate {
                    pf: pf.to_string(),
                    vf,
                    min: Some(original.min_tx_rate),
                    max: Some(original.max_tx_rate),
                },
            )
            .await;
        restorer
            .attempt(
                None,
                LinkOp::VfLinkState {
                    pf: pf.to_string(),
                    vf,
                    state: original.link_state,
                },
            )
            .await;

        if let Some(name) = host_netdev {
            if let Some(mac) = original.effective_mac {
                restorer
                    .attempt(None, LinkOp::Mac { link: name.clone(), mac })
                    .await;
            }
            if let Some(mtu) = original.mtu {
                restorer.attempt(None, LinkOp::Mtu { link: name, mtu }).await;
            }
        }

        if restorer.failed.is_empty() {
            debug!("Restored original VF state");
            return Ok(());
        }
        Err(SriovError::device_state(
            restorer.failed.join(","),
            device.describe(),
            restorer.messages.join("; "),
        ))
    }
}

/// Failure collector for best-effort restore.
struct Restorer<'a> {
    links: &'a dyn LinkOps,
    failed: Vec<String>,
    messages: Vec<String>,
}

impl Restorer<'_> {
    fn record(&mut self, attribute: &str, err: SriovError) {
        warn!(attribute = attribute, error = %err, "Failed to restore VF attribute");
        self.failed.push(attribute.to_string());
        self.messages.push(err.to_string());
    }

    async fn attempt(&mut self, netns: Option<&str>, op: LinkOp) -> bool {
        match self.links.apply(netns, &op).await {
            Ok(()) => true,
            Err(err) => {
                self.record(op.attribute(), err);
                false
            }
        }
    }

    /// Brings the netdev back to the host under `host_ifname`. Returns its
    /// host side name if it ends up in the host namespace.
    async fn return_to_host(&mut self, loc: &NetdevLocation, host_ifname: &str) -> Option<String> {
        let target = if host_ifname.is_empty() {
            loc.name.clone()
        } else {
            host_ifname.to_string()
        };

        let Some(netns) = loc.netns.as_deref() else {
            if loc.name == target {
                return Some(target);
            }
            self.attempt(None, LinkOp::Down { link: loc.name.clone() }).await;
            let renamed = self
                .attempt(
                    None,
                    LinkOp::Rename {
                        link: loc.name.clone(),
                        new_name: target.clone(),
                    },
                )
                .await;
            return Some(if renamed { target } else { loc.name.clone() });
        };

        self.attempt(Some(netns), LinkOp::Down { link: loc.name.clone() })
            .await;

        let mut current = loc.name.clone();
        if current != target
            && self
                .attempt(
                    Some(netns),
                    LinkOp::Rename {
                        link: current.clone(),
                        new_name: target.clone(),
                    },
                )
                .await
        {
            current = target;
        }

        let moved = self
            .attempt(
                Some(netns),
                LinkOp::MoveToNetns {
                    link: current.clone(),
                    netns: HOST_NETNS.to_string(),
                },
            )
            .await;
        moved.then_some(current)
    }
}
