//! In-memory link capability that records every applied operation.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use sriov_cni_common::{
    Link, LinkOp, LinkOps, MacAddress, SriovError, SriovResult, VfInfo, VlanProto, HOST_NETNS,
};

#[derive(Debug, Clone)]
struct FakeLink {
    netns: Option<String>,
    link: Link,
}

#[derive(Debug, Default)]
struct State {
    links: Vec<FakeLink>,
    vfs: HashMap<(String, u32), VfInfo>,
    applied: Vec<(Option<String>, LinkOp)>,
    failing: Vec<String>,
    reject_proto: bool,
    manual_carrier: bool,
    next_index: u32,
}

/// Fake [`LinkOps`] modelling links per namespace and VF attributes per PF.
///
/// Rate updates follow the kernel rule that a nonzero max below min is
/// rejected. Bringing a link up gives it carrier unless
/// [`FakeLinkOps::hold_carrier`] was called.
#[derive(Debug, Default)]
pub struct FakeLinkOps {
    state: Mutex<State>,
}

fn ns_key(netns: Option<&str>) -> Option<String> {
    match netns {
        None | Some(HOST_NETNS) => None,
        Some(path) => Some(path.to_string()),
    }
}

fn failed(op: &LinkOp, message: &str) -> SriovError {
    SriovError::ShellCommandFailed {
        command: format!("ip {}", op.ip_args()),
        exit_code: 2,
        output: message.to_string(),
    }
}

impl State {
    fn find(&mut self, netns: &Option<String>, name: &str) -> Option<&mut FakeLink> {
        self.links
            .iter_mut()
            .find(|l| &l.netns == netns && l.link.name == name)
    }

    fn exists(&self, netns: &Option<String>, name: &str) -> bool {
        self.links
            .iter()
            .any(|l| &l.netns == netns && l.link.name == name)
    }

    fn vf(&mut self, op: &LinkOp, pf: &str, vf: u32) -> SriovResult<&mut VfInfo> {
        self.vfs
            .get_mut(&(pf.to_string(), vf))
            .ok_or_else(|| SriovError::device_not_found(op.target(), "Cannot find device"))
    }

    fn link(&mut self, op: &LinkOp, netns: &Option<String>, name: &str) -> SriovResult<&mut FakeLink> {
        self.find(netns, name)
            .ok_or_else(|| SriovError::device_not_found(name, format!("Cannot find device \"{}\" ({})", name, op.attribute())))
    }

    fn apply(&mut self, netns: Option<String>, op: &LinkOp) -> SriovResult<()> {
        if self.failing.iter().any(|a| a == op.attribute()) {
            return Err(failed(op, "RTNETLINK answers: Operation not permitted"));
        }

        match op {
            LinkOp::VfMac { pf, vf, mac } => self.vf(op, pf, *vf)?.mac = *mac,
            LinkOp::VfVlan {
                pf,
                vf,
                vlan,
                qos,
                proto,
            } => {
                if proto.is_some() && self.reject_proto {
                    return Err(failed(op, "RTNETLINK answers: Protocol not supported"));
                }
                let info = self.vf(op, pf, *vf)?;
                info.vlan = *vlan;
                info.qos = *qos;
                info.proto = proto.unwrap_or(VlanProto::Dot1Q);
            }
            LinkOp::VfSpoofChk { pf, vf, on } => self.vf(op, pf, *vf)?.spoofchk = *on,
            LinkOp::VfTrust { pf, vf, on } => self.vf(op, pf, *vf)?.trust = *on,
            LinkOp::VfRate { pf, vf, min, max } => {
                let info = self.vf(op, pf, *vf)?;
                let min = min.unwrap_or(info.min_tx_rate);
                let max = max.unwrap_or(info.max_tx_rate);
                if max != 0 && min > max {
                    return Err(failed(op, "RTNETLINK answers: Invalid argument"));
                }
                info.min_tx_rate = min;
                info.max_tx_rate = max;
            }
            LinkOp::VfLinkState { pf, vf, state } => self.vf(op, pf, *vf)?.link_state = *state,
            LinkOp::Mac { link, mac } => self.link(op, &netns, link)?.link.mac = Some(*mac),
            LinkOp::Mtu { link, mtu } => self.link(op, &netns, link)?.link.mtu = *mtu,
            LinkOp::Up { link } => {
                let manual = self.manual_carrier;
                let fake = self.link(op, &netns, link)?;
                fake.link.admin_up = true;
                if !manual {
                    fake.link.running = true;
                }
            }
            LinkOp::Down { link } => {
                let fake = self.link(op, &netns, link)?;
                fake.link.admin_up = false;
                fake.link.running = false;
            }
            LinkOp::Rename { link, new_name } => {
                if self.exists(&netns, new_name) {
                    return Err(failed(op, "RTNETLINK answers: File exists"));
                }
                self.link(op, &netns, link)?.link.name = new_name.clone();
            }
            LinkOp::MoveToNetns { link, netns: target } => {
                let target = ns_key(Some(target.as_str()));
                if self.exists(&target, link) {
                    return Err(failed(op, "RTNETLINK answers: File exists"));
                }
                let fake = self.link(op, &netns, link)?;
                fake.netns = target;
                fake.link.admin_up = false;
                fake.link.running = false;
            }
            LinkOp::AddAddress { link, .. } | LinkOp::AddRoute { link, .. } => {
                self.link(op, &netns, link)?;
            }
        }

        self.applied.push((netns, op.clone()));
        Ok(())
    }
}

impl FakeLinkOps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers VF `info.vf` on `pf`.
    pub fn add_vf(&self, pf: &str, info: VfInfo) {
        self.state
            .lock()
            .vfs
            .insert((pf.to_string(), info.vf), info);
    }

    /// Adds a down link. Returns its index.
    pub fn add_link(&self, netns: Option<&str>, name: &str, mac: MacAddress, mtu: u32) -> u32 {
        let mut state = self.state.lock();
        state.next_index += 1;
        let index = state.next_index + 10;
        state.links.push(FakeLink {
            netns: ns_key(netns),
            link: Link {
                index,
                name: name.to_string(),
                mac: Some(mac),
                mtu,
                admin_up: false,
                running: false,
            },
        });
        index
    }

    /// Removes a link, as if the device disappeared.
    pub fn remove_link(&self, netns: Option<&str>, name: &str) {
        let key = ns_key(netns);
        self.state
            .lock()
            .links
            .retain(|l| !(l.netns == key && l.link.name == name));
    }

    /// Drops every link of a namespace.
    pub fn remove_namespace(&self, netns: &str) {
        let key = ns_key(Some(netns));
        self.state.lock().links.retain(|l| l.netns != key);
    }

    /// Current VF attributes.
    pub fn vf(&self, pf: &str, vf: u32) -> Option<VfInfo> {
        self.state.lock().vfs.get(&(pf.to_string(), vf)).cloned()
    }

    /// Current state of a link.
    pub fn find_link(&self, netns: Option<&str>, name: &str) -> Option<Link> {
        let key = ns_key(netns);
        self.state
            .lock()
            .links
            .iter()
            .find(|l| l.netns == key && l.link.name == name)
            .map(|l| l.link.clone())
    }

    /// Successfully applied operations, in order.
    pub fn ops(&self) -> Vec<LinkOp> {
        self.state
            .lock()
            .applied
            .iter()
            .map(|(_, op)| op.clone())
            .collect()
    }

    /// Successfully applied operations with the namespace they ran in.
    pub fn recorded(&self) -> Vec<(Option<String>, LinkOp)> {
        self.state.lock().applied.clone()
    }

    pub fn clear_ops(&self) {
        self.state.lock().applied.clear();
    }

    /// Makes every operation on `attribute` fail.
    pub fn fail_on(&self, attribute: &str) {
        self.state.lock().failing.push(attribute.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().failing.clear();
    }

    /// Makes VLAN operations carrying a protocol fail, like drivers without
    /// 802.1ad support.
    pub fn reject_vlan_proto(&self) {
        self.state.lock().reject_proto = true;
    }

    /// Keeps links without carrier when brought up.
    pub fn hold_carrier(&self) {
        self.state.lock().manual_carrier = true;
    }

    /// Sets admin state and carrier of a link together.
    pub fn set_carrier(&self, netns: Option<&str>, name: &str, up: bool) {
        let key = ns_key(netns);
        if let Some(fake) = self.state.lock().find(&key, name) {
            fake.link.admin_up = up;
            fake.link.running = up;
        }
    }

    /// Sets IFF_RUNNING only.
    pub fn set_running(&self, netns: Option<&str>, name: &str, running: bool) {
        let key = ns_key(netns);
        if let Some(fake) = self.state.lock().find(&key, name) {
            fake.link.running = running;
        }
    }
}

#[async_trait]
impl LinkOps for FakeLinkOps {
    async fn link(&self, netns: Option<&str>, name: &str) -> SriovResult<Link> {
        self.find_link(netns, name)
            .ok_or_else(|| SriovError::device_not_found(name, "Device does not exist"))
    }

    async fn links(&self, netns: Option<&str>) -> SriovResult<Vec<Link>> {
        let key = ns_key(netns);
        Ok(self
            .state
            .lock()
            .links
            .iter()
            .filter(|l| l.netns == key)
            .map(|l| l.link.clone())
            .collect())
    }

    async fn vf_info(&self, pf: &str, vf: u32) -> SriovResult<VfInfo> {
        self.vf(pf, vf).ok_or_else(|| {
            SriovError::device_not_found(format!("{} vf {}", pf, vf), "VF not reported by PF")
        })
    }

    async fn apply(&self, netns: Option<&str>, op: &LinkOp) -> SriovResult<()> {
        self.state.lock().apply(ns_key(netns), op)
    }
}
