//! Link capability: query, list and set operations on network links.
//!
//! Components never reach for a process-wide netlink handle. They are
//! constructed with an `Arc<dyn LinkOps>`; production code passes
//! [`IpLinkOps`], tests pass a recording fake.
//!
//! Every operation takes the namespace it runs in: `None` is the namespace of
//! the plugin process (the host), `Some(path)` a container namespace.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{SriovError, SriovResult};
use crate::mac::MacAddress;
use crate::shell::{self, ip_prefix, shellquote};

/// Namespace path of the host (init) network namespace.
pub const HOST_NETNS: &str = "/proc/1/ns/net";

/// VLAN tag protocol of a VF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum VlanProto {
    /// IEEE 802.1Q (ethertype 0x8100).
    #[default]
    Dot1Q,
    /// IEEE 802.1ad (ethertype 0x88a8).
    Dot1AD,
}

impl VlanProto {
    /// Returns the protocol name as accepted by `ip link set ... vf ... proto`.
    pub fn as_str(&self) -> &'static str {
        match self {
            VlanProto::Dot1Q => "802.1Q",
            VlanProto::Dot1AD => "802.1ad",
        }
    }
}

impl fmt::Display for VlanProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VlanProto {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "802.1q" => Ok(VlanProto::Dot1Q),
            "802.1ad" => Ok(VlanProto::Dot1AD),
            _ => Err(format!("unknown VLAN protocol '{}'", s)),
        }
    }
}

impl TryFrom<String> for VlanProto {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<VlanProto> for String {
    fn from(proto: VlanProto) -> String {
        proto.as_str().to_string()
    }
}

/// Administrative link state of a VF as enforced by the PF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VfLinkState {
    /// Link follows the PF.
    #[default]
    Auto,
    /// Link forced up.
    Enable,
    /// Link forced down.
    Disable,
}

impl VfLinkState {
    /// Returns the state name as used by `ip link set ... vf ... state`.
    pub fn as_str(&self) -> &'static str {
        match self {
            VfLinkState::Auto => "auto",
            VfLinkState::Enable => "enable",
            VfLinkState::Disable => "disable",
        }
    }
}

impl fmt::Display for VfLinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VfLinkState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(VfLinkState::Auto),
            "enable" => Ok(VfLinkState::Enable),
            "disable" => Ok(VfLinkState::Disable),
            _ => Err(format!("unknown link state '{}'", s)),
        }
    }
}

/// A network link as seen from one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// Interface index.
    pub index: u32,
    /// Interface name.
    pub name: String,
    /// Hardware (effective) address.
    pub mac: Option<MacAddress>,
    /// MTU.
    pub mtu: u32,
    /// IFF_UP.
    pub admin_up: bool,
    /// IFF_RUNNING.
    pub running: bool,
}

impl Link {
    /// Returns true when the link is administratively up and reports carrier.
    pub fn has_carrier(&self) -> bool {
        self.admin_up && self.running
    }
}

/// Per-VF attributes as reported by the PF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfInfo {
    /// VF index on the PF.
    pub vf: u32,
    /// Administrative MAC.
    pub mac: MacAddress,
    /// VLAN id (0 = untagged).
    pub vlan: u16,
    /// VLAN QoS.
    pub qos: u8,
    /// VLAN protocol.
    pub proto: VlanProto,
    /// Spoof checking enabled.
    pub spoofchk: bool,
    /// Trust mode enabled.
    pub trust: bool,
    /// Minimum TX rate in Mbps (0 = unlimited).
    pub min_tx_rate: u32,
    /// Maximum TX rate in Mbps (0 = unlimited).
    pub max_tx_rate: u32,
    /// Link state mode.
    pub link_state: VfLinkState,
}

/// A single set operation on a link or on a VF through its PF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOp {
    VfMac { pf: String, vf: u32, mac: MacAddress },
    VfVlan { pf: String, vf: u32, vlan: u16, qos: u8, proto: Option<VlanProto> },
    VfSpoofChk { pf: String, vf: u32, on: bool },
    VfTrust { pf: String, vf: u32, on: bool },
    VfRate { pf: String, vf: u32, min: Option<u32>, max: Option<u32> },
    VfLinkState { pf: String, vf: u32, state: VfLinkState },
    Mac { link: String, mac: MacAddress },
    Mtu { link: String, mtu: u32 },
    Up { link: String },
    Down { link: String },
    Rename { link: String, new_name: String },
    MoveToNetns { link: String, netns: String },
    AddAddress { link: String, cidr: String },
    AddRoute { link: String, dst: String, gateway: Option<String> },
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

impl LinkOp {
    /// Attribute name used in error messages.
    pub fn attribute(&self) -> &'static str {
        match self {
            LinkOp::VfMac { .. } | LinkOp::Mac { .. } => "mac",
            LinkOp::VfVlan { .. } => "vlan",
            LinkOp::VfSpoofChk { .. } => "spoofchk",
            LinkOp::VfTrust { .. } => "trust",
            LinkOp::VfRate { min: Some(_), max: None, .. } => "min_tx_rate",
            LinkOp::VfRate { min: None, max: Some(_), .. } => "max_tx_rate",
            LinkOp::VfRate { .. } => "tx_rate",
            LinkOp::VfLinkState { .. } => "link_state",
            LinkOp::Mtu { .. } => "mtu",
            LinkOp::Up { .. } | LinkOp::Down { .. } => "admin_state",
            LinkOp::Rename { .. } => "name",
            LinkOp::MoveToNetns { .. } => "netns",
            LinkOp::AddAddress { .. } => "address",
            LinkOp::AddRoute { .. } => "route",
        }
    }

    /// The device the operation targets, for log and error messages.
    pub fn target(&self) -> String {
        match self {
            LinkOp::VfMac { pf, vf, .. }
            | LinkOp::VfVlan { pf, vf, .. }
            | LinkOp::VfSpoofChk { pf, vf, .. }
            | LinkOp::VfTrust { pf, vf, .. }
            | LinkOp::VfRate { pf, vf, .. }
            | LinkOp::VfLinkState { pf, vf, .. } => format!("{} vf {}", pf, vf),
            LinkOp::Mac { link, .. }
            | LinkOp::Mtu { link, .. }
            | LinkOp::Up { link }
            | LinkOp::Down { link }
            | LinkOp::Rename { link, .. }
            | LinkOp::MoveToNetns { link, .. }
            | LinkOp::AddAddress { link, .. }
            | LinkOp::AddRoute { link, .. } => link.clone(),
        }
    }

    /// Builds the `ip` arguments for this operation.
    pub fn ip_args(&self) -> String {
        let vf_prefix = |pf: &str, vf: u32| format!("link set dev {} vf {}", shellquote(pf), vf);
        match self {
            LinkOp::VfMac { pf, vf, mac } => format!("{} mac {}", vf_prefix(pf, *vf), mac),
            LinkOp::VfVlan {
                pf,
                vf,
                vlan,
                qos,
                proto,
            } => {
                let mut args = format!("{} vlan {} qos {}", vf_prefix(pf, *vf), vlan, qos);
                if let Some(proto) = proto {
                    args.push_str(&format!(" proto {}", proto));
                }
                args
            }
            LinkOp::VfSpoofChk { pf, vf, on } => {
                format!("{} spoofchk {}", vf_prefix(pf, *vf), on_off(*on))
            }
            LinkOp::VfTrust { pf, vf, on } => format!("{} trust {}", vf_prefix(pf, *vf), on_off(*on)),
            LinkOp::VfRate { pf, vf, min, max } => {
                let mut args = vf_prefix(pf, *vf);
                if let Some(min) = min {
                    args.push_str(&format!(" min_tx_rate {}", min));
                }
                if let Some(max) = max {
                    args.push_str(&format!(" max_tx_rate {}", max));
                }
                args
            }
            LinkOp::VfLinkState { pf, vf, state } => {
                format!("{} state {}", vf_prefix(pf, *vf), state)
            }
            LinkOp::Mac { link, mac } => format!("link set dev {} address {}", shellquote(link), mac),
            LinkOp::Mtu { link, mtu } => format!("link set dev {} mtu {}", shellquote(link), mtu),
            LinkOp::Up { link } => format!("link set dev {} up", shellquote(link)),
            LinkOp::Down { link } => format!("link set dev {} down", shellquote(link)),
            LinkOp::Rename { link, new_name } => format!(
                "link set dev {} name {}",
                shellquote(link),
                shellquote(new_name)
            ),
            LinkOp::MoveToNetns { link, netns } => format!(
                "link set dev {} netns {}",
                shellquote(link),
                shellquote(netns)
            ),
            LinkOp::AddAddress { link, cidr } => {
                format!("addr replace {} dev {}", shellquote(cidr), shellquote(link))
            }
            LinkOp::AddRoute { link, dst, gateway } => {
                let mut args = format!("route replace {} dev {}", shellquote(dst), shellquote(link));
                if let Some(gw) = gateway {
                    args.push_str(&format!(" via {}", shellquote(gw)));
                }
                args
            }
        }
    }
}

/// Capability interface over the OS link primitives.
#[async_trait]
pub trait LinkOps: Send + Sync {
    /// Looks up one link by name.
    async fn link(&self, netns: Option<&str>, name: &str) -> SriovResult<Link>;

    /// Lists all links of a namespace.
    async fn links(&self, netns: Option<&str>) -> SriovResult<Vec<Link>>;

    /// Reads the attributes of VF `vf` from PF `pf` (host namespace).
    async fn vf_info(&self, pf: &str, vf: u32) -> SriovResult<VfInfo>;

    /// Applies one set operation.
    async fn apply(&self, netns: Option<&str>, op: &LinkOp) -> SriovResult<()>;
}

/// [`LinkOps`] backed by iproute2 (`ip -j`), entered through `nsenter` for
/// container namespaces.
#[derive(Debug, Clone, Default)]
pub struct IpLinkOps;

impl IpLinkOps {
    /// Creates a new iproute2 backed link capability.
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, netns: Option<&str>, args: &str, subject: &str) -> SriovResult<String> {
        let cmd = format!("{} {}", ip_prefix(netns), args);
        let result = shell::exec(&cmd).await?;
        if result.success() {
            return Ok(result.stdout);
        }

        let output = result.combined_output();
        if output.contains("nsenter:") {
            Err(SriovError::namespace(netns.unwrap_or(HOST_NETNS), output))
        } else if output.contains("does not exist") || output.contains("Cannot find device") {
            Err(SriovError::device_not_found(subject, output))
        } else {
            Err(SriovError::ShellCommandFailed {
                command: cmd,
                exit_code: result.exit_code,
                output,
            })
        }
    }
}

#[async_trait]
impl LinkOps for IpLinkOps {
    async fn link(&self, netns: Option<&str>, name: &str) -> SriovResult<Link> {
        let args = format!("-j link show dev {}", shellquote(name));
        let stdout = self.run(netns, &args, name).await?;
        parse_links(&stdout)?
            .into_iter()
            .next()
            .ok_or_else(|| SriovError::device_not_found(name, "no link in ip output"))
    }

    async fn links(&self, netns: Option<&str>) -> SriovResult<Vec<Link>> {
        let stdout = self.run(netns, "-j link show", "links").await?;
        parse_links(&stdout)
    }

    async fn vf_info(&self, pf: &str, vf: u32) -> SriovResult<VfInfo> {
        let args = format!("-j link show dev {}", shellquote(pf));
        let stdout = self.run(None, &args, pf).await?;
        parse_vf_info(&stdout, vf).ok_or_else(|| {
            SriovError::device_not_found(format!("{} vf {}", pf, vf), "VF not reported by PF")
        })
    }

    async fn apply(&self, netns: Option<&str>, op: &LinkOp) -> SriovResult<()> {
        tracing::debug!(target_dev = %op.target(), attribute = op.attribute(), "Applying link operation");
        self.run(netns, &op.ip_args(), &op.target()).await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct IpLinkJson {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    mtu: u32,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    vfinfo_list: Vec<IpVfJson>,
}

#[derive(Debug, Deserialize)]
struct IpVfJson {
    vf: u32,
    #[serde(default, alias = "mac")]
    address: Option<String>,
    #[serde(default)]
    vlan_list: Vec<IpVlanJson>,
    #[serde(default)]
    vlan: Option<u16>,
    #[serde(default)]
    qos: Option<u8>,
    #[serde(default)]
    rate: Option<IpRateJson>,
    #[serde(default)]
    spoofchk: bool,
    #[serde(default)]
    trust: bool,
    #[serde(default)]
    link_state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IpVlanJson {
    vlan: u16,
    #[serde(default)]
    qos: u8,
    #[serde(default)]
    protocol: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct IpRateJson {
    #[serde(default)]
    max_tx: u32,
    #[serde(default)]
    min_tx: u32,
}

fn decode_links(stdout: &str) -> SriovResult<Vec<IpLinkJson>> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(stdout).map_err(|e| SriovError::decode("ip link output", e))
}

/// Parses `ip -j link show` output.
pub fn parse_links(stdout: &str) -> SriovResult<Vec<Link>> {
    Ok(decode_links(stdout)?
        .into_iter()
        .map(|l| {
            let admin_up = l.flags.iter().any(|f| f == "UP");
            // iproute2 prints NO-CARRIER for IFF_UP without IFF_RUNNING.
            let running = admin_up && !l.flags.iter().any(|f| f == "NO-CARRIER");
            Link {
                index: l.ifindex,
                name: l.ifname,
                mac: l.address.and_then(|a| a.parse().ok()),
                mtu: l.mtu,
                admin_up,
                running,
            }
        })
        .collect())
}

/// Extracts VF `vf` from `ip -j link show dev <pf>` output.
pub fn parse_vf_info(stdout: &str, vf: u32) -> Option<VfInfo> {
    let links = decode_links(stdout).ok()?;
    let entry = links
        .into_iter()
        .flat_map(|l| l.vfinfo_list)
        .find(|v| v.vf == vf)?;

    let (vlan, qos, proto) = match entry.vlan_list.first() {
        Some(tag) => (
            tag.vlan,
            tag.qos,
            tag.protocol
                .as_deref()
                .and_then(|p| p.parse().ok())
                .unwrap_or_default(),
        ),
        None => (
            entry.vlan.unwrap_or(0),
            entry.qos.unwrap_or(0),
            VlanProto::Dot1Q,
        ),
    };
    let rate = entry.rate.unwrap_or_default();

    Some(VfInfo {
        vf: entry.vf,
        mac: entry
            .address
            .and_then(|a| a.parse().ok())
            .unwrap_or(MacAddress::ZERO),
        vlan,
        qos,
        proto,
        spoofchk: entry.spoofchk,
        trust: entry.trust,
        min_tx_rate: rate.min_tx,
        max_tx_rate: rate.max_tx,
        link_state: entry
            .link_state
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default(),
    })
}
