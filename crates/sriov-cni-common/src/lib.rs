//! Shared infrastructure for the SR-IOV CNI plugin.
//!
//! The plugin core never touches the OS directly. Everything it needs from
//! the host is an explicit capability defined here and handed over at
//! construction time:
//!
//! - [`netlink`]: link queries and set operations ([`LinkOps`])
//! - [`netns`]: namespace liveness ([`NamespaceProbe`])
//! - [`store`]: persisted allocation records ([`AllocationStore`])
//! - [`ipam`]: the IPAM delegate ([`IpamDelegate`])
//! - [`shell`]: safe command execution with proper quoting
//! - [`error`]: the error taxonomy and CNI error codes
//!
//! # Example
//!
//! ```ignore
//! use sriov_cni_common::{IpLinkOps, LinkOp, LinkOps, SriovResult};
//!
//! async fn set_vlan(pf: &str, vf: u32, vlan: u16) -> SriovResult<()> {
//!     let op = LinkOp::VfVlan { pf: pf.into(), vf, vlan, qos: 0, proto: None };
//!     IpLinkOps::new().apply(None, &op).await
//! }
//! ```

pub mod error;
pub mod ipam;
pub mod mac;
pub mod netlink;
pub mod netns;
pub mod shell;
pub mod store;

// Re-export commonly used items at crate root
pub use error::{codes, SriovError, SriovResult};
pub use ipam::{ExecIpam, IpConfig, IpamDelegate, IpamRequest, IpamResult, Route};
pub use mac::{InvalidMacAddress, MacAddress};
pub use netlink::{
    IpLinkOps, Link, LinkOp, LinkOps, VfInfo, VfLinkState, VlanProto, HOST_NETNS,
};
pub use netns::{NamespaceProbe, NsfsProbe};
pub use store::{AllocationStore, DirStore};
