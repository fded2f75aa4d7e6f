//! Test infrastructure for the SR-IOV CNI plugin.
//!
//! Provides in-memory stand-ins for every host capability:
//! - [`FakeLinkOps`]: links per namespace and VF attributes per PF
//! - [`FakeNamespaces`]: namespace liveness
//! - [`MemoryStore`]: the allocation store
//! - [`FakeSysfs`]: a PCI tree in a scratch directory
//! - [`ScriptedIpam`]: the IPAM delegate
//!
//! and [`Scenario`], which wires them around a single VF.

pub mod fixtures;
mod ipam;
mod links;
mod namespaces;
mod store;
mod sysfs;

pub use fixtures::*;
pub use ipam::{IpamCall, ScriptedIpam};
pub use links::FakeLinkOps;
pub use namespaces::FakeNamespaces;
pub use store::MemoryStore;
pub use sysfs::FakeSysfs;
