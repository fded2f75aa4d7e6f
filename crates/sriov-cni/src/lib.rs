//! SR-IOV CNI plugin.
//!
//! Binds SR-IOV virtual functions to container network namespaces. The
//! binary is invoked once per ADD, DEL or CHECK event; this library holds
//! the device lifecycle behind it:
//!
//! - [`pci_allocator`]: exclusive, crash-safe claims on VF PCI addresses
//! - [`resolver`]: PCI address to PF, VF index, driver and netdev
//! - [`vf_state`]: capture, apply and restore of VF attributes
//! - [`carrier`]: waiting for link readiness after the move
//! - [`cmd`]: the ADD/DEL/CHECK state machines with rollback
//! - [`config`] and [`cache`]: the network configuration and its
//!   per-attachment persisted copy
//! - [`skel`]: the CNI process protocol
//!
//! All host access goes through the capabilities in `sriov_cni_common`,
//! which are handed to [`SriovCni::new`] through [`Collaborators`].

pub mod cache;
pub mod carrier;
pub mod cmd;
pub mod config;
pub mod logging;
pub mod pci_allocator;
pub mod resolver;
pub mod result;
pub mod skel;
pub mod types;
pub mod vf_state;

pub use cache::NetConfCache;
pub use carrier::CarrierWaiter;
pub use cmd::{CmdArgs, CmdFailure, Collaborators, SriovCni};
pub use config::{defaults, NetConf};
pub use pci_allocator::PciAllocator;
pub use resolver::DeviceResolver;
pub use result::{CniResult, Interface};
pub use types::{DesiredVfState, NetdevLocation, VfDevice, VfState};
pub use vf_state::VfStateManager;
