//! ADD, DEL and CHECK.
//!
//! ADD walks Resolved -> Claimed -> Captured -> Configured -> Moved -> Ready
//! -> Committed. A failure after Claimed rolls back what this invocation
//! did, in reverse: IPAM release, VF restore, allocation release. Rollback
//! problems are collected as warnings and never replace the primary error.
//!
//! Carrier timeout is the one soft failure: the attachment is committed and
//! the error is still reported, so a retried ADD replays and a DEL cleans up.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument, warn};

use sriov_cni_common::{
    AllocationStore, DirStore, ExecIpam, IpLinkOps, IpamDelegate, IpamRequest, LinkOp, LinkOps,
    NamespaceProbe, NsfsProbe, SriovError, SriovResult, VfLinkState,
};

use crate::cache::NetConfCache;
use crate::carrier::CarrierWaiter;
use crate::config::{defaults, NetConf};
use crate::pci_allocator::PciAllocator;
use crate::resolver::DeviceResolver;
use crate::result::{CniResult, Interface};
use crate::types::{NetdevLocation, VfDevice};
use crate::vf_state::{state_error, VfStateManager};

/// Invocation parameters from the CNI environment and stdin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdArgs {
    pub container_id: String,
    pub netns: String,
    pub ifname: String,
    pub args: String,
    pub path: String,
    pub stdin: Vec<u8>,
}

/// A failed command: the primary error plus anything rollback could not undo.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct CmdFailure {
    #[source]
    pub error: SriovError,
    pub warnings: Vec<String>,
}

impl CmdFailure {
    /// CNI error code of the primary error.
    pub fn code(&self) -> u32 {
        self.error.cni_code()
    }
}

impl From<SriovError> for CmdFailure {
    fn from(error: SriovError) -> Self {
        Self {
            error,
            warnings: Vec::new(),
        }
    }
}

/// The host capabilities the plugin runs against.
pub struct Collaborators {
    pub links: Arc<dyn LinkOps>,
    pub store: Arc<dyn AllocationStore>,
    pub probe: Arc<dyn NamespaceProbe>,
    pub ipam: Arc<dyn IpamDelegate>,
    pub sysfs_root: PathBuf,
    pub data_dir: PathBuf,
}

impl Collaborators {
    /// The real host: iproute2, sysfs, nsfs and the on-disk store.
    pub fn host() -> Self {
        let data_dir = PathBuf::from(defaults::DATA_DIR);
        Self {
            links: Arc::new(IpLinkOps::new()),
            store: Arc::new(DirStore::new(data_dir.join(defaults::PCI_DIR))),
            probe: Arc::new(NsfsProbe::new()),
            ipam: Arc::new(ExecIpam::new()),
            sysfs_root: PathBuf::from(defaults::SYSFS_ROOT),
            data_dir,
        }
    }
}

/// How far an ADD got, for rollback.
#[derive(Debug, Default)]
struct AddProgress {
    /// This invocation created the allocation record.
    claimed: bool,
    /// The VF may have been modified by this invocation.
    captured: bool,
    /// The IPAM delegate was asked for addresses.
    ipam: bool,
}

/// Outcome of a committed ADD.
struct Attached {
    result: CniResult,
    carrier_timeout: Option<SriovError>,
}

/// The SR-IOV CNI plugin.
pub struct SriovCni {
    links: Arc<dyn LinkOps>,
    probe: Arc<dyn NamespaceProbe>,
    ipam: Arc<dyn IpamDelegate>,
    allocator: PciAllocator,
    resolver: DeviceResolver,
    vf_state: VfStateManager,
    carrier: CarrierWaiter,
    cache: NetConfCache,
}

impl SriovCni {
    pub fn new(collaborators: Collaborators) -> Self {
        let Collaborators {
            links,
            store,
            probe,
            ipam,
            sysfs_root,
            data_dir,
        } = collaborators;
        let allocator = PciAllocator::new(store, probe.clone());
        Self {
            resolver: DeviceResolver::new(sysfs_root, allocator.clone()),
            vf_state: VfStateManager::new(links.clone()),
            carrier: CarrierWaiter::new(links.clone()),
            cache: NetConfCache::new(data_dir),
            allocator,
            links,
            probe,
            ipam,
        }
    }

    fn ipam_request(&self, args: &CmdArgs, config: Vec<u8>) -> IpamRequest {
        IpamRequest {
            container_id: args.container_id.clone(),
            netns: args.netns.clone(),
            ifname: args.ifname.clone(),
            args: args.args.clone(),
            cni_path: args.path.clone(),
            config,
        }
    }

    async fn set(&self, netns: Option<&str>, op: LinkOp) -> SriovResult<()> {
        self.links
            .apply(netns, &op)
            .await
            .map_err(|e| state_error(&op, e))
    }

    /// Attaches the VF named by the configuration to the container.
    #[instrument(skip(self, args), fields(container = %args.container_id, ifname = %args.ifname))]
    pub async fn cmd_add(&self, args: &CmdArgs) -> Result<CniResult, CmdFailure> {
        let mut conf = NetConf::load(&args.stdin)?;
        conf.device.orig_vf_state = None;
        if !self.probe.is_live(&args.netns)? {
            return Err(SriovError::namespace(&args.netns, "not a live network namespace").into());
        }

        let pci = conf.pci().to_string();
        let mut device = self.resolver.resolve(&pci, &args.netns)?;
        if device.userspace && conf.ipam_type().is_some() {
            return Err(SriovError::config(
                "ipam",
                format!(
                    "{} is bound to userspace driver {}, IPAM cannot be used",
                    pci,
                    device.driver.as_deref().unwrap_or("unknown")
                ),
            )
            .into());
        }

        if let Some(cached) = self.cache.load(&args.container_id, &args.ifname)? {
            if let (true, Some(orig)) = (cached.pci() == pci, cached.orig_vf_state()) {
                conf.set_orig_vf_state(orig.clone());
            }
        }

        let mut progress = AddProgress::default();
        match self.allocator.save_allocated_pci(&pci, &args.netns) {
            Ok(()) => progress.claimed = true,
            Err(SriovError::AlreadyAllocated { ref owner, .. }) if *owner == args.netns => {
                info!(pci = %pci, "VF already attached to this namespace, replaying");
            }
            Err(e) => return Err(e.into()),
        }

        match self.attach(&mut conf, &mut device, args, &mut progress).await {
            Ok(Attached {
                carrier_timeout: Some(timeout),
                ..
            }) => {
                warn!(pci = %pci, error = %timeout, "Attached without carrier");
                Err(timeout.into())
            }
            Ok(Attached { result, .. }) => {
                info!(pci = %pci, vf = %device.describe(), "Attached VF");
                Ok(result)
            }
            Err(error) => {
                warn!(pci = %pci, error = %error, "ADD failed, rolling back");
                let warnings = self.rollback(&conf, &device, args, &progress).await;
                Err(CmdFailure { error, warnings })
            }
        }
    }

    async fn attach(
        &self,
        conf: &mut NetConf,
        device: &mut VfDevice,
        args: &CmdArgs,
        progress: &mut AddProgress,
    ) -> SriovResult<Attached> {
        let netns = args.netns.as_str();
        let ifname = args.ifname.as_str();

        // On replay the netdev may already sit in the namespace.
        let mut moved = false;
        if !device.userspace && !progress.claimed {
            match self.links.link(Some(netns), ifname).await {
                Ok(_) => {
                    device.netdev = Some(NetdevLocation::container(netns, ifname));
                    moved = true;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        if !device.userspace && device.netdev.is_none() {
            return Err(SriovError::device_not_found(
                &device.pci,
                "VF has no network interface in the host namespace",
            ));
        }

        if conf.orig_vf_state().is_none() {
            let orig = self.vf_state.capture(device).await?;
            conf.set_orig_vf_state(orig);
        }
        progress.captured = progress.claimed;

        self.vf_state.apply(conf.desired(), device).await?;

        if !device.userspace {
            if !moved {
                self.move_into(device, netns, ifname).await?;
            }
            self.set(Some(netns), LinkOp::Up { link: ifname.to_string() })
                .await?;
        }

        let mut carrier_timeout = None;
        if !device.userspace && conf.desired().link_state != Some(VfLinkState::Disable) {
            let timeout = conf.carrier_timeout();
            if !self
                .carrier
                .wait_for_carrier(Some(netns), ifname, timeout)
                .await?
            {
                carrier_timeout = Some(SriovError::CarrierTimeout {
                    ifname: ifname.to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
        }

        let mac = match &device.netdev {
            Some(loc) if !device.userspace => {
                self.links.link(loc.netns.as_deref(), &loc.name).await?.mac
            }
            _ => None,
        };
        let mut result = CniResult::new(
            conf.cni_version(),
            Interface {
                name: ifname.to_string(),
                mac,
                sandbox: netns.to_string(),
            },
        );

        if carrier_timeout.is_none() {
            if let Some(plugin) = conf.ipam_type() {
                progress.ipam = true;
                let request = self.ipam_request(args, args.stdin.clone());
                let ipam = self.ipam.add(plugin, &request).await?;
                for ip in &ipam.ips {
                    self.set(
                        Some(netns),
                        LinkOp::AddAddress {
                            link: ifname.to_string(),
                            cidr: ip.address.clone(),
                        },
                    )
                    .await?;
                }
                for route in &ipam.routes {
                    self.set(
                        Some(netns),
                        LinkOp::AddRoute {
                            link: ifname.to_string(),
                            dst: route.dst.clone(),
                            gateway: route.gw.clone(),
                        },
                    )
                    .await?;
                }
                result = result.with_ipam(ipam);
            }
        }

        self.cache.save(&args.container_id, ifname, conf)?;
        Ok(Attached {
            result,
            carrier_timeout,
        })
    }

    /// Moves the host netdev into `netns` as `ifname`, going through a
    /// temporary name so it cannot clash on either side.
    async fn move_into(&self, device: &mut VfDevice, netns: &str, ifname: &str) -> SriovResult<()> {
        let Some(host) = device.netdev.clone() else {
            return Ok(());
        };

        let existing = self.links.links(Some(netns)).await?;
        if existing.iter().any(|link| link.name == ifname) {
            return Err(SriovError::device_state(
                "name",
                ifname,
                format!("an interface with this name already exists in {}", netns),
            ));
        }

        let link = self.links.link(None, &host.name).await?;
        let temp = format!("temp_{}", link.index);

        self.set(None, LinkOp::Down { link: host.name.clone() })
            .await?;
        self.set(
            None,
            LinkOp::Rename {
                link: host.name.clone(),
                new_name: temp.clone(),
            },
        )
        .await?;
        device.netdev = Some(NetdevLocation::host(&temp));

        self.set(
            None,
            LinkOp::MoveToNetns {
                link: temp.clone(),
                netns: netns.to_string(),
            },
        )
        .await?;
        device.netdev = Some(NetdevLocation::container(netns, &temp));

        self.set(
            Some(netns),
            LinkOp::Rename {
                link: temp,
                new_name: ifname.to_string(),
            },
        )
        .await?;
        device.netdev = Some(NetdevLocation::container(netns, ifname));
        Ok(())
    }

    async fn rollback(
        &self,
        conf: &NetConf,
        device: &VfDevice,
        args: &CmdArgs,
        progress: &AddProgress,
    ) -> Vec<String> {
        let mut warnings = Vec::new();

        if progress.ipam {
            if let Some(plugin) = conf.ipam_type() {
                let request = self.ipam_request(args, args.stdin.clone());
                if let Err(e) = self.ipam.del(plugin, &request).await {
                    warn!(error = %e, "Rollback: IPAM release failed");
                    warnings.push(format!("IPAM release failed: {}", e));
                }
            }
        }

        if progress.captured {
            if let Some(orig) = conf.orig_vf_state() {
                if let Err(e) = self.vf_state.restore(orig, device).await {
                    warn!(error = %e, "Rollback: VF restore failed");
                    warnings.push(format!("VF restore failed: {}", e));
                }
            }
        }

        if progress.claimed {
            if let Err(e) = self.allocator.delete_allocated_pci(&device.pci) {
                warn!(error = %e, "Rollback: allocation release failed");
                warnings.push(format!("allocation release failed: {}", e));
            }
        }

        warnings
    }

    /// Detaches the VF and puts it back as it was found.
    ///
    /// Anything already gone (cache entry, namespace, device) counts as
    /// released. A restore failure on a present device keeps the record and
    /// the cache so a retried DEL can finish. An IPAM release failure does
    /// not stop the VF cleanup; it is reported once cleanup is done.
    #[instrument(skip(self, args), fields(container = %args.container_id, ifname = %args.ifname))]
    pub async fn cmd_del(&self, args: &CmdArgs) -> Result<(), CmdFailure> {
        let Some(conf) = self.cache.load(&args.container_id, &args.ifname)? else {
            info!("No cached configuration, nothing to release");
            return Ok(());
        };
        let pci = conf.pci().to_string();

        let mut ipam_error = None;
        if let Some(plugin) = conf.ipam_type() {
            let config = if args.stdin.is_empty() {
                conf.to_bytes()?
            } else {
                args.stdin.clone()
            };
            if let Err(e) = self.ipam.del(plugin, &self.ipam_request(args, config)).await {
                warn!(pci = %pci, error = %e, "IPAM release failed, continuing with VF cleanup");
                ipam_error = Some(e);
            }
        }

        let released = self.release(&conf, &pci, args).await;
        match (ipam_error, released) {
            (None, Ok(())) => {
                info!(pci = %pci, "Released VF");
                Ok(())
            }
            (None, Err(e)) => Err(e.into()),
            (Some(error), released) => Err(CmdFailure {
                error,
                warnings: released
                    .err()
                    .map(|e| vec![format!("VF release failed: {}", e)])
                    .unwrap_or_default(),
            }),
        }
    }

    /// Restores the VF, then drops the allocation record and the cache entry.
    async fn release(&self, conf: &NetConf, pci: &str, args: &CmdArgs) -> SriovResult<()> {
        let netns_live = !args.netns.is_empty() && self.probe.is_live(&args.netns)?;

        match self.resolver.locate(pci) {
            Ok(mut device) => {
                if let Some(orig) = conf.orig_vf_state() {
                    if !device.userspace && netns_live {
                        match self.links.link(Some(&args.netns), &args.ifname).await {
                            Ok(_) => {
                                device.netdev =
                                    Some(NetdevLocation::container(&args.netns, &args.ifname));
                            }
                            Err(e) if e.is_not_found() => {}
                            Err(SriovError::Namespace { .. }) => {}
                            Err(e) => return Err(e),
                        }
                    }
                    self.vf_state.restore(orig, &device).await?;
                }
            }
            Err(e) if e.is_not_found() => {
                warn!(pci = %pci, "VF is gone, skipping restore");
            }
            Err(e) => return Err(e),
        }

        match self.allocator.owner(pci)? {
            Some(owner) if owner != args.netns => {
                warn!(pci = %pci, owner = %owner, "Allocation belongs to another namespace, keeping it");
            }
            _ => {
                self.allocator.release_owned(pci, &args.netns)?;
            }
        }
        self.cache.remove(&args.container_id, &args.ifname)
    }

    /// Verifies the attachment against its configuration without changing
    /// anything.
    #[instrument(skip(self, args), fields(container = %args.container_id, ifname = %args.ifname))]
    pub async fn cmd_check(&self, args: &CmdArgs) -> Result<(), CmdFailure> {
        let conf = NetConf::load(&args.stdin)?;
        let cached = self
            .cache
            .load(&args.container_id, &args.ifname)?
            .ok_or_else(|| {
                SriovError::config(
                    "netconf",
                    format!(
                        "no cached configuration for {}-{}",
                        args.container_id, args.ifname
                    ),
                )
            })?;

        let pci = conf.pci().to_string();
        let mut mismatches = Vec::new();
        if cached.pci() != pci {
            mismatches.push(format!("deviceID: expected {}, found {}", pci, cached.pci()));
        }

        let mut device = self.resolver.locate(&pci)?;

        match self.allocator.owner(&pci)? {
            Some(owner) if owner == args.netns => {}
            Some(owner) => mismatches.push(format!(
                "allocation: expected owner {}, found {}",
                args.netns, owner
            )),
            None => mismatches.push(format!(
                "allocation: expected owner {}, found none",
                args.netns
            )),
        }

        if !device.userspace {
            match self.links.link(Some(&args.netns), &args.ifname).await {
                Ok(_) => {
                    device.netdev = Some(NetdevLocation::container(&args.netns, &args.ifname));
                }
                Err(e) if e.is_not_found() => {
                    mismatches.push(format!("netdev: {} not present in {}", args.ifname, args.netns));
                    device.netdev = None;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let actual = self.vf_state.capture(&device).await?;
        mismatches.extend(conf.desired().mismatches(&actual));

        if let Some(plugin) = conf.ipam_type() {
            self.ipam
                .check(plugin, &self.ipam_request(args, args.stdin.clone()))
                .await?;
        }

        if !mismatches.is_empty() {
            return Err(SriovError::CheckMismatch {
                device: pci,
                mismatches,
            }
            .into());
        }
        info!(pci = %pci, "Attachment matches its configuration");
        Ok(())
    }
}
