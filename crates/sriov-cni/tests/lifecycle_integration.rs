//! ADD, DEL and CHECK end to end against the fake host.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mockall::mock;
use pretty_assertions::assert_eq;
use serde_json::json;

use sriov_cni::{CmdArgs, Collaborators, NetConfCache, SriovCni};
use sriov_cni_common::{
    codes, IpamDelegate, IpamRequest, IpamResult, LinkOp, LinkOps, SriovError, SriovResult,
};
use sriov_cni_test::{
    vf_info, vf_mac, NetConfBuilder, Scenario, CNI_PATH, CONTAINER_ID, IFNAME, NETNS,
    OTHER_NETNS, PF_NAME, VF_INDEX, VF_NAME, VF_PCI,
};

fn plugin_with_ipam(s: &Scenario, ipam: Arc<dyn IpamDelegate>) -> SriovCni {
    SriovCni::new(Collaborators {
        links: s.links.clone(),
        store: s.store.clone(),
        probe: s.namespaces.clone(),
        ipam,
        sysfs_root: s.sysfs.root(),
        data_dir: s.data_dir(),
    })
}

fn plugin(s: &Scenario) -> SriovCni {
    plugin_with_ipam(s, s.ipam.clone())
}

fn args(netns: &str, stdin: Vec<u8>) -> CmdArgs {
    CmdArgs {
        container_id: CONTAINER_ID.to_string(),
        netns: netns.to_string(),
        ifname: IFNAME.to_string(),
        args: String::new(),
        path: CNI_PATH.to_string(),
        stdin,
    }
}

fn tuned() -> NetConfBuilder {
    NetConfBuilder::new()
        .with("mac", "02:aa:bb:cc:dd:01")
        .with("vlan", 100)
        .with("vlanQoS", 3)
        .with("spoofchk", "off")
        .with("trust", "on")
        .with("min_tx_rate", 100)
        .with("max_tx_rate", 200)
        .with("link_state", "enable")
        .with("mtu", 9000)
}

fn cached(s: &Scenario) -> bool {
    NetConfCache::new(s.data_dir())
        .load(CONTAINER_ID, IFNAME)
        .unwrap()
        .is_some()
}

#[tokio::test]
async fn test_add_moves_and_configures_vf() {
    let s = Scenario::new();
    let cni = plugin(&s);

    let result = cni
        .cmd_add(&args(NETNS, tuned().ipam("host-local").build()))
        .await
        .unwrap();

    assert_eq!(result.interfaces.len(), 1);
    assert_eq!(result.interfaces[0].name, IFNAME);
    assert_eq!(result.interfaces[0].sandbox, NETNS);
    assert_eq!(result.interfaces[0].mac.unwrap().to_string(), "02:aa:bb:cc:dd:01");
    assert_eq!(result.ips[0].address, "10.56.217.10/24");
    assert_eq!(result.ips[0].interface, Some(0));

    let vf = s.links.vf(PF_NAME, VF_INDEX).unwrap();
    assert_eq!(vf.vlan, 100);
    assert_eq!(vf.qos, 3);
    assert!(!vf.spoofchk);
    assert!(vf.trust);
    assert_eq!((vf.min_tx_rate, vf.max_tx_rate), (100, 200));

    assert!(s.links.find_link(None, VF_NAME).is_none());
    let link = s.links.find_link(Some(NETNS), IFNAME).unwrap();
    assert!(link.admin_up);
    assert_eq!(link.mtu, 9000);

    assert_eq!(s.store.get(VF_PCI).as_deref(), Some(NETNS));
    assert!(cached(&s));
    assert_eq!(s.ipam.commands(), vec!["ADD"]);

    let addresses: Vec<_> = s
        .links
        .recorded()
        .into_iter()
        .filter(|(_, op)| matches!(op, LinkOp::AddAddress { .. } | LinkOp::AddRoute { .. }))
        .collect();
    assert_eq!(addresses.len(), 2);
    assert!(addresses.iter().all(|(ns, _)| ns.as_deref() == Some(NETNS)));
}

#[tokio::test]
async fn test_add_goes_through_temporary_name() {
    let s = Scenario::new();
    plugin(&s)
        .cmd_add(&args(NETNS, NetConfBuilder::new().build()))
        .await
        .unwrap();

    let renames: Vec<_> = s
        .links
        .ops()
        .into_iter()
        .filter_map(|op| match op {
            LinkOp::Rename { new_name, .. } => Some(new_name),
            _ => None,
        })
        .collect();
    assert_eq!(renames.len(), 2);
    assert!(renames[0].starts_with("temp_"));
    assert_eq!(renames[1], IFNAME);
}

#[tokio::test]
async fn test_add_rejects_taken_ifname() {
    let s = Scenario::new();
    s.links.add_link(Some(NETNS), IFNAME, vf_mac(), 1500);

    let err = plugin(&s)
        .cmd_add(&args(NETNS, NetConfBuilder::new().build()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), codes::DEVICE_STATE);
    assert!(s.links.find_link(None, VF_NAME).is_some());
    assert!(!s.store.contains(VF_PCI));
}

#[tokio::test]
async fn test_replayed_add_is_idempotent() {
    let s = Scenario::new();
    let cni = plugin(&s);
    let conf = tuned().build();

    let first = cni.cmd_add(&args(NETNS, conf.clone())).await.unwrap();
    s.links.clear_ops();
    let second = cni.cmd_add(&args(NETNS, conf)).await.unwrap();

    assert_eq!(first, second);
    assert!(!s
        .links
        .ops()
        .iter()
        .any(|op| matches!(op, LinkOp::MoveToNetns { .. } | LinkOp::Rename { .. })));
    assert_eq!(s.store.get(VF_PCI).as_deref(), Some(NETNS));

    // The original state survives replay, so DEL still restores the host values.
    cni.cmd_del(&args(NETNS, Vec::new())).await.unwrap();
    assert_eq!(s.links.vf(PF_NAME, VF_INDEX).unwrap(), vf_info(VF_INDEX));
    assert_eq!(s.links.find_link(None, VF_NAME).unwrap().mac, Some(vf_mac()));
}

#[tokio::test]
async fn test_vf_owned_by_live_namespace_is_refused() {
    let s = Scenario::new();
    let cni = plugin(&s);
    cni.cmd_add(&args(NETNS, NetConfBuilder::new().build()))
        .await
        .unwrap();
    s.links.clear_ops();

    let mut other = args(OTHER_NETNS, NetConfBuilder::new().build());
    other.container_id = "other".to_string();
    let err = cni.cmd_add(&other).await.unwrap_err();

    assert_eq!(err.code(), codes::ALREADY_ALLOCATED);
    assert!(matches!(err.error, SriovError::AlreadyAllocated { ref owner, .. } if owner == NETNS));
    assert!(s.links.ops().is_empty());
    assert_eq!(s.store.get(VF_PCI).as_deref(), Some(NETNS));
}

#[tokio::test]
async fn test_stale_allocation_is_taken_over() {
    let s = Scenario::new();
    s.store.insert(VF_PCI, "/var/run/netns/gone");

    plugin(&s)
        .cmd_add(&args(NETNS, NetConfBuilder::new().build()))
        .await
        .unwrap();
    assert_eq!(s.store.get(VF_PCI).as_deref(), Some(NETNS));
}

#[tokio::test]
async fn test_failed_rate_rolls_everything_back() {
    let s = Scenario::new();
    s.links.fail_on("max_tx_rate");

    let err = plugin(&s)
        .cmd_add(&args(NETNS, tuned().ipam("host-local").build()))
        .await
        .unwrap_err();

    assert_eq!(err.code(), codes::DEVICE_STATE);
    assert!(err.warnings.is_empty());
    assert_eq!(s.links.vf(PF_NAME, VF_INDEX).unwrap(), vf_info(VF_INDEX));
    let host = s.links.find_link(None, VF_NAME).unwrap();
    assert_eq!(host.mac, Some(vf_mac()));
    assert_eq!(host.mtu, 1500);
    assert!(!s.store.contains(VF_PCI));
    assert!(!cached(&s));
    assert!(s.ipam.calls().is_empty());
}

#[tokio::test]
async fn test_rollback_failures_become_warnings() {
    let s = Scenario::new();
    s.links.fail_on("max_tx_rate");
    s.links.fail_on("trust");

    let err = plugin(&s)
        .cmd_add(&args(NETNS, NetConfBuilder::new().with("max_tx_rate", 500).build()))
        .await
        .unwrap_err();

    // The primary error is the rate failure, the restore problem rides along.
    assert!(matches!(err.error, SriovError::DeviceState { ref attribute, .. } if attribute == "max_tx_rate"));
    assert_eq!(err.warnings.len(), 1);
    assert!(err.warnings[0].starts_with("VF restore failed"));
    assert!(!s.store.contains(VF_PCI));
}

#[tokio::test]
async fn test_carrier_timeout_commits_attachment() {
    let s = Scenario::new();
    s.links.hold_carrier();
    let cni = plugin(&s);
    let conf = NetConfBuilder::new()
        .with("carrierTimeoutMs", 50)
        .ipam("host-local")
        .build();

    let err = cni.cmd_add(&args(NETNS, conf.clone())).await.unwrap_err();
    assert_eq!(err.code(), codes::CARRIER_TIMEOUT);
    assert!(s.links.find_link(Some(NETNS), IFNAME).is_some());
    assert_eq!(s.store.get(VF_PCI).as_deref(), Some(NETNS));
    assert!(cached(&s));
    assert!(s.ipam.calls().is_empty());

    // Once carrier shows up a retried ADD finishes the job.
    s.links.set_carrier(Some(NETNS), IFNAME, true);
    let result = cni.cmd_add(&args(NETNS, conf)).await.unwrap();
    assert_eq!(result.ips.len(), 1);
    assert_eq!(s.ipam.commands(), vec!["ADD"]);
}

#[tokio::test]
async fn test_carrier_arriving_late_is_awaited() {
    let s = Scenario::new();
    s.links.hold_carrier();
    let links = s.links.clone();
    let raise = tokio::spawn(async move {
        for _ in 0..50 {
            if links.find_link(Some(NETNS), IFNAME).is_some() {
                tokio::time::sleep(Duration::from_millis(30)).await;
                links.set_running(Some(NETNS), IFNAME, true);
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    plugin(&s)
        .cmd_add(&args(NETNS, NetConfBuilder::new().with("carrierTimeoutMs", 2000).build()))
        .await
        .unwrap();
    raise.await.unwrap();
}

#[tokio::test]
async fn test_disabled_link_skips_carrier_wait() {
    let s = Scenario::new();
    s.links.hold_carrier();

    plugin(&s)
        .cmd_add(&args(
            NETNS,
            NetConfBuilder::new()
                .with("link_state", "disable")
                .with("carrierTimeoutMs", 20)
                .build(),
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_userspace_vf() {
    let s = Scenario::new();
    s.bind_userspace();
    let cni = plugin(&s);

    let err = cni
        .cmd_add(&args(NETNS, NetConfBuilder::new().ipam("host-local").build()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), codes::INVALID_NETWORK_CONFIG);
    assert!(!s.store.contains(VF_PCI));

    let result = cni
        .cmd_add(&args(NETNS, NetConfBuilder::new().with("vlan", 10).build()))
        .await
        .unwrap();
    assert_eq!(result.interfaces[0].mac, None);
    assert_eq!(s.links.vf(PF_NAME, VF_INDEX).unwrap().vlan, 10);
    assert!(!s.links.ops().iter().any(|op| matches!(op, LinkOp::MoveToNetns { .. })));

    cni.cmd_del(&args(NETNS, Vec::new())).await.unwrap();
    assert_eq!(s.links.vf(PF_NAME, VF_INDEX).unwrap().vlan, 0);
    assert!(!s.store.contains(VF_PCI));
}

#[tokio::test]
async fn test_del_restores_and_releases() {
    let s = Scenario::new();
    let cni = plugin(&s);
    cni.cmd_add(&args(NETNS, tuned().ipam("host-local").build()))
        .await
        .unwrap();

    cni.cmd_del(&args(NETNS, Vec::new())).await.unwrap();

    assert_eq!(s.links.vf(PF_NAME, VF_INDEX).unwrap(), vf_info(VF_INDEX));
    let host = s.links.find_link(None, VF_NAME).unwrap();
    assert_eq!(host.mac, Some(vf_mac()));
    assert_eq!(host.mtu, 1500);
    assert!(s.links.find_link(Some(NETNS), IFNAME).is_none());
    assert!(!s.store.contains(VF_PCI));
    assert!(!cached(&s));
    assert_eq!(s.ipam.commands(), vec!["ADD", "DEL"]);

    // DEL without stdin hands the cached configuration to IPAM.
    let del = &s.ipam.calls()[1];
    let conf: serde_json::Value = serde_json::from_slice(&del.request.config).unwrap();
    assert_eq!(conf["ipam"]["type"], "host-local");
    assert_eq!(conf["deviceID"], VF_PCI);

    s.links.clear_ops();
    cni.cmd_del(&args(NETNS, Vec::new())).await.unwrap();
    assert!(s.links.ops().is_empty());
    assert_eq!(s.ipam.commands(), vec!["ADD", "DEL"]);
}

#[tokio::test]
async fn test_add_ignores_orig_state_from_input() {
    let s = Scenario::new();
    let cni = plugin(&s);
    let forged = json!({
        "HostIFName": "eth0",
        "SpoofChk": false,
        "Trust": true,
        "AdminMAC": "02:00:00:00:00:99",
        "Vlan": 777,
    });
    cni.cmd_add(&args(NETNS, tuned().with("OrigVfState", forged).build()))
        .await
        .unwrap();

    cni.cmd_del(&args(NETNS, Vec::new())).await.unwrap();

    assert_eq!(s.links.vf(PF_NAME, VF_INDEX).unwrap(), vf_info(VF_INDEX));
    assert!(s.links.find_link(None, VF_NAME).is_some());
    assert!(s.links.find_link(None, "eth0").is_none());
}

#[tokio::test]
async fn test_del_after_namespace_is_gone() {
    let s = Scenario::new();
    let cni = plugin(&s);
    cni.cmd_add(&args(NETNS, tuned().build())).await.unwrap();

    s.destroy_netns();
    cni.cmd_del(&args(NETNS, Vec::new())).await.unwrap();

    assert!(s.links.find_link(None, IFNAME).is_none());
    assert_eq!(s.links.find_link(None, VF_NAME).unwrap().mac, Some(vf_mac()));
    assert_eq!(s.links.vf(PF_NAME, VF_INDEX).unwrap(), vf_info(VF_INDEX));
    assert!(!s.store.contains(VF_PCI));
    assert!(!cached(&s));
}

#[tokio::test]
async fn test_del_keeps_record_owned_elsewhere() {
    let s = Scenario::new();
    let cni = plugin(&s);
    cni.cmd_add(&args(NETNS, NetConfBuilder::new().build()))
        .await
        .unwrap();
    s.store.insert(VF_PCI, OTHER_NETNS);

    cni.cmd_del(&args(NETNS, Vec::new())).await.unwrap();
    assert_eq!(s.store.get(VF_PCI).as_deref(), Some(OTHER_NETNS));
    assert!(!cached(&s));
}

#[tokio::test]
async fn test_del_restore_failure_keeps_state_for_retry() {
    let s = Scenario::new();
    let cni = plugin(&s);
    cni.cmd_add(&args(NETNS, tuned().build())).await.unwrap();

    s.links.fail_on("vlan");
    let err = cni.cmd_del(&args(NETNS, Vec::new())).await.unwrap_err();
    assert_eq!(err.code(), codes::DEVICE_STATE);
    assert!(s.store.contains(VF_PCI));
    assert!(cached(&s));

    s.links.clear_failures();
    cni.cmd_del(&args(NETNS, Vec::new())).await.unwrap();
    assert_eq!(s.links.vf(PF_NAME, VF_INDEX).unwrap(), vf_info(VF_INDEX));
    assert!(!s.store.contains(VF_PCI));
}

#[tokio::test]
async fn test_del_cleans_up_when_ipam_release_fails() {
    let s = Scenario::new();
    let cni = plugin(&s);
    cni.cmd_add(&args(NETNS, tuned().ipam("host-local").build()))
        .await
        .unwrap();
    s.destroy_netns();
    s.ipam.fail("DEL");

    let err = cni.cmd_del(&args(NETNS, Vec::new())).await.unwrap_err();

    assert_eq!(err.code(), codes::IPAM);
    assert!(err.warnings.is_empty());
    assert_eq!(s.ipam.commands(), vec!["ADD", "DEL"]);
    assert_eq!(s.links.vf(PF_NAME, VF_INDEX).unwrap(), vf_info(VF_INDEX));
    assert_eq!(s.links.find_link(None, VF_NAME).unwrap().mac, Some(vf_mac()));
    assert!(!s.store.contains(VF_PCI));
    assert!(!cached(&s));
}

#[tokio::test]
async fn test_del_ipam_failure_carries_restore_problem() {
    let s = Scenario::new();
    let cni = plugin(&s);
    cni.cmd_add(&args(NETNS, tuned().ipam("host-local").build()))
        .await
        .unwrap();
    s.ipam.fail("DEL");
    s.links.fail_on("vlan");

    let err = cni.cmd_del(&args(NETNS, Vec::new())).await.unwrap_err();

    assert_eq!(err.code(), codes::IPAM);
    assert_eq!(err.warnings.len(), 1);
    assert!(err.warnings[0].starts_with("VF release failed"));
    assert!(s.store.contains(VF_PCI));
    assert!(cached(&s));
}

#[tokio::test]
async fn test_check_passes_on_fresh_attachment() {
    let s = Scenario::new();
    let cni = plugin(&s);
    let conf = tuned().ipam("host-local").build();
    cni.cmd_add(&args(NETNS, conf.clone())).await.unwrap();

    cni.cmd_check(&args(NETNS, conf)).await.unwrap();
    assert_eq!(s.ipam.commands(), vec!["ADD", "CHECK"]);
}

#[tokio::test]
async fn test_check_reports_every_drift() {
    let s = Scenario::new();
    let cni = plugin(&s);
    let conf = NetConfBuilder::new()
        .with("vlan", 100)
        .with("trust", "on")
        .build();
    cni.cmd_add(&args(NETNS, conf.clone())).await.unwrap();

    s.links
        .apply(
            None,
            &LinkOp::VfVlan { pf: PF_NAME.into(), vf: VF_INDEX, vlan: 0, qos: 0, proto: None },
        )
        .await
        .unwrap();
    s.links
        .apply(None, &LinkOp::VfTrust { pf: PF_NAME.into(), vf: VF_INDEX, on: false })
        .await
        .unwrap();
    s.links.clear_ops();

    let err = cni.cmd_check(&args(NETNS, conf)).await.unwrap_err();
    assert_eq!(err.code(), codes::CHECK_MISMATCH);
    match err.error {
        SriovError::CheckMismatch { mismatches, .. } => assert_eq!(
            mismatches,
            vec![
                "vlan: expected 100, found 0".to_string(),
                "trust: expected on, found off".to_string(),
            ]
        ),
        other => panic!("Expected CheckMismatch, got {:?}", other),
    }
    // CHECK never remediates.
    assert!(s.links.ops().is_empty());
}

#[tokio::test]
async fn test_check_without_attachment() {
    let s = Scenario::new();
    let err = plugin(&s)
        .cmd_check(&args(NETNS, NetConfBuilder::new().build()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), codes::INVALID_NETWORK_CONFIG);
}

#[tokio::test]
async fn test_check_missing_netdev() {
    let s = Scenario::new();
    let cni = plugin(&s);
    let conf = NetConfBuilder::new().build();
    cni.cmd_add(&args(NETNS, conf.clone())).await.unwrap();
    s.links.remove_link(Some(NETNS), IFNAME);

    let err = cni.cmd_check(&args(NETNS, conf)).await.unwrap_err();
    match err.error {
        SriovError::CheckMismatch { mismatches, .. } => {
            assert_eq!(mismatches, vec![format!("netdev: {} not present in {}", IFNAME, NETNS)]);
        }
        other => panic!("Expected CheckMismatch, got {:?}", other),
    }
}

#[tokio::test]
async fn test_add_into_dead_namespace() {
    let s = Scenario::new();
    let err = plugin(&s)
        .cmd_add(&args("/var/run/netns/missing", NetConfBuilder::new().build()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), codes::NAMESPACE);
    assert!(s.links.ops().is_empty());
}

#[tokio::test]
async fn test_invalid_config_touches_nothing() {
    let s = Scenario::new();
    let cni = plugin(&s);

    let err = cni
        .cmd_add(&args(NETNS, NetConfBuilder::new().with("vlan", 4095).build()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), codes::INVALID_NETWORK_CONFIG);

    let err = cni
        .cmd_add(&args(NETNS, b"{not json".to_vec()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), codes::DECODE_FAILURE);

    let err = cni
        .cmd_add(&args(NETNS, NetConfBuilder::new().with("deviceID", "0000:af:09.7").build()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), codes::DEVICE_NOT_FOUND);

    assert!(s.links.ops().is_empty());
    assert!(!s.store.contains(VF_PCI));
}

mock! {
    Ipam {}

    #[async_trait]
    impl IpamDelegate for Ipam {
        async fn add(&self, plugin: &str, request: &IpamRequest) -> SriovResult<IpamResult>;
        async fn del(&self, plugin: &str, request: &IpamRequest) -> SriovResult<()>;
        async fn check(&self, plugin: &str, request: &IpamRequest) -> SriovResult<()>;
    }
}

#[tokio::test]
async fn test_ipam_failure_rolls_back() {
    let s = Scenario::new();
    let mut ipam = MockIpam::new();
    ipam.expect_add()
        .times(1)
        .returning(|plugin, _| {
            Err(SriovError::Ipam {
                plugin: plugin.to_string(),
                message: "no IP addresses available in range set".to_string(),
            })
        });
    ipam.expect_del().times(1).returning(|_, _| Ok(()));
    ipam.expect_check().never();

    let err = plugin_with_ipam(&s, Arc::new(ipam))
        .cmd_add(&args(NETNS, tuned().ipam("host-local").build()))
        .await
        .unwrap_err();

    assert_eq!(err.code(), codes::IPAM);
    assert!(err.warnings.is_empty());
    assert!(s.links.find_link(Some(NETNS), IFNAME).is_none());
    assert_eq!(s.links.find_link(None, VF_NAME).unwrap().mac, Some(vf_mac()));
    assert_eq!(s.links.vf(PF_NAME, VF_INDEX).unwrap(), vf_info(VF_INDEX));
    assert!(!s.store.contains(VF_PCI));
    assert!(!cached(&s));
}

#[tokio::test]
async fn test_ipam_release_failure_is_a_warning() {
    let s = Scenario::new();
    s.links.fail_on("address");
    let mut ipam = MockIpam::new();
    ipam.expect_add()
        .returning(|_, _| Ok(serde_json::from_value(json!({ "ips": [{ "address": "10.0.0.2/24" }] })).unwrap()));
    ipam.expect_del().times(1).returning(|plugin, _| {
        Err(SriovError::Ipam {
            plugin: plugin.to_string(),
            message: "store unavailable".to_string(),
        })
    });

    let err = plugin_with_ipam(&s, Arc::new(ipam))
        .cmd_add(&args(NETNS, NetConfBuilder::new().ipam("host-local").build()))
        .await
        .unwrap_err();

    assert_eq!(err.code(), codes::DEVICE_STATE);
    assert_eq!(err.warnings.len(), 1);
    assert!(err.warnings[0].contains("store unavailable"));
    assert!(!s.store.contains(VF_PCI));
}
