//! Network configuration parsing, validation and persistence format.
//!
//! The configuration document is one flat JSON object holding two disjoint
//! parts: the generic CNI keys every plugin understands and the SR-IOV
//! device keys. Each part is its own serde type; on output both are
//! serialized and merged, and the generic part wins on a key collision.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use sriov_cni_common::{MacAddress, SriovError, SriovResult, VfLinkState, VlanProto};

use crate::types::{DesiredVfState, VfState};

/// Default values for configuration and runtime parameters.
pub mod defaults {
    /// Directory holding the netconf cache.
    pub const DATA_DIR: &str = "/var/lib/cni/sriov";
    /// Subdirectory of [`DATA_DIR`] holding the PCI allocation records.
    pub const PCI_DIR: &str = "pci";
    /// Mount point of sysfs.
    pub const SYSFS_ROOT: &str = "/sys";
    /// How long ADD waits for carrier on the moved interface.
    pub const CARRIER_TIMEOUT_MS: u64 = 5000;
    /// Carrier poll period.
    pub const CARRIER_POLL_INTERVAL_MS: u64 = 10;
    /// Log level when `logLevel` is not set.
    pub const LOG_LEVEL: &str = "info";
    /// CNI version reported when the configuration does not name one.
    pub const CNI_VERSION: &str = "1.0.0";
}

/// Accepted `logLevel` values.
pub const LOG_LEVELS: &[&str] = &["panic", "error", "warning", "info", "debug"];

/// Keys owned by the SR-IOV part of the document.
const SRIOV_KEYS: &[&str] = &[
    "deviceID",
    "mac",
    "mtu",
    "vlan",
    "vlanQoS",
    "vlanProto",
    "min_tx_rate",
    "max_tx_rate",
    "spoofchk",
    "trust",
    "link_state",
    "runtimeConfig",
    "logLevel",
    "logFile",
    "carrierTimeoutMs",
    "OrigVfState",
];

static PCI_ADDR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:([0-9a-fA-F]{4}):)?([0-9a-fA-F]{2}):([0-9a-fA-F]{2})\.([0-7])$")
        .expect("Invalid regex pattern")
});

/// Generic CNI configuration keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CniNetConf {
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipam: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<Value>,
    #[serde(rename = "prevResult", default, skip_serializing_if = "Option::is_none")]
    pub prev_result: Option<Value>,
    /// Keys neither part knows; carried through unchanged.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Runtime supplied overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

/// SR-IOV device configuration keys, kept in input form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SriovNetConf {
    #[serde(rename = "deviceID", default)]
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<i64>,
    #[serde(rename = "vlanQoS", default, skip_serializing_if = "Option::is_none")]
    pub vlan_qos: Option<i64>,
    #[serde(rename = "vlanProto", default, skip_serializing_if = "Option::is_none")]
    pub vlan_proto: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_tx_rate: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tx_rate: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spoofchk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_state: Option<String>,
    #[serde(rename = "runtimeConfig", default, skip_serializing_if = "Option::is_none")]
    pub runtime_config: Option<RuntimeConfig>,
    #[serde(rename = "logLevel", default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(rename = "logFile", default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
    #[serde(rename = "carrierTimeoutMs", default, skip_serializing_if = "Option::is_none")]
    pub carrier_timeout_ms: Option<u64>,
    /// State of the VF before the first ADD. Never read from user input.
    #[serde(rename = "OrigVfState", default, skip_serializing_if = "Option::is_none")]
    pub orig_vf_state: Option<VfState>,
}

/// A parsed and validated network configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct NetConf {
    pub generic: CniNetConf,
    pub device: SriovNetConf,
    desired: DesiredVfState,
}

fn from_doc<T: DeserializeOwned>(doc: Value) -> SriovResult<T> {
    serde_json::from_value(doc).map_err(|e| SriovError::config("netconf", e.to_string()))
}

fn to_object<T: Serialize>(value: &T) -> SriovResult<Map<String, Value>> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(SriovError::config(
            "netconf",
            format!("expected an object, serialized to {}", other),
        )),
        Err(e) => Err(SriovError::decode("network configuration", e)),
    }
}

/// Canonicalizes a PCI address to `dddd:bb:dd.f`; a missing domain is `0000`.
pub fn canonical_pci(addr: &str) -> SriovResult<String> {
    let caps = PCI_ADDR_RE.captures(addr.trim()).ok_or_else(|| {
        SriovError::config("deviceID", format!("'{}' is not a PCI address", addr))
    })?;
    let domain = caps.get(1).map_or("0000", |m| m.as_str());
    Ok(format!("{}:{}:{}.{}", domain, &caps[2], &caps[3], &caps[4]).to_ascii_lowercase())
}

fn parse_on_off(field: &str, value: &str) -> SriovResult<bool> {
    match value {
        "on" => Ok(true),
        "off" => Ok(false),
        other => Err(SriovError::config(
            field,
            format!("'{}' is not one of on|off", other),
        )),
    }
}

fn in_range<T: TryFrom<i64>>(field: &str, value: i64, max: i64) -> SriovResult<T> {
    if !(0..=max).contains(&value) {
        return Err(SriovError::config(
            field,
            format!("{} is out of range 0..={}", value, max),
        ));
    }
    T::try_from(value).map_err(|_| SriovError::config(field, format!("{} is out of range", value)))
}

fn validate(conf: &SriovNetConf) -> SriovResult<DesiredVfState> {
    let mut desired = DesiredVfState::default();

    if let Some(mac) = conf.mac.as_deref() {
        let parsed: MacAddress = mac
            .parse()
            .map_err(|e: sriov_cni_common::InvalidMacAddress| SriovError::config("mac", e.to_string()))?;
        if parsed.is_multicast() {
            return Err(SriovError::config("mac", format!("{} is a multicast address", mac)));
        }
        desired.mac = Some(parsed);
    }

    if let Some(vlan) = conf.vlan {
        desired.vlan = Some(in_range("vlan", vlan, 4094)?);
    }
    if let Some(qos) = conf.vlan_qos {
        desired.vlan_qos = Some(in_range("vlanQoS", qos, 7)?);
    }
    if let Some(proto) = conf.vlan_proto.as_deref() {
        desired.vlan_proto = Some(
            proto
                .parse::<VlanProto>()
                .map_err(|e| SriovError::config("vlanProto", e))?,
        );
    }
    let vlan = desired.vlan.unwrap_or(0);
    if vlan == 0 && desired.vlan_qos.unwrap_or(0) != 0 {
        return Err(SriovError::config("vlanQoS", "a nonzero QoS requires a nonzero vlan"));
    }
    if vlan == 0 && desired.vlan_proto == Some(VlanProto::Dot1AD) {
        return Err(SriovError::config("vlanProto", "802.1ad requires a nonzero vlan"));
    }

    if let Some(rate) = conf.min_tx_rate {
        desired.min_tx_rate = Some(in_range("min_tx_rate", rate, i64::from(u32::MAX))?);
    }
    if let Some(rate) = conf.max_tx_rate {
        desired.max_tx_rate = Some(in_range("max_tx_rate", rate, i64::from(u32::MAX))?);
    }
    if let (Some(min), Some(max)) = (desired.min_tx_rate, desired.max_tx_rate) {
        if max != 0 && min > max {
            return Err(SriovError::config(
                "min_tx_rate",
                format!("{} exceeds max_tx_rate {}", min, max),
            ));
        }
    }

    if let Some(on) = conf.spoofchk.as_deref() {
        desired.spoofchk = Some(parse_on_off("spoofchk", on)?);
    }
    if let Some(on) = conf.trust.as_deref() {
        desired.trust = Some(parse_on_off("trust", on)?);
    }
    if let Some(state) = conf.link_state.as_deref() {
        desired.link_state = Some(
            state
                .parse::<VfLinkState>()
                .map_err(|e| SriovError::config("link_state", e))?,
        );
    }

    if let Some(mtu) = conf.mtu {
        if mtu <= 0 {
            return Err(SriovError::config("mtu", format!("{} is not positive", mtu)));
        }
        desired.mtu = Some(in_range("mtu", mtu, i64::from(u32::MAX))?);
    }

    if let Some(level) = conf.log_level.as_deref() {
        if !LOG_LEVELS.contains(&level) {
            return Err(SriovError::config(
                "logLevel",
                format!("'{}' is not one of {}", level, LOG_LEVELS.join("|")),
            ));
        }
    }
    if conf.carrier_timeout_ms == Some(0) {
        return Err(SriovError::config("carrierTimeoutMs", "must be positive"));
    }

    Ok(desired)
}

impl NetConf {
    /// Parses and validates a configuration document.
    ///
    /// `runtimeConfig.mac` overrides `mac`. Syntax errors are decode
    /// failures; wrong types and invalid values are configuration errors.
    pub fn load(bytes: &[u8]) -> SriovResult<NetConf> {
        let doc: Value = serde_json::from_slice(bytes)
            .map_err(|e| SriovError::decode("network configuration", e))?;
        if !doc.is_object() {
            return Err(SriovError::config("netconf", "expected a JSON object"));
        }

        let mut generic: CniNetConf = from_doc(doc.clone())?;
        let mut device: SriovNetConf = from_doc(doc)?;
        generic.extra.retain(|key, _| !SRIOV_KEYS.contains(&key.as_str()));

        if device.device_id.is_empty() {
            return Err(SriovError::config("deviceID", "required"));
        }
        device.device_id = canonical_pci(&device.device_id)?;

        if let Some(mac) = device.runtime_config.as_ref().and_then(|rc| rc.mac.clone()) {
            device.mac = Some(mac);
        }

        let desired = validate(&device)?;
        Ok(NetConf {
            generic,
            device,
            desired,
        })
    }

    /// Serializes both parts and merges them into one flat document.
    pub fn to_bytes(&self) -> SriovResult<Vec<u8>> {
        let mut merged = to_object(&self.device)?;
        for (key, value) in to_object(&self.generic)? {
            merged.insert(key, value);
        }
        serde_json::to_vec(&Value::Object(merged))
            .map_err(|e| SriovError::decode("network configuration", e))
    }

    /// Canonical PCI address of the VF.
    pub fn pci(&self) -> &str {
        &self.device.device_id
    }

    /// Requested VF attributes.
    pub fn desired(&self) -> &DesiredVfState {
        &self.desired
    }

    /// CNI version of the configuration, or the default.
    pub fn cni_version(&self) -> &str {
        if self.generic.cni_version.is_empty() {
            defaults::CNI_VERSION
        } else {
            &self.generic.cni_version
        }
    }

    /// The IPAM delegate plugin, if any.
    pub fn ipam_type(&self) -> Option<&str> {
        self.generic
            .ipam
            .as_ref()
            .and_then(|ipam| ipam.get("type"))
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
    }

    /// How long ADD waits for carrier.
    pub fn carrier_timeout(&self) -> Duration {
        Duration::from_millis(
            self.device
                .carrier_timeout_ms
                .unwrap_or(defaults::CARRIER_TIMEOUT_MS),
        )
    }

    /// The pre-attachment VF state, if captured.
    pub fn orig_vf_state(&self) -> Option<&VfState> {
        self.device.orig_vf_state.as_ref()
    }

    /// Records the pre-attachment VF state. A state already present is kept.
    pub fn set_orig_vf_state(&mut self, state: VfState) {
        if self.device.orig_vf_state.is_none() {
            self.device.orig_vf_state = Some(state);
        }
    }
}
