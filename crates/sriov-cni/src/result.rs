//! CNI ADD result.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use sriov_cni_common::{IpConfig, IpamResult, MacAddress, Route};

/// One interface created by the plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<MacAddress>,
    /// Namespace path the interface lives in.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sandbox: String,
}

/// The JSON document printed on a successful ADD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CniResult {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub interfaces: Vec<Interface>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<IpConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<Value>,
}

impl CniResult {
    /// A result with the single attached interface and no addresses.
    pub fn new(cni_version: &str, interface: Interface) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            interfaces: vec![interface],
            ips: Vec::new(),
            routes: Vec::new(),
            dns: None,
        }
    }

    /// Merges an IPAM result, pointing every address at our interface.
    pub fn with_ipam(mut self, ipam: IpamResult) -> Self {
        self.ips = ipam
            .ips
            .into_iter()
            .map(|ip| IpConfig {
                interface: Some(0),
                ..ip
            })
            .collect();
        self.routes = ipam.routes;
        self.dns = ipam.dns;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_json() {
        let result = CniResult::new(
            "1.0.0",
            Interface {
                name: "net1".into(),
                mac: Some("0a:00:00:00:00:01".parse().unwrap()),
                sandbox: "/var/run/netns/c1".into(),
            },
        )
        .with_ipam(IpamResult {
            ips: vec![IpConfig {
                address: "10.1.1.5/24".into(),
                gateway: Some("10.1.1.1".into()),
                interface: None,
            }],
            routes: vec![],
            dns: None,
        });

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["cniVersion"], "1.0.0");
        assert_eq!(json["interfaces"][0]["mac"], "0a:00:00:00:00:01");
        assert_eq!(json["ips"][0]["interface"], 0);
        assert!(json.get("routes").is_none());
    }
}
