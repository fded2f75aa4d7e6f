//! Scripted IPAM delegate.

use async_trait::async_trait;
use parking_lot::Mutex;

use sriov_cni_common::{IpConfig, IpamDelegate, IpamRequest, IpamResult, Route, SriovError, SriovResult};

/// One delegate invocation as seen by [`ScriptedIpam`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpamCall {
    pub command: &'static str,
    pub plugin: String,
    pub request: IpamRequest,
}

#[derive(Debug, Default)]
struct Script {
    result: IpamResult,
    failing: Vec<&'static str>,
    calls: Vec<IpamCall>,
}

/// [`IpamDelegate`] that answers from a configured result and records every
/// call. Failing commands are recorded too.
#[derive(Debug, Default)]
pub struct ScriptedIpam {
    script: Mutex<Script>,
}

impl ScriptedIpam {
    /// A delegate handing out `10.56.217.10/24` with a default route.
    pub fn new() -> Self {
        let ipam = Self::default();
        ipam.set_result(IpamResult {
            ips: vec![IpConfig {
                address: "10.56.217.10/24".to_string(),
                gateway: Some("10.56.217.1".to_string()),
                interface: None,
            }],
            routes: vec![Route {
                dst: "0.0.0.0/0".to_string(),
                gw: Some("10.56.217.1".to_string()),
            }],
            dns: None,
        });
        ipam
    }

    pub fn set_result(&self, result: IpamResult) {
        self.script.lock().result = result;
    }

    /// Makes `command` ("ADD", "DEL" or "CHECK") fail.
    pub fn fail(&self, command: &'static str) {
        self.script.lock().failing.push(command);
    }

    pub fn calls(&self) -> Vec<IpamCall> {
        self.script.lock().calls.clone()
    }

    /// Commands invoked so far, in order.
    pub fn commands(&self) -> Vec<&'static str> {
        self.script.lock().calls.iter().map(|c| c.command).collect()
    }

    fn record(&self, command: &'static str, plugin: &str, request: &IpamRequest) -> SriovResult<IpamResult> {
        let mut script = self.script.lock();
        script.calls.push(IpamCall {
            command,
            plugin: plugin.to_string(),
            request: request.clone(),
        });
        if script.failing.contains(&command) {
            return Err(SriovError::Ipam {
                plugin: plugin.to_string(),
                message: format!("{} failed: no addresses available", command),
            });
        }
        Ok(script.result.clone())
    }
}

#[async_trait]
impl IpamDelegate for ScriptedIpam {
    async fn add(&self, plugin: &str, request: &IpamRequest) -> SriovResult<IpamResult> {
        self.record("ADD", plugin, request)
    }

    async fn del(&self, plugin: &str, request: &IpamRequest) -> SriovResult<()> {
        self.record("DEL", plugin, request).map(|_| ())
    }

    async fn check(&self, plugin: &str, request: &IpamRequest) -> SriovResult<()> {
        self.record("CHECK", plugin, request).map(|_| ())
    }
}
