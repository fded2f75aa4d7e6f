//! IP address management delegate.
//!
//! Address assignment is not done here. The plugin named by the `ipam.type`
//! configuration field is executed from `CNI_PATH` with the same
//! configuration and CNI environment, and its result is merged into ours.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::error::{SriovError, SriovResult};

/// Everything a delegate invocation needs besides the plugin name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpamRequest {
    /// `CNI_CONTAINERID`.
    pub container_id: String,
    /// `CNI_NETNS`.
    pub netns: String,
    /// `CNI_IFNAME`.
    pub ifname: String,
    /// `CNI_ARGS`.
    pub args: String,
    /// `CNI_PATH`.
    pub cni_path: String,
    /// Network configuration passed on stdin.
    pub config: Vec<u8>,
}

/// One IP configuration returned by the delegate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpConfig {
    /// Address in CIDR notation.
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    /// Index into the result's interface list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
}

/// One route returned by the delegate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub dst: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
}

/// Result of a delegate ADD.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpamResult {
    #[serde(default)]
    pub ips: Vec<IpConfig>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<serde_json::Value>,
}

/// The IPAM collaborator.
#[async_trait]
pub trait IpamDelegate: Send + Sync {
    /// Allocates addresses for the attachment.
    async fn add(&self, plugin: &str, request: &IpamRequest) -> SriovResult<IpamResult>;

    /// Releases the attachment's addresses.
    async fn del(&self, plugin: &str, request: &IpamRequest) -> SriovResult<()>;

    /// Verifies the attachment's addresses.
    async fn check(&self, plugin: &str, request: &IpamRequest) -> SriovResult<()>;
}

/// Error object printed by a failing CNI plugin.
#[derive(Debug, Deserialize)]
struct PluginError {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    details: String,
}

/// Delegate that executes the IPAM plugin binary found in `CNI_PATH`.
#[derive(Debug, Clone, Default)]
pub struct ExecIpam;

impl ExecIpam {
    /// Creates a new executing delegate.
    pub fn new() -> Self {
        Self
    }

    /// Finds `plugin` in the colon separated `cni_path`.
    pub fn find_plugin(plugin: &str, cni_path: &str) -> SriovResult<PathBuf> {
        if plugin.is_empty() || plugin.contains('/') {
            return Err(SriovError::config("ipam.type", format!("invalid plugin name '{}'", plugin)));
        }
        cni_path
            .split(':')
            .filter(|dir| !dir.is_empty())
            .map(|dir| Path::new(dir).join(plugin))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| SriovError::Ipam {
                plugin: plugin.to_string(),
                message: format!("plugin not found in CNI_PATH '{}'", cni_path),
            })
    }

    #[instrument(skip(self, request), fields(container = %request.container_id))]
    async fn invoke(&self, command: &str, plugin: &str, request: &IpamRequest) -> SriovResult<Vec<u8>> {
        let binary = Self::find_plugin(plugin, &request.cni_path)?;
        debug!(binary = %binary.display(), "Invoking IPAM delegate");

        let ipam_err = |message: String| SriovError::Ipam {
            plugin: plugin.to_string(),
            message,
        };

        let mut child = Command::new(&binary)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &request.container_id)
            .env("CNI_NETNS", &request.netns)
            .env("CNI_IFNAME", &request.ifname)
            .env("CNI_ARGS", &request.args)
            .env("CNI_PATH", &request.cni_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SriovError::io(format!("failed to spawn {}", binary.display()), e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&request.config)
                .await
                .map_err(|e| SriovError::io("failed to write IPAM stdin", e))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| SriovError::io(format!("failed to wait for {}", binary.display()), e))?;

        if output.status.success() {
            return Ok(output.stdout);
        }

        let message = match serde_json::from_slice::<PluginError>(&output.stdout) {
            Ok(err) if err.details.is_empty() => format!("{} (code {})", err.msg, err.code),
            Ok(err) => format!("{}: {} (code {})", err.msg, err.details, err.code),
            Err(_) => String::from_utf8_lossy(&output.stderr).trim().to_string(),
        };
        Err(ipam_err(message))
    }
}

#[async_trait]
impl IpamDelegate for ExecIpam {
    async fn add(&self, plugin: &str, request: &IpamRequest) -> SriovResult<IpamResult> {
        let stdout = self.invoke("ADD", plugin, request).await?;
        serde_json::from_slice(&stdout).map_err(|e| SriovError::decode("IPAM result", e))
    }

    async fn del(&self, plugin: &str, request: &IpamRequest) -> SriovResult<()> {
        self.invoke("DEL", plugin, request).await.map(|_| ())
    }

    async fn check(&self, plugin: &str, request: &IpamRequest) -> SriovResult<()> {
        self.invoke("CHECK", plugin, request).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn write_plugin(dir: &Path, name: &str, script: &str) {
        let path = dir.join(name);
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn request(cni_path: &Path) -> IpamRequest {
        IpamRequest {
            container_id: "c1".into(),
            netns: "/var/run/netns/c1".into(),
            ifname: "net1".into(),
            cni_path: cni_path.display().to_string(),
            config: br#"{"cniVersion":"1.0.0"}"#.to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn test_find_plugin() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(dir.path(), "host-local", "#!/bin/sh\n");
        let path = format!("/nonexistent:{}", dir.path().display());

        let found = ExecIpam::find_plugin("host-local", &path).unwrap();
        assert_eq!(found, dir.path().join("host-local"));
        assert!(ExecIpam::find_plugin("static", &path).is_err());
        assert!(ExecIpam::find_plugin("../host-local", &path).is_err());
    }

    #[tokio::test]
    async fn test_add_parses_result() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(
            dir.path(),
            "fake-ipam",
            "#!/bin/sh\ncat > /dev/null\necho '{\"cniVersion\":\"1.0.0\",\"ips\":[{\"address\":\"10.1.1.5/24\",\"gateway\":\"10.1.1.1\"}],\"routes\":[{\"dst\":\"0.0.0.0/0\"}]}'\n",
        );

        let result = ExecIpam::new()
            .add("fake-ipam", &request(dir.path()))
            .await
            .unwrap();
        assert_eq!(result.ips.len(), 1);
        assert_eq!(result.ips[0].address, "10.1.1.5/24");
        assert_eq!(result.ips[0].gateway.as_deref(), Some("10.1.1.1"));
        assert_eq!(result.routes[0].dst, "0.0.0.0/0");
    }

    #[tokio::test]
    async fn test_failure_carries_plugin_message() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(
            dir.path(),
            "bad-ipam",
            "#!/bin/sh\ncat > /dev/null\necho '{\"code\":11,\"msg\":\"no addresses left\"}'\nexit 1\n",
        );

        match ExecIpam::new().add("bad-ipam", &request(dir.path())).await {
            Err(SriovError::Ipam { plugin, message }) => {
                assert_eq!(plugin, "bad-ipam");
                assert!(message.contains("no addresses left"));
            }
            other => panic!("Expected Ipam error, got {:?}", other),
        }
    }
}
