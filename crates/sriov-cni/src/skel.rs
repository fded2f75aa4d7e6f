//! CNI process protocol: environment, stdout replies and exit codes.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde_json::Value;
use tracing::{error, warn};

use sriov_cni_common::{SriovError, SriovResult};

use crate::cmd::{CmdArgs, CmdFailure, SriovCni};
use crate::config::defaults;

/// CNI versions this plugin speaks.
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// The `CNI_COMMAND` verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Add,
    Del,
    Check,
    Version,
}

impl FromStr for Command {
    type Err = SriovError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADD" => Ok(Command::Add),
            "DEL" => Ok(Command::Del),
            "CHECK" => Ok(Command::Check),
            "VERSION" => Ok(Command::Version),
            other => Err(SriovError::InvalidEnvironment {
                variable: "CNI_COMMAND".to_string(),
                message: format!("unknown command '{}'", other),
            }),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Command::Add => "ADD",
            Command::Del => "DEL",
            Command::Check => "CHECK",
            Command::Version => "VERSION",
        })
    }
}

/// Error object printed on stdout when a command fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReply {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub details: String,
}

/// What the process prints and how it exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub stdout: String,
    pub exit_code: u8,
}

/// Reads the command and its arguments through `lookup`.
///
/// `CNI_NETNS` is optional for DEL, the runtime may have torn the namespace
/// down already.
pub fn parse_env(
    lookup: impl Fn(&str) -> Option<String>,
    stdin: Vec<u8>,
) -> SriovResult<(Command, CmdArgs)> {
    let require = |variable: &str| {
        lookup(variable)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| SriovError::InvalidEnvironment {
                variable: variable.to_string(),
                message: "required but not set".to_string(),
            })
    };

    let command: Command = require("CNI_COMMAND")?.parse()?;
    if command == Command::Version {
        return Ok((command, CmdArgs::default()));
    }

    let netns = match command {
        Command::Del => lookup("CNI_NETNS").unwrap_or_default(),
        _ => require("CNI_NETNS")?,
    };

    Ok((
        command,
        CmdArgs {
            container_id: require("CNI_CONTAINERID")?,
            netns,
            ifname: require("CNI_IFNAME")?,
            args: lookup("CNI_ARGS").unwrap_or_default(),
            path: require("CNI_PATH")?,
            stdin,
        },
    ))
}

/// Best effort `cniVersion` of a configuration for error replies.
fn cni_version_of(stdin: &[u8]) -> String {
    serde_json::from_slice::<Value>(stdin)
        .ok()
        .and_then(|doc| doc.get("cniVersion").and_then(Value::as_str).map(str::to_string))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| defaults::CNI_VERSION.to_string())
}

/// Builds the failure reply; no partial result is ever printed.
pub fn error_reply(stdin: &[u8], failure: &CmdFailure) -> Reply {
    let reply = ErrorReply {
        cni_version: cni_version_of(stdin),
        code: failure.code(),
        msg: failure.error.to_string(),
        details: failure.warnings.join("; "),
    };
    Reply {
        stdout: serde_json::to_string(&reply).unwrap_or_else(|_| {
            format!(r#"{{"code":{},"msg":"failed to encode error"}}"#, reply.code)
        }),
        exit_code: 1,
    }
}

fn version_reply() -> Reply {
    let doc = serde_json::json!({
        "cniVersion": defaults::CNI_VERSION,
        "supportedVersions": SUPPORTED_VERSIONS,
    });
    Reply {
        stdout: doc.to_string(),
        exit_code: 0,
    }
}

/// Runs one command and renders the reply.
pub async fn dispatch(plugin: &SriovCni, command: Command, args: &CmdArgs) -> Reply {
    let outcome = match command {
        Command::Version => return version_reply(),
        Command::Add => plugin.cmd_add(args).await.and_then(|result| {
            serde_json::to_string(&result)
                .map_err(|e| SriovError::decode("CNI result", e).into())
        }),
        Command::Del => plugin.cmd_del(args).await.map(|()| String::new()),
        Command::Check => plugin.cmd_check(args).await.map(|()| String::new()),
    };

    match outcome {
        Ok(stdout) => Reply {
            stdout,
            exit_code: 0,
        },
        Err(failure) => {
            if failure.error.is_soft() {
                warn!(command = %command, code = failure.code(), error = %failure.error, "Command left the attachment in place");
            } else {
                error!(command = %command, code = failure.code(), error = %failure.error, "Command failed");
            }
            error_reply(&args.stdin, &failure)
        }
    }
}
