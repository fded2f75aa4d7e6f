//! sriov - SR-IOV CNI plugin
//!
//! Entry point invoked by the container runtime.

use std::io::Read;
use std::process::ExitCode;

use serde_json::Value;
use tracing::debug;

use sriov_cni::cmd::CmdFailure;
use sriov_cni::skel::{self, Reply};
use sriov_cni::{logging, Collaborators, SriovCni};
use sriov_cni_common::{SriovError, SriovResult};

fn read_stdin() -> SriovResult<Vec<u8>> {
    let mut buf = Vec::new();
    std::io::stdin()
        .read_to_end(&mut buf)
        .map_err(|e| SriovError::io("failed to read network configuration from stdin", e))?;
    Ok(buf)
}

/// Log settings from a configuration that may not validate.
fn log_settings(stdin: &[u8]) -> (Option<String>, Option<String>) {
    let Ok(doc) = serde_json::from_slice::<Value>(stdin) else {
        return (None, None);
    };
    let field = |key: &str| doc.get(key).and_then(Value::as_str).map(str::to_string);
    (field("logLevel"), field("logFile"))
}

fn emit(reply: Reply) -> ExitCode {
    if !reply.stdout.is_empty() {
        println!("{}", reply.stdout);
    }
    ExitCode::from(reply.exit_code)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let is_version = std::env::var("CNI_COMMAND").is_ok_and(|c| c == "VERSION");
    let stdin = if is_version {
        Vec::new()
    } else {
        match read_stdin() {
            Ok(stdin) => stdin,
            Err(e) => return emit(skel::error_reply(&[], &CmdFailure::from(e))),
        }
    };

    let (level, file) = log_settings(&stdin);
    if let Err(e) = logging::init_logging(level.as_deref(), file.as_deref()) {
        eprintln!("sriov: {:#}", e);
    }

    let (command, args) = match skel::parse_env(|key| std::env::var(key).ok(), stdin.clone()) {
        Ok(parsed) => parsed,
        Err(e) => return emit(skel::error_reply(&stdin, &CmdFailure::from(e))),
    };
    debug!(command = %command, container = %args.container_id, "Invoked");

    let plugin = SriovCni::new(Collaborators::host());
    emit(skel::dispatch(&plugin, command, &args).await)
}
