//! Error types for SR-IOV CNI operations.
//!
//! Every component reports a typed [`SriovError`]; only the command
//! orchestrator decides whether a failure is rolled back, tolerated or
//! propagated. Each variant maps to a stable CNI error code via
//! [`SriovError::cni_code`].

use std::io;
use thiserror::Error;

/// Result type alias for SR-IOV CNI operations.
pub type SriovResult<T> = Result<T, SriovError>;

/// Well-known CNI error codes.
pub mod codes {
    /// Invalid necessary environment variables.
    pub const INVALID_ENVIRONMENT: u32 = 4;
    /// I/O failure.
    pub const IO_FAILURE: u32 = 5;
    /// Failed to decode content.
    pub const DECODE_FAILURE: u32 = 6;
    /// Invalid network config.
    pub const INVALID_NETWORK_CONFIG: u32 = 7;

    // Plugin specific codes start at 100.
    pub const DEVICE_NOT_FOUND: u32 = 100;
    pub const DRIVER_MISMATCH: u32 = 101;
    pub const ALREADY_ALLOCATED: u32 = 102;
    pub const DEVICE_STATE: u32 = 103;
    pub const CARRIER_TIMEOUT: u32 = 104;
    pub const NAMESPACE: u32 = 105;
    pub const IPAM: u32 = 106;
    pub const CHECK_MISMATCH: u32 = 107;
}

/// Errors that can occur while binding a VF to a container.
#[derive(Debug, Error)]
pub enum SriovError {
    /// Malformed or contradictory input configuration.
    #[error("Invalid configuration for {field}: {message}")]
    Config {
        /// The offending configuration field.
        field: String,
        /// Error message.
        message: String,
    },

    /// A required CNI environment variable is missing or malformed.
    #[error("Invalid environment variable {variable}: {message}")]
    InvalidEnvironment {
        /// The variable name (e.g. `CNI_NETNS`).
        variable: String,
        /// Error message.
        message: String,
    },

    /// A JSON document could not be decoded.
    #[error("Failed to decode {what}: {source}")]
    Decode {
        /// What was being decoded.
        what: String,
        /// The underlying decode error.
        #[source]
        source: serde_json::Error,
    },

    /// PCI device or network interface not found.
    #[error("Device '{device}' not found: {message}")]
    DeviceNotFound {
        /// PCI address or interface name.
        device: String,
        /// Error message.
        message: String,
    },

    /// The device is not an SR-IOV virtual function.
    #[error("Device '{device}' is not an SR-IOV VF: {message}")]
    DriverMismatch {
        /// PCI address.
        device: String,
        /// Error message.
        message: String,
    },

    /// The PCI address is claimed by a live namespace other than the requested one.
    #[error("PCI address {pci} is already allocated to {owner}")]
    AlreadyAllocated {
        /// PCI address.
        pci: String,
        /// Namespace path recorded as owner.
        owner: String,
    },

    /// A VF or netdev attribute query/set failed.
    #[error("Failed to set {attribute} on {device}: {message}")]
    DeviceState {
        /// Attribute name (e.g. "vlan", "max_tx_rate").
        attribute: String,
        /// VF or interface description.
        device: String,
        /// Underlying device error.
        message: String,
    },

    /// The link did not report carrier before the deadline.
    #[error("Timed out after {timeout_ms}ms waiting for carrier on {ifname}")]
    CarrierTimeout {
        /// Interface name inside the target namespace.
        ifname: String,
        /// The deadline that elapsed.
        timeout_ms: u64,
    },

    /// Filesystem or allocation store IO failure.
    #[error("{context}: {source}")]
    Io {
        /// What was being done.
        context: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Entering, probing or leaving a network namespace failed.
    #[error("Network namespace {path}: {message}")]
    Namespace {
        /// Namespace path.
        path: String,
        /// Error message.
        message: String,
    },

    /// The IPAM delegate failed.
    #[error("IPAM plugin '{plugin}' failed: {message}")]
    Ipam {
        /// Delegate plugin type.
        plugin: String,
        /// Error message.
        message: String,
    },

    /// CHECK found the device diverging from its configuration.
    #[error("Device {device} does not match its configuration: {}", .mismatches.join("; "))]
    CheckMismatch {
        /// PCI address.
        device: String,
        /// One entry per differing field.
        mismatches: Vec<String>,
    },

    /// Failed to execute a shell command (spawn error).
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Shell command returned non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },
}

impl SriovError {
    /// Creates a configuration error.
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a device not found error.
    pub fn device_not_found(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DeviceNotFound {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Creates a device state error.
    pub fn device_state(
        attribute: impl Into<String>,
        device: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::DeviceState {
            attribute: attribute.into(),
            device: device.into(),
            message: message.into(),
        }
    }

    /// Creates an IO error with context.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Creates a namespace error.
    pub fn namespace(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Namespace {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a decode error.
    pub fn decode(what: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Decode {
            what: what.into(),
            source,
        }
    }

    /// Returns the CNI error code reported to the runtime.
    pub fn cni_code(&self) -> u32 {
        match self {
            SriovError::Config { .. } => codes::INVALID_NETWORK_CONFIG,
            SriovError::InvalidEnvironment { .. } => codes::INVALID_ENVIRONMENT,
            SriovError::Decode { .. } => codes::DECODE_FAILURE,
            SriovError::DeviceNotFound { .. } => codes::DEVICE_NOT_FOUND,
            SriovError::DriverMismatch { .. } => codes::DRIVER_MISMATCH,
            SriovError::AlreadyAllocated { .. } => codes::ALREADY_ALLOCATED,
            SriovError::DeviceState { .. } | SriovError::ShellCommandFailed { .. } => {
                codes::DEVICE_STATE
            }
            SriovError::CarrierTimeout { .. } => codes::CARRIER_TIMEOUT,
            SriovError::Io { .. } | SriovError::ShellExec { .. } => codes::IO_FAILURE,
            SriovError::Namespace { .. } => codes::NAMESPACE,
            SriovError::Ipam { .. } => codes::IPAM,
            SriovError::CheckMismatch { .. } => codes::CHECK_MISMATCH,
        }
    }

    /// Returns true if the device or interface was not found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SriovError::DeviceNotFound { .. })
    }

    /// Returns true if this failure leaves the attachment in place
    /// instead of triggering rollback.
    pub fn is_soft(&self) -> bool {
        matches!(self, SriovError::CarrierTimeout { .. })
    }
}
