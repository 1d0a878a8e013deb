// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for accelerator operations
//!
//! Nothing in this crate retries. Timeouts, resets and re-initialisation are
//! the caller's decision; [`XgemmError::class`] tells it which kind of
//! failure it is looking at.

use std::path::PathBuf;
use thiserror::Error;
use xgemm_chip::layout::WindowId;

/// Result type alias for accelerator operations
pub type Result<T> = std::result::Result<T, XgemmError>;

/// Coarse grouping of [`XgemmError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Device or OS resource absent. Fatal.
    Init,
    /// Data did not land where it was sent.
    Transfer,
    /// Caller broke the handshake protocol, or the device stopped answering.
    Protocol,
    /// Configuration rejected before touching hardware.
    Config,
}

/// Errors that can occur during accelerator operations
#[derive(Debug, Error)]
pub enum XgemmError {
    /// Backing memory file could not be opened
    #[error("Cannot open {path}: {source}")]
    ResourceUnavailable {
        /// Memory file path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A physical window could not be mapped
    #[error("Failed to map {window} window at {phys_base:#x} ({size:#x} bytes): {reason}")]
    MapFailed {
        /// Window being mapped
        window: WindowId,
        /// Physical base address
        phys_base: u64,
        /// Window size in bytes
        size: usize,
        /// Reason for failure
        reason: String,
    },

    /// Sentinel word did not match
    #[error("Accelerator not present: expected {expected:#010x}, read {found:#010x}")]
    DeviceNotPresent {
        /// Expected sentinel
        expected: u32,
        /// Value read from the device
        found: u32,
    },

    /// Write-back verification read disagreed with the written value
    #[error("Verify mismatch in {window} at element {offset}: wrote {expected:#x}, read {found:#x}")]
    VerifyMismatch {
        /// Window written
        window: WindowId,
        /// Element offset within the window
        offset: usize,
        /// Value written (raw bits)
        expected: u64,
        /// Value read back (raw bits)
        found: u64,
    },

    /// Operand does not fit in the windows reserved for it
    #[error("Operand needs {requested} elements, only {available} available")]
    CapacityExceeded {
        /// Elements requested
        requested: usize,
        /// Elements available from the requested start
        available: usize,
    },

    /// Operand slice or dimensions inconsistent
    #[error("Invalid dimensions: {reason}")]
    InvalidDimensions {
        /// Description of the inconsistency
        reason: String,
    },

    /// Handshake protocol violated by the caller
    #[error("Protocol misuse: {reason}")]
    ProtocolMisuse {
        /// What was attempted
        reason: String,
    },

    /// Device never reported the awaited state
    #[error("Operation timeout after {waited_ms}ms ({spins} polls)")]
    Timeout {
        /// Wall-clock time spent polling
        waited_ms: u64,
        /// Status reads performed
        spins: u64,
    },

    /// Configuration rejected
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Reason for rejection
        reason: String,
    },
}

impl XgemmError {
    /// Create a resource unavailable error
    pub fn resource_unavailable(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ResourceUnavailable {
            path: path.into(),
            source,
        }
    }

    /// Create a map failed error
    pub fn map_failed(window: WindowId, phys_base: u64, size: usize, reason: impl Into<String>) -> Self {
        Self::MapFailed {
            window,
            phys_base,
            size,
            reason: reason.into(),
        }
    }

    /// Create an invalid dimensions error
    pub fn invalid_dimensions(reason: impl Into<String>) -> Self {
        Self::InvalidDimensions {
            reason: reason.into(),
        }
    }

    /// Create a protocol misuse error
    pub fn protocol_misuse(reason: impl Into<String>) -> Self {
        Self::ProtocolMisuse {
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Which part of the failure taxonomy this error belongs to
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::ResourceUnavailable { .. } | Self::MapFailed { .. } | Self::DeviceNotPresent { .. } => {
                ErrorClass::Init
            }
            Self::VerifyMismatch { .. } | Self::CapacityExceeded { .. } => ErrorClass::Transfer,
            Self::InvalidDimensions { .. } | Self::ProtocolMisuse { .. } | Self::Timeout { .. } => {
                ErrorClass::Protocol
            }
            Self::InvalidConfig { .. } => ErrorClass::Config,
        }
    }

    /// Whether this is a [`XgemmError::ProtocolMisuse`]
    pub const fn is_protocol_misuse(&self) -> bool {
        matches!(self, Self::ProtocolMisuse { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_follow_taxonomy() {
        let io = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_eq!(XgemmError::resource_unavailable("/dev/mem", io).class(), ErrorClass::Init);
        assert_eq!(
            XgemmError::DeviceNotPresent { expected: 1, found: 2 }.class(),
            ErrorClass::Init
        );
        assert_eq!(
            XgemmError::CapacityExceeded { requested: 2, available: 1 }.class(),
            ErrorClass::Transfer
        );
        assert!(XgemmError::protocol_misuse("start while busy").is_protocol_misuse());
        assert_eq!(XgemmError::Timeout { waited_ms: 1, spins: 9 }.class(), ErrorClass::Protocol);
        assert_eq!(XgemmError::invalid_config("empty").class(), ErrorClass::Config);
    }

    #[test]
    fn messages_name_the_window() {
        let err = XgemmError::map_failed(WindowId::B1, 0xb006_0000, 0x2_0000, "EPERM");
        assert_eq!(
            err.to_string(),
            "Failed to map b1 window at 0xb0060000 (0x20000 bytes): EPERM"
        );
    }
}
