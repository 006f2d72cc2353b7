//! Plugin errors and their CNI error codes.

use crate::wiring::WiringError;
use podnet_ebpf::TableError;
use podnet_ipam::{IpamError, StoreError};
use thiserror::Error;

// Well-known CNI error codes
pub const CODE_INCOMPATIBLE_VERSION: u32 = 1;
pub const CODE_INVALID_ENV: u32 = 4;
pub const CODE_DECODE: u32 = 6;
pub const CODE_INVALID_CONFIG: u32 = 7;
pub const CODE_TRY_AGAIN_LATER: u32 = 11;

// Plugin-specific codes (100 and up)
pub const CODE_IPAM: u32 = 100;
pub const CODE_TABLES: u32 = 101;
pub const CODE_WIRING: u32 = 102;
pub const CODE_CHECK: u32 = 103;
pub const CODE_INTERNAL: u32 = 199;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("failed to decode network configuration: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("invalid network configuration: {0}")]
    Config(String),

    #[error("invalid CNI arguments: {0}")]
    Args(String),

    #[error("unsupported CNI version {0}")]
    IncompatibleVersion(String),

    #[error("address management failed: {0}")]
    Ipam(#[from] IpamError),

    #[error("forwarding table update failed: {0}")]
    Tables(#[from] TableError),

    #[error("interface wiring failed: {0}")]
    Wiring(#[from] WiringError),

    #[error("check failed: {0}")]
    Check(String),

    #[error("{0}")]
    Internal(String),
}

impl From<StoreError> for PluginError {
    fn from(e: StoreError) -> Self {
        PluginError::Ipam(IpamError::Store(e))
    }
}

impl PluginError {
    /// CNI error code for this failure.
    pub fn code(&self) -> u32 {
        match self {
            PluginError::Decode(_) => CODE_DECODE,
            PluginError::Config(_) => CODE_INVALID_CONFIG,
            PluginError::Args(_) => CODE_INVALID_ENV,
            PluginError::IncompatibleVersion(_) => CODE_INCOMPATIBLE_VERSION,
            PluginError::Ipam(e) if e.is_store_unavailable() => CODE_TRY_AGAIN_LATER,
            PluginError::Ipam(IpamError::Corrupt { .. }) => CODE_DECODE,
            PluginError::Ipam(_) => CODE_IPAM,
            PluginError::Tables(_) => CODE_TABLES,
            PluginError::Wiring(_) => CODE_WIRING,
            PluginError::Check(_) => CODE_CHECK,
            PluginError::Internal(_) => CODE_INTERNAL,
        }
    }

    /// Short message for the `msg` field of the error reply.
    pub fn msg(&self) -> &'static str {
        match self.code() {
            CODE_INCOMPATIBLE_VERSION => "incompatible CNI version",
            CODE_INVALID_ENV => "invalid environment variables",
            CODE_DECODE => "failed to decode content",
            CODE_INVALID_CONFIG => "invalid network config",
            CODE_TRY_AGAIN_LATER => "try again later",
            CODE_IPAM => "address allocation failed",
            CODE_TABLES => "forwarding table update failed",
            CODE_WIRING => "interface setup failed",
            CODE_CHECK => "container network check failed",
            _ => "internal error",
        }
    }
}

pub type Result<T> = std::result::Result<T, PluginError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        let unavailable = PluginError::from(StoreError::Unavailable("down".to_string()));
        assert_eq!(unavailable.code(), 11);
        assert_eq!(unavailable.msg(), "try again later");

        let exhausted =
            PluginError::Ipam(IpamError::AllocationExhausted("10.244.0.0/24".parse().unwrap()));
        assert_eq!(exhausted.code(), CODE_IPAM);

        assert_eq!(PluginError::Config("x".to_string()).code(), 7);
        assert_eq!(PluginError::Args("x".to_string()).code(), 4);
        let decode = serde_json::from_str::<u32>("x").unwrap_err();
        assert_eq!(PluginError::Decode(decode).code(), 6);
        assert!(PluginError::Check("x".to_string()).code() >= 100);
    }
}
