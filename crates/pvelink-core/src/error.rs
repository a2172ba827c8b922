//! Error types for pvelink-core

use pvelink_types::Endpoint;
use thiserror::Error;

/// Result type alias using the pvelink-core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure that aborts a planning run.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed mapping file: bad MAC prefix, bad link entry, no links
    #[error("configuration error: {0}")]
    Config(String),

    /// VM id or interface index cannot be encoded into a port
    #[error("VMID {vm} must be <= 999 and eth index {iface} must be <= 9")]
    EndpointOutOfRange { vm: u32, iface: u32 },

    /// Encoded port is 0 or does not fit in 16 bits
    #[error("port {port} for {endpoint} out of range (1-65535)")]
    PortOutOfRange { port: u64, endpoint: Endpoint },

    #[error("duplicate endpoint {0}: an interface may take part in only one link")]
    DuplicateEndpoint(Endpoint),

    #[error("port collision {port} between {endpoint} and {owner}")]
    PortCollision {
        port: u16,
        endpoint: Endpoint,
        owner: Endpoint,
    },

    #[error(
        "no free PCI slot on VM {vm}: free a slot or set `delegate_pci_addr: true` \
         to let the hypervisor assign addresses"
    )]
    SlotExhausted { vm: u32 },

    #[error("unknown PCI allocation strategy '{0}' (expected lowest_free or next_highest)")]
    InvalidStrategy(String),
}

impl Error {
    /// True for errors caused by identifiers outside the encodable range.
    pub fn is_range(&self) -> bool {
        matches!(
            self,
            Error::EndpointOutOfRange { .. } | Error::PortOutOfRange { .. }
        )
    }
}
