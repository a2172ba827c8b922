//! Deterministic identities for link endpoints.
//!
//! MAC: 3-byte prefix + VMID (2 bytes) + interface index (1 byte).
//!   prefix be:24:99, VM 10 eth0  → be:24:99:00:0a:00
//!   prefix be:24:99, VM 300 eth2 → be:24:99:01:2c:02
//!
//! UDP port: leading digit of the port base, then VMID, then interface index.
//!   digit 4, VM 10 eth0  → 4100
//!   digit 4, VM 123 eth7 → 41237

use pvelink_types::{parse_hex_bytes, Endpoint, MacAddr};

use crate::error::{Error, Result};

pub const MAX_VMID: u32 = 999;
pub const MAX_IFACE: u32 = 9;

/// First three bytes of every generated MAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacPrefix(pub [u8; 3]);

impl MacPrefix {
    /// Parse `aa:bb:cc` and force a locally administered unicast address.
    pub fn parse(s: &str) -> Result<Self> {
        let mut bytes = parse_hex_bytes::<3>(&s.trim().to_ascii_lowercase()).ok_or_else(|| {
            Error::Config(format!("mac_prefix must be 3 hex bytes like bc:24:99 (got {s})"))
        })?;
        bytes[0] |= 0x02;
        bytes[0] &= 0xfe;
        Ok(Self(bytes))
    }
}

impl std::fmt::Display for MacPrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02x}:{:02x}:{:02x}", self.0[0], self.0[1], self.0[2])
    }
}

pub fn derive_mac(prefix: MacPrefix, vm: u32, iface: u32) -> MacAddr {
    let [b1, b2, b3] = prefix.0;
    MacAddr([
        b1,
        b2,
        b3,
        ((vm >> 8) & 0xff) as u8,
        (vm & 0xff) as u8,
        (iface & 0xff) as u8,
    ])
}

/// Leading decimal digit of the configured port base (40000 → 4).
pub fn port_digit(port_base: u32) -> u8 {
    let mut n = port_base;
    while n >= 10 {
        n /= 10;
    }
    n as u8
}

pub fn derive_port(digit: u8, vm: u32, iface: u32) -> Result<u16> {
    if vm > MAX_VMID || iface > MAX_IFACE {
        return Err(Error::EndpointOutOfRange { vm, iface });
    }
    // Both bounds checked, so the concatenation is at most 5 digits.
    let port: u64 = format!("{digit}{vm}{iface}")
        .parse()
        .map_err(|_| Error::Config(format!("invalid port digit {digit}")))?;
    match u16::try_from(port) {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(Error::PortOutOfRange {
            port,
            endpoint: Endpoint::new(vm, iface),
        }),
    }
}
