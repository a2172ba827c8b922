use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

// --- Link topology ---

/// One (VM, interface index) pair taking part in a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub vm: u32,
    pub iface: u32,
}

impl Endpoint {
    pub fn new(vm: u32, iface: u32) -> Self {
        Self { vm, iface }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VM {} eth{}", self.vm, self.iface)
    }
}

/// A point-to-point UDP tunnel between two endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSpec {
    pub a: Endpoint,
    pub b: Endpoint,
}

impl LinkSpec {
    pub fn new(a: Endpoint, b: Endpoint) -> Self {
        Self { a, b }
    }
}

// --- MAC addresses ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacParseError(pub String);

impl fmt::Display for MacParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid MAC address: {}", self.0)
    }
}

impl std::error::Error for MacParseError {}

/// Parse `n` hex bytes separated by `:` or `-`.
pub fn parse_hex_bytes<const N: usize>(s: &str) -> Option<[u8; N]> {
    let mut out = [0u8; N];
    let mut parts = s.split([':', '-']);
    for byte in out.iter_mut() {
        let part = parts.next()?;
        if part.is_empty() || part.len() > 2 {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}

impl FromStr for MacAddr {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex_bytes::<6>(s.trim())
            .map(MacAddr)
            .ok_or_else(|| MacParseError(s.to_string()))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = MacParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> Self {
        mac.to_string()
    }
}

// --- Tunnel hosts ---

/// Tunnel endpoint host: an IP literal or a DNS name QEMU resolves itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum HostAddr {
    Ip(IpAddr),
    /// Lowercased hostname.
    Name(String),
}

impl HostAddr {
    pub fn is_loopback(&self) -> bool {
        match self {
            HostAddr::Ip(ip) => ip.is_loopback(),
            HostAddr::Name(name) => name == "localhost",
        }
    }

    /// Loopback address of the same family. Names map to IPv4.
    pub fn loopback_for(&self) -> HostAddr {
        match self {
            HostAddr::Ip(IpAddr::V6(_)) => HostAddr::Ip(IpAddr::V6(Ipv6Addr::LOCALHOST)),
            _ => HostAddr::Ip(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        }
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn with_port(&self, port: u16) -> String {
        match self {
            HostAddr::Ip(IpAddr::V6(ip)) => format!("[{ip}]:{port}"),
            _ => format!("{self}:{port}"),
        }
    }
}

impl From<IpAddr> for HostAddr {
    fn from(ip: IpAddr) -> Self {
        HostAddr::Ip(ip)
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostAddr::Ip(ip) => write!(f, "{ip}"),
            HostAddr::Name(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostParseError(pub String);

impl fmt::Display for HostParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid host address: '{}'", self.0)
    }
}

impl std::error::Error for HostParseError {}

impl FromStr for HostAddr {
    type Err = HostParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        if let Ok(ip) = t.parse::<IpAddr>() {
            return Ok(HostAddr::Ip(ip));
        }
        // no ':' or ',' since both would break the netdev option string
        let valid_label = |label: &str| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        };
        let name = t.strip_suffix('.').unwrap_or(t);
        if name.is_empty() || name.len() > 253 || !name.split('.').all(valid_label) {
            return Err(HostParseError(s.to_string()));
        }
        Ok(HostAddr::Name(name.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for HostAddr {
    type Error = HostParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<HostAddr> for String {
    fn from(host: HostAddr) -> Self {
        host.to_string()
    }
}

// --- Bus slot allocation ---

/// How new PCI slots are picked on `pci.0`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStrategy {
    /// First free slot in the usable range.
    LowestFree,
    /// First free slot above the highest one seen on the VM, wrapping to
    /// `LowestFree` when the top of the range is reached.
    #[default]
    NextHighest,
}

impl SlotStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStrategy::LowestFree => "lowest_free",
            SlotStrategy::NextHighest => "next_highest",
        }
    }
}

impl fmt::Display for SlotStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStrategy(pub String);

impl FromStr for SlotStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "lowest_free" => Ok(SlotStrategy::LowestFree),
            "next_highest" => Ok(SlotStrategy::NextHighest),
            _ => Err(UnknownStrategy(s.to_string())),
        }
    }
}

// --- Allocation results ---

/// Fully resolved network device for one endpoint of one link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedInterface {
    pub endpoint: Endpoint,
    pub mac: MacAddr,
    pub device_index: u32,
    /// `None` when slot assignment is left to the hypervisor.
    pub bus_slot: Option<u8>,
    pub local_addr: HostAddr,
    pub local_port: u16,
    pub peer_addr: HostAddr,
    pub peer_port: u16,
    pub reused: bool,
}

impl ResolvedInterface {
    /// QEMU id shared by the `-netdev` and `-device` halves.
    pub fn netdev_id(&self) -> String {
        format!("net{}", self.device_index)
    }
}

/// Output of one allocation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Leading digit of every UDP port.
    pub port_digit: u8,
    /// First device index available to new interfaces per VM, after
    /// skipping indices held by existing devices.
    pub start_indices: BTreeMap<u32, u32>,
    /// Interfaces in resolution order.
    pub interfaces: Vec<ResolvedInterface>,
}

impl Plan {
    /// All local ports, ascending.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.interfaces.iter().map(|i| i.local_port).collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    pub fn reused(&self) -> impl Iterator<Item = &ResolvedInterface> {
        self.interfaces.iter().filter(|i| i.reused)
    }

    /// Interfaces grouped by ascending VM id, resolution order kept per VM.
    pub fn by_vm(&self) -> BTreeMap<u32, Vec<&ResolvedInterface>> {
        let mut grouped: BTreeMap<u32, Vec<&ResolvedInterface>> = BTreeMap::new();
        for iface in &self.interfaces {
            grouped.entry(iface.endpoint.vm).or_default().push(iface);
        }
        grouped
    }
}
