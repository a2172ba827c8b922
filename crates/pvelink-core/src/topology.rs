//! Mapping file: link list plus the defaults every generated device shares.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use pvelink_types::{Endpoint, HostAddr, LinkSpec, SlotStrategy};
use serde::Deserialize;

use crate::derive::{port_digit, MacPrefix};
use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct RawMapping {
    #[serde(default)]
    defaults: RawDefaults,
    #[serde(default)]
    links: Vec<Vec<Token>>,
}

#[derive(Debug, Deserialize)]
struct RawDefaults {
    #[serde(default = "default_model")]
    model: String,
    #[serde(default = "default_host_mtu")]
    host_mtu: u32,
    #[serde(default = "default_rx_queue_size")]
    rx_queue_size: u32,
    #[serde(default = "default_tx_queue_size")]
    tx_queue_size: u32,
    #[serde(default = "default_mac_prefix")]
    mac_prefix: String,
    #[serde(default = "default_udp_port_base")]
    udp_port_base: u32,
    #[serde(default)]
    udp_ip_by_vm: BTreeMap<Token, String>,
    #[serde(default = "default_udp_ip")]
    udp_default_ip: String,
    #[serde(default = "default_true")]
    loopback_if_same_host: bool,
    #[serde(default)]
    delegate_pci_addr: bool,
    #[serde(default)]
    pci_strategy: Option<String>,
}

impl Default for RawDefaults {
    fn default() -> Self {
        Self {
            model: default_model(),
            host_mtu: default_host_mtu(),
            rx_queue_size: default_rx_queue_size(),
            tx_queue_size: default_tx_queue_size(),
            mac_prefix: default_mac_prefix(),
            udp_port_base: default_udp_port_base(),
            udp_ip_by_vm: BTreeMap::new(),
            udp_default_ip: default_udp_ip(),
            loopback_if_same_host: true,
            delegate_pci_addr: false,
            pci_strategy: None,
        }
    }
}

fn default_model() -> String {
    "virtio-net-pci".to_string()
}

fn default_host_mtu() -> u32 {
    9300
}

fn default_rx_queue_size() -> u32 {
    1024
}

fn default_tx_queue_size() -> u32 {
    256
}

fn default_mac_prefix() -> String {
    "bc:24:99".to_string()
}

fn default_udp_port_base() -> u32 {
    40000
}

fn default_udp_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_true() -> bool {
    true
}

/// A link field or `udp_ip_by_vm` key: either a bare number or text such as
/// `eth2` or `"10"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(untagged)]
enum Token {
    Int(u64),
    Text(String),
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Int(n) => write!(f, "{n}"),
            Token::Text(s) => f.write_str(s),
        }
    }
}

/// Validated mapping file.
#[derive(Debug, Clone)]
pub struct Topology {
    pub model: String,
    /// `None` when `host_mtu` is 0.
    pub host_mtu: Option<u32>,
    pub rx_queue_size: u32,
    pub tx_queue_size: u32,
    pub mac_prefix: MacPrefix,
    pub port_digit: u8,
    pub addr_by_vm: BTreeMap<u32, HostAddr>,
    pub default_addr: HostAddr,
    pub loopback_if_same_host: bool,
    /// Leave `addr=` off the device so QEMU picks the PCI slot.
    pub delegate_pci_addr: bool,
    pub strategy: SlotStrategy,
    pub links: Vec<LinkSpec>,
}

impl Topology {
    /// Load a mapping file. `.json` files are parsed as JSON, anything else
    /// as YAML.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let mapping: RawMapping = if is_json {
            serde_json::from_str(&raw).map_err(|e| {
                Error::Config(format!("invalid JSON mapping {}: {}", path.display(), e))
            })?
        } else {
            serde_yaml::from_str(&raw).map_err(|e| {
                Error::Config(format!("invalid YAML mapping {}: {}", path.display(), e))
            })?
        };

        Self::from_raw(mapping)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let mapping: RawMapping = serde_yaml::from_str(text)
            .map_err(|e| Error::Config(format!("invalid YAML mapping: {e}")))?;
        Self::from_raw(mapping)
    }

    fn from_raw(raw: RawMapping) -> Result<Self> {
        let defs = raw.defaults;

        if raw.links.is_empty() {
            return Err(Error::Config("no 'links' provided".into()));
        }
        let links = raw
            .links
            .iter()
            .map(|item| parse_link(item))
            .collect::<Result<Vec<_>>>()?;

        let strategy = match defs.pci_strategy.as_deref() {
            None => SlotStrategy::default(),
            Some(s) => s.parse().map_err(|_| Error::InvalidStrategy(s.to_string()))?,
        };

        let addr_by_vm = defs
            .udp_ip_by_vm
            .iter()
            .map(|(key, host)| {
                let vm = parse_vmid(key)?;
                Ok((vm, parse_addr(host, &format!("udp_ip_by_vm.{vm}"))?))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;

        if defs.model.trim().is_empty() {
            return Err(Error::Config("model cannot be empty".into()));
        }

        Ok(Self {
            model: defs.model,
            host_mtu: (defs.host_mtu > 0).then_some(defs.host_mtu),
            rx_queue_size: defs.rx_queue_size,
            tx_queue_size: defs.tx_queue_size,
            mac_prefix: MacPrefix::parse(&defs.mac_prefix)?,
            port_digit: port_digit(defs.udp_port_base),
            addr_by_vm,
            default_addr: parse_addr(&defs.udp_default_ip, "udp_default_ip")?,
            loopback_if_same_host: defs.loopback_if_same_host,
            delegate_pci_addr: defs.delegate_pci_addr,
            strategy,
            links,
        })
    }

    /// Every VM that takes part in at least one link, ascending.
    pub fn vm_ids(&self) -> BTreeSet<u32> {
        self.links.iter().flat_map(|l| [l.a.vm, l.b.vm]).collect()
    }

    /// Tunnel address of a VM's host, falling back to the default.
    pub fn addr_for(&self, vm: u32) -> &HostAddr {
        self.addr_by_vm.get(&vm).unwrap_or(&self.default_addr)
    }
}

fn parse_addr(s: &str, field: &str) -> Result<HostAddr> {
    s.parse()
        .map_err(|_| Error::Config(format!("{field}: invalid IP address or hostname '{s}'")))
}

fn parse_link(item: &[Token]) -> Result<LinkSpec> {
    let bad = || {
        let shown: Vec<String> = item.iter().map(|t| t.to_string()).collect();
        Error::Config(format!(
            "each link must be [vmA, ethA|A, vmB, ethB|B], got: [{}]",
            shown.join(", ")
        ))
    };
    let [vm_a, if_a, vm_b, if_b] = item else {
        return Err(bad());
    };
    Ok(LinkSpec::new(
        Endpoint::new(parse_vmid(vm_a)?, parse_iface(if_a)?),
        Endpoint::new(parse_vmid(vm_b)?, parse_iface(if_b)?),
    ))
}

fn parse_vmid(token: &Token) -> Result<u32> {
    let parsed = match token {
        Token::Int(n) => u32::try_from(*n).ok(),
        Token::Text(s) => s.trim().parse().ok(),
    };
    parsed.ok_or_else(|| Error::Config(format!("invalid VMID: {token}")))
}

/// `ethN`, `ETHN` or `N`.
pub fn parse_iface_token(token: &str) -> Option<u32> {
    let t = token.trim();
    let digits = match t.get(..3) {
        Some(p) if p.eq_ignore_ascii_case("eth") => &t[3..],
        _ => t,
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn parse_iface(token: &Token) -> Result<u32> {
    let parsed = match token {
        Token::Int(n) => u32::try_from(*n).ok(),
        Token::Text(s) => parse_iface_token(s),
    };
    parsed.ok_or_else(|| Error::Config(format!("invalid eth index: {token}")))
}
