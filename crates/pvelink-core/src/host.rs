//! Host introspection: what a VM already has before new links are planned.
//!
//! Two sources per VM, both optional:
//!   `<conf_dir>/<vmid>.conf`  persisted config, scanned for `netN:` lines
//!   `qm showcmd <vmid>`       effective QEMU command line
//!
//! Nothing here fails. A missing file, a failing `qm` or text we cannot make
//! sense of all read as "no prior state", since a brand-new VM has none.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::process::Command;

use pvelink_types::MacAddr;
use tracing::{debug, warn};

/// Lowest and highest `pci.0` slot handed to generated devices.
pub const SLOT_MIN: u8 = 0x10;
pub const SLOT_MAX: u8 = 0x1f;

/// `pci.1` and `pci.2` bridges sit here on every Proxmox VM.
pub const RESERVED_SLOTS: [u8; 2] = [0x1e, 0x1f];

pub const DEFAULT_CONF_DIR: &str = "/etc/pve/qemu-server";
pub const DEFAULT_QM_BIN: &str = "qm";

/// Network device already attached to a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExistingInterface {
    pub device_index: u32,
    pub bus_slot: u8,
}

/// Read-only snapshot of one VM, taken before allocation starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmState {
    /// Highest `netN:` in the persisted config plus one.
    pub next_free_device_index: u32,
    /// Occupied `pci.0` slots, reserved ones included.
    pub used_bus_slots: BTreeSet<u8>,
    /// Highest occupied non-reserved slot in the usable range.
    pub highest_used_bus_slot: Option<u8>,
    pub existing_by_mac: BTreeMap<MacAddr, ExistingInterface>,
}

impl Default for VmState {
    fn default() -> Self {
        Self {
            next_free_device_index: 0,
            used_bus_slots: RESERVED_SLOTS.into_iter().collect(),
            highest_used_bus_slot: None,
            existing_by_mac: BTreeMap::new(),
        }
    }
}

impl VmState {
    /// Build a snapshot from the raw config text and command dump.
    pub fn from_sources(config: Option<&str>, launch_command: Option<&str>) -> Self {
        let mut state = Self::default();

        if let Some(index) = config.and_then(highest_net_index) {
            state.next_free_device_index = index + 1;
        }

        if let Some(dump) = launch_command {
            let args = split_args(dump);
            state.used_bus_slots.extend(used_bus_slots(&args));
            state.existing_by_mac = existing_interfaces(&args);
        }

        state.highest_used_bus_slot = state
            .used_bus_slots
            .iter()
            .copied()
            .filter(|s| (SLOT_MIN..=SLOT_MAX).contains(s) && !RESERVED_SLOTS.contains(s))
            .max();
        state
    }
}

/// Source of per-VM host state.
pub trait HostProbe {
    /// Persisted config text, `None` when the VM has none.
    fn vm_config(&self, vm: u32) -> Option<String>;

    /// Effective launch command, `None` when the query fails.
    fn launch_command(&self, vm: u32) -> Option<String>;

    fn vm_state(&self, vm: u32) -> VmState {
        let config = self.vm_config(vm);
        let dump = self.launch_command(vm);
        let state = VmState::from_sources(config.as_deref(), dump.as_deref());
        debug!(
            vm,
            next_index = state.next_free_device_index,
            used_slots = state.used_bus_slots.len(),
            existing = state.existing_by_mac.len(),
            "read host state"
        );
        state
    }
}

/// Reads a local Proxmox VE node.
#[derive(Debug, Clone)]
pub struct PveHost {
    conf_dir: PathBuf,
    qm_bin: String,
}

impl Default for PveHost {
    fn default() -> Self {
        Self::new(DEFAULT_CONF_DIR, DEFAULT_QM_BIN)
    }
}

impl PveHost {
    pub fn new(conf_dir: impl Into<PathBuf>, qm_bin: impl Into<String>) -> Self {
        Self {
            conf_dir: conf_dir.into(),
            qm_bin: qm_bin.into(),
        }
    }

    pub fn config_path(&self, vm: u32) -> PathBuf {
        self.conf_dir.join(format!("{vm}.conf"))
    }
}

impl HostProbe for PveHost {
    fn vm_config(&self, vm: u32) -> Option<String> {
        let path = self.config_path(vm);
        if !path.exists() {
            debug!(vm, path = %path.display(), "no VM config, treating as new");
            return None;
        }
        match std::fs::read_to_string(&path) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(vm, path = %path.display(), "cannot read VM config: {e}");
                None
            }
        }
    }

    fn launch_command(&self, vm: u32) -> Option<String> {
        let output = match Command::new(&self.qm_bin)
            .args(["showcmd", &vm.to_string()])
            .output()
        {
            Ok(o) => o,
            Err(e) => {
                warn!(vm, qm = %self.qm_bin, "failed to run showcmd: {e}");
                return None;
            }
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(vm, status = ?output.status.code(), "showcmd failed: {}", stderr.trim());
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Probe that reports every VM as brand new.
#[derive(Debug, Clone, Copy, Default)]
pub struct FreshHost;

impl HostProbe for FreshHost {
    fn vm_config(&self, _vm: u32) -> Option<String> {
        None
    }

    fn launch_command(&self, _vm: u32) -> Option<String> {
        None
    }
}

/// Highest `N` over lines starting with `netN:`.
pub fn highest_net_index(config: &str) -> Option<u32> {
    config
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("net")?;
            let (digits, _) = rest.split_once(':')?;
            if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            digits.parse::<u32>().ok()
        })
        .max()
}

/// Split a command dump into arguments, honouring single and double quotes.
/// Line continuations from `showcmd --pretty` are dropped.
pub fn split_args(dump: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut quote: Option<char> = None;

    for c in dump.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                in_arg = true;
            }
            None if c.is_whitespace() => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            None => {
                current.push(c);
                in_arg = true;
            }
        }
    }
    if in_arg {
        args.push(current);
    }

    args.retain(|a| a != "\\");
    args
}

/// Leading hex digits of `s` as a slot number (`12` from `12.0x1`).
fn parse_slot(s: &str) -> Option<u8> {
    let end = s.find(|c: char| !c.is_ascii_hexdigit()).unwrap_or(s.len());
    u8::from_str_radix(&s[..end], 16).ok()
}

/// Every `,addr=0x..` on any argument. Over-reports on purpose: a slot held
/// by a device on another bus only costs us one candidate.
pub fn used_bus_slots(args: &[String]) -> BTreeSet<u8> {
    args.iter()
        .flat_map(|arg| {
            arg.match_indices(",addr=0x")
                .filter_map(|(pos, m)| parse_slot(&arg[pos + m.len()..]))
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Network devices carrying all of `mac=`, `netdev=netN` and `addr=0x..`.
pub fn existing_interfaces(args: &[String]) -> BTreeMap<MacAddr, ExistingInterface> {
    let mut found = BTreeMap::new();
    for arg in args {
        let mut mac = None;
        let mut device_index = None;
        let mut bus_slot = None;
        for opt in arg.split(',') {
            if let Some(v) = opt.strip_prefix("mac=") {
                mac = v.parse::<MacAddr>().ok();
            } else if let Some(v) = opt.strip_prefix("netdev=net") {
                device_index = v.parse::<u32>().ok();
            } else if let Some(v) = opt.strip_prefix("addr=0x") {
                bus_slot = parse_slot(v);
            }
        }
        if let (Some(mac), Some(device_index), Some(bus_slot)) = (mac, device_index, bus_slot) {
            found.insert(
                mac,
                ExistingInterface {
                    device_index,
                    bus_slot,
                },
            );
        }
    }
    found
}
