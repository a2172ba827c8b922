//! Resource allocation: turns the link list into fully resolved interfaces.
//!
//! Per endpoint: MAC and UDP port are derived, then the device index and
//! `pci.0` slot are either reused from a device already carrying that MAC or
//! freshly allocated without colliding with anything on the VM.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use pvelink_types::{Endpoint, HostAddr, LinkSpec, MacAddr, Plan, ResolvedInterface, SlotStrategy};
use tracing::{debug, info};

use crate::derive::{derive_mac, derive_port};
use crate::error::{Error, Result};
use crate::host::{VmState, RESERVED_SLOTS, SLOT_MAX, SLOT_MIN};
use crate::topology::Topology;

/// Global UDP port ownership for one run.
#[derive(Debug, Default)]
pub struct PortTable {
    owners: BTreeMap<u16, Endpoint>,
}

impl PortTable {
    /// Claim `port` for `endpoint`. Claiming a port twice for the same
    /// endpoint is a no-op.
    pub fn register(&mut self, port: u16, endpoint: Endpoint) -> Result<()> {
        if let Some(&owner) = self.owners.get(&port) {
            if owner != endpoint {
                return Err(Error::PortCollision {
                    port,
                    endpoint,
                    owner,
                });
            }
        }
        self.owners.insert(port, endpoint);
        Ok(())
    }

    pub fn owner(&self, port: u16) -> Option<Endpoint> {
        self.owners.get(&port).copied()
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

fn usable(slot: u8) -> bool {
    (SLOT_MIN..=SLOT_MAX).contains(&slot) && !RESERVED_SLOTS.contains(&slot)
}

/// First free slot in the usable range.
pub fn lowest_free(used: &BTreeSet<u8>) -> Option<u8> {
    (SLOT_MIN..=SLOT_MAX).find(|s| usable(*s) && !used.contains(s))
}

/// First free slot above `highest`, without wrapping.
pub fn next_highest(used: &BTreeSet<u8>, highest: Option<u8>) -> Option<u8> {
    let start = highest
        .map(|h| h.saturating_add(1))
        .unwrap_or(SLOT_MIN)
        .max(SLOT_MIN);
    (start..=SLOT_MAX).find(|s| usable(*s) && !used.contains(s))
}

/// Mutable counters for one run, seeded from the host snapshots.
#[derive(Debug, Default)]
pub struct AllocationState {
    next_device_index: BTreeMap<u32, u32>,
    first_new_index: BTreeMap<u32, u32>,
    taken_indices: BTreeMap<u32, BTreeSet<u32>>,
    used_bus_slots: BTreeMap<u32, BTreeSet<u8>>,
    highest_bus_slot: BTreeMap<u32, u8>,
    ports: PortTable,
    seen: HashSet<Endpoint>,
}

impl AllocationState {
    pub fn seed(&mut self, vm: u32, host: &VmState) {
        self.next_device_index
            .insert(vm, host.next_free_device_index);
        self.taken_indices.insert(
            vm,
            host.existing_by_mac
                .values()
                .map(|e| e.device_index)
                .collect(),
        );
        self.used_bus_slots.insert(vm, host.used_bus_slots.clone());
        if let Some(h) = host.highest_used_bus_slot {
            self.highest_bus_slot.insert(vm, h);
        }
    }

    /// Record an endpoint, failing if it was already part of a link.
    pub fn mark_seen(&mut self, endpoint: Endpoint) -> Result<()> {
        if !self.seen.insert(endpoint) {
            return Err(Error::DuplicateEndpoint(endpoint));
        }
        Ok(())
    }

    pub fn claim_port(&mut self, endpoint: Endpoint, digit: u8) -> Result<u16> {
        let port = derive_port(digit, endpoint.vm, endpoint.iface)?;
        self.ports.register(port, endpoint)?;
        Ok(port)
    }

    /// Next device index on `vm`, skipping indices held by existing devices.
    pub fn next_device_index(&mut self, vm: u32) -> u32 {
        let taken = self.taken_indices.entry(vm).or_default();
        let next = self.next_device_index.entry(vm).or_insert(0);
        while taken.contains(next) {
            *next += 1;
        }
        let index = *next;
        *next += 1;
        taken.insert(index);
        self.first_new_index.entry(vm).or_insert(index);
        index
    }

    /// First index handed out on `vm` this run, or the one that would be.
    pub fn first_device_index(&self, vm: u32) -> u32 {
        if let Some(&first) = self.first_new_index.get(&vm) {
            return first;
        }
        let mut next = self.next_device_index.get(&vm).copied().unwrap_or(0);
        if let Some(taken) = self.taken_indices.get(&vm) {
            while taken.contains(&next) {
                next += 1;
            }
        }
        next
    }

    /// Record a slot held by a reused device so no new device lands on it.
    pub fn mark_slot_used(&mut self, vm: u32, slot: u8) {
        self.used_bus_slots
            .entry(vm)
            .or_insert_with(|| RESERVED_SLOTS.into_iter().collect())
            .insert(slot);
        if usable(slot) {
            let h = self.highest_bus_slot.entry(vm).or_insert(slot);
            *h = (*h).max(slot);
        }
    }

    pub fn allocate_slot(&mut self, vm: u32, strategy: SlotStrategy) -> Result<u8> {
        let used = self
            .used_bus_slots
            .entry(vm)
            .or_insert_with(|| RESERVED_SLOTS.into_iter().collect());
        let highest = self.highest_bus_slot.get(&vm).copied();

        let slot = match strategy {
            SlotStrategy::LowestFree => lowest_free(used),
            SlotStrategy::NextHighest => next_highest(used, highest).or_else(|| lowest_free(used)),
        }
        .ok_or(Error::SlotExhausted { vm })?;

        used.insert(slot);
        let h = self.highest_bus_slot.entry(vm).or_insert(slot);
        *h = (*h).max(slot);
        Ok(slot)
    }

    pub fn ports(&self) -> &PortTable {
        &self.ports
    }
}

/// Tunnel addresses for both ends, collapsed to loopback when both VMs share
/// a non-loopback host address and the topology asks for it.
pub fn resolve_addresses(topology: &Topology, a: u32, b: u32) -> (HostAddr, HostAddr) {
    let addr_a = topology.addr_for(a);
    let addr_b = topology.addr_for(b);
    if topology.loopback_if_same_host && addr_a == addr_b && !addr_a.is_loopback() {
        let lo = addr_a.loopback_for();
        return (lo.clone(), lo);
    }
    (addr_a.clone(), addr_b.clone())
}

struct Identity {
    device_index: u32,
    bus_slot: Option<u8>,
    reused: bool,
}

pub struct Allocator<'a> {
    topology: &'a Topology,
    hosts: BTreeMap<u32, VmState>,
    state: AllocationState,
    interfaces: Vec<ResolvedInterface>,
}

impl<'a> Allocator<'a> {
    /// VMs missing from `hosts` are treated as brand new.
    pub fn new(topology: &'a Topology, hosts: &BTreeMap<u32, VmState>) -> Self {
        let mut state = AllocationState::default();
        let hosts: BTreeMap<u32, VmState> = topology
            .vm_ids()
            .into_iter()
            .map(|vm| (vm, hosts.get(&vm).cloned().unwrap_or_default()))
            .collect();
        for (vm, host) in &hosts {
            state.seed(*vm, host);
        }
        Self {
            topology,
            hosts,
            state,
            interfaces: Vec::new(),
        }
    }

    pub fn allocate_link(&mut self, link: &LinkSpec) -> Result<()> {
        let (a, b) = (link.a, link.b);
        self.state.mark_seen(a)?;
        self.state.mark_seen(b)?;

        let (addr_a, addr_b) = resolve_addresses(self.topology, a.vm, b.vm);

        let mac_a = derive_mac(self.topology.mac_prefix, a.vm, a.iface);
        let mac_b = derive_mac(self.topology.mac_prefix, b.vm, b.iface);

        let digit = self.topology.port_digit;
        let port_a = self.state.claim_port(a, digit)?;
        let port_b = self.state.claim_port(b, digit)?;

        let id_a = self.resolve_identity(a, mac_a)?;
        let id_b = self.resolve_identity(b, mac_b)?;

        self.interfaces.push(ResolvedInterface {
            endpoint: a,
            mac: mac_a,
            device_index: id_a.device_index,
            bus_slot: id_a.bus_slot,
            local_addr: addr_a.clone(),
            local_port: port_a,
            peer_addr: addr_b.clone(),
            peer_port: port_b,
            reused: id_a.reused,
        });
        self.interfaces.push(ResolvedInterface {
            endpoint: b,
            mac: mac_b,
            device_index: id_b.device_index,
            bus_slot: id_b.bus_slot,
            local_addr: addr_b,
            local_port: port_b,
            peer_addr: addr_a,
            peer_port: port_a,
            reused: id_b.reused,
        });
        Ok(())
    }

    fn resolve_identity(&mut self, endpoint: Endpoint, mac: MacAddr) -> Result<Identity> {
        let delegate = self.topology.delegate_pci_addr;
        let existing = self
            .hosts
            .get(&endpoint.vm)
            .and_then(|h| h.existing_by_mac.get(&mac))
            .copied();

        if let Some(existing) = existing {
            debug!(
                %endpoint, %mac,
                index = existing.device_index,
                slot = existing.bus_slot,
                "reusing existing interface"
            );
            self.state.mark_slot_used(endpoint.vm, existing.bus_slot);
            return Ok(Identity {
                device_index: existing.device_index,
                bus_slot: (!delegate).then_some(existing.bus_slot),
                reused: true,
            });
        }

        let device_index = self.state.next_device_index(endpoint.vm);
        let bus_slot = if delegate {
            None
        } else {
            Some(
                self.state
                    .allocate_slot(endpoint.vm, self.topology.strategy)?,
            )
        };
        debug!(%endpoint, %mac, index = device_index, slot = ?bus_slot, "allocated interface");
        Ok(Identity {
            device_index,
            bus_slot,
            reused: false,
        })
    }

    pub fn finish(self) -> Plan {
        let start_indices = self
            .hosts
            .keys()
            .map(|vm| (*vm, self.state.first_device_index(*vm)))
            .collect();
        info!(
            interfaces = self.interfaces.len(),
            vms = self.hosts.len(),
            ports = self.state.ports().len(),
            "plan complete"
        );
        Plan {
            port_digit: self.topology.port_digit,
            start_indices,
            interfaces: self.interfaces,
        }
    }
}

/// Resolve every link in order. Any failure aborts the whole plan.
pub fn plan(topology: &Topology, hosts: &BTreeMap<u32, VmState>) -> Result<Plan> {
    let mut allocator = Allocator::new(topology, hosts);
    for link in &topology.links {
        allocator.allocate_link(link)?;
    }
    Ok(allocator.finish())
}
