//! Allocation engine for point-to-point UDP tunnel links between Proxmox VE
//! virtual machines.
//!
//! The flow is: load a [`Topology`], take a [`VmState`] snapshot of every VM
//! through a [`HostProbe`], run [`plan`] and hand the resulting [`Plan`] to
//! [`render::render_script`].

pub mod alloc;
pub mod derive;
pub mod error;
pub mod host;
pub mod render;
pub mod topology;

use std::collections::BTreeMap;

pub use alloc::{plan, AllocationState, Allocator, PortTable};
pub use derive::{derive_mac, derive_port, MacPrefix};
pub use error::{Error, Result};
pub use host::{FreshHost, HostProbe, PveHost, VmState};
pub use pvelink_types::{
    Endpoint, HostAddr, LinkSpec, MacAddr, Plan, ResolvedInterface, SlotStrategy,
};
pub use topology::Topology;

/// Snapshot every VM in the topology once, then plan all links.
pub fn plan_with_probe(topology: &Topology, probe: &dyn HostProbe) -> Result<Plan> {
    let hosts: BTreeMap<u32, VmState> = topology
        .vm_ids()
        .into_iter()
        .map(|vm| (vm, probe.vm_state(vm)))
        .collect();
    plan(topology, &hosts)
}
