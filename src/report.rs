use anyhow::Result;
use pvelink_core::render::render_script;
use pvelink_core::{Plan, Topology};
use tabled::{Table, Tabled};

use crate::cli::Format;

#[derive(Tabled)]
struct IfaceRow {
    vm: u32,
    eth: u32,
    netdev: String,
    mac: String,
    slot: String,
    local: String,
    peer: String,
    reused: String,
}

/// Render the whole plan before anything reaches stdout.
pub fn render(topology: &Topology, plan: &Plan, format: Format) -> Result<String> {
    Ok(match format {
        Format::Shell => render_script(topology, plan),
        Format::Json => {
            let mut json = serde_json::to_string_pretty(plan)?;
            json.push('\n');
            json
        }
        Format::Table => render_table(plan),
    })
}

fn render_table(plan: &Plan) -> String {
    let rows: Vec<IfaceRow> = plan
        .by_vm()
        .into_values()
        .flatten()
        .map(|i| IfaceRow {
            vm: i.endpoint.vm,
            eth: i.endpoint.iface,
            netdev: i.netdev_id(),
            mac: i.mac.to_string(),
            slot: i.bus_slot.map_or("auto".into(), |s| format!("0x{s:x}")),
            local: i.local_addr.with_port(i.local_port),
            peer: i.peer_addr.with_port(i.peer_port),
            reused: if i.reused { "yes" } else { "-" }.to_string(),
        })
        .collect();

    let mut table = Table::new(rows).to_string();
    table.push('\n');
    table
}

/// One-paragraph description of a validated mapping.
pub fn describe(topology: &Topology, plan: &Plan) -> String {
    let vms: Vec<String> = topology.vm_ids().iter().map(|v| v.to_string()).collect();
    let slots = if topology.delegate_pci_addr {
        "assigned by QEMU".to_string()
    } else {
        topology.strategy.to_string()
    };
    format!(
        "mapping OK: {} links, {} interfaces across VMs {}\n\
         MAC prefix {}, UDP ports {} + VMID + ethIndex, PCI slots {}\n",
        topology.links.len(),
        plan.interfaces.len(),
        vms.join(", "),
        topology.mac_prefix,
        plan.port_digit,
        slots,
    )
}
