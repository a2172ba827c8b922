//! QEMU argument rendering and the `qm set` script.

use std::fmt::Write;

use pvelink_types::{Plan, ResolvedInterface};

use crate::topology::Topology;

/// Escape a string for safe use in a shell command.
/// Uses single quotes and escapes any single quotes in the string.
pub fn shell_escape(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }

    if s.chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c == '/')
    {
        return s.to_string();
    }

    format!("'{}'", s.replace('\'', "'\\''"))
}

/// `-netdev socket,...` half of an interface.
pub fn netdev_arg(iface: &ResolvedInterface) -> String {
    format!(
        "-netdev socket,id={},udp={},localaddr={}",
        iface.netdev_id(),
        iface.peer_addr.with_port(iface.peer_port),
        iface.local_addr.with_port(iface.local_port)
    )
}

/// `-device <model>,...` half of an interface.
pub fn device_arg(topology: &Topology, iface: &ResolvedInterface) -> String {
    let id = iface.netdev_id();
    let mut arg = format!(
        "-device {},mac={},rx_queue_size={},tx_queue_size={},netdev={id},id={id}",
        topology.model, iface.mac, topology.rx_queue_size, topology.tx_queue_size
    );
    if let Some(slot) = iface.bus_slot {
        let _ = write!(arg, ",bus=pci.0,addr=0x{slot:x}");
    }
    if let Some(mtu) = topology.host_mtu {
        let _ = write!(arg, ",host_mtu={mtu}");
    }
    arg
}

/// Both halves of every interface, in order.
pub fn vm_args<'a>(
    topology: &Topology,
    ifaces: impl IntoIterator<Item = &'a ResolvedInterface>,
) -> Vec<String> {
    ifaces
        .into_iter()
        .flat_map(|i| [netdev_arg(i), device_arg(topology, i)])
        .collect()
}

pub fn qm_set_command(vm: u32, args: &[String]) -> String {
    format!("qm set {vm} --args {}", shell_escape(&args.join(" ")))
}

/// Comment block describing ports, reuse and starting indices.
pub fn summary(plan: &Plan) -> String {
    let mut out = String::new();
    let ports = plan.ports();
    if !ports.is_empty() {
        let list: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
        let _ = writeln!(
            out,
            "# UDP ports used: {} (formula: {} + VMID + ethIndex)",
            list.join(", "),
            plan.port_digit
        );
    }

    let mut reused: Vec<&ResolvedInterface> = plan.reused().collect();
    if !reused.is_empty() {
        reused.sort_by_key(|i| i.endpoint);
        let _ = writeln!(out, "# Reused existing interfaces (matched by MAC):");
        for i in reused {
            let slot = i
                .bus_slot
                .map(|s| format!("0x{s:x}"))
                .unwrap_or_else(|| "auto".to_string());
            let _ = writeln!(
                out,
                "#   {}: {} @ {} ({})",
                i.endpoint,
                i.netdev_id(),
                slot,
                i.mac
            );
        }
    }

    let _ = writeln!(out, "# Existing netN count per VM respected (starting indices):");
    for (vm, start) in &plan.start_indices {
        let _ = writeln!(out, "#   VM {vm}: starting at net{start}");
    }
    out
}

/// Full script: summary, then one `qm set` per VM in ascending VM order.
pub fn render_script(topology: &Topology, plan: &Plan) -> String {
    let mut out = summary(plan);
    out.push('\n');
    for (vm, ifaces) in plan.by_vm() {
        let args = vm_args(topology, ifaces);
        let _ = writeln!(out, "# VM {vm}");
        let _ = writeln!(out, "{}\n", qm_set_command(vm, &args));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvelink_types::{Endpoint, MacAddr};
    use std::collections::BTreeMap;

    fn topology(extra: &str) -> Topology {
        Topology::from_yaml(&format!(
            "defaults:\n  udp_port_base: 4000\n{extra}\nlinks:\n  - [10, 0, 20, 0]\n"
        ))
        .unwrap()
    }

    fn iface(reused: bool, slot: Option<u8>) -> ResolvedInterface {
        ResolvedInterface {
            endpoint: Endpoint::new(10, 0),
            mac: MacAddr([0xbe, 0x24, 0x99, 0x00, 0x0a, 0x00]),
            device_index: 0,
            bus_slot: slot,
            local_addr: "127.0.0.1".parse().unwrap(),
            local_port: 4100,
            peer_addr: "127.0.0.1".parse().unwrap(),
            peer_port: 4200,
            reused,
        }
    }

    #[test]
    fn shell_escape_empty_string() {
        assert_eq!(shell_escape(""), "''");
    }

    #[test]
    fn shell_escape_safe_strings_unchanged() {
        assert_eq!(shell_escape("hello"), "hello");
        assert_eq!(shell_escape("/usr/sbin/qm"), "/usr/sbin/qm");
        assert_eq!(shell_escape("a-b"), "a-b");
    }

    #[test]
    fn shell_escape_wraps_special_chars() {
        assert_eq!(shell_escape("-netdev socket"), "'-netdev socket'");
        assert_eq!(shell_escape("a,b=c"), "'a,b=c'");
        assert_eq!(shell_escape("$(cmd)"), "'$(cmd)'");
    }

    #[test]
    fn shell_escape_handles_single_quotes() {
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
    }

    #[test]
    fn netdev_arg_format() {
        assert_eq!(
            netdev_arg(&iface(false, Some(0x10))),
            "-netdev socket,id=net0,udp=127.0.0.1:4200,localaddr=127.0.0.1:4100"
        );
    }

    #[test]
    fn netdev_arg_brackets_ipv6() {
        let mut i = iface(false, None);
        i.local_addr = "::1".parse().unwrap();
        i.peer_addr = "2001:db8::2".parse().unwrap();
        assert_eq!(
            netdev_arg(&i),
            "-netdev socket,id=net0,udp=[2001:db8::2]:4200,localaddr=[::1]:4100"
        );
    }

    #[test]
    fn netdev_arg_hostnames() {
        let mut i = iface(false, None);
        i.local_addr = "pve1.lan".parse().unwrap();
        i.peer_addr = "pve2.lan".parse().unwrap();
        assert_eq!(
            netdev_arg(&i),
            "-netdev socket,id=net0,udp=pve2.lan:4200,localaddr=pve1.lan:4100"
        );
    }

    #[test]
    fn device_arg_with_slot_and_mtu() {
        let topo = topology("");
        assert_eq!(
            device_arg(&topo, &iface(false, Some(0x1a))),
            "-device virtio-net-pci,mac=be:24:99:00:0a:00,rx_queue_size=1024,tx_queue_size=256,\
             netdev=net0,id=net0,bus=pci.0,addr=0x1a,host_mtu=9300"
        );
    }

    #[test]
    fn device_arg_delegated_without_mtu() {
        let topo = topology("  host_mtu: 0\n  model: e1000");
        assert_eq!(
            device_arg(&topo, &iface(false, None)),
            "-device e1000,mac=be:24:99:00:0a:00,rx_queue_size=1024,tx_queue_size=256,\
             netdev=net0,id=net0"
        );
    }

    #[test]
    fn qm_set_quotes_args() {
        let args = vec!["-netdev socket,id=net0".to_string(), "-device x".to_string()];
        assert_eq!(
            qm_set_command(10, &args),
            "qm set 10 --args '-netdev socket,id=net0 -device x'"
        );
    }

    #[test]
    fn summary_lists_reuse_and_starts() {
        let plan = Plan {
            port_digit: 4,
            start_indices: BTreeMap::from([(10, 2)]),
            interfaces: vec![iface(true, Some(0x12))],
        };
        let text = summary(&plan);
        assert_eq!(
            text,
            "# UDP ports used: 4100 (formula: 4 + VMID + ethIndex)\n\
             # Reused existing interfaces (matched by MAC):\n\
             #   VM 10 eth0: net0 @ 0x12 (be:24:99:00:0a:00)\n\
             # Existing netN count per VM respected (starting indices):\n\
             #   VM 10: starting at net2\n"
        );
    }

    #[test]
    fn summary_without_reuse_omits_section() {
        let plan = Plan {
            port_digit: 4,
            start_indices: BTreeMap::from([(10, 0)]),
            interfaces: vec![iface(false, Some(0x10))],
        };
        assert!(!summary(&plan).contains("Reused"));
    }
}
