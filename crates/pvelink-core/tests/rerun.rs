//! Rerunning against a host that already carries the generated devices must
//! reproduce the same device indices and PCI slots.

use std::collections::HashMap;

use pvelink_core::render::{render_script, vm_args};
use pvelink_core::{plan_with_probe, Error, HostProbe, Plan, Topology};

const BRIDGES: &str = "-device 'pci-bridge,id=pci.1,chassis_nr=1,bus=pci.0,addr=0x1e' \
-device 'pci-bridge,id=pci.2,chassis_nr=2,bus=pci.0,addr=0x1f'";

/// In-memory stand-in for a Proxmox node.
#[derive(Default)]
struct FakeNode {
    configs: HashMap<u32, String>,
    extra_args: HashMap<u32, String>,
    applied: HashMap<u32, String>,
}

impl FakeNode {
    /// What `qm set --args` followed by a restart would leave behind.
    fn apply(&mut self, topology: &Topology, plan: &Plan) {
        for (vm, ifaces) in plan.by_vm() {
            self.applied.insert(vm, vm_args(topology, ifaces).join(" "));
        }
    }
}

impl HostProbe for FakeNode {
    fn vm_config(&self, vm: u32) -> Option<String> {
        self.configs.get(&vm).cloned()
    }

    fn launch_command(&self, vm: u32) -> Option<String> {
        if !self.configs.contains_key(&vm) && !self.applied.contains_key(&vm) {
            return None;
        }
        Some(format!(
            "/usr/bin/kvm -id {vm} -name 'vm{vm},debug-threads=on' {BRIDGES} {} {} -machine 'type=pc+pve0'",
            self.extra_args.get(&vm).map(String::as_str).unwrap_or(""),
            self.applied.get(&vm).map(String::as_str).unwrap_or(""),
        ))
    }
}

fn topology(links: &str) -> Topology {
    Topology::from_yaml(&format!(
        "defaults:\n  udp_port_base: 40000\n  mac_prefix: bc:24:99\nlinks:\n{links}\n"
    ))
    .unwrap()
}

fn identities(plan: &Plan) -> Vec<(u32, u32, u32, Option<u8>)> {
    plan.interfaces
        .iter()
        .map(|i| (i.endpoint.vm, i.endpoint.iface, i.device_index, i.bus_slot))
        .collect()
}

fn commands(script: &str) -> Vec<&str> {
    script.lines().filter(|l| l.starts_with("qm set")).collect()
}

#[test]
fn single_link_on_fresh_vms() {
    let topo = topology("  - [10, 0, 20, 0]");
    let plan = plan_with_probe(&topo, &FakeNode::default()).unwrap();
    let script = render_script(&topo, &plan);

    assert_eq!(
        script,
        "# UDP ports used: 4100, 4200 (formula: 4 + VMID + ethIndex)\n\
         # Existing netN count per VM respected (starting indices):\n\
         #   VM 10: starting at net0\n\
         #   VM 20: starting at net0\n\
         \n\
         # VM 10\n\
         qm set 10 --args '-netdev socket,id=net0,udp=127.0.0.1:4200,localaddr=127.0.0.1:4100 \
         -device virtio-net-pci,mac=be:24:99:00:0a:00,rx_queue_size=1024,tx_queue_size=256,\
         netdev=net0,id=net0,bus=pci.0,addr=0x10,host_mtu=9300'\n\
         \n\
         # VM 20\n\
         qm set 20 --args '-netdev socket,id=net0,udp=127.0.0.1:4100,localaddr=127.0.0.1:4200 \
         -device virtio-net-pci,mac=be:24:99:00:14:00,rx_queue_size=1024,tx_queue_size=256,\
         netdev=net0,id=net0,bus=pci.0,addr=0x10,host_mtu=9300'\n\
         \n"
    );
}

#[test]
fn rerun_reuses_every_interface() {
    let topo = topology("  - [10, 0, 20, 0]\n  - [10, eth1, 30, eth2]\n  - [20, 1, 30, 0]");
    let mut node = FakeNode::default();

    let first = plan_with_probe(&topo, &node).unwrap();
    assert_eq!(first.reused().count(), 0);
    node.apply(&topo, &first);

    let second = plan_with_probe(&topo, &node).unwrap();
    assert_eq!(identities(&first), identities(&second));
    assert!(second.interfaces.iter().all(|i| i.reused));
    assert_eq!(
        commands(&render_script(&topo, &first)),
        commands(&render_script(&topo, &second))
    );
}

#[test]
fn rerun_after_out_of_band_changes() {
    let mut node = FakeNode::default();
    node.configs.insert(
        10,
        "cores: 2\nnet0: virtio=BC:24:11:AA:BB:CC,bridge=vmbr0\n".to_string(),
    );
    node.extra_args.insert(
        10,
        "-device 'virtio-net-pci,mac=BC:24:11:AA:BB:CC,netdev=net0,bus=pci.0,addr=0x12,id=net0'"
            .to_string(),
    );

    let topo = topology("  - [10, 0, 20, 0]");
    let first = plan_with_probe(&topo, &node).unwrap();
    // net0 and slot 0x12 belong to the bridge NIC
    assert_eq!(identities(&first)[0], (10, 0, 1, Some(0x13)));
    node.apply(&topo, &first);

    // someone hot-plugs a disk controller on 0x14
    node.extra_args.get_mut(&10).unwrap().push_str(
        " -device 'virtio-scsi-pci,id=scsihw1,bus=pci.0,addr=0x14'",
    );

    let grown = topology("  - [10, 0, 20, 0]\n  - [10, 1, 20, 1]");
    let second = plan_with_probe(&grown, &node).unwrap();
    let ids = identities(&second);
    assert_eq!(ids[0], (10, 0, 1, Some(0x13)));
    assert_eq!(ids[1], (20, 0, 0, Some(0x10)));
    assert_eq!(ids[2], (10, 1, 2, Some(0x15)));
    assert_eq!(ids[3], (20, 1, 1, Some(0x11)));
    assert!(second.interfaces[0].reused && second.interfaces[1].reused);
    assert!(!second.interfaces[2].reused && !second.interfaces[3].reused);
}

#[test]
fn failure_aborts_whole_plan() {
    let topo = topology("  - [10, 0, 20, 0]\n  - [30, 0, 20, 0]");
    let err = plan_with_probe(&topo, &FakeNode::default()).unwrap_err();
    assert!(matches!(err, Error::DuplicateEndpoint(_)));
}

#[test]
fn reused_slot_outside_bus_scan_is_not_reassigned() {
    // `addr=` leads the option list, so only the device scan picks it up
    let mut node = FakeNode::default();
    node.extra_args.insert(
        10,
        "-device 'addr=0x10,mac=be:24:99:00:0a:00,netdev=net0,id=net0'".to_string(),
    );
    node.configs.insert(10, "cores: 2\n".to_string());

    let topo = Topology::from_yaml(
        "defaults:\n  pci_strategy: lowest_free\n\
         links:\n  - [10, 0, 20, 0]\n  - [10, 1, 30, 0]\n",
    )
    .unwrap();
    let plan = plan_with_probe(&topo, &node).unwrap();
    let vm10: Vec<_> = identities(&plan)
        .into_iter()
        .filter(|(vm, ..)| *vm == 10)
        .collect();
    assert_eq!(vm10, vec![(10, 0, 0, Some(0x10)), (10, 1, 1, Some(0x11))]);
}

#[test]
fn hostname_peers_render_unbracketed() {
    let topo = Topology::from_yaml(
        "defaults:\n  udp_ip_by_vm:\n    10: pve1.lan\n    \"20\": pve2.lan\n\
         links:\n  - [10, 0, 20, 0]\n",
    )
    .unwrap();
    let plan = plan_with_probe(&topo, &FakeNode::default()).unwrap();
    let script = render_script(&topo, &plan);
    let cmds = commands(&script);
    assert!(cmds[0].contains("udp=pve2.lan:4200,localaddr=pve1.lan:4100"));
    assert!(cmds[1].contains("udp=pve1.lan:4100,localaddr=pve2.lan:4200"));
}
