//! Teardown and discovery cleanup against the mock control plane.

use paddock_core::{
    IpamMapping, NetworkProvisioner, RunResources, TaskTracker, TeardownCoordinator,
    VmOrchestrator,
};
use paddock_pve::{Api, Method, MockControlPlane};
use serde_json::json;
use std::sync::Arc;

struct Endpoint {
    network: NetworkProvisioner,
    vms: VmOrchestrator,
}

impl Endpoint {
    fn new(mock: &MockControlPlane) -> Self {
        let api = Api::new(Arc::new(mock.clone()));
        let tasks = TaskTracker::new(api.clone());
        Self {
            network: NetworkProvisioner::new(api.clone(), tasks.clone()),
            vms: VmOrchestrator::new(api, mock.node(), tasks),
        }
    }

    fn teardown(&self) -> TeardownCoordinator<'_> {
        TeardownCoordinator::new(&self.network, &self.vms)
    }
}

/// A run zone with one vnet, one subnet, a lease and a running VM.
fn seed_run(mock: &MockControlPlane, ns: &str, vmid: u32) {
    let zone = format!("{ns}z");
    let vnet = format!("{ns}v0");
    mock.add_zone(&zone);
    mock.add_vnet(&vnet, &zone, Some("lan"));
    mock.add_subnet(&vnet, "192.168.30.0/24");
    mock.add_lease(&vnet, "192.168.30.20", Some("52:54:00:00:00:01"));
    mock.add_vm(
        vmid,
        &format!("{ns}-{vmid}"),
        &format!("paddock;run-{ns}"),
        false,
        json!({"net0": format!("virtio=52:54:00:00:00:01,bridge={vnet}")}),
    );
    mock.set_running(vmid, true);
}

fn seed_static(mock: &MockControlPlane) {
    mock.add_zone("sbxvmz");
    mock.add_vnet("sbxvmv0", "sbxvmz", None);
    mock.add_subnet("sbxvmv0", "192.168.99.0/24");
    mock.add_vm(
        900,
        "paddock-ubuntu24-04",
        "paddock,builtin-ubuntu24.04",
        true,
        json!({"net0": "virtio,bridge=sbxvmv0"}),
    );
}

#[tokio::test(start_paused = true)]
async fn test_discovery_plan_finds_only_owned_resources() {
    let mock = MockControlPlane::default();
    seed_static(&mock);
    seed_run(&mock, "abc123", 120);
    mock.add_zone("lab");
    mock.add_vnet("labv0", "lab", None);
    mock.add_vm(130, "foreign", "", false, json!({"net0": "virtio,bridge=labv0"}));
    let endpoint = Endpoint::new(&mock);

    let plan = endpoint.teardown().plan_discovery().await.unwrap();

    let ids: Vec<u32> = plan.vms.iter().map(|vm| vm.vmid).collect();
    assert_eq!(ids, vec![120]);
    assert_eq!(plan.zones, vec!["abc123z".to_string()]);
    assert_eq!(plan.leases.len(), 1);
    assert!(plan.to_string().contains("abc123z"));
}

#[tokio::test(start_paused = true)]
async fn test_discovery_finds_zone_through_vm_bridge() {
    let mock = MockControlPlane::default();
    mock.add_zone("custom");
    mock.add_vnet("customv0", "custom", None);
    mock.add_vm(140, "odd", "paddock;run-zzz999", false, json!({"net0": "virtio,bridge=customv0"}));
    let endpoint = Endpoint::new(&mock);

    let plan = endpoint.teardown().plan_discovery().await.unwrap();

    assert_eq!(plan.zones, vec!["custom".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_execute_plan_leaves_static_network() {
    let mock = MockControlPlane::default();
    seed_static(&mock);
    seed_run(&mock, "abc123", 120);
    seed_run(&mock, "def456", 121);
    let endpoint = Endpoint::new(&mock);

    let plan = endpoint.teardown().cleanup_discovered().await.unwrap();

    assert_eq!(plan.zones.len(), 2);
    assert_eq!(mock.zones(), vec!["sbxvmz".to_string()]);
    assert_eq!(mock.vnets(), vec!["sbxvmv0".to_string()]);
    assert_eq!(mock.vm_ids(), vec![900]);
    assert!(mock.lease_ips().is_empty());
    assert_eq!(mock.applies(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_empty_plan_makes_no_mutations() {
    let mock = MockControlPlane::default();
    seed_static(&mock);
    let endpoint = Endpoint::new(&mock);

    let plan = endpoint.teardown().cleanup_discovered().await.unwrap();

    assert!(plan.is_empty());
    assert!(mock.calls().iter().all(|c| !c.method.is_mutation()));
}

#[tokio::test(start_paused = true)]
async fn test_delete_run_by_ids() {
    let mock = MockControlPlane::default();
    seed_run(&mock, "abc123", 120);
    let endpoint = Endpoint::new(&mock);
    let run = RunResources {
        zone: Some("abc123z".into()),
        vm_ids: vec![120],
        leases: vec![IpamMapping {
            vnet: "abc123v0".into(),
            zone: "abc123z".into(),
            mac: "52:54:00:00:00:01".into(),
            ipv4: "192.168.30.20".parse().unwrap(),
        }],
    };

    endpoint.teardown().delete_run(&run).await.unwrap();

    assert!(mock.zones().is_empty());
    assert!(mock.vm_ids().is_empty());
    assert_eq!(mock.subnet_count(), 0);
}

/// Deleting twice succeeds: everything missing counts as deleted.
#[tokio::test(start_paused = true)]
async fn test_delete_run_tolerates_missing() {
    let mock = MockControlPlane::default();
    seed_run(&mock, "abc123", 120);
    let endpoint = Endpoint::new(&mock);
    let run = RunResources {
        zone: Some("abc123z".into()),
        vm_ids: vec![120],
        leases: Vec::new(),
    };
    mock.add_vm(121, "gone-soon", "paddock", false, json!({}));

    // Lease left in place: the subnet delete must fail, not be skipped.
    assert!(endpoint.teardown().delete_run(&run).await.is_err());
    assert_eq!(mock.zones(), vec!["abc123z".to_string()]);

    let leases = endpoint.network.list_leases().await.unwrap();
    endpoint.network.delete_leases(&leases).await.unwrap();
    endpoint.teardown().delete_run(&run).await.unwrap();
    endpoint.teardown().delete_run(&run).await.unwrap();
    assert!(mock.zones().is_empty());
    assert_eq!(mock.vm_ids(), vec![121]);
}

#[tokio::test(start_paused = true)]
async fn test_vm_destroy_failure_keeps_network() {
    let mock = MockControlPlane::default();
    seed_run(&mock, "abc123", 120);
    mock.fail(Method::Delete, "/nodes/pve/qemu/120", "disk is locked");
    let endpoint = Endpoint::new(&mock);
    let run = RunResources {
        zone: Some("abc123z".into()),
        vm_ids: vec![120],
        leases: Vec::new(),
    };

    let err = endpoint.teardown().delete_run(&run).await.unwrap_err();

    assert!(err.to_string().contains("disk is locked"));
    assert_eq!(mock.count(Method::Delete, "/cluster/sdn"), 0);
}

/// A lease that cannot be deleted blocks its subnet, so nothing after it runs.
#[tokio::test(start_paused = true)]
async fn test_lease_delete_failure_stops_teardown() {
    let mock = MockControlPlane::default();
    seed_run(&mock, "abc123", 120);
    mock.fail(Method::Delete, "/cluster/sdn/vnets/abc123v0/ips", "ipam backend locked");
    let endpoint = Endpoint::new(&mock);
    let run = RunResources {
        zone: Some("abc123z".into()),
        vm_ids: vec![120],
        leases: vec![IpamMapping {
            vnet: "abc123v0".into(),
            zone: "abc123z".into(),
            mac: "52:54:00:00:00:01".into(),
            ipv4: "192.168.30.20".parse().unwrap(),
        }],
    };

    let err = endpoint.teardown().delete_run(&run).await.unwrap_err();

    assert!(err.to_string().contains("ipam backend locked"));
    assert_eq!(mock.count(Method::Delete, "/cluster/sdn/vnets/abc123v0/subnets"), 0);
    assert_eq!(mock.lease_ips(), vec!["192.168.30.20".to_string()]);
    assert_eq!(mock.vm_ids(), vec![120]);

    let err = endpoint.teardown().cleanup_discovered().await.unwrap_err();
    assert!(err.to_string().contains("ipam backend locked"));
    assert_eq!(mock.zones(), vec!["abc123z".to_string()]);
}
