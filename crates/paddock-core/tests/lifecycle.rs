//! Provisioning lifecycle tests against mock endpoints.
//!
//! Every test runs on a paused clock, so task settling and poll backoff
//! cost nothing.

use async_trait::async_trait;
use paddock_core::{
    BuiltInImage, Connector, CoreError, ManagerConfig, NetworkConfig, NetworkMode, NicSpec,
    ResourceRecord, SandboxConfig, SandboxManager, SubnetConfig, VmSource, VmSpec, VnetConfig,
};
use paddock_pve::{ControlPlane, Method, MockControlPlane};
use serde_json::json;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

/// Hands out mocks by host name.
struct Mocks(HashMap<String, MockControlPlane>);

#[async_trait]
impl Connector for Mocks {
    async fn connect(&self, record: &ResourceRecord) -> paddock_core::Result<Arc<dyn ControlPlane>> {
        self.0
            .get(record.host())
            .map(|mock| Arc::new(mock.clone()) as Arc<dyn ControlPlane>)
            .ok_or_else(|| CoreError::Config(format!("unknown host {}", record.host())))
    }
}

fn node(host: &str) -> MockControlPlane {
    MockControlPlane::new(host, "proxmox")
}

fn manager(mocks: &[&MockControlPlane], config: ManagerConfig) -> SandboxManager {
    let map = mocks
        .iter()
        .map(|m| (m.host().to_string(), (*m).clone()))
        .collect();
    SandboxManager::new(config, Arc::new(Mocks(map))).with_seed(1)
}

fn record(id: &str, host: &str) -> ResourceRecord {
    ResourceRecord::new(id, "default", host)
}

/// A ready-made Ubuntu template so runs skip the golden image flow.
fn seed_template(mock: &MockControlPlane) {
    mock.add_vm(
        900,
        "paddock-ubuntu24-04",
        "paddock,builtin-ubuntu24.04",
        true,
        json!({"net0": "virtio,bridge=sbxvmv0", "scsi0": "local-lvm:base-900-disk-0"}),
    );
}

fn fixed_ip_config() -> SandboxConfig {
    SandboxConfig::builder()
        .network(NetworkMode::Explicit(NetworkConfig::new(vec![VnetConfig {
            alias: Some("lan".into()),
            subnets: vec![SubnetConfig::standard(10).unwrap()],
        }])))
        .vm(VmSpec::built_in(BuiltInImage::Ubuntu2404).nics(vec![NicSpec::new("lan")
            .mac("52:54:00:aa:bb:01")
            .ipv4(Ipv4Addr::new(192, 168, 10, 20))]))
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_golden_image_then_sandbox() {
    let mock = node("pve-a");
    let m = manager(&[&mock], ManagerConfig::default());
    m.initialize(vec![record("a1", "pve-a")]).await;

    let run = m.provision("task-1", &SandboxConfig::default()).await.unwrap();
    let ns = run.namespace().to_string();

    assert_eq!(mock.vm_ids(), vec![100, 101]);
    let template = mock.vm_config(100).unwrap();
    assert_eq!(template["tags"], "paddock,builtin-ubuntu24.04");
    assert_eq!(template["template"], 1);
    assert_eq!(template["ide2"], "none,media=cdrom");
    assert!(mock.storage_content("local")[0].ends_with("noble-server-cloudimg-amd64.ova"));

    let sandbox = mock.vm_config(101).unwrap();
    assert_eq!(sandbox["tags"], format!("paddock;run-{ns}"));
    assert_eq!(sandbox["net0"], format!("virtio,bridge={ns}v0"));
    assert!(mock.is_running(101));
    assert_eq!(run.sandbox("default").unwrap().vm_id, 101);
    assert_eq!(run.resources().zone, Some(format!("{ns}z")));
    assert_eq!(m.pool().available("default"), Some(0));

    m.release(run).await.unwrap();

    assert_eq!(mock.vm_ids(), vec![100]);
    assert_eq!(mock.zones(), vec!["sbxvmz".to_string()]);
    assert_eq!(m.pool().available("default"), Some(1));
    assert_eq!(m.stats().released(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_builtin_template_is_reused() {
    let mock = node("pve-a");
    let m = manager(&[&mock], ManagerConfig::default());
    m.initialize(vec![record("a1", "pve-a")]).await;

    for name in ["first", "second"] {
        let run = m.provision(name, &SandboxConfig::default()).await.unwrap();
        m.release(run).await.unwrap();
    }

    assert_eq!(mock.count(Method::Post, "/nodes/proxmox/storage/local/download-url"), 1);
    assert_eq!(mock.count(Method::Post, "/nodes/proxmox/qemu/100/template"), 1);
    assert_eq!(mock.count(Method::Post, "/nodes/proxmox/qemu/100/clone"), 2);
    assert_eq!(m.stats().provisioned(), 2);
}

/// Zone and first vnet exist when the second vnet fails.
#[tokio::test(start_paused = true)]
async fn test_failure_after_zone_created_cleans_up_once() {
    let mock = node("pve-a");
    seed_template(&mock);
    let m = manager(&[&mock], ManagerConfig::default());
    m.initialize(vec![record("a1", "pve-a")]).await;

    let lan = |octet: u8| VnetConfig {
        alias: None,
        subnets: vec![SubnetConfig {
            cidr: format!("10.{octet}.0.0/24").parse().unwrap(),
            gateway: Ipv4Addr::new(10, octet, 0, 1),
            snat: false,
            dhcp_ranges: Vec::new(),
        }],
    };
    let config = SandboxConfig::builder()
        .network(NetworkMode::Explicit(
            NetworkConfig::new(vec![lan(1), lan(2)]).with_builtin_ipam(false),
        ))
        .build()
        .unwrap();
    // vnet 0, its subnet, then vnet 1
    mock.fail_nth(Method::Post, "/cluster/sdn/vnets", 3, "vnet create refused");

    let err = m.provision("task-4", &config).await.unwrap_err();

    assert!(err.to_string().contains("vnet create refused"));
    assert!(mock.zones().is_empty());
    assert!(mock.vnets().is_empty());
    assert_eq!(m.stats().discovery_cleanups(), 1);
    assert_eq!(m.pool().available("default"), Some(1));
    assert_eq!(m.withheld(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failure_before_infrastructure_skips_cleanup() {
    let mock = node("pve-a");
    mock.fail(Method::Get, "/cluster/sdn/zones", "zones unavailable");
    let m = manager(&[&mock], ManagerConfig::default());
    m.initialize(vec![record("a1", "pve-a")]).await;

    let err = m.provision("task", &SandboxConfig::default()).await.unwrap_err();

    assert!(err.to_string().contains("zones unavailable"));
    assert_eq!(m.stats().discovery_cleanups(), 0);
    assert_eq!(mock.count(Method::Delete, "/"), 0);
    assert_eq!(m.pool().available("default"), Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_releases_record() {
    let m = manager(&[], ManagerConfig::default());
    m.initialize(vec![record("a1", "ghost")]).await;

    let err = m.provision("task", &SandboxConfig::default()).await.unwrap_err();

    assert!(matches!(err, CoreError::Config(_)));
    assert_eq!(m.pool().available("default"), Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_failure_withholds_record() {
    let mock = node("pve-a");
    seed_template(&mock);
    mock.fail(Method::Post, "/nodes/proxmox/qemu/900/clone", "clone refused");
    mock.fail(Method::Delete, "/cluster/sdn/zones", "zone is locked");
    let m = manager(&[&mock], ManagerConfig::default());
    m.initialize(vec![record("a1", "pve-a")]).await;

    let err = m.provision("task", &SandboxConfig::default()).await.unwrap_err();

    assert!(err.to_string().contains("clone refused"));
    assert!(!err.to_string().contains("zone is locked"));
    assert_eq!(m.withheld(), 1);
    assert_eq!(m.pool().available("default"), Some(0));
}

#[tokio::test(start_paused = true)]
async fn test_release_tears_down_in_order() {
    let mock = node("pve-a");
    seed_template(&mock);
    let m = manager(&[&mock], ManagerConfig::default());
    m.initialize(vec![record("a1", "pve-a")]).await;

    let run = m.provision("task", &fixed_ip_config()).await.unwrap();
    let ns = run.namespace().to_string();
    let vm_id = run.sandbox("default").unwrap().vm_id;
    assert_eq!(mock.lease_ips(), vec!["192.168.10.20".to_string()]);
    assert_eq!(
        mock.vm_config(vm_id).unwrap()["net0"],
        format!("virtio=52:54:00:aa:bb:01,bridge={ns}v0")
    );

    let before = mock.calls().len();
    m.release(run).await.unwrap();
    let calls = mock.calls().split_off(before);

    let position = |method: Method, matches: &dyn Fn(&str) -> bool| {
        calls
            .iter()
            .position(|c| c.method == method && matches(&c.path))
            .unwrap_or_else(|| panic!("no {method} call matched"))
    };
    let lease = position(Method::Delete, &|p| p.starts_with(&format!("/cluster/sdn/vnets/{ns}v0/ips")));
    let vm = position(Method::Delete, &|p| p.starts_with(&format!("/nodes/proxmox/qemu/{vm_id}")));
    let subnet = position(Method::Delete, &|p| p.contains("/subnets/"));
    let vnet = position(Method::Delete, &|p| p == format!("/cluster/sdn/vnets/{ns}v0"));
    let zone = position(Method::Delete, &|p| p == format!("/cluster/sdn/zones/{ns}z"));
    let apply = position(Method::Put, &|p| p == "/cluster/sdn");

    assert!(lease < vm && vm < subnet && subnet < vnet && vnet < zone && zone < apply);
    assert!(mock.lease_ips().is_empty());
    assert_eq!(m.pool().available("default"), Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_release_failure_withholds_record() {
    let mock = node("pve-a");
    seed_template(&mock);
    let m = manager(&[&mock], ManagerConfig::default());
    m.initialize(vec![record("a1", "pve-a")]).await;

    let run = m.provision("task", &SandboxConfig::default()).await.unwrap();
    mock.fail(Method::Delete, "/cluster/sdn/zones", "zone is locked");

    let err = m.release(run).await.unwrap_err();

    assert!(err.to_string().contains("zone is locked"));
    assert_eq!(m.withheld(), 1);
    assert_eq!(m.pool().available("default"), Some(0));
}

/// Two records on one endpoint never drive it at the same time.
#[tokio::test(start_paused = true)]
async fn test_endpoint_workflows_are_serialized() {
    let mock = node("pve-a");
    seed_template(&mock);
    mock.set_latency(Duration::from_millis(5));
    let m = manager(&[&mock], ManagerConfig::default().preflight_clean(false));
    m.initialize(vec![record("a1", "pve-a"), record("a2", "pve-a")]).await;

    let config = SandboxConfig::default();
    let (a, b) = tokio::join!(m.provision("alpha", &config), m.provision("bravo", &config));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(mock.max_in_flight(), 1);
    assert_ne!(a.namespace(), b.namespace());
    assert_ne!(a.sandbox("default"), b.sandbox("default"));

    let (ra, rb) = tokio::join!(m.release(a), m.release(b));
    ra.unwrap();
    rb.unwrap();
    assert_eq!(mock.max_in_flight(), 1);
    assert_eq!(m.pool().available("default"), Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_existing_network_mode() {
    let mock = node("pve-a");
    seed_template(&mock);
    mock.add_zone("lab");
    mock.add_vnet("labv0", "lab", Some("lan"));
    mock.add_subnet("labv0", "10.0.0.0/24");
    let m = manager(&[&mock], ManagerConfig::default());
    m.initialize(vec![record("a1", "pve-a")]).await;

    let config = SandboxConfig::builder()
        .network(NetworkMode::Existing)
        .vm(VmSpec::built_in(BuiltInImage::Ubuntu2404).nics(vec![NicSpec::new("lan")]))
        .build()
        .unwrap();
    let run = m.provision("task", &config).await.unwrap();
    let vm_id = run.sandbox("default").unwrap().vm_id;

    assert_eq!(run.resources().zone, None);
    assert_eq!(mock.count(Method::Post, "/cluster/sdn/zones"), 0);
    assert_eq!(mock.vm_config(vm_id).unwrap()["net0"], "virtio,bridge=labv0");

    m.release(run).await.unwrap();
    assert_eq!(mock.vnets(), vec!["labv0".to_string()]);
    assert_eq!(mock.zones(), vec!["lab".to_string()]);
    assert!(!mock.vm_ids().contains(&vm_id));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_alias_fails_run() {
    let mock = node("pve-a");
    seed_template(&mock);
    let m = manager(&[&mock], ManagerConfig::default());
    m.initialize(vec![record("a1", "pve-a")]).await;

    let config = SandboxConfig::builder()
        .network(NetworkMode::Existing)
        .vm(VmSpec::built_in(BuiltInImage::Ubuntu2404).nics(vec![NicSpec::new("wan")]))
        .build()
        .unwrap();
    let err = m.provision("task", &config).await.unwrap_err();

    assert!(err.to_string().contains("unknown vnet alias 'wan'"));
    assert_eq!(m.pool().available("default"), Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_version_gate_blocks_debian() {
    let mock = node("pve-a");
    mock.set_version("8.4.1");
    let m = manager(&[&mock], ManagerConfig::default());
    m.initialize(vec![record("a1", "pve-a")]).await;

    let config = SandboxConfig::builder()
        .vm(VmSpec::built_in(BuiltInImage::Debian13))
        .build()
        .unwrap();
    let err = m.provision("task", &config).await.unwrap_err();

    assert!(err.to_string().contains("does not meet minimum requirement 9.0"));
    assert!(mock.vm_ids().is_empty());
    assert_eq!(m.pool().available("default"), Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_kali_requires_uploaded_image() {
    let mock = node("pve-a");
    let m = manager(&[&mock], ManagerConfig::default());
    m.initialize(vec![record("a1", "pve-a")]).await;

    let config = SandboxConfig::builder()
        .vm(VmSpec::built_in(BuiltInImage::Kali20253))
        .build()
        .unwrap();
    let err = m.provision("task", &config).await.unwrap_err();

    assert!(err.to_string().contains("kali-2025.3-genericcloud-amd64.raw"));
    assert_eq!(mock.count(Method::Post, "/nodes/proxmox/storage/local/download-url"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cloud_init_failure_cleans_up_template_vm() {
    let mock = node("pve-a");
    mock.set_agent_output("status: error\n");
    let m = manager(&[&mock], ManagerConfig::default());
    m.initialize(vec![record("a1", "pve-a")]).await;

    let err = m.provision("task", &SandboxConfig::default()).await.unwrap_err();

    assert!(matches!(err, CoreError::Failed { .. }));
    assert!(mock.vm_ids().is_empty());
    assert_eq!(mock.zones(), vec!["sbxvmz".to_string()]);
    assert_eq!(m.pool().available("default"), Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_preflight_removes_leftovers() {
    let mock = node("pve-a");
    seed_template(&mock);
    mock.add_zone("old123z");
    mock.add_vnet("old123v0", "old123z", None);
    mock.add_subnet("old123v0", "192.168.40.0/24");
    mock.add_vm(950, "leftover", "paddock;run-old123", false, json!({"net0": "virtio,bridge=old123v0"}));
    mock.set_running(950, true);
    let m = manager(&[&mock], ManagerConfig::default());
    m.initialize(vec![record("a1", "pve-a")]).await;

    let run = m.provision("task", &SandboxConfig::default()).await.unwrap();

    assert!(!mock.zones().contains(&"old123z".to_string()));
    assert!(!mock.vm_ids().contains(&950));
    assert_eq!(m.stats().discovery_cleanups(), 1);
    assert!(mock.is_running(run.sandbox("default").unwrap().vm_id));
}

#[tokio::test(start_paused = true)]
async fn test_acquire_deadline_from_config() {
    let mock = node("pve-a");
    let m = manager(
        &[&mock],
        ManagerConfig::default().acquire_timeout(Duration::from_millis(100)),
    );
    m.initialize(vec![record("a1", "pve-a")]).await;
    let _held = m.pool().acquire("default").await.unwrap();

    let err = m.provision("task", &SandboxConfig::default()).await.unwrap_err();

    assert!(matches!(err, CoreError::Timeout { .. }));
    assert!(mock.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_all_covers_every_endpoint() {
    let a = node("pve-a");
    let b = node("pve-b");
    for mock in [&a, &b] {
        mock.add_zone("abc123z");
        mock.add_vnet("abc123v0", "abc123z", None);
        mock.add_vm(120, "leftover", "paddock;run-abc123", false, json!({"net0": "virtio,bridge=abc123v0"}));
        mock.add_vm(130, "someone-else", "", false, json!({}));
    }
    let m = manager(&[&a, &b], ManagerConfig::default());

    let records = vec![
        ResourceRecord::new("a1", "a", "pve-a"),
        ResourceRecord::new("a2", "a", "pve-a"),
        ResourceRecord::new("b1", "b", "pve-b"),
    ];
    m.cleanup_all(records).await.unwrap();

    for mock in [&a, &b] {
        assert!(mock.zones().is_empty());
        assert_eq!(mock.vm_ids(), vec![130]);
    }
    assert_eq!(m.stats().discovery_cleanups(), 2);
    assert_eq!(m.pool().available("a"), Some(2));
    assert_eq!(m.pool().available("b"), Some(1));
}

/// The VM carries its tags from creation, so cleanup finds it even when
/// the first attempt to destroy it fails.
#[tokio::test(start_paused = true)]
async fn test_imported_vm_setup_failure_leaves_nothing() {
    let mock = node("pve-a");
    mock.fail(Method::Get, "/nodes/proxmox/qemu/100/config", "config unreadable");
    mock.fail_nth(Method::Delete, "/nodes/proxmox/qemu/100", 1, "storage busy");
    let m = manager(&[&mock], ManagerConfig::default());
    m.initialize(vec![record("a1", "pve-a")]).await;
    let config = SandboxConfig::builder()
        .vm(VmSpec::new(VmSource::ImportedImage("local:import/disk.qcow2".into())))
        .build()
        .unwrap();

    let err = m.provision("task", &config).await.unwrap_err();

    assert!(err.to_string().contains("config unreadable"));
    let create = mock
        .calls()
        .into_iter()
        .find(|c| c.method == Method::Post && c.path == "/nodes/proxmox/qemu")
        .unwrap();
    let tags = create.body.unwrap()["tags"].as_str().unwrap().to_string();
    assert!(tags.starts_with("paddock;run-"));
    assert!(mock.vm_ids().is_empty());
    assert!(mock.zones().is_empty());
    assert_eq!(m.withheld(), 0);
    assert_eq!(m.pool().available("default"), Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_template_config_failure_leaves_nothing() {
    let mock = node("pve-a");
    mock.fail(Method::Post, "/nodes/proxmox/qemu/100/config", "config locked");
    let m = manager(&[&mock], ManagerConfig::default());
    m.initialize(vec![record("a1", "pve-a")]).await;

    assert!(m.provision("task", &SandboxConfig::default()).await.is_err());

    assert!(mock.vm_ids().is_empty());
    assert_eq!(mock.zones(), vec!["sbxvmz".to_string()]);
    assert_eq!(m.pool().available("default"), Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_stuck_lease_withholds_record() {
    let mock = node("pve-a");
    seed_template(&mock);
    let m = manager(&[&mock], ManagerConfig::default());
    m.initialize(vec![record("a1", "pve-a")]).await;

    let run = m.provision("task", &fixed_ip_config()).await.unwrap();
    let ns = run.namespace().to_string();
    mock.fail(Method::Delete, &format!("/cluster/sdn/vnets/{ns}v0/ips"), "ipam backend locked");

    let err = m.release(run).await.unwrap_err();

    assert!(err.to_string().contains("ipam backend locked"));
    assert_eq!(mock.count(Method::Delete, &format!("/cluster/sdn/vnets/{ns}v0/subnets")), 0);
    assert_eq!(mock.lease_ips(), vec!["192.168.10.20".to_string()]);
    assert_eq!(m.withheld(), 1);
    assert_eq!(m.pool().available("default"), Some(0));
}
