//! In-memory control plane for tests.
//!
//! Emulates the subset of the REST API paddock uses, keeps a call log and
//! supports fault injection. State transitions that are asynchronous on a
//! real node (power state, downloads, template conversion) complete
//! immediately here. Deletions enforce the same dependency rules a real
//! node does: a subnet with allocated IPs, a vnet that still has subnets or
//! attached VMs, a zone with vnets, and a running VM all refuse deletion.

use crate::client::{ControlPlane, Method};
use crate::error::{PveError, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A recorded request.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

#[derive(Debug, Clone)]
struct Fault {
    method: Method,
    prefix: String,
    skip: usize,
    remaining: usize,
    status: u16,
    message: String,
}

#[derive(Debug, Clone)]
struct MockTask {
    upid: String,
    kind: String,
    polls_left: usize,
    final_status: String,
}

#[derive(Debug, Clone)]
struct MockVm {
    config: Map<String, Value>,
    running: bool,
}

impl MockVm {
    fn bridges(&self) -> Vec<String> {
        self.config
            .iter()
            .filter(|(k, _)| k.starts_with("net"))
            .filter_map(|(_, v)| v.as_str())
            .flat_map(|v| v.split(','))
            .filter_map(|part| part.strip_prefix("bridge="))
            .map(str::to_string)
            .collect()
    }

    fn is_template(&self) -> bool {
        matches!(self.config.get("template"), Some(v) if v == &json!(1))
    }
}

#[derive(Debug, Clone)]
struct Lease {
    ip: String,
    mac: Option<String>,
    vnet: String,
    zone: String,
}

#[derive(Debug)]
struct MockState {
    zones: BTreeMap<String, Value>,
    vnets: BTreeMap<String, Value>,
    subnets: BTreeMap<String, Vec<Value>>,
    leases: Vec<Lease>,
    vms: BTreeMap<u32, MockVm>,
    storage: BTreeMap<String, Vec<String>>,
    tasks: Vec<MockTask>,
    version: String,
    agent_output: String,
    task_polls: usize,
    task_failure: Option<String>,
    faults: Vec<Fault>,
    calls: Vec<Call>,
    applies: usize,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            zones: BTreeMap::new(),
            vnets: BTreeMap::new(),
            subnets: BTreeMap::new(),
            leases: Vec::new(),
            vms: BTreeMap::new(),
            storage: BTreeMap::new(),
            tasks: Vec::new(),
            version: "9.0.3".into(),
            agent_output: "status: done\n".into(),
            task_polls: 0,
            task_failure: None,
            faults: Vec::new(),
            calls: Vec::new(),
            applies: 0,
        }
    }
}

/// In-memory [`ControlPlane`] emulating a single node.
#[derive(Clone)]
pub struct MockControlPlane {
    host: String,
    base_url: String,
    node: String,
    state: Arc<Mutex<MockState>>,
    latency: Arc<Mutex<Duration>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl Default for MockControlPlane {
    fn default() -> Self {
        Self::new("mock", "pve")
    }
}

impl MockControlPlane {
    /// A mock named `host` with a single node called `node`.
    pub fn new(host: &str, node: &str) -> Self {
        Self {
            host: host.to_string(),
            base_url: format!("https://{host}:8006/api2/json"),
            node: node.to_string(),
            state: Arc::new(Mutex::new(MockState::default())),
            latency: Arc::new(Mutex::new(Duration::ZERO)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    // ------------------------------------------------------------------
    // Seeding
    // ------------------------------------------------------------------

    pub fn set_version(&self, version: &str) {
        self.state().version = version.to_string();
    }

    /// Text the guest agent reports for every command.
    pub fn set_agent_output(&self, output: &str) {
        self.state().agent_output = output.to_string();
    }

    /// Delay applied to every request.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    /// New tasks stay pending for this many task-list reads.
    pub fn set_task_polls(&self, polls: usize) {
        self.state().task_polls = polls;
    }

    /// The next task created ends with `status` instead of `OK`.
    pub fn fail_next_task(&self, status: &str) {
        self.state().task_failure = Some(status.to_string());
    }

    pub fn add_zone(&self, zone: &str) {
        self.state().zones.insert(
            zone.to_string(),
            json!({"zone": zone, "type": "simple", "ipam": "pve", "dhcp": "dnsmasq"}),
        );
    }

    pub fn add_vnet(&self, vnet: &str, zone: &str, alias: Option<&str>) {
        let mut entry = json!({"vnet": vnet, "zone": zone});
        if let Some(alias) = alias {
            entry["alias"] = json!(alias);
        }
        self.state().vnets.insert(vnet.to_string(), entry);
    }

    pub fn add_subnet(&self, vnet: &str, cidr: &str) {
        let mut state = self.state();
        let zone = zone_of(&state, vnet);
        state
            .subnets
            .entry(vnet.to_string())
            .or_default()
            .push(subnet_entry(&zone, vnet, cidr, None));
    }

    pub fn add_lease(&self, vnet: &str, ip: &str, mac: Option<&str>) {
        let mut state = self.state();
        let zone = zone_of(&state, vnet);
        state.leases.push(Lease {
            ip: ip.to_string(),
            mac: mac.map(str::to_string),
            vnet: vnet.to_string(),
            zone,
        });
    }

    /// Seed a VM. `config` entries are merged over `name`/`tags`.
    pub fn add_vm(&self, vmid: u32, name: &str, tags: &str, template: bool, config: Value) {
        let mut map = Map::new();
        map.insert("name".into(), json!(name));
        if !tags.is_empty() {
            map.insert("tags".into(), json!(tags));
        }
        if template {
            map.insert("template".into(), json!(1));
        }
        if let Value::Object(extra) = config {
            map.extend(extra);
        }
        self.state().vms.insert(
            vmid,
            MockVm {
                config: map,
                running: false,
            },
        );
    }

    pub fn set_running(&self, vmid: u32, running: bool) {
        if let Some(vm) = self.state().vms.get_mut(&vmid) {
            vm.running = running;
        }
    }

    pub fn add_storage_content(&self, storage: &str, volid: &str) {
        self.state()
            .storage
            .entry(storage.to_string())
            .or_default()
            .push(volid.to_string());
    }

    pub fn add_task(&self, upid: &str, status: Option<&str>) {
        self.state().tasks.push(MockTask {
            upid: upid.to_string(),
            kind: "seeded".into(),
            polls_left: if status.is_some() { 0 } else { usize::MAX },
            final_status: status.unwrap_or("OK").to_string(),
        });
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    /// Every matching request fails with a 500 carrying `message`.
    pub fn fail(&self, method: Method, path_prefix: &str, message: &str) {
        self.push_fault(method, path_prefix, 0, usize::MAX, 500, message);
    }

    /// The `n`th (1-based) matching request fails once.
    pub fn fail_nth(&self, method: Method, path_prefix: &str, n: usize, message: &str) {
        self.push_fault(method, path_prefix, n.saturating_sub(1), 1, 500, message);
    }

    /// Matching requests fail with `status` the next `times` times.
    pub fn fail_times(&self, method: Method, path_prefix: &str, times: usize, status: u16) {
        self.push_fault(method, path_prefix, 0, times, status, "injected failure");
    }

    pub fn clear_faults(&self) {
        self.state().faults.clear();
    }

    fn push_fault(
        &self,
        method: Method,
        prefix: &str,
        skip: usize,
        remaining: usize,
        status: u16,
        message: &str,
    ) {
        self.state().faults.push(Fault {
            method,
            prefix: prefix.to_string(),
            skip,
            remaining,
            status,
            message: message.to_string(),
        });
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// Number of recorded requests matching method and path prefix.
    pub fn count(&self, method: Method, path_prefix: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.method == method && c.path.starts_with(path_prefix))
            .count()
    }

    pub fn zones(&self) -> Vec<String> {
        self.state().zones.keys().cloned().collect()
    }

    pub fn vnets(&self) -> Vec<String> {
        self.state().vnets.keys().cloned().collect()
    }

    pub fn vnet_alias(&self, vnet: &str) -> Option<String> {
        self.state()
            .vnets
            .get(vnet)
            .and_then(|v| v.get("alias"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn subnets(&self, vnet: &str) -> Vec<Value> {
        self.state().subnets.get(vnet).cloned().unwrap_or_default()
    }

    pub fn subnet_count(&self) -> usize {
        self.state().subnets.values().map(Vec::len).sum()
    }

    pub fn lease_ips(&self) -> Vec<String> {
        self.state().leases.iter().map(|l| l.ip.clone()).collect()
    }

    pub fn vm_ids(&self) -> Vec<u32> {
        self.state().vms.keys().copied().collect()
    }

    /// Config map of a VM.
    pub fn vm_config(&self, vmid: u32) -> Option<Value> {
        self.state()
            .vms
            .get(&vmid)
            .map(|vm| Value::Object(vm.config.clone()))
    }

    pub fn is_running(&self, vmid: u32) -> bool {
        self.state().vms.get(&vmid).is_some_and(|vm| vm.running)
    }

    pub fn storage_content(&self, storage: &str) -> Vec<String> {
        self.state().storage.get(storage).cloned().unwrap_or_default()
    }

    /// Number of SDN apply calls that succeeded.
    pub fn applies(&self) -> usize {
        self.state().applies
    }

    /// Highest number of requests observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let result = {
            let mut state = self.state();
            state.calls.push(Call {
                method,
                path: path.to_string(),
                body: body.clone(),
            });
            match take_fault(&mut state, method, path) {
                Some(err) => Err(err),
                None => route(&mut state, &self.node, method, path, body),
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn take_fault(state: &mut MockState, method: Method, path: &str) -> Option<PveError> {
    for fault in state.faults.iter_mut() {
        if fault.method != method || !path.starts_with(&fault.prefix) || fault.remaining == 0 {
            continue;
        }
        if fault.skip > 0 {
            fault.skip -= 1;
            continue;
        }
        fault.remaining -= 1;
        return Some(PveError::Api {
            method,
            path: path.to_string(),
            status: fault.status,
            body: fault.message.clone(),
        });
    }
    None
}

fn api_err(method: Method, path: &str, status: u16, message: impl Into<String>) -> PveError {
    PveError::Api {
        method,
        path: path.to_string(),
        status,
        body: message.into(),
    }
}

fn zone_of(state: &MockState, vnet: &str) -> String {
    state
        .vnets
        .get(vnet)
        .and_then(|v| v.get("zone"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn subnet_entry(zone: &str, vnet: &str, cidr: &str, gateway: Option<&str>) -> Value {
    let mut entry = json!({
        "id": format!("{zone}-{}", cidr.replace('/', "-")),
        "subnet": format!("{zone}-{}", cidr.replace('/', "-")),
        "cidr": cidr,
        "vnet": vnet,
        "zone": zone,
        "type": "subnet",
    });
    if let Some(gw) = gateway {
        entry["gateway"] = json!(gw);
    }
    entry
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|kv| !kv.is_empty())
        .map(|kv| match kv.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (kv.to_string(), String::new()),
        })
        .collect()
}

fn field<'a>(body: &'a Option<Value>, key: &str) -> Option<&'a Value> {
    body.as_ref().and_then(|b| b.get(key))
}

fn field_str<'a>(body: &'a Option<Value>, key: &str) -> Option<&'a str> {
    field(body, key).and_then(Value::as_str)
}

fn new_task(state: &mut MockState, node: &str, kind: &str) -> Value {
    let upid = format!("UPID:{node}:{}:{kind}:", uuid::Uuid::new_v4().simple());
    let final_status = state.task_failure.take().unwrap_or_else(|| "OK".into());
    state.tasks.push(MockTask {
        upid: upid.clone(),
        kind: kind.to_string(),
        polls_left: state.task_polls,
        final_status,
    });
    json!(upid)
}

fn route(
    state: &mut MockState,
    node: &str,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> Result<Value> {
    let (route_path, query) = match path.split_once('?') {
        Some((p, q)) => (p, parse_query(q)),
        None => (path, HashMap::new()),
    };
    let segs: Vec<&str> = route_path.trim_matches('/').split('/').collect();
    let not_found = || api_err(method, path, 404, format!("no such route: {method} {path}"));

    match (method, segs.as_slice()) {
        (Method::Get, ["cluster", "tasks"]) => {
            let mut out = Vec::new();
            for task in state.tasks.iter_mut() {
                let mut entry = json!({"upid": task.upid, "type": task.kind});
                if task.polls_left == 0 {
                    entry["status"] = json!(task.final_status);
                } else if task.polls_left != usize::MAX {
                    task.polls_left -= 1;
                }
                out.push(entry);
            }
            Ok(Value::Array(out))
        }
        (Method::Get, ["cluster", "nextid"]) => {
            let next = state.vms.keys().next_back().map(|id| id + 1).unwrap_or(100);
            Ok(json!(next.max(100).to_string()))
        }

        // SDN
        (Method::Put, ["cluster", "sdn"]) => {
            state.applies += 1;
            Ok(new_task(state, node, "reloadnetworkall"))
        }
        (Method::Get, ["cluster", "sdn", "zones"]) => {
            Ok(Value::Array(state.zones.values().cloned().collect()))
        }
        (Method::Post, ["cluster", "sdn", "zones"]) => {
            let zone = field_str(&body, "zone").ok_or_else(|| api_err(method, path, 400, "zone missing"))?;
            if state.zones.contains_key(zone) {
                return Err(api_err(method, path, 500, format!("zone '{zone}' already exists")));
            }
            state
                .zones
                .insert(zone.to_string(), body.clone().unwrap_or(Value::Null));
            Ok(Value::Null)
        }
        (Method::Delete, ["cluster", "sdn", "zones", zone]) => {
            if !state.zones.contains_key(*zone) {
                return Err(api_err(method, path, 500, format!("sdn '{zone}' does not exist")));
            }
            if state.vnets.values().any(|v| v.get("zone") == Some(&json!(zone))) {
                return Err(api_err(method, path, 500, format!("zone '{zone}' is in use by vnets")));
            }
            state.zones.remove(*zone);
            Ok(Value::Null)
        }
        (Method::Get, ["cluster", "sdn", "vnets"]) => {
            Ok(Value::Array(state.vnets.values().cloned().collect()))
        }
        (Method::Post, ["cluster", "sdn", "vnets"]) => {
            let vnet = field_str(&body, "vnet").ok_or_else(|| api_err(method, path, 400, "vnet missing"))?;
            let zone = field_str(&body, "zone").unwrap_or_default();
            if !state.zones.contains_key(zone) {
                return Err(api_err(method, path, 500, format!("zone '{zone}' does not exist")));
            }
            if state.vnets.contains_key(vnet) {
                return Err(api_err(method, path, 500, format!("vnet '{vnet}' already exists")));
            }
            state
                .vnets
                .insert(vnet.to_string(), body.clone().unwrap_or(Value::Null));
            Ok(Value::Null)
        }
        (Method::Delete, ["cluster", "sdn", "vnets", vnet]) => {
            if !state.vnets.contains_key(*vnet) {
                return Err(api_err(method, path, 500, format!("sdn '{vnet}' does not exist")));
            }
            if state.subnets.get(*vnet).is_some_and(|s| !s.is_empty()) {
                return Err(api_err(method, path, 500, format!("vnet '{vnet}' still has subnets")));
            }
            if state.vms.values().any(|vm| vm.bridges().iter().any(|b| b == vnet)) {
                return Err(api_err(method, path, 500, format!("vnet '{vnet}' is used by a guest")));
            }
            state.vnets.remove(*vnet);
            state.subnets.remove(*vnet);
            Ok(Value::Null)
        }
        (Method::Get, ["cluster", "sdn", "vnets", vnet, "subnets"]) => {
            if !state.vnets.contains_key(*vnet) {
                return Err(api_err(method, path, 500, format!("sdn '{vnet}' does not exist")));
            }
            Ok(Value::Array(state.subnets.get(*vnet).cloned().unwrap_or_default()))
        }
        (Method::Post, ["cluster", "sdn", "vnets", vnet, "subnets"]) => {
            if !state.vnets.contains_key(*vnet) {
                return Err(api_err(method, path, 500, format!("sdn '{vnet}' does not exist")));
            }
            let cidr = field_str(&body, "subnet").ok_or_else(|| api_err(method, path, 400, "subnet missing"))?;
            let zone = zone_of(state, vnet);
            let gateway = field_str(&body, "gateway");
            let mut entry = subnet_entry(&zone, vnet, cidr, gateway);
            if let Some(snat) = field(&body, "snat") {
                entry["snat"] = snat.clone();
            }
            if let Some(range) = field(&body, "dhcp-range") {
                entry["dhcp-range"] = range.clone();
            }
            state.subnets.entry(vnet.to_string()).or_default().push(entry);
            Ok(Value::Null)
        }
        (Method::Delete, ["cluster", "sdn", "vnets", vnet, "subnets", id]) => {
            let Some(list) = state.subnets.get(*vnet) else {
                return Err(api_err(method, path, 500, format!("subnet '{id}' does not exist")));
            };
            if !list.iter().any(|s| s.get("id") == Some(&json!(id))) {
                return Err(api_err(method, path, 500, format!("subnet '{id}' does not exist")));
            }
            if state.leases.iter().any(|l| l.vnet == *vnet) {
                return Err(api_err(method, path, 500, format!("cannot delete subnet '{id}', not empty")));
            }
            if let Some(list) = state.subnets.get_mut(*vnet) {
                list.retain(|s| s.get("id") != Some(&json!(id)));
            }
            Ok(Value::Null)
        }
        (Method::Post, ["cluster", "sdn", "vnets", vnet, "ips"]) => {
            if !state.vnets.contains_key(*vnet) {
                return Err(api_err(method, path, 500, format!("sdn '{vnet}' does not exist")));
            }
            let ip = field_str(&body, "ip").ok_or_else(|| api_err(method, path, 400, "ip missing"))?;
            if state.leases.iter().any(|l| l.vnet == *vnet && l.ip == ip) {
                return Err(api_err(method, path, 500, format!("IP '{ip}' already allocated")));
            }
            let zone = zone_of(state, vnet);
            state.leases.push(Lease {
                ip: ip.to_string(),
                mac: field_str(&body, "mac").map(str::to_string),
                vnet: vnet.to_string(),
                zone,
            });
            Ok(Value::Null)
        }
        (Method::Delete, ["cluster", "sdn", "vnets", vnet, "ips"]) => {
            let ip = query.get("ip").cloned().unwrap_or_default();
            let before = state.leases.len();
            state.leases.retain(|l| !(l.vnet == *vnet && l.ip == ip));
            if state.leases.len() == before {
                return Err(api_err(method, path, 500, format!("IP '{ip}' does not exist")));
            }
            Ok(Value::Null)
        }
        (Method::Get, ["cluster", "sdn", "ipams", "pve", "status"]) => Ok(Value::Array(
            state
                .leases
                .iter()
                .map(|l| {
                    json!({
                        "ip": l.ip,
                        "mac": l.mac,
                        "vnet": l.vnet,
                        "zone": l.zone,
                    })
                })
                .collect(),
        )),

        // Node
        (Method::Get, ["nodes", _, "version"]) => Ok(json!({"version": state.version, "release": "9.0"})),
        (Method::Get, ["nodes", _, "storage", storage, "content"]) => Ok(Value::Array(
            state
                .storage
                .get(*storage)
                .map(|list| {
                    list.iter()
                        .map(|volid| json!({"volid": volid, "content": "import"}))
                        .collect()
                })
                .unwrap_or_default(),
        )),
        (Method::Post, ["nodes", _, "storage", storage, "download-url"]) => {
            let filename = field_str(&body, "filename").ok_or_else(|| api_err(method, path, 400, "filename missing"))?;
            let content = field_str(&body, "content").unwrap_or("import");
            let volid = format!("{storage}:{content}/{filename}");
            state.storage.entry(storage.to_string()).or_default().push(volid);
            Ok(new_task(state, node, "download"))
        }

        // QEMU
        (Method::Get, ["nodes", _, "qemu"]) => Ok(Value::Array(
            state
                .vms
                .iter()
                .map(|(id, vm)| {
                    json!({
                        "vmid": id,
                        "name": vm.config.get("name"),
                        "tags": vm.config.get("tags"),
                        "template": if vm.is_template() { 1 } else { 0 },
                        "status": if vm.running { "running" } else { "stopped" },
                    })
                })
                .collect(),
        )),
        (Method::Post, ["nodes", _, "qemu"]) => {
            let vmid = field(&body, "vmid")
                .and_then(crate::models::parse_vm_id)
                .ok_or_else(|| api_err(method, path, 400, "vmid missing"))?;
            if state.vms.contains_key(&vmid) {
                return Err(api_err(method, path, 500, format!("VM {vmid} already exists")));
            }
            let mut config = body.and_then(|b| b.as_object().cloned()).unwrap_or_default();
            config.remove("vmid");
            state.vms.insert(vmid, MockVm { config, running: false });
            Ok(new_task(state, node, "qmcreate"))
        }
        (_, ["nodes", _, "qemu", id, rest @ ..]) => {
            let vmid: u32 = id.parse().map_err(|_| not_found())?;
            route_vm(state, node, method, path, vmid, rest, body)
        }
        _ => Err(not_found()),
    }
}

fn route_vm(
    state: &mut MockState,
    node: &str,
    method: Method,
    path: &str,
    vmid: u32,
    rest: &[&str],
    body: Option<Value>,
) -> Result<Value> {
    let missing = || api_err(method, path, 500, format!("Configuration file for VM {vmid} does not exist"));
    if !state.vms.contains_key(&vmid) {
        return Err(missing());
    }

    match (method, rest) {
        (Method::Delete, []) => {
            let running = state.vms.get(&vmid).is_some_and(|vm| vm.running);
            if running {
                return Err(api_err(method, path, 500, format!("VM {vmid} is running - destroy failed")));
            }
            state.vms.remove(&vmid);
            Ok(new_task(state, node, "qmdestroy"))
        }
        (Method::Get, ["config"]) => {
            let vm = state.vms.get(&vmid).ok_or_else(missing)?;
            Ok(Value::Object(vm.config.clone()))
        }
        (Method::Post | Method::Put, ["config"]) => {
            let vm = state.vms.get_mut(&vmid).ok_or_else(missing)?;
            if let Some(Value::Object(update)) = body {
                for (k, v) in update {
                    if k == "delete" {
                        for key in v.as_str().unwrap_or_default().split(',') {
                            vm.config.remove(key.trim());
                        }
                    } else {
                        vm.config.insert(k, v);
                    }
                }
            }
            if method == Method::Post {
                Ok(new_task(state, node, "qmconfig"))
            } else {
                Ok(Value::Null)
            }
        }
        (Method::Post, ["clone"]) => {
            let newid = field(&body, "newid")
                .and_then(crate::models::parse_vm_id)
                .ok_or_else(|| api_err(method, path, 400, "newid missing"))?;
            if state.vms.contains_key(&newid) {
                return Err(api_err(method, path, 500, format!("VM {newid} already exists")));
            }
            let source = state.vms.get(&vmid).ok_or_else(missing)?;
            let mut config = source.config.clone();
            config.remove("template");
            if let Some(name) = field_str(&body, "name") {
                config.insert("name".into(), json!(name));
            }
            state.vms.insert(newid, MockVm { config, running: false });
            Ok(new_task(state, node, "qmclone"))
        }
        (Method::Post, ["template"]) => {
            let vm = state.vms.get_mut(&vmid).ok_or_else(missing)?;
            if vm.running {
                return Err(api_err(method, path, 500, "you can't convert a running VM to a template"));
            }
            vm.config.insert("template".into(), json!(1));
            Ok(new_task(state, node, "qmtemplate"))
        }
        (Method::Get, ["status", "current"]) => {
            let vm = state.vms.get(&vmid).ok_or_else(missing)?;
            let status = if vm.running { "running" } else { "stopped" };
            Ok(json!({"status": status, "qmpstatus": status}))
        }
        (Method::Post, ["status", action]) => {
            let vm = state.vms.get_mut(&vmid).ok_or_else(missing)?;
            let kind = match *action {
                "start" => {
                    if vm.is_template() {
                        return Err(api_err(method, path, 500, "cannot start a template"));
                    }
                    vm.running = true;
                    "qmstart"
                }
                "stop" | "shutdown" => {
                    vm.running = false;
                    "qmstop"
                }
                _ => return Err(api_err(method, path, 404, format!("unknown action {action}"))),
            };
            Ok(new_task(state, node, kind))
        }
        (Method::Post, ["agent", "ping"]) => {
            let vm = state.vms.get(&vmid).ok_or_else(missing)?;
            if !vm.running {
                return Err(api_err(method, path, 500, format!("VM {vmid} is not running")));
            }
            Ok(json!({}))
        }
        (Method::Post, ["agent", "exec"]) => {
            let vm = state.vms.get(&vmid).ok_or_else(missing)?;
            if !vm.running {
                return Err(api_err(method, path, 500, format!("VM {vmid} is not running")));
            }
            Ok(json!({"pid": 4242}))
        }
        (Method::Get, ["agent", "exec-status"]) => Ok(json!({
            "exited": 1,
            "exitcode": 0,
            "out-data": state.agent_output,
        })),
        _ => Err(api_err(method, path, 404, format!("no such route: {method} {path}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Api;

    fn api(mock: &MockControlPlane) -> Api {
        Api::new(Arc::new(mock.clone()))
    }

    #[tokio::test]
    async fn test_zone_lifecycle() {
        let mock = MockControlPlane::default();
        let api = api(&mock);
        api.post("/cluster/sdn/zones", json!({"zone": "abc123z", "type": "simple"}))
            .await
            .unwrap();
        api.post("/cluster/sdn/vnets", json!({"vnet": "abc123v0", "zone": "abc123z"}))
            .await
            .unwrap();

        let err = api.delete("/cluster/sdn/zones/abc123z").await.unwrap_err();
        assert!(!err.is_not_found());

        api.delete("/cluster/sdn/vnets/abc123v0").await.unwrap();
        api.delete("/cluster/sdn/zones/abc123z").await.unwrap();
        assert!(mock.zones().is_empty());

        let err = api.delete("/cluster/sdn/zones/abc123z").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_subnet_delete_blocked_by_lease() {
        let mock = MockControlPlane::default();
        mock.add_zone("z1");
        mock.add_vnet("v1", "z1", None);
        mock.add_subnet("v1", "192.168.5.0/24");
        mock.add_lease("v1", "192.168.5.10", None);
        let api = api(&mock);

        let err = api.delete("/cluster/sdn/vnets/v1/subnets/z1-192.168.5.0-24").await;
        assert!(err.is_err());
        api.delete("/cluster/sdn/vnets/v1/ips?ip=192.168.5.10&zone=z1")
            .await
            .unwrap();
        api.delete("/cluster/sdn/vnets/v1/subnets/z1-192.168.5.0-24")
            .await
            .unwrap();
        assert_eq!(mock.subnet_count(), 0);
    }

    #[tokio::test]
    async fn test_fault_injection_nth() {
        let mock = MockControlPlane::default();
        mock.fail_nth(Method::Get, "/cluster/nextid", 2, "boom");
        let api = api(&mock);
        assert!(api.get_value("/cluster/nextid").await.is_ok());
        assert!(api.get_value("/cluster/nextid").await.is_err());
        assert!(api.get_value("/cluster/nextid").await.is_ok());
        assert_eq!(mock.count(Method::Get, "/cluster/nextid"), 3);
    }

    #[tokio::test]
    async fn test_running_vm_cannot_be_destroyed() {
        let mock = MockControlPlane::default();
        mock.add_vm(120, "box", "", false, json!({}));
        let api = api(&mock);
        api.post("/nodes/pve/qemu/120/status/start", json!({})).await.unwrap();
        assert!(api.delete("/nodes/pve/qemu/120").await.is_err());
        api.post("/nodes/pve/qemu/120/status/stop", json!({})).await.unwrap();
        api.delete("/nodes/pve/qemu/120").await.unwrap();
        assert!(mock.vm_ids().is_empty());
    }

    #[tokio::test]
    async fn test_pending_tasks_resolve() {
        let mock = MockControlPlane::default();
        mock.set_task_polls(1);
        let api = api(&mock);
        api.put("/cluster/sdn", None).await.unwrap();

        let tasks: Vec<crate::models::ClusterTask> = api.get("/cluster/tasks").await.unwrap();
        assert!(tasks[0].status.is_none());
        let tasks: Vec<crate::models::ClusterTask> = api.get("/cluster/tasks").await.unwrap();
        assert_eq!(tasks[0].status.as_deref(), Some("OK"));
    }
}
