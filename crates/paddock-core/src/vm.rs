//! VM creation, lifecycle and golden images.
//!
//! Ownership is carried in tags, never in retained ids: every VM paddock
//! creates is tagged [`OWNER_TAG`], run VMs also carry `run-<namespace>`,
//! and built-in templates carry `builtin-<image>`.

use crate::error::{CoreError, Result};
use crate::namespace::{self, IdNamespace};
use crate::network::{CreatedNetwork, IpamMapping, NetworkProvisioner, VnetAlias};
use crate::retry::{retry, wait_until, Probe, RetryPolicy};
use crate::tasks::TaskTracker;
use paddock_pve::models::parse_vm_id;
use paddock_pve::{
    AgentExecStarted, AgentExecStatus, Api, StorageContent, VersionInfo, VmStatus, VmSummary,
};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Instant;

/// Marker tag on everything paddock owns.
pub const OWNER_TAG: &str = "paddock";

const OS_TYPES: &[&str] = &[
    "l24", "l26", "other", "solaris", "w2k", "w2k3", "w2k8", "win10", "win11", "win7", "win8",
    "wvista", "wxp",
];

// ============================================================================
// Built-in images
// ============================================================================

/// Images paddock knows how to turn into templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltInImage {
    Ubuntu2404,
    Debian13,
    Kali20253,
}

struct ImageSource {
    /// Where the control plane can fetch the file, if it can.
    url: Option<&'static str>,
    /// File name in the storage's import area.
    file: &'static str,
    /// Disk inside the file, for archives.
    inner: Option<&'static str>,
    min_version: Option<(u32, u32)>,
}

impl BuiltInImage {
    pub const ALL: [BuiltInImage; 3] = [Self::Ubuntu2404, Self::Debian13, Self::Kali20253];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ubuntu2404 => "ubuntu24.04",
            Self::Debian13 => "debian13",
            Self::Kali20253 => "kali2025.3",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|i| i.name() == name)
    }

    /// Tag identifying this image's template.
    pub fn tag(&self) -> String {
        format!("builtin-{}", self.name())
    }

    fn source(&self) -> ImageSource {
        match self {
            Self::Ubuntu2404 => ImageSource {
                url: Some("https://cloud-images.ubuntu.com/noble/current/noble-server-cloudimg-amd64.ova"),
                file: "noble-server-cloudimg-amd64.ova",
                inner: Some("ubuntu-noble-24.04-cloudimg.vmdk"),
                min_version: None,
            },
            Self::Debian13 => ImageSource {
                url: Some("https://cloud.debian.org/images/cloud/trixie/latest/debian-13-genericcloud-amd64.qcow2"),
                file: "debian-13-genericcloud-amd64.qcow2",
                inner: None,
                min_version: Some((9, 0)),
            },
            // Shipped only as .tar.xz, which download-url cannot unpack.
            Self::Kali20253 => ImageSource {
                url: None,
                file: "kali-2025.3-genericcloud-amd64.raw",
                inner: None,
                min_version: Some((9, 0)),
            },
        }
    }
}

impl fmt::Display for BuiltInImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// VM specification
// ============================================================================

/// Where a VM's disk comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmSource {
    /// Linked clone of a built-in template.
    BuiltIn(BuiltInImage),
    /// Linked clone of an existing template carrying this tag.
    TemplateTag(String),
    /// New VM importing this volume (e.g. `local:import/disk.qcow2`).
    ImportedImage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiskController {
    #[default]
    Scsi,
    Ide,
}

impl DiskController {
    fn slot(&self) -> &'static str {
        match self {
            Self::Scsi => "scsi0",
            Self::Ide => "ide0",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NicController {
    #[default]
    Virtio,
    E1000,
}

impl NicController {
    fn model(&self) -> &'static str {
        match self {
            Self::Virtio => "virtio",
            Self::E1000 => "e1000",
        }
    }
}

/// One network interface, attached by vnet alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicSpec {
    pub vnet_alias: String,
    pub mac: Option<String>,
    /// Fixed address; needs `mac` and produces an IPAM lease.
    pub ipv4: Option<Ipv4Addr>,
}

impl NicSpec {
    pub fn new(vnet_alias: impl Into<String>) -> Self {
        Self {
            vnet_alias: vnet_alias.into(),
            mac: None,
            ipv4: None,
        }
    }

    pub fn mac(mut self, mac: impl Into<String>) -> Self {
        self.mac = Some(mac.into());
        self
    }

    pub fn ipv4(mut self, ip: Ipv4Addr) -> Self {
        self.ipv4 = Some(ip);
        self
    }
}

/// What to build for one VM of a run.
///
/// `nics`: `None` attaches built-in and imported VMs to the run's first
/// vnet and leaves template clones as the template has them; `Some(vec![])`
/// removes every NIC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSpec {
    pub source: VmSource,
    pub name: Option<String>,
    pub ram_mb: u32,
    pub vcpus: u32,
    pub nics: Option<Vec<NicSpec>>,
    pub is_sandbox: bool,
    pub uefi_boot: bool,
    pub disk_controller: DiskController,
    pub nic_controller: NicController,
    pub os_type: String,
}

impl VmSpec {
    pub fn new(source: VmSource) -> Self {
        Self {
            source,
            name: None,
            ram_mb: 2048,
            vcpus: 2,
            nics: None,
            is_sandbox: true,
            uefi_boot: false,
            disk_controller: DiskController::default(),
            nic_controller: NicController::default(),
            os_type: "l26".into(),
        }
    }

    pub fn built_in(image: BuiltInImage) -> Self {
        Self::new(VmSource::BuiltIn(image))
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn ram_mb(mut self, mb: u32) -> Self {
        self.ram_mb = mb;
        self
    }

    pub fn vcpus(mut self, n: u32) -> Self {
        self.vcpus = n;
        self
    }

    pub fn nics(mut self, nics: Vec<NicSpec>) -> Self {
        self.nics = Some(nics);
        self
    }

    pub fn sandbox(mut self, is_sandbox: bool) -> Self {
        self.is_sandbox = is_sandbox;
        self
    }

    pub fn uefi(mut self, uefi: bool) -> Self {
        self.uefi_boot = uefi;
        self
    }

    pub fn disk_controller(mut self, c: DiskController) -> Self {
        self.disk_controller = c;
        self
    }

    pub fn nic_controller(mut self, c: NicController) -> Self {
        self.nic_controller = c;
        self
    }

    pub fn os_type(mut self, os_type: impl Into<String>) -> Self {
        self.os_type = os_type.into();
        self
    }

    /// Aliases this VM's NICs refer to.
    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.nics.iter().flatten().map(|n| n.vnet_alias.as_str())
    }

    pub fn validate(&self) -> Result<()> {
        if self.ram_mb == 0 {
            return Err(CoreError::InvalidVm("ram_mb must be > 0".into()));
        }
        if self.vcpus == 0 {
            return Err(CoreError::InvalidVm("vcpus must be > 0".into()));
        }
        if let Some(name) = &self.name {
            let valid = !name.is_empty()
                && name.len() <= 63
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
                && !name.starts_with('-')
                && !name.ends_with('-');
            if !valid {
                return Err(CoreError::InvalidVm(format!("'{name}' is not a valid DNS name")));
            }
        }
        if !OS_TYPES.contains(&self.os_type.as_str()) {
            return Err(CoreError::InvalidVm(format!("unknown os_type '{}'", self.os_type)));
        }
        for nic in self.nics.iter().flatten() {
            if nic.ipv4.is_some() && nic.mac.is_none() {
                return Err(CoreError::InvalidVm(format!(
                    "NIC on '{}' has a fixed address but no MAC",
                    nic.vnet_alias
                )));
            }
        }
        Ok(())
    }
}

/// A VM created for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedVm {
    pub vm_id: u32,
    pub name: Option<String>,
    pub is_sandbox: bool,
    /// Leases to register for fixed-address NICs.
    pub leases: Vec<IpamMapping>,
}

/// `template` config values arrive as numbers or strings.
fn is_template(config: &Map<String, Value>) -> bool {
    match config.get("template") {
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        Some(Value::String(s)) => s == "1",
        Some(Value::Bool(b)) => *b,
        _ => false,
    }
}

/// Vnets a VM config is bridged to.
pub fn bridges(config: &Map<String, Value>) -> Vec<String> {
    config
        .iter()
        .filter(|(k, _)| k.starts_with("net"))
        .filter_map(|(_, v)| v.as_str())
        .flat_map(|v| v.split(','))
        .filter_map(|part| part.strip_prefix("bridge="))
        .map(str::to_string)
        .collect()
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Drives VMs on one node.
pub struct VmOrchestrator {
    api: Api,
    node: String,
    tasks: TaskTracker,
    storage: String,
    disk_storage: String,
    lifecycle: RetryPolicy,
    config_write: RetryPolicy,
}

impl VmOrchestrator {
    pub fn new(api: Api, node: impl Into<String>, tasks: TaskTracker) -> Self {
        Self {
            api,
            node: node.into(),
            tasks,
            storage: "local".into(),
            disk_storage: "local-lvm".into(),
            lifecycle: RetryPolicy::vm_lifecycle(),
            config_write: RetryPolicy::config_write(),
        }
    }

    /// Storage holding imported images, and storage for VM disks.
    pub fn with_storage(mut self, storage: impl Into<String>, disk_storage: impl Into<String>) -> Self {
        self.storage = storage.into();
        self.disk_storage = disk_storage.into();
        self
    }

    fn qemu(&self, vm_id: u32, rest: &str) -> String {
        format!("/nodes/{}/qemu/{vm_id}{rest}", self.node)
    }

    pub async fn next_vm_id(&self) -> Result<u32> {
        let value = self.api.get_value("/cluster/nextid").await?;
        parse_vm_id(&value).ok_or_else(|| {
            CoreError::Remote(paddock_pve::PveError::Unexpected {
                path: "/cluster/nextid".into(),
                message: format!("not a vm id: {value}"),
            })
        })
    }

    pub async fn list_vms(&self) -> Result<Vec<VmSummary>> {
        Ok(self.api.get(&format!("/nodes/{}/qemu", self.node)).await?)
    }

    pub async fn vm_config(&self, vm_id: u32) -> Result<Map<String, Value>> {
        Ok(self.api.get(&self.qemu(vm_id, "/config")).await?)
    }

    async fn update_config(&self, vm_id: u32, body: Value) -> Result<()> {
        let path = self.qemu(vm_id, "/config");
        retry("config write", &self.config_write, || {
            let body = body.clone();
            let path = path.clone();
            async move {
                self.api.post(&path, body).await?;
                Ok(())
            }
        })
        .await
    }

    /// Ensure the node runs at least `major.minor`.
    pub async fn ensure_version(&self, major: u32, minor: u32) -> Result<()> {
        let info: VersionInfo = self.api.get(&format!("/nodes/{}/version", self.node)).await?;
        let (have_major, have_minor) = info.major_minor().ok_or_else(|| {
            CoreError::Config(format!("could not parse hypervisor version '{}'", info.version))
        })?;
        if (have_major, have_minor) < (major, minor) {
            return Err(CoreError::Config(format!(
                "hypervisor version {} does not meet minimum requirement {major}.{minor}",
                info.version
            )));
        }
        Ok(())
    }

    /// Templates of built-in images, found by tag.
    pub async fn find_builtins(&self) -> Result<HashMap<BuiltInImage, u32>> {
        let vms = self.list_vms().await?;
        let mut found = HashMap::new();
        for image in BuiltInImage::ALL {
            let tag = image.tag();
            if let Some(vm) = vms
                .iter()
                .find(|vm| vm.template && vm.has_tag(OWNER_TAG) && vm.has_tag(&tag))
            {
                found.insert(image, vm.vmid);
            }
        }
        Ok(found)
    }

    /// VMs paddock created that are not templates.
    pub async fn owned_vms(&self) -> Result<Vec<VmSummary>> {
        Ok(self
            .list_vms()
            .await?
            .into_iter()
            .filter(|vm| !vm.template && vm.has_tag(OWNER_TAG))
            .collect())
    }

    async fn content_exists(&self, file: &str) -> Result<bool> {
        let content: Vec<StorageContent> = self
            .api
            .get(&format!("/nodes/{}/storage/{}/content", self.node, self.storage))
            .await?;
        Ok(content.iter().any(|c| c.volid.ends_with(file)))
    }

    async fn ensure_source_uploaded(&self, image: BuiltInImage) -> Result<()> {
        let source = image.source();
        if self.content_exists(source.file).await? {
            tracing::debug!(image = %image, "Source image already uploaded");
            return Ok(());
        }
        let Some(url) = source.url else {
            return Err(CoreError::Config(format!(
                "{} must be uploaded to storage '{}' before {image} can be built",
                source.file, self.storage
            )));
        };

        tracing::info!(image = %image, url, "Downloading source image");
        self.api
            .post(
                &format!("/nodes/{}/storage/{}/download-url", self.node, self.storage),
                json!({"url": url, "filename": source.file, "content": "import"}),
            )
            .await?;

        let file = source.file;
        wait_until("source image upload", &self.lifecycle, move || async move {
            Ok(if self.content_exists(file).await? {
                Probe::Ready(())
            } else {
                Probe::Pending
            })
        })
        .await
    }

    /// Ensure a template for `image` exists and return its id.
    ///
    /// Skips everything if a template carrying the image tag is present.
    pub async fn ensure_builtin(&self, image: BuiltInImage, network: &NetworkProvisioner) -> Result<u32> {
        if let Some(id) = self.find_builtins().await?.get(&image) {
            return Ok(*id);
        }

        let start = Instant::now();
        let source = image.source();
        if let Some((major, minor)) = source.min_version {
            self.ensure_version(major, minor).await?;
        }
        let vm_id = self.next_vm_id().await?;
        tracing::info!(image = %image, vm_id, "Building built-in template");

        self.ensure_source_uploaded(image).await?;
        network.ensure_static_network().await?;

        let import = match source.inner {
            Some(inner) => format!("import/{}/{inner}", source.file),
            None => format!("import/{}", source.file),
        };
        let body = json!({
            "vmid": vm_id,
            "name": format!("{OWNER_TAG}-{}", image.name().replace('.', "-")),
            "cpu": "host",
            "memory": 8192,
            "cores": 2,
            "ostype": "l26",
            "scsi0": format!(
                "{}:0,import-from={}:{import},format=qcow2,cache=writeback",
                self.disk_storage, self.storage
            ),
            "scsihw": "virtio-scsi-single",
            "net0": format!("virtio,bridge={}", namespace::static_vnet_id()),
            "serial0": "socket",
            "agent": "enabled=1",
            "tags": format!("{OWNER_TAG},{}", image.tag()),
        });
        let create_path = format!("/nodes/{}/qemu", self.node);
        self.tasks
            .run_and_wait("create template VM", || async {
                self.api.post(&create_path, body).await?;
                Ok(())
            })
            .await?;

        self.update_config(vm_id, json!({"ide2": format!("{}:cloudinit", self.disk_storage)}))
            .await?;

        self.start_vm(vm_id).await?;
        self.wait_for_status(vm_id, "running").await?;
        self.wait_for_agent(vm_id).await?;
        self.wait_for_first_boot(vm_id).await?;

        self.tasks
            .run_and_wait("shutdown template VM", || async {
                self.api.post(&self.qemu(vm_id, "/status/shutdown"), json!({})).await?;
                Ok(())
            })
            .await?;
        self.wait_for_status(vm_id, "stopped").await?;

        self.tasks
            .run_and_wait("convert to template", || async {
                self.api.post(&self.qemu(vm_id, "/template"), json!({})).await?;
                Ok(())
            })
            .await?;
        wait_until("template conversion", &self.config_write, move || async move {
            let config: Map<String, Value> =
                self.api.get(&self.qemu(vm_id, "/config?current=1")).await?;
            Ok(if is_template(&config) {
                Probe::Ready(())
            } else {
                Probe::Pending
            })
        })
        .await?;

        self.update_config(vm_id, json!({"ide2": "none,media=cdrom"})).await?;

        tracing::info!(
            image = %image,
            vm_id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Built-in template ready"
        );
        Ok(vm_id)
    }

    /// Run `cloud-init status --wait` in the guest and check it finished.
    async fn wait_for_first_boot(&self, vm_id: u32) -> Result<()> {
        let started: AgentExecStarted = serde_json::from_value(
            self.api
                .post(
                    &self.qemu(vm_id, "/agent/exec"),
                    json!({"command": ["cloud-init", "status", "--wait"]}),
                )
                .await?,
        )?;
        let path = self.qemu(vm_id, &format!("/agent/exec-status?pid={}", started.pid));

        let path = &path;
        wait_until("first boot", &self.lifecycle, move || async move {
            let status: AgentExecStatus = self.api.get(path).await?;
            if !status.exited {
                return Ok(Probe::Pending);
            }
            let out = status.out_data.unwrap_or_default();
            if out.contains("status: done") {
                Ok(Probe::Ready(()))
            } else {
                Ok(Probe::Failed(CoreError::Failed {
                    operation: format!("cloud-init on VM {vm_id}"),
                    message: format!("{} {}", out.trim(), status.err_data.unwrap_or_default().trim()),
                }))
            }
        })
        .await
    }

    async fn find_template(&self, tag: &str) -> Result<u32> {
        self.list_vms()
            .await?
            .into_iter()
            .find(|vm| vm.template && vm.has_tag(tag))
            .map(|vm| vm.vmid)
            .ok_or_else(|| CoreError::InvalidVm(format!("no template tagged '{tag}'")))
    }

    /// Resolve NIC specs to `net<i>` config values and leases.
    fn plan_nics(
        &self,
        spec: &VmSpec,
        network: &CreatedNetwork,
    ) -> Result<(Option<Vec<String>>, Vec<IpamMapping>)> {
        let model = spec.nic_controller.model();
        let Some(nics) = &spec.nics else {
            return match spec.source {
                VmSource::TemplateTag(_) => Ok((None, Vec::new())),
                _ => {
                    let first = network.first().ok_or_else(|| {
                        CoreError::InvalidVm("no vnet available to attach to".into())
                    })?;
                    Ok((Some(vec![format!("{model},bridge={}", first.vnet)]), Vec::new()))
                }
            };
        };

        let mut lines = Vec::with_capacity(nics.len());
        let mut leases = Vec::new();
        for nic in nics {
            let VnetAlias { vnet, zone, .. } = network.resolve(&nic.vnet_alias).ok_or_else(|| {
                CoreError::InvalidVm(format!("unknown vnet alias '{}'", nic.vnet_alias))
            })?;
            lines.push(match &nic.mac {
                Some(mac) => format!("{model}={mac},bridge={vnet}"),
                None => format!("{model},bridge={vnet}"),
            });
            if let (Some(ip), Some(mac)) = (nic.ipv4, &nic.mac) {
                leases.push(IpamMapping {
                    vnet: vnet.clone(),
                    zone: zone.clone(),
                    mac: mac.clone(),
                    ipv4: ip,
                });
            }
        }
        Ok((Some(lines), leases))
    }

    /// Create (but do not start) one VM of a run.
    ///
    /// A VM that fails after its create or clone is destroyed again before
    /// the error is returned.
    pub async fn create_vm(&self, spec: &VmSpec, ns: &IdNamespace, network: &CreatedNetwork) -> Result<CreatedVm> {
        spec.validate()?;
        let (nets, leases) = self.plan_nics(spec, network)?;
        let vm_id = self.next_vm_id().await?;
        let name = spec.name.clone().unwrap_or_else(|| format!("{ns}-{vm_id}"));

        self.create_disk(spec, ns, vm_id, &name).await?;
        if let Err(e) = self.configure_vm(spec, ns, vm_id, nets).await {
            tracing::warn!(vm_id, error = %e, "VM setup failed, destroying it");
            if let Err(cleanup) = self.destroy_vm(vm_id).await {
                tracing::error!(vm_id, error = %cleanup, "Could not destroy half-built VM");
            }
            return Err(e);
        }

        tracing::info!(vm_id, name = %name, namespace = %ns, "VM created");
        Ok(CreatedVm {
            vm_id,
            name: spec.name.clone(),
            is_sandbox: spec.is_sandbox,
            leases,
        })
    }

    /// Clone or import the VM's disk under `vm_id`.
    async fn create_disk(&self, spec: &VmSpec, ns: &IdNamespace, vm_id: u32, name: &str) -> Result<()> {
        match &spec.source {
            VmSource::BuiltIn(image) => {
                let template = self
                    .find_builtins()
                    .await?
                    .get(image)
                    .copied()
                    .ok_or_else(|| CoreError::InvalidVm(format!("built-in {image} is not available")))?;
                self.clone_vm(template, vm_id, name).await
            }
            VmSource::TemplateTag(tag) => {
                let template = self.find_template(tag).await?;
                self.clone_vm(template, vm_id, name).await
            }
            VmSource::ImportedImage(volume) => {
                let mut body = json!({
                    "vmid": vm_id,
                    "name": name,
                    "ostype": spec.os_type,
                    "agent": "enabled=1",
                    "serial0": "socket",
                    "tags": format!("{OWNER_TAG};{}", ns.run_tag()),
                });
                body[spec.disk_controller.slot()] =
                    json!(format!("{}:0,import-from={volume}", self.disk_storage));
                if spec.disk_controller == DiskController::Scsi {
                    body["scsihw"] = json!("virtio-scsi-single");
                }
                if spec.uefi_boot {
                    body["efidisk0"] = json!(format!("{}:1", self.disk_storage));
                }
                let path = format!("/nodes/{}/qemu", self.node);
                self.tasks
                    .run_and_wait("create VM", || async {
                        self.api.post(&path, body).await?;
                        Ok(())
                    })
                    .await
            }
        }
    }

    /// Size, tag and re-network a freshly created VM.
    async fn configure_vm(
        &self,
        spec: &VmSpec,
        ns: &IdNamespace,
        vm_id: u32,
        nets: Option<Vec<String>>,
    ) -> Result<()> {
        let mut update = json!({
            "memory": spec.ram_mb,
            "cores": spec.vcpus,
            "tags": format!("{OWNER_TAG};{}", ns.run_tag()),
        });
        if spec.uefi_boot {
            update["bios"] = json!("ovmf");
        }
        if let Some(nets) = nets {
            let current = self.vm_config(vm_id).await?;
            let stale: Vec<String> = current
                .keys()
                .filter(|k| k.starts_with("net"))
                .filter(|k| k[3..].parse::<usize>().is_ok_and(|i| i >= nets.len()))
                .cloned()
                .collect();
            for (i, line) in nets.iter().enumerate() {
                update[format!("net{i}")] = json!(line);
            }
            if !stale.is_empty() {
                update["delete"] = json!(stale.join(","));
            }
        }
        self.update_config(vm_id, update).await
    }

    async fn clone_vm(&self, template: u32, vm_id: u32, name: &str) -> Result<()> {
        let path = self.qemu(template, "/clone");
        self.tasks
            .run_and_wait("clone VM", || async {
                self.api
                    .post(&path, json!({"newid": vm_id, "name": name, "full": 0}))
                    .await?;
                Ok(())
            })
            .await
    }

    pub async fn start_vm(&self, vm_id: u32) -> Result<()> {
        self.tasks
            .run_and_wait("start VM", || async {
                self.api.post(&self.qemu(vm_id, "/status/start"), json!({})).await?;
                Ok(())
            })
            .await
    }

    async fn wait_for_status(&self, vm_id: u32, wanted: &'static str) -> Result<()> {
        let op = format!("VM {vm_id} {wanted}");
        wait_until(&op, &self.lifecycle, move || async move {
            let status: VmStatus = self.api.get(&self.qemu(vm_id, "/status/current")).await?;
            Ok(if status.status == wanted {
                Probe::Ready(())
            } else {
                Probe::Pending
            })
        })
        .await
    }

    async fn wait_for_agent(&self, vm_id: u32) -> Result<()> {
        wait_until("guest agent", &self.lifecycle, move || async move {
            self.api.post(&self.qemu(vm_id, "/agent/ping"), json!({})).await?;
            Ok(Probe::Ready(()))
        })
        .await
    }

    /// Wait until a started VM is running and, for sandboxes, its guest
    /// agent answers.
    pub async fn await_vm(&self, vm_id: u32, is_sandbox: bool) -> Result<()> {
        self.wait_for_status(vm_id, "running").await?;
        if is_sandbox {
            self.wait_for_agent(vm_id).await?;
        }
        tracing::debug!(vm_id, is_sandbox, "VM ready");
        Ok(())
    }

    /// Stop and delete a VM. A VM that is already gone counts as success.
    pub async fn destroy_vm(&self, vm_id: u32) -> Result<()> {
        match self.api.post(&self.qemu(vm_id, "/status/stop"), json!({})).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                tracing::warn!(vm_id, "VM already gone");
                return Ok(());
            }
            Err(e) => tracing::debug!(vm_id, error = %e, "Stop failed, continuing"),
        }

        let op = format!("VM {vm_id} stopped");
        wait_until(&op, &self.lifecycle, move || async move {
            match self.api.get::<VmStatus>(&self.qemu(vm_id, "/status/current")).await {
                Ok(s) if s.status == "stopped" => Ok(Probe::Ready(())),
                Ok(_) => Ok(Probe::Pending),
                Err(e) if e.is_not_found() => Ok(Probe::Ready(())),
                Err(e) => Err(e.into()),
            }
        })
        .await?;

        let path = self.qemu(vm_id, "?purge=1&destroy-unreferenced-disks=1");
        let result = self
            .tasks
            .run_and_wait("destroy VM", || async {
                self.api.delete(&path).await?;
                Ok(())
            })
            .await;
        match result {
            Ok(()) => {
                tracing::info!(vm_id, "VM destroyed");
                Ok(())
            }
            Err(CoreError::Remote(e)) if e.is_not_found() => {
                tracing::warn!(vm_id, "VM already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_names_roundtrip() {
        for image in BuiltInImage::ALL {
            assert_eq!(BuiltInImage::parse(image.name()), Some(image));
        }
        assert_eq!(BuiltInImage::parse("centos"), None);
        assert_eq!(BuiltInImage::Debian13.tag(), "builtin-debian13");
    }

    #[test]
    fn test_spec_defaults() {
        let spec = VmSpec::built_in(BuiltInImage::Ubuntu2404);
        assert_eq!(spec.ram_mb, 2048);
        assert_eq!(spec.vcpus, 2);
        assert!(spec.is_sandbox);
        assert_eq!(spec.os_type, "l26");
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_spec_validation() {
        let base = VmSpec::built_in(BuiltInImage::Ubuntu2404);
        assert!(base.clone().ram_mb(0).validate().is_err());
        assert!(base.clone().name("not_dns").validate().is_err());
        assert!(base.clone().name("web-1").validate().is_ok());
        assert!(base.clone().os_type("beos").validate().is_err());

        let fixed = NicSpec::new("lan").ipv4(Ipv4Addr::new(192, 168, 3, 10));
        assert!(base.clone().nics(vec![fixed.clone()]).validate().is_err());
        assert!(base.nics(vec![fixed.mac("52:54:00:12:34:56")]).validate().is_ok());
    }

    #[test]
    fn test_bridges() {
        let config: Map<String, Value> = serde_json::from_value(json!({
            "net0": "virtio=52:54:00:00:00:01,bridge=abc123v0",
            "net1": "e1000,bridge=abc123v1,firewall=1",
            "scsi0": "local-lvm:vm-100-disk-0",
        }))
        .unwrap();
        let mut b = bridges(&config);
        b.sort();
        assert_eq!(b, vec!["abc123v0".to_string(), "abc123v1".to_string()]);
    }

    #[test]
    fn test_is_template() {
        let t: Map<String, Value> = serde_json::from_value(json!({"template": 1})).unwrap();
        let s: Map<String, Value> = serde_json::from_value(json!({"template": "1"})).unwrap();
        let n: Map<String, Value> = serde_json::from_value(json!({})).unwrap();
        assert!(is_template(&t));
        assert!(is_template(&s));
        assert!(!is_template(&n));
    }
}
