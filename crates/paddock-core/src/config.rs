//! Configuration: endpoint records, manager settings, per-run sandboxes.

use crate::error::{CoreError, Result};
use crate::network::NetworkMode;
use crate::record::ResourceRecord;
use crate::vm::{BuiltInImage, VmSource, VmSpec};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

#[derive(Deserialize)]
struct RecordsFile {
    instances: Vec<ResourceRecord>,
}

/// Parse a records file: `{"instances": [ ... ]}`.
pub fn parse_records(json: &str) -> Result<Vec<ResourceRecord>> {
    let file: RecordsFile = serde_json::from_str(json)?;
    let mut seen = HashSet::new();
    for record in &file.instances {
        if !seen.insert(record.instance_id()) {
            return Err(CoreError::Config(format!(
                "duplicate instance_id '{}'",
                record.instance_id()
            )));
        }
    }
    Ok(file.instances)
}

/// Load records from the process environment.
///
/// | Variable | Default |
/// |----------|---------|
/// | `PADDOCK_CONFIG_FILE` | unset; JSON records file |
/// | `PADDOCK_HOST` | unset; single legacy record if set |
/// | `PADDOCK_PORT` | `8006` |
/// | `PADDOCK_USER` | `root` |
/// | `PADDOCK_REALM` | `pam` |
/// | `PADDOCK_PASSWORD` | empty |
/// | `PADDOCK_NODE` | `proxmox` |
/// | `PADDOCK_VERIFY_TLS` | `1` |
pub fn load_records() -> Result<Vec<ResourceRecord>> {
    load_records_with(|key| std::env::var(key).ok())
}

/// [`load_records`] with an injectable variable lookup.
pub fn load_records_with(var: impl Fn(&str) -> Option<String>) -> Result<Vec<ResourceRecord>> {
    if let Some(path) = var("PADDOCK_CONFIG_FILE") {
        let json = std::fs::read_to_string(&path)
            .map_err(|e| CoreError::Config(format!("cannot read {path}: {e}")))?;
        let records = parse_records(&json)?;
        tracing::info!(path = %path, records = records.len(), "Loaded instance records");
        return Ok(records);
    }

    let Some(host) = var("PADDOCK_HOST") else {
        tracing::debug!("No instance configuration found");
        return Ok(Vec::new());
    };

    let port = match var("PADDOCK_PORT") {
        Some(p) => p
            .parse()
            .map_err(|_| CoreError::Config(format!("PADDOCK_PORT '{p}' is not a port")))?,
        None => 8006,
    };
    let record = ResourceRecord::new("default", "default", host)
        .with_port(port)
        .with_login(
            var("PADDOCK_USER").unwrap_or_else(|| "root".into()),
            var("PADDOCK_REALM").unwrap_or_else(|| "pam".into()),
        )
        .with_password(var("PADDOCK_PASSWORD").unwrap_or_default())
        .with_node(var("PADDOCK_NODE").unwrap_or_else(|| "proxmox".into()))
        .with_verify_tls(var("PADDOCK_VERIFY_TLS").map_or(true, |v| v != "0" && v != "false"));
    Ok(vec![record])
}

/// Process-level settings for the [`SandboxManager`](crate::SandboxManager).
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// Give up waiting for a free instance after this long. `None` waits
    /// indefinitely.
    pub acquire_timeout: Option<Duration>,
    /// Clean leftovers from an instance before provisioning on it.
    pub preflight_clean: bool,
    /// Storage for imported images.
    pub storage: String,
    /// Storage for VM disks.
    pub disk_storage: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: None,
            preflight_clean: true,
            storage: "local".into(),
            disk_storage: "local-lvm".into(),
        }
    }
}

impl ManagerConfig {
    /// Load from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `PADDOCK_ACQUIRE_TIMEOUT_SECS` | unset (wait forever) |
    /// | `PADDOCK_PREFLIGHT_CLEAN` | `true` |
    /// | `PADDOCK_STORAGE` | `local` |
    /// | `PADDOCK_DISK_STORAGE` | `local-lvm` |
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            acquire_timeout: std::env::var("PADDOCK_ACQUIRE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs),
            preflight_clean: std::env::var("PADDOCK_PREFLIGHT_CLEAN")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(default.preflight_clean),
            storage: std::env::var("PADDOCK_STORAGE").unwrap_or(default.storage),
            disk_storage: std::env::var("PADDOCK_DISK_STORAGE").unwrap_or(default.disk_storage),
        }
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    pub fn preflight_clean(mut self, enabled: bool) -> Self {
        self.preflight_clean = enabled;
        self
    }
}

/// What one run needs.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxConfig {
    /// Pool to take an instance from (default: `default`).
    pub pool_id: String,
    /// Networks for the run (default: generated).
    pub network: NetworkMode,
    /// VMs for the run (default: one built-in Ubuntu sandbox).
    pub vms: Vec<VmSpec>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            pool_id: "default".into(),
            network: NetworkMode::Auto,
            vms: vec![VmSpec::built_in(BuiltInImage::Ubuntu2404)],
        }
    }
}

impl SandboxConfig {
    /// Create a new config builder.
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }

    /// Built-in images the run's VMs need.
    pub fn builtins(&self) -> Vec<BuiltInImage> {
        let mut out = Vec::new();
        for vm in &self.vms {
            if let VmSource::BuiltIn(image) = vm.source {
                if !out.contains(&image) {
                    out.push(image);
                }
            }
        }
        out
    }

    /// Distinct NIC aliases in order of first use; `[None]` if there are none.
    pub fn nic_aliases(&self) -> Vec<Option<String>> {
        let mut out: Vec<Option<String>> = Vec::new();
        for alias in self.vms.iter().flat_map(VmSpec::aliases) {
            let alias = Some(alias.to_string());
            if !out.contains(&alias) {
                out.push(alias);
            }
        }
        if out.is_empty() {
            out.push(None);
        }
        out
    }

    /// Validate everything that can be checked without the control plane.
    pub fn validate(&self) -> Result<()> {
        if self.pool_id.is_empty() {
            return Err(CoreError::Config("pool_id is required".into()));
        }
        if self.vms.is_empty() {
            return Err(CoreError::InvalidVm("at least one VM is required".into()));
        }
        for vm in &self.vms {
            vm.validate()?;
        }
        if !self.vms.iter().any(|vm| vm.is_sandbox) {
            return Err(CoreError::InvalidVm("no VM is marked as a sandbox".into()));
        }
        if let NetworkMode::Explicit(network) = &self.network {
            network.validate()?;
        }
        Ok(())
    }
}

/// Builder for SandboxConfig.
#[derive(Debug, Default)]
pub struct SandboxConfigBuilder {
    config: SandboxConfig,
    vms_set: bool,
}

impl SandboxConfigBuilder {
    pub fn pool(mut self, pool_id: impl Into<String>) -> Self {
        self.config.pool_id = pool_id.into();
        self
    }

    pub fn network(mut self, mode: NetworkMode) -> Self {
        self.config.network = mode;
        self
    }

    /// Add a VM. The first call replaces the default VM.
    pub fn vm(mut self, spec: VmSpec) -> Self {
        if !self.vms_set {
            self.config.vms.clear();
            self.vms_set = true;
        }
        self.config.vms.push(spec);
        self
    }

    /// Build the configuration, validating it.
    pub fn build(self) -> Result<SandboxConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
