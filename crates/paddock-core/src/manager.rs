//! Sandbox manager - the provisioning lifecycle.
//!
//! A run checks a record out of the [`InstancePool`], builds its network
//! and VMs on that endpoint, and later tears them down again. The record
//! goes back into the pool only when the endpoint is known to be clean.

use crate::config::{ManagerConfig, SandboxConfig};
use crate::error::{CoreError, Result};
use crate::lock::EndpointLocks;
use crate::namespace::{self, IdNamespace, NamespaceAllocator};
use crate::network::{NetworkMode, NetworkProvisioner};
use crate::pool::InstancePool;
use crate::record::{distinct_endpoints, ResourceRecord};
use crate::tasks::TaskTracker;
use crate::teardown::{CleanupPlan, RunResources, TeardownCoordinator};
use crate::vm::{CreatedVm, VmOrchestrator};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use paddock_pve::{Api, ControlPlane, PveClient};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

// ============================================================================
// Connecting to endpoints
// ============================================================================

/// Turns a record into a live control-plane connection.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, record: &ResourceRecord) -> Result<Arc<dyn ControlPlane>>;
}

/// Connects over HTTPS with the record's credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct PveConnector;

#[async_trait]
impl Connector for PveConnector {
    async fn connect(&self, record: &ResourceRecord) -> Result<Arc<dyn ControlPlane>> {
        let client = PveClient::new(
            record.host(),
            record.port(),
            record.login_user(),
            record.password(),
            record.verify_tls(),
        )?;
        Ok(Arc::new(client))
    }
}

/// Everything needed to work on one endpoint.
struct Endpoint {
    api: Api,
    network: NetworkProvisioner,
    vms: VmOrchestrator,
}

impl Endpoint {
    fn teardown(&self) -> TeardownCoordinator<'_> {
        TeardownCoordinator::new(&self.network, &self.vms)
    }
}

// ============================================================================
// Runs
// ============================================================================

/// A sandbox VM of a provisioned run.
///
/// Only identifies the VM; running commands or moving files in the guest
/// is up to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxVm {
    pub vm_id: u32,
    pub name: Option<String>,
}

/// A provisioned run, handed back to [`SandboxManager::release`] when done.
#[derive(Debug)]
pub struct ProvisionedRun {
    record: ResourceRecord,
    namespace: IdNamespace,
    resources: RunResources,
    sandboxes: BTreeMap<String, SandboxVm>,
    created_at: DateTime<Utc>,
}

impl ProvisionedRun {
    /// The endpoint the run lives on.
    pub fn record(&self) -> &ResourceRecord {
        &self.record
    }

    pub fn namespace(&self) -> &IdNamespace {
        &self.namespace
    }

    pub fn resources(&self) -> &RunResources {
        &self.resources
    }

    /// Sandboxes by name. The first sandbox VM is always `default`.
    pub fn sandboxes(&self) -> &BTreeMap<String, SandboxVm> {
        &self.sandboxes
    }

    pub fn sandbox(&self, name: &str) -> Option<&SandboxVm> {
        self.sandboxes.get(name)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Name sandboxes: `default` for the first, then by VM name or `vm_<id>`.
fn name_sandboxes(vms: &[CreatedVm]) -> Result<BTreeMap<String, SandboxVm>> {
    let mut sandboxes = BTreeMap::new();
    for vm in vms.iter().filter(|vm| vm.is_sandbox) {
        let key = if sandboxes.is_empty() {
            "default".to_string()
        } else {
            vm.name.clone().unwrap_or_else(|| format!("vm_{}", vm.vm_id))
        };
        sandboxes.insert(
            key,
            SandboxVm {
                vm_id: vm.vm_id,
                name: vm.name.clone(),
            },
        );
    }
    if sandboxes.is_empty() {
        return Err(CoreError::InvalidVm("no VM is marked as a sandbox".into()));
    }
    Ok(sandboxes)
}

// ============================================================================
// Statistics
// ============================================================================

/// Manager statistics for observability.
#[derive(Debug, Default)]
pub struct ManagerStats {
    /// Runs fully provisioned
    pub provisioned: AtomicU64,
    /// Runs torn down and released
    pub released: AtomicU64,
    /// Discovery-mode cleanups executed
    pub discovery_cleanups: AtomicU64,
}

impl ManagerStats {
    pub fn provisioned(&self) -> u64 {
        self.provisioned.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    pub fn discovery_cleanups(&self) -> u64 {
        self.discovery_cleanups.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Provisions and releases sandbox runs on pooled endpoints.
pub struct SandboxManager {
    config: ManagerConfig,
    connector: Arc<dyn Connector>,
    pool: InstancePool,
    locks: EndpointLocks,
    namespaces: NamespaceAllocator,
    rng: Mutex<StdRng>,
    stats: ManagerStats,
}

impl SandboxManager {
    pub fn new(config: ManagerConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            pool: InstancePool::new(),
            locks: EndpointLocks::new(),
            namespaces: NamespaceAllocator::new(),
            rng: Mutex::new(StdRng::from_os_rng()),
            stats: ManagerStats::default(),
        }
    }

    /// Derive all randomness from `seed` (tests).
    pub fn with_seed(mut self, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        self.namespaces = NamespaceAllocator::with_rng(StdRng::seed_from_u64(rng.random()));
        self.rng = Mutex::new(rng);
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn pool(&self) -> &InstancePool {
        &self.pool
    }

    pub fn stats(&self) -> &ManagerStats {
        &self.stats
    }

    /// Records withheld from circulation as possibly dirty.
    pub fn withheld(&self) -> u64 {
        self.pool.stats().withheld()
    }

    /// Create the pools for `records`. Idempotent.
    pub async fn initialize(&self, records: Vec<ResourceRecord>) {
        self.pool.initialize(records).await;
    }

    async fn endpoint(&self, record: &ResourceRecord) -> Result<Endpoint> {
        let api = Api::new(self.connector.connect(record).await?);
        let tasks = TaskTracker::new(api.clone());
        let seed = self.rng.lock().unwrap_or_else(|e| e.into_inner()).random();
        let network =
            NetworkProvisioner::new(api.clone(), tasks.clone()).with_rng(StdRng::seed_from_u64(seed));
        let vms = VmOrchestrator::new(api.clone(), record.node(), tasks)
            .with_storage(&self.config.storage, &self.config.disk_storage);
        Ok(Endpoint { api, network, vms })
    }

    async fn acquire(&self, pool_id: &str) -> Result<ResourceRecord> {
        match self.config.acquire_timeout {
            Some(deadline) => self.pool.acquire_timeout(pool_id, deadline).await,
            None => self.pool.acquire(pool_id).await,
        }
    }

    /// Return `record` to its pool if `clean`, otherwise keep it out.
    fn check_in(&self, record: ResourceRecord, clean: bool) {
        if clean {
            let pool_id = record.pool_id().to_string();
            self.pool.release(&pool_id, record);
        } else {
            self.pool.withhold(&record);
        }
    }

    async fn discovery_cleanup(&self, endpoint: &Endpoint) -> Result<CleanupPlan> {
        self.stats.discovery_cleanups.fetch_add(1, Ordering::Relaxed);
        endpoint.teardown().cleanup_discovered().await
    }

    /// Provision a run called `run_name`.
    ///
    /// On failure after infrastructure creation began, discovery cleanup
    /// runs before the error is returned. The record is released only if
    /// that cleanup succeeded; the error returned is always the original.
    pub async fn provision(&self, run_name: &str, config: &SandboxConfig) -> Result<ProvisionedRun> {
        config.validate()?;
        let record = self.acquire(&config.pool_id).await?;

        let endpoint = match self.endpoint(&record).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                tracing::error!(instance_id = %record.instance_id(), error = %e, "Could not connect");
                self.check_in(record, true);
                return Err(e);
            }
        };

        let guard = self.locks.lock(&record.endpoint()).await;
        let start = Instant::now();
        let mut started = false;
        let result = self
            .build(&endpoint, &record, run_name, config, &mut started)
            .await;

        match result {
            Ok((namespace, resources, sandboxes)) => {
                drop(guard);
                self.stats.provisioned.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    run = run_name,
                    instance_id = %record.instance_id(),
                    namespace = %namespace,
                    vms = resources.vm_ids.len(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Run provisioned"
                );
                Ok(ProvisionedRun {
                    record,
                    namespace,
                    resources,
                    sandboxes,
                    created_at: Utc::now(),
                })
            }
            Err(e) => {
                tracing::error!(run = run_name, instance_id = %record.instance_id(), error = %e, "Provisioning failed");
                let clean = if started {
                    match self.discovery_cleanup(&endpoint).await {
                        Ok(_) => true,
                        Err(cleanup) => {
                            tracing::error!(
                                instance_id = %record.instance_id(),
                                error = %cleanup,
                                "Cleanup after failed provisioning failed"
                            );
                            false
                        }
                    }
                } else {
                    true
                };
                drop(guard);
                self.check_in(record, clean);
                Err(e)
            }
        }
    }

    async fn build(
        &self,
        endpoint: &Endpoint,
        record: &ResourceRecord,
        run_name: &str,
        config: &SandboxConfig,
        started: &mut bool,
    ) -> Result<(IdNamespace, RunResources, BTreeMap<String, SandboxVm>)> {
        if self.config.preflight_clean {
            self.preflight(endpoint, record).await;
        }

        let ns = self.namespaces.allocate(&endpoint.api, run_name).await?;
        *started = true;

        for image in config.builtins() {
            endpoint.vms.ensure_builtin(image, &endpoint.network).await?;
        }

        let network = match &config.network {
            NetworkMode::Auto => {
                let generated = endpoint
                    .network
                    .generate_network_config(&config.nic_aliases())
                    .await?;
                endpoint.network.create(&ns, Some(&generated)).await?
            }
            NetworkMode::Explicit(explicit) => endpoint.network.create(&ns, Some(explicit)).await?,
            NetworkMode::Existing => endpoint.network.create(&ns, None).await?,
        };

        let mut resources = RunResources {
            zone: network.zone.clone(),
            ..Default::default()
        };
        let mut created = Vec::with_capacity(config.vms.len());
        for spec in &config.vms {
            let vm = endpoint.vms.create_vm(spec, &ns, &network).await?;
            resources.vm_ids.push(vm.vm_id);
            created.push(vm);
        }

        for lease in created.iter().flat_map(|vm| &vm.leases) {
            endpoint.network.create_lease(lease).await?;
            resources.leases.push(lease.clone());
        }

        for vm in &created {
            endpoint.vms.start_vm(vm.vm_id).await?;
        }
        futures::future::try_join_all(
            created
                .iter()
                .map(|vm| endpoint.vms.await_vm(vm.vm_id, vm.is_sandbox)),
        )
        .await?;

        let sandboxes = name_sandboxes(&created)?;
        Ok((ns, resources, sandboxes))
    }

    /// Clean leftovers before use. Failures are logged, never raised.
    async fn preflight(&self, endpoint: &Endpoint, record: &ResourceRecord) {
        let static_vnet = namespace::static_vnet_id();
        let leftovers = match endpoint.network.list_vnets().await {
            Ok(vnets) => vnets.iter().any(|v| v.vnet != static_vnet),
            Err(e) => {
                tracing::warn!(instance_id = %record.instance_id(), error = %e, "Pre-flight check failed");
                return;
            }
        };
        if !leftovers {
            return;
        }
        tracing::warn!(instance_id = %record.instance_id(), "Leftover vnets found, cleaning up");
        if let Err(e) = self.discovery_cleanup(endpoint).await {
            tracing::error!(instance_id = %record.instance_id(), error = %e, "Pre-flight cleanup failed");
        }
    }

    /// Tear down `run` and return its record to the pool if that worked.
    pub async fn release(&self, run: ProvisionedRun) -> Result<()> {
        let ProvisionedRun {
            record,
            namespace,
            resources,
            ..
        } = run;

        let endpoint = match self.endpoint(&record).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.check_in(record, false);
                return Err(e);
            }
        };

        let guard = self.locks.lock(&record.endpoint()).await;
        let result = endpoint.teardown().delete_run(&resources).await;
        drop(guard);

        match result {
            Ok(()) => {
                self.stats.released.fetch_add(1, Ordering::Relaxed);
                tracing::info!(instance_id = %record.instance_id(), namespace = %namespace, "Run torn down");
                self.check_in(record, true);
                Ok(())
            }
            Err(e) => {
                tracing::error!(instance_id = %record.instance_id(), namespace = %namespace, error = %e, "Teardown failed");
                self.check_in(record, false);
                Err(e)
            }
        }
    }

    /// What discovery cleanup would delete on `record`'s endpoint.
    pub async fn plan_cleanup(&self, record: &ResourceRecord) -> Result<CleanupPlan> {
        let endpoint = self.endpoint(record).await?;
        let _guard = self.locks.lock(&record.endpoint()).await;
        endpoint.teardown().plan_discovery().await
    }

    /// Execute a plan from [`plan_cleanup`](Self::plan_cleanup).
    pub async fn execute_cleanup(&self, record: &ResourceRecord, plan: &CleanupPlan) -> Result<()> {
        let endpoint = self.endpoint(record).await?;
        let _guard = self.locks.lock(&record.endpoint()).await;
        self.stats.discovery_cleanups.fetch_add(1, Ordering::Relaxed);
        endpoint.teardown().execute(plan).await
    }

    /// Re-initialize the pools for `records` and run discovery cleanup on
    /// every distinct endpoint among them.
    pub async fn cleanup_all(&self, records: Vec<ResourceRecord>) -> Result<()> {
        self.pool.initialize(records.clone()).await;

        let mut failures = Vec::new();
        for record in distinct_endpoints(&records) {
            let result = async {
                let endpoint = self.endpoint(record).await?;
                let _guard = self.locks.lock(&record.endpoint()).await;
                self.discovery_cleanup(&endpoint).await
            }
            .await;
            match result {
                Ok(plan) => tracing::info!(
                    instance_id = %record.instance_id(),
                    vms = plan.vms.len(),
                    zones = plan.zones.len(),
                    "Endpoint cleaned"
                ),
                Err(e) => {
                    tracing::error!(instance_id = %record.instance_id(), error = %e, "Endpoint cleanup failed");
                    failures.push(format!("{}: {e}", record.instance_id()));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Cleanup(failures.join("; ")))
        }
    }

    /// Cleanup of a single run by id is not supported; use
    /// [`cleanup_all`](Self::cleanup_all).
    pub async fn cleanup_by_id(&self, id: &str) -> Result<()> {
        tracing::warn!(id, "Cleanup by id requested");
        Err(CoreError::NotImplemented("cleanup by id".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paddock_pve::MockControlPlane;

    struct Fixed(MockControlPlane);

    #[async_trait]
    impl Connector for Fixed {
        async fn connect(&self, _record: &ResourceRecord) -> Result<Arc<dyn ControlPlane>> {
            Ok(Arc::new(self.0.clone()))
        }
    }

    fn created(vm_id: u32, name: Option<&str>, is_sandbox: bool) -> CreatedVm {
        CreatedVm {
            vm_id,
            name: name.map(String::from),
            is_sandbox,
            leases: Vec::new(),
        }
    }

    #[test]
    fn test_sandbox_naming() {
        let sandboxes = name_sandboxes(&[
            created(100, None, false),
            created(101, Some("web"), true),
            created(102, Some("db"), true),
            created(103, None, true),
        ])
        .unwrap();
        let keys: Vec<&str> = sandboxes.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["db", "default", "vm_103"]);
        assert_eq!(sandboxes["default"].vm_id, 101);
    }

    #[test]
    fn test_sandbox_naming_requires_sandbox() {
        assert!(matches!(
            name_sandboxes(&[created(100, None, false)]),
            Err(CoreError::InvalidVm(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_by_id_not_implemented() {
        let manager = SandboxManager::new(
            ManagerConfig::default(),
            Arc::new(Fixed(MockControlPlane::default())),
        );
        let err = manager.cleanup_by_id("abc123").await.unwrap_err();
        assert_eq!(err.to_string(), "cleanup by id not implemented");
    }

    #[tokio::test]
    async fn test_invalid_config_acquires_nothing() {
        let manager = SandboxManager::new(
            ManagerConfig::default(),
            Arc::new(Fixed(MockControlPlane::default())),
        );
        manager
            .initialize(vec![ResourceRecord::new("pve-1", "default", "mock")])
            .await;
        let config = SandboxConfig {
            vms: Vec::new(),
            ..Default::default()
        };
        assert!(manager.provision("task", &config).await.is_err());
        assert_eq!(manager.pool().available("default"), Some(1));
        assert_eq!(manager.pool().stats().acquired(), 0);
    }
}
