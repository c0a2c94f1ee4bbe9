//! Ordered destruction of run infrastructure.
//!
//! Deletion always runs leases, then VMs, then each vnet's subnets and
//! the vnet itself, then the zone, then an SDN apply. Each step is blocked
//! on the control plane by anything left over from the previous one.
//! Objects that are already gone count as deleted.

use crate::error::{CoreError, Result};
use crate::namespace::{self, is_run_zone};
use crate::network::{IpamMapping, NetworkProvisioner};
use crate::vm::{bridges, VmOrchestrator};
use paddock_pve::{IpamEntry, PveError, VmSummary};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Everything one run created, by id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunResources {
    pub zone: Option<String>,
    pub vm_ids: Vec<u32>,
    pub leases: Vec<IpamMapping>,
}

/// What a discovery-mode cleanup would delete.
#[derive(Debug, Clone, Default)]
pub struct CleanupPlan {
    pub vms: Vec<VmSummary>,
    pub zones: Vec<String>,
    pub leases: Vec<IpamEntry>,
}

impl CleanupPlan {
    pub fn is_empty(&self) -> bool {
        self.vms.is_empty() && self.zones.is_empty() && self.leases.is_empty()
    }
}

impl fmt::Display for CleanupPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "VMs to destroy ({}):", self.vms.len())?;
        writeln!(f, "  {:<8} {:<24} TAGS", "VMID", "NAME")?;
        for vm in &self.vms {
            writeln!(
                f,
                "  {:<8} {:<24} {}",
                vm.vmid,
                vm.name.as_deref().unwrap_or("-"),
                vm.tags.as_deref().unwrap_or("")
            )?;
        }
        writeln!(f, "SDN zones to delete ({}):", self.zones.len())?;
        for zone in &self.zones {
            writeln!(f, "  {zone}")?;
        }
        if !self.leases.is_empty() {
            writeln!(f, "IPAM leases to release ({}):", self.leases.len())?;
            for lease in &self.leases {
                writeln!(
                    f,
                    "  {:<16} {}",
                    lease.ip.as_deref().unwrap_or("-"),
                    lease.vnet.as_deref().unwrap_or("-")
                )?;
            }
        }
        Ok(())
    }
}

fn tolerate_missing(result: std::result::Result<serde_json::Value, PveError>, what: &str) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => {
            tracing::warn!(object = what, "Already deleted");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Tears down runs on one endpoint.
pub struct TeardownCoordinator<'a> {
    network: &'a NetworkProvisioner,
    vms: &'a VmOrchestrator,
}

impl<'a> TeardownCoordinator<'a> {
    pub fn new(network: &'a NetworkProvisioner, vms: &'a VmOrchestrator) -> Self {
        Self { network, vms }
    }

    /// Delete a run whose ids are known.
    pub async fn delete_run(&self, run: &RunResources) -> Result<()> {
        self.network.delete_mappings(&run.leases).await?;
        self.destroy_vms(&run.vm_ids).await?;
        let zones: Vec<String> = run.zone.iter().cloned().collect();
        self.delete_zones(&zones).await
    }

    async fn destroy_vms(&self, vm_ids: &[u32]) -> Result<()> {
        let mut failures = Vec::new();
        for &vm_id in vm_ids {
            if let Err(e) = self.vms.destroy_vm(vm_id).await {
                tracing::error!(vm_id, error = %e, "Failed to destroy VM");
                failures.push(format!("VM {vm_id}: {e}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Cleanup(failures.join("; ")))
        }
    }

    /// Delete every vnet (subnets first) of each zone, the zones, then apply.
    async fn delete_zones(&self, zones: &[String]) -> Result<()> {
        if zones.is_empty() {
            return Ok(());
        }
        let api = self.network;
        let vnets = api.list_vnets().await?;

        for zone in zones {
            for vnet in vnets.iter().filter(|v| &v.zone == zone) {
                let subnets = match api.subnets_of(&vnet.vnet).await {
                    Ok(s) => s,
                    Err(CoreError::Remote(e)) if e.is_not_found() => Vec::new(),
                    Err(e) => return Err(e),
                };
                for subnet in subnets {
                    tolerate_missing(
                        api.raw()
                            .delete(&format!("/cluster/sdn/vnets/{}/subnets/{}", vnet.vnet, subnet.id))
                            .await,
                        &subnet.id,
                    )?;
                }
                tolerate_missing(
                    api.raw().delete(&format!("/cluster/sdn/vnets/{}", vnet.vnet)).await,
                    &vnet.vnet,
                )?;
                tracing::debug!(zone_id = %zone, vnet_id = %vnet.vnet, "Vnet deleted");
            }
            tolerate_missing(api.raw().delete(&format!("/cluster/sdn/zones/{zone}")).await, zone)?;
            tracing::info!(zone_id = %zone, "Zone deleted");
        }

        self.network.apply_changes().await
    }

    /// Scan the endpoint for everything carrying the ownership tag.
    ///
    /// Zones are those the owned VMs are bridged to plus every zone shaped
    /// like a run zone. The static template network is never included.
    pub async fn plan_discovery(&self) -> Result<CleanupPlan> {
        let vms = self.vms.owned_vms().await?;
        let vnet_zone: HashMap<String, String> = self
            .network
            .list_vnets()
            .await?
            .into_iter()
            .map(|v| (v.vnet, v.zone))
            .collect();

        let static_zone = namespace::static_zone_id();
        let mut zones = BTreeSet::new();
        for vm in &vms {
            let config = match self.vms.vm_config(vm.vmid).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::debug!(vm_id = vm.vmid, error = %e, "Could not read VM config");
                    continue;
                }
            };
            for bridge in bridges(&config) {
                if let Some(zone) = vnet_zone.get(&bridge) {
                    zones.insert(zone.clone());
                }
            }
        }
        for zone in self.network.list_zones().await? {
            if is_run_zone(&zone.zone) {
                zones.insert(zone.zone);
            }
        }
        zones.remove(&static_zone);

        let leases = match self.network.list_leases().await {
            Ok(all) => all
                .into_iter()
                .filter(|l| l.zone.as_ref().is_some_and(|z| zones.contains(z)))
                .collect(),
            Err(e) => {
                tracing::debug!(error = %e, "Could not list IPAM leases");
                Vec::new()
            }
        };

        Ok(CleanupPlan {
            vms,
            zones: zones.into_iter().collect(),
            leases,
        })
    }

    /// Delete what `plan` lists, in teardown order.
    pub async fn execute(&self, plan: &CleanupPlan) -> Result<()> {
        if plan.is_empty() {
            tracing::debug!("Nothing to clean up");
            return Ok(());
        }
        tracing::info!(vms = plan.vms.len(), zones = plan.zones.len(), "Running discovery cleanup");
        self.network.delete_leases(&plan.leases).await?;
        let ids: Vec<u32> = plan.vms.iter().map(|vm| vm.vmid).collect();
        self.destroy_vms(&ids).await?;
        self.delete_zones(&plan.zones).await
    }

    /// Plan and execute in one go.
    pub async fn cleanup_discovered(&self) -> Result<CleanupPlan> {
        let plan = self.plan_discovery().await?;
        self.execute(&plan).await?;
        Ok(plan)
    }
}
