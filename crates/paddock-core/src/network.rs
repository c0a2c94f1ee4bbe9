//! SDN zones, vnets and subnets for a provisioning run.
//!
//! A run gets one simple zone named after its namespace, with up to
//! [`MAX_VNETS`] vnets. Subnet ranges are drawn at random from
//! `192.168.2-252.0/24` and checked against every existing simple-zone
//! subnet, so concurrent runs on one endpoint do not collide.

use crate::error::{CoreError, Result};
use crate::namespace::{self, IdNamespace};
use crate::tasks::TaskTracker;
use futures::future::try_join_all;
use ipnetwork::Ipv4Network;
use paddock_pve::{Api, IpamEntry, SubnetInfo, VnetInfo, ZoneInfo};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;

/// Most vnets one run may create.
pub const MAX_VNETS: usize = 10;

/// Third octet of the static template network.
pub const STATIC_OCTET: u8 = 99;

/// A DHCP pool inside a subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DhcpRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl DhcpRange {
    fn to_wire(self) -> String {
        format!("start-address={},end-address={}", self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetConfig {
    pub cidr: Ipv4Network,
    pub gateway: Ipv4Addr,
    pub snat: bool,
    pub dhcp_ranges: Vec<DhcpRange>,
}

impl SubnetConfig {
    /// A /24 with gateway `.1`, DHCP `.50`-`.100` and source NAT.
    pub fn standard(third_octet: u8) -> Result<Self> {
        let cidr = Ipv4Network::new(Ipv4Addr::new(192, 168, third_octet, 0), 24)
            .map_err(|e| CoreError::InvalidNetwork(e.to_string()))?;
        Ok(Self {
            cidr,
            gateway: host(cidr, 1),
            snat: true,
            dhcp_ranges: vec![DhcpRange {
                start: host(cidr, 50),
                end: host(cidr, 100),
            }],
        })
    }
}

fn host(cidr: Ipv4Network, n: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(cidr.network()).wrapping_add(n))
}

fn overlaps(a: &Ipv4Network, b: &Ipv4Network) -> bool {
    a.contains(b.network()) || b.contains(a.network())
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VnetConfig {
    pub alias: Option<String>,
    pub subnets: Vec<SubnetConfig>,
}

/// Networks to create for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub vnets: Vec<VnetConfig>,
    /// Use the built-in IPAM with dnsmasq DHCP. DHCP ranges are required
    /// when set and rejected when not.
    pub builtin_ipam: bool,
}

impl NetworkConfig {
    pub fn new(vnets: Vec<VnetConfig>) -> Self {
        Self {
            vnets,
            builtin_ipam: true,
        }
    }

    pub fn with_builtin_ipam(mut self, enabled: bool) -> Self {
        self.builtin_ipam = enabled;
        self
    }

    /// Checks that need no remote state: vnet count, DHCP/IPAM consistency,
    /// and overlap between the config's own subnets.
    pub fn validate(&self) -> Result<()> {
        if self.vnets.is_empty() {
            return Err(CoreError::InvalidNetwork("No vnets provided".into()));
        }
        if self.vnets.len() > MAX_VNETS {
            return Err(CoreError::InvalidNetwork(format!(
                "Too many vnets ({}); max {MAX_VNETS}",
                self.vnets.len()
            )));
        }

        let has_ranges = self
            .subnets()
            .any(|s| !s.dhcp_ranges.is_empty());
        if self.builtin_ipam && !has_ranges {
            return Err(CoreError::InvalidNetwork(
                "DHCP ranges should be provided when the built-in IPAM is enabled".into(),
            ));
        }
        if !self.builtin_ipam && has_ranges {
            return Err(CoreError::InvalidNetwork(
                "DHCP ranges cannot be provided when the built-in IPAM is disabled".into(),
            ));
        }

        let cidrs: Vec<Ipv4Network> = self.subnets().map(|s| s.cidr).collect();
        let mut clashes = Vec::new();
        for (i, a) in cidrs.iter().enumerate() {
            for b in &cidrs[i + 1..] {
                if overlaps(a, b) {
                    clashes.push(format!("{a} / {b}"));
                }
            }
        }
        if !clashes.is_empty() {
            return Err(CoreError::DuplicateRanges(clashes.join(", ")));
        }
        Ok(())
    }

    fn subnets(&self) -> impl Iterator<Item = &SubnetConfig> {
        self.vnets.iter().flat_map(|v| v.subnets.iter())
    }
}

/// How a run gets its networks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NetworkMode {
    /// Generate one vnet per NIC alias the run's VMs ask for.
    #[default]
    Auto,
    /// Create exactly this configuration.
    Explicit(NetworkConfig),
    /// Create nothing; attach to vnets that already exist.
    Existing,
}

/// A vnet id, its alias and owning zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VnetAlias {
    pub vnet: String,
    pub alias: Option<String>,
    pub zone: String,
}

/// Result of [`NetworkProvisioner::create`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CreatedNetwork {
    /// Zone created for the run, `None` when existing vnets were used.
    pub zone: Option<String>,
    pub vnets: Vec<VnetAlias>,
}

impl CreatedNetwork {
    /// Vnet for `alias`.
    pub fn resolve(&self, alias: &str) -> Option<&VnetAlias> {
        self.vnets.iter().find(|v| v.alias.as_deref() == Some(alias))
    }

    pub fn first(&self) -> Option<&VnetAlias> {
        self.vnets.first()
    }
}

/// A fixed MAC to IPv4 binding inside a vnet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpamMapping {
    pub vnet: String,
    pub zone: String,
    pub mac: String,
    pub ipv4: Ipv4Addr,
}

impl IpamMapping {
    fn as_entry(&self) -> IpamEntry {
        IpamEntry {
            ip: Some(self.ipv4.to_string()),
            mac: Some(self.mac.clone()),
            vnet: Some(self.vnet.clone()),
            zone: Some(self.zone.clone()),
            subnet: None,
            vmid: None,
            gateway: None,
        }
    }
}

/// Creates and inspects SDN objects on one endpoint.
pub struct NetworkProvisioner {
    api: Api,
    tasks: TaskTracker,
    rng: Mutex<StdRng>,
}

impl NetworkProvisioner {
    pub fn new(api: Api, tasks: TaskTracker) -> Self {
        Self {
            api,
            tasks,
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Use a fixed random source for subnet selection.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = Mutex::new(rng);
        self
    }

    /// The underlying API handle.
    pub fn raw(&self) -> &Api {
        &self.api
    }

    /// CIDRs of every subnet in every simple zone.
    pub async fn existing_subnets(&self) -> Result<Vec<Ipv4Network>> {
        let zones: Vec<ZoneInfo> = self.api.get("/cluster/sdn/zones").await?;
        let simple: HashSet<String> = zones
            .into_iter()
            .filter(|z| z.kind == "simple")
            .map(|z| z.zone)
            .collect();
        let vnets: Vec<VnetInfo> = self.api.get("/cluster/sdn/vnets").await?;

        let lists = try_join_all(
            vnets
                .iter()
                .filter(|v| simple.contains(&v.zone))
                .map(|v| self.subnets_of(&v.vnet)),
        )
        .await?;

        Ok(lists
            .into_iter()
            .flatten()
            .filter_map(|s| {
                let cidr = s.cidr?;
                match cidr.parse() {
                    Ok(net) => Some(net),
                    Err(e) => {
                        tracing::debug!(cidr = %cidr, error = %e, "Skipping unparsable subnet");
                        None
                    }
                }
            })
            .collect())
    }

    pub async fn subnets_of(&self, vnet: &str) -> Result<Vec<SubnetInfo>> {
        Ok(self
            .api
            .get(&format!("/cluster/sdn/vnets/{vnet}/subnets"))
            .await?)
    }

    pub async fn list_vnets(&self) -> Result<Vec<VnetInfo>> {
        Ok(self.api.get("/cluster/sdn/vnets").await?)
    }

    pub async fn list_zones(&self) -> Result<Vec<ZoneInfo>> {
        Ok(self.api.get("/cluster/sdn/zones").await?)
    }

    /// One standard subnet per alias, on ranges free on this endpoint.
    ///
    /// Third octets are tried in shuffled order; each candidate is checked
    /// against existing subnets and those already chosen in this call.
    pub async fn generate_network_config(&self, aliases: &[Option<String>]) -> Result<NetworkConfig> {
        if aliases.is_empty() {
            return Err(CoreError::InvalidNetwork("No vnets provided".into()));
        }
        if aliases.len() > MAX_VNETS {
            return Err(CoreError::InvalidNetwork(format!(
                "Too many vnets ({}); max {MAX_VNETS}",
                aliases.len()
            )));
        }

        let mut taken = self.existing_subnets().await?;
        let mut octets: Vec<u8> = (2..=252).filter(|o| *o != STATIC_OCTET).collect();
        {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            octets.shuffle(&mut *rng);
        }

        let mut candidates = octets.into_iter();
        let mut vnets = Vec::with_capacity(aliases.len());
        for alias in aliases {
            let subnet = loop {
                let Some(octet) = candidates.next() else {
                    return Err(CoreError::InvalidNetwork(
                        "Could not find a suitable IP range".into(),
                    ));
                };
                let subnet = SubnetConfig::standard(octet)?;
                if !taken.iter().any(|t| overlaps(t, &subnet.cidr)) {
                    break subnet;
                }
            };
            taken.push(subnet.cidr);
            vnets.push(VnetConfig {
                alias: alias.clone(),
                subnets: vec![subnet],
            });
        }

        Ok(NetworkConfig::new(vnets))
    }

    /// Create `config` under `ns`, or list existing vnets when `config` is
    /// `None`.
    ///
    /// All validation, including the overlap check against existing
    /// subnets, happens before the first mutation.
    pub async fn create(&self, ns: &IdNamespace, config: Option<&NetworkConfig>) -> Result<CreatedNetwork> {
        let Some(config) = config else {
            let vnets = self
                .list_vnets()
                .await?
                .into_iter()
                .map(|v| VnetAlias {
                    vnet: v.vnet,
                    alias: v.alias,
                    zone: v.zone,
                })
                .collect();
            return Ok(CreatedNetwork { zone: None, vnets });
        };

        config.validate()?;
        let existing = self.existing_subnets().await?;
        let clashes: Vec<String> = config
            .subnets()
            .filter(|s| existing.iter().any(|e| overlaps(e, &s.cidr)))
            .map(|s| s.cidr.to_string())
            .collect();
        if !clashes.is_empty() {
            return Err(CoreError::DuplicateRanges(clashes.join(", ")));
        }

        let zone = ns.zone_id();
        let mut zone_body = json!({"type": "simple", "zone": zone});
        if config.builtin_ipam {
            zone_body["ipam"] = json!("pve");
            zone_body["dhcp"] = json!("dnsmasq");
        }
        self.api.post("/cluster/sdn/zones", zone_body).await?;
        tracing::info!(zone_id = %zone, "Zone created");

        let mut vnets = Vec::with_capacity(config.vnets.len());
        for (index, vnet_config) in config.vnets.iter().enumerate() {
            let vnet = ns.vnet_id(index);
            let mut body = json!({"vnet": vnet, "zone": zone});
            if let Some(alias) = &vnet_config.alias {
                body["alias"] = json!(alias);
            }
            self.api.post("/cluster/sdn/vnets", body).await?;
            for subnet in &vnet_config.subnets {
                self.create_subnet(&vnet, subnet).await?;
            }
            tracing::debug!(zone_id = %zone, vnet_id = %vnet, alias = ?vnet_config.alias, "Vnet created");
            vnets.push(VnetAlias {
                vnet,
                alias: vnet_config.alias.clone(),
                zone: zone.clone(),
            });
        }

        self.apply_changes().await?;
        Ok(CreatedNetwork {
            zone: Some(zone),
            vnets,
        })
    }

    async fn create_subnet(&self, vnet: &str, subnet: &SubnetConfig) -> Result<()> {
        let mut body = json!({
            "subnet": subnet.cidr.to_string(),
            "type": "subnet",
            "vnet": vnet,
            "gateway": subnet.gateway.to_string(),
            "snat": subnet.snat,
        });
        if !subnet.dhcp_ranges.is_empty() {
            body["dhcp-range"] = Value::Array(
                subnet
                    .dhcp_ranges
                    .iter()
                    .map(|r| Value::String(r.to_wire()))
                    .collect(),
            );
        }
        self.api
            .post(&format!("/cluster/sdn/vnets/{vnet}/subnets"), body)
            .await?;
        Ok(())
    }

    /// Push pending SDN changes to the nodes and wait for the reload.
    pub async fn apply_changes(&self) -> Result<()> {
        self.tasks
            .run_and_wait("apply SDN changes", || async {
                self.api.put("/cluster/sdn", None).await?;
                Ok(())
            })
            .await
    }

    /// Make sure the long-lived template network exists.
    pub async fn ensure_static_network(&self) -> Result<()> {
        let zone = namespace::static_zone_id();
        if self.list_zones().await?.iter().any(|z| z.zone == zone) {
            tracing::debug!(zone_id = %zone, "Static network present");
            return Ok(());
        }

        let vnet = namespace::static_vnet_id();
        self.api
            .post(
                "/cluster/sdn/zones",
                json!({"type": "simple", "zone": zone, "ipam": "pve", "dhcp": "dnsmasq"}),
            )
            .await?;
        self.api
            .post("/cluster/sdn/vnets", json!({"vnet": vnet, "zone": zone}))
            .await?;
        self.create_subnet(&vnet, &SubnetConfig::standard(STATIC_OCTET)?)
            .await?;
        self.apply_changes().await?;
        tracing::info!(zone_id = %zone, vnet_id = %vnet, "Static network created");
        Ok(())
    }

    pub async fn create_lease(&self, mapping: &IpamMapping) -> Result<()> {
        self.api
            .post(
                &format!("/cluster/sdn/vnets/{}/ips", mapping.vnet),
                json!({"zone": mapping.zone, "ip": mapping.ipv4.to_string(), "mac": mapping.mac}),
            )
            .await?;
        tracing::debug!(vnet_id = %mapping.vnet, ip = %mapping.ipv4, mac = %mapping.mac, "Lease created");
        Ok(())
    }

    pub async fn list_leases(&self) -> Result<Vec<IpamEntry>> {
        Ok(self.api.get("/cluster/sdn/ipams/pve/status").await?)
    }

    /// Delete leases, tolerating ones that are already gone.
    ///
    /// Any other failure stops at that lease: its subnet cannot go yet.
    pub async fn delete_leases(&self, leases: &[IpamEntry]) -> Result<()> {
        for lease in leases {
            let (Some(ip), Some(vnet)) = (&lease.ip, &lease.vnet) else {
                continue;
            };
            let mut path = format!("/cluster/sdn/vnets/{vnet}/ips?ip={ip}&vnet={vnet}");
            if let Some(zone) = &lease.zone {
                path.push_str(&format!("&zone={zone}"));
            }
            if let Some(mac) = &lease.mac {
                path.push_str(&format!("&mac={mac}"));
            }
            match self.api.delete(&path).await {
                Ok(_) => tracing::debug!(ip = %ip, vnet_id = %vnet, "Lease deleted"),
                Err(e) if e.is_not_found() => {
                    tracing::debug!(ip = %ip, vnet_id = %vnet, "Lease already deleted")
                }
                Err(e) => {
                    tracing::error!(ip = %ip, vnet_id = %vnet, error = %e, "Failed to delete lease");
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Delete the leases for explicit mappings.
    pub async fn delete_mappings(&self, mappings: &[IpamMapping]) -> Result<()> {
        let entries: Vec<IpamEntry> = mappings.iter().map(IpamMapping::as_entry).collect();
        self.delete_leases(&entries).await
    }
}
