//! Run-scoped identifier prefixes.
//!
//! Every zone, vnet and VM tag created by one provisioning run is named
//! under a six-character prefix: three characters derived from the run
//! name and three random digits. The zone is `<prefix>z`, vnets are
//! `<prefix>v<n>`.

use crate::error::{CoreError, Result};
use paddock_pve::{Api, ZoneInfo};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::fmt;
use std::sync::Mutex;

/// Candidates tried before giving up.
pub const MAX_ATTEMPTS: usize = 64;

/// Reserved prefix of the long-lived network used by template VMs.
pub const STATIC_PREFIX: &str = "sbxvm";

/// Zone of the static network.
pub fn static_zone_id() -> String {
    format!("{STATIC_PREFIX}z")
}

/// Vnet of the static network.
pub fn static_vnet_id() -> String {
    format!("{STATIC_PREFIX}v0")
}

/// True if `zone` has the shape of a per-run zone (`^...[0-9]{3}z$`).
pub fn is_run_zone(zone: &str) -> bool {
    let bytes = zone.as_bytes();
    bytes.len() == 7
        && bytes[..3].iter().all(u8::is_ascii_alphanumeric)
        && bytes[3..6].iter().all(u8::is_ascii_digit)
        && bytes[6] == b'z'
}

/// First three characters of `hint`, lower-cased, non-alphanumerics as `x`,
/// padded with `x`.
pub fn sanitize_hint(hint: &str) -> String {
    let mut out: String = hint
        .chars()
        .take(3)
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                'x'
            }
        })
        .collect();
    while out.len() < 3 {
        out.push('x');
    }
    out
}

/// A validated six-character run prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdNamespace(String);

impl IdNamespace {
    /// Validate an existing prefix.
    pub fn parse(prefix: &str) -> Result<Self> {
        let ns = Self(prefix.to_string());
        if !is_run_zone(&ns.zone_id()) || prefix.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(CoreError::Config(format!("invalid namespace prefix '{prefix}'")));
        }
        Ok(ns)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn zone_id(&self) -> String {
        format!("{}z", self.0)
    }

    pub fn vnet_id(&self, index: usize) -> String {
        format!("{}v{}", self.0, index)
    }

    /// Per-run tag put on every VM the run creates.
    pub fn run_tag(&self) -> String {
        format!("run-{}", self.0)
    }
}

impl fmt::Display for IdNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pick a prefix for `hint` that does not collide with `existing` zones.
pub fn pick<R: Rng + ?Sized>(
    hint: &str,
    existing: &HashSet<String>,
    rng: &mut R,
) -> Result<IdNamespace> {
    let hint = sanitize_hint(hint);
    for _ in 0..MAX_ATTEMPTS {
        let candidate = IdNamespace(format!("{hint}{:03}", rng.random_range(0..1000u32)));
        if !existing.contains(&candidate.zone_id()) {
            return Ok(candidate);
        }
    }
    Err(CoreError::NamespaceExhausted {
        hint,
        attempts: MAX_ATTEMPTS,
    })
}

/// Allocates namespaces against the live zone list.
pub struct NamespaceAllocator {
    rng: Mutex<StdRng>,
}

impl Default for NamespaceAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceAllocator {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }

    /// Use a fixed random source (tests).
    pub fn with_rng(rng: StdRng) -> Self {
        Self {
            rng: Mutex::new(rng),
        }
    }

    /// Read the zone list once and pick a free prefix for `hint`.
    pub async fn allocate(&self, api: &Api, hint: &str) -> Result<IdNamespace> {
        let zones: Vec<ZoneInfo> = api.get("/cluster/sdn/zones").await?;
        let existing: HashSet<String> = zones.into_iter().map(|z| z.zone).collect();

        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        let ns = pick(hint, &existing, &mut *rng)?;
        tracing::debug!(namespace = %ns, hint, "Allocated namespace");
        Ok(ns)
    }
}
