//! # paddock-pve
//!
//! Control-plane access layer for paddock sandboxes.
//!
//! Everything above this crate talks to the hypervisor through the
//! [`ControlPlane`] trait, usually wrapped in an [`Api`] for typed reads.
//!
//! ```no_run
//! use paddock_pve::{Api, PveClient, VersionInfo};
//! use std::sync::Arc;
//!
//! # async fn example() -> paddock_pve::Result<()> {
//! let client = PveClient::new("10.0.0.5", 8006, "root@pam", "secret", false)?;
//! let api = Api::new(Arc::new(client));
//! let version: VersionInfo = api.get("/nodes/pve/version").await?;
//! println!("{}", version.version);
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Ticket auth**: lazy login with one re-login on an expired ticket
//! - **Typed models**: the response shapes paddock reads
//! - **Mock control plane**: in-memory node emulation for tests

mod client;
mod error;
mod mock;
pub mod models;

pub use client::{Api, ControlPlane, Method, PveClient};
pub use error::{PveError, Result};
pub use mock::{Call, MockControlPlane};
pub use models::{
    AgentExecStarted, AgentExecStatus, ClusterTask, IpamEntry, StorageContent, SubnetInfo,
    VersionInfo, VmStatus, VmSummary, VnetInfo, ZoneInfo,
};
