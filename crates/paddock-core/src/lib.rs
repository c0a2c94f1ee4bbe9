//! # paddock-core
//!
//! Instance pooling and sandbox provisioning for paddock.
//!
//! A finite set of hypervisor endpoints is shared between many concurrent
//! runs. Each run checks an endpoint out of a pool, builds an SDN zone and
//! VMs on it under a unique namespace, and tears everything down again
//! before the endpoint goes back into circulation.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      SandboxManager                        │
//! │   provision() / release() / cleanup_all()                  │
//! ├────────────────────────────────────────────────────────────┤
//! │  InstancePool     EndpointLocks      NamespaceAllocator    │
//! │  (records)        (host:port mutex)  (run prefixes)        │
//! ├────────────────────────────────────────────────────────────┤
//! │  NetworkProvisioner   VmOrchestrator   TeardownCoordinator │
//! │        │                    │                  │           │
//! │        └──── TaskTracker / wait_until / retry ─┘           │
//! └────────────────────────────┬───────────────────────────────┘
//!                              ▼
//!                 paddock-pve ControlPlane
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use paddock_core::{load_records, ManagerConfig, PveConnector, SandboxConfig, SandboxManager};
//! use std::sync::Arc;
//!
//! # async fn example() -> paddock_core::Result<()> {
//! let manager = SandboxManager::new(ManagerConfig::from_env(), Arc::new(PveConnector));
//! manager.initialize(load_records()?).await;
//!
//! let run = manager.provision("task-1", &SandboxConfig::default()).await?;
//! println!("sandbox vm: {}", run.sandboxes()["default"].vm_id);
//!
//! manager.release(run).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Blocking pools**: FIFO checkout with optional deadline
//! - **Leak-free teardown**: records return to the pool only when clean
//! - **Tag-based discovery**: cleanup works without any retained state
//! - **Golden images**: built-in templates are built once and reused

mod config;
mod error;
mod lock;
mod manager;
pub mod namespace;
pub mod network;
mod pool;
mod record;
pub mod retry;
mod tasks;
mod teardown;
pub mod vm;

pub use config::{
    load_records, load_records_with, parse_records, ManagerConfig, SandboxConfig,
    SandboxConfigBuilder,
};
pub use error::{CoreError, Result};
pub use lock::EndpointLocks;
pub use manager::{
    Connector, ManagerStats, ProvisionedRun, PveConnector, SandboxManager, SandboxVm,
};
pub use namespace::{IdNamespace, NamespaceAllocator};
pub use network::{
    CreatedNetwork, DhcpRange, IpamMapping, NetworkConfig, NetworkMode, NetworkProvisioner,
    SubnetConfig, VnetAlias, VnetConfig,
};
pub use pool::{InstancePool, PoolStats};
pub use record::{distinct_endpoints, ResourceRecord};
pub use retry::{retry, wait_until, Probe, RetryPolicy};
pub use tasks::TaskTracker;
pub use teardown::{CleanupPlan, RunResources, TeardownCoordinator};
pub use vm::{
    BuiltInImage, CreatedVm, DiskController, NicController, NicSpec, VmOrchestrator, VmSource,
    VmSpec,
};
