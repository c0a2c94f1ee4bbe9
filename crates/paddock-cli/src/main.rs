//! paddock command-line entry point.
//!
//! ## Commands
//!
//! - **cleanup** `[--yes]`: discovery cleanup on every configured endpoint
//! - **cleanup** `<id>`: cleanup of a single run (unsupported)
//! - **pools**: configured pools and their records
//!
//! Records come from `PADDOCK_CONFIG_FILE` or the `PADDOCK_*` variables.

use anyhow::{bail, Context};
use paddock_core::{
    distinct_endpoints, load_records, ManagerConfig, PveConnector, ResourceRecord, SandboxManager,
};
use std::collections::BTreeMap;
use std::io::{IsTerminal, Write};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const USAGE: &str = "usage: paddock <cleanup [--yes] [ID] | pools>";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Cleanup { id: Option<String>, yes: bool },
    Pools,
    Help,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Command> {
    let mut args = args.into_iter();
    match args.next().as_deref() {
        Some("cleanup") => {
            let mut id = None;
            let mut yes = false;
            for arg in args {
                match arg.as_str() {
                    "-y" | "--yes" => yes = true,
                    flag if flag.starts_with('-') => bail!("unknown flag {flag}\n{USAGE}"),
                    _ if id.is_some() => bail!("cleanup takes at most one id\n{USAGE}"),
                    _ => id = Some(arg),
                }
            }
            Ok(Command::Cleanup { id, yes })
        }
        Some("pools") => Ok(Command::Pools),
        Some("-h" | "--help" | "help") | None => Ok(Command::Help),
        Some(other) => bail!("unknown command {other}\n{USAGE}"),
    }
}

/// Ask only when a person is at the terminal.
fn should_confirm() -> bool {
    std::io::stdin().is_terminal() && std::env::var_os("CI").is_none()
}

fn confirm(question: &str) -> anyhow::Result<bool> {
    print!("{question} [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

async fn cleanup(manager: &SandboxManager, records: Vec<ResourceRecord>, yes: bool) -> anyhow::Result<()> {
    if records.is_empty() {
        bail!("no instances configured; set PADDOCK_CONFIG_FILE or PADDOCK_HOST");
    }
    manager.initialize(records.clone()).await;

    let mut failed = Vec::new();
    for record in distinct_endpoints(&records) {
        let endpoint = record.endpoint();
        let plan = manager
            .plan_cleanup(record)
            .await
            .with_context(|| format!("listing resources on {endpoint}"))?;
        if plan.is_empty() {
            println!("No resources to delete on {endpoint}.");
            continue;
        }

        println!("The following resources will be destroyed on {endpoint}:");
        println!("{plan}");
        if !yes && should_confirm() && !confirm("Delete ALL the above resources?")? {
            println!("Cancelled.");
            continue;
        }

        match manager.execute_cleanup(record, &plan).await {
            Ok(()) => println!("Cleaned up {endpoint}."),
            Err(e) => {
                tracing::error!(endpoint = %endpoint, error = %e, "Cleanup failed");
                failed.push(endpoint);
            }
        }
    }

    if !failed.is_empty() {
        bail!("cleanup failed on {}", failed.join(", "));
    }
    Ok(())
}

fn print_pools(records: &[ResourceRecord]) {
    let mut pools: BTreeMap<&str, Vec<&ResourceRecord>> = BTreeMap::new();
    for record in records {
        pools.entry(record.pool_id()).or_default().push(record);
    }
    if pools.is_empty() {
        println!("No pools configured.");
        return;
    }
    println!("{:<20} {:<8} INSTANCES", "POOL", "RECORDS");
    for (pool_id, members) in pools {
        let ids: Vec<String> = members
            .iter()
            .map(|r| format!("{} ({})", r.instance_id(), r.endpoint()))
            .collect();
        println!("{:<20} {:<8} {}", pool_id, members.len(), ids.join(", "));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("paddock=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let command = parse_args(std::env::args().skip(1))?;
    let records = load_records()?;
    let manager = SandboxManager::new(ManagerConfig::from_env(), Arc::new(PveConnector));

    match command {
        Command::Cleanup { id: Some(id), .. } => manager.cleanup_by_id(&id).await?,
        Command::Cleanup { id: None, yes } => cleanup(&manager, records, yes).await?,
        Command::Pools => print_pools(&records),
        Command::Help => println!("{USAGE}"),
    }
    Ok(())
}
