//! `netlem`: build an emulated topology from a file and keep it up until interrupted.

mod config;
mod show;

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use netlem::{Manager, ManagerConfig};
use tracing_subscriber::EnvFilter;

use crate::config::TopologyFile;

/// Single-host network topology emulator.
#[derive(Parser, Debug)]
#[command(name = "netlem", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the topology, wait for Ctrl-C, then tear it down.
    Apply {
        /// Topology file.
        #[arg(short = 'f', long = "from")]
        file: PathBuf,

        /// Open vSwitch bridge to attach the nodes to.
        #[arg(long, default_value = netlem::ovs::DEFAULT_BRIDGE)]
        bridge: String,

        /// Print the node and link tables once applied.
        #[arg(long, default_value_t = false)]
        show: bool,
    },
    /// Validate a topology file without touching the system.
    Check {
        /// Topology file.
        #[arg(short = 'f', long = "from")]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Apply { file, bridge, show } => apply(&file, bridge, show).await,
        Command::Check { file } => check(&file),
    }
}

fn load(file: &Path) -> anyhow::Result<TopologyFile> {
    TopologyFile::load(file).with_context(|| format!("invalid topology {}", file.display()))
}

fn check(file: &Path) -> anyhow::Result<()> {
    let topology = load(file)?;
    println!(
        "{}: {} nodes, {} links",
        file.display(),
        topology.nodes.len(),
        topology.links.len()
    );
    Ok(())
}

async fn apply(file: &Path, bridge: String, show: bool) -> anyhow::Result<()> {
    let topology = load(file)?;

    let config = ManagerConfig::default().with_bridge(bridge);
    let mut manager =
        Manager::new(config).await.context("failed to set up the emulation bridge")?;

    if let Err(e) = build(&mut manager, &topology).await {
        tracing::error!("{e:#}, tearing down");
        manager.destroy().await;
        return Err(e);
    }

    tracing::info!(
        nodes = topology.nodes.len(),
        links = topology.links.len(),
        "topology applied, press Ctrl-C to tear down"
    );
    if show {
        print!("{}", show::nodes_table(&manager.nodes()));
        println!();
        print!("{}", show::rules_table(&manager.rules()));
    }

    let signal = tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C");

    tracing::info!("tearing down topology");
    manager.destroy().await;

    signal
}

async fn build(manager: &mut Manager, topology: &TopologyFile) -> anyhow::Result<()> {
    for spec in topology.node_specs() {
        let name = spec.name.clone();
        manager.add_node(spec).await.with_context(|| format!("failed to add node {name}"))?;
    }

    for link in topology.link_requests() {
        let describe = format!("{} -> {}", link.source, link.destination);
        manager.add_link(link).await.with_context(|| format!("failed to add link {describe}"))?;
    }

    Ok(())
}
