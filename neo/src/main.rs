//! `neod`: launch a NEO master or storage node.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use neo_common::Address;
use neo_master::{Master, MasterConfig};
use neo_storage::{StorageConfig, StorageNode};

#[derive(Parser, Debug)]
#[command(name = "neod", about = "NEO distributed object store daemon")]
struct Options {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the primary master.
    Master(MasterOptions),
    /// Run a storage node.
    Storage(StorageOptions),
}

#[derive(Args, Debug)]
struct MasterOptions {
    /// IP:PORT to listen on.
    #[arg(long, short = 'a', env = "NEO_BIND", default_value = "127.0.0.1:10100")]
    bind: Address,

    /// Cluster name. All nodes of a cluster must agree on it.
    #[arg(long, env = "NEO_CLUSTER", default_value = "neo")]
    cluster: String,

    /// Partition count, fixed at cluster creation.
    #[arg(long, env = "NEO_PARTITIONS", default_value = "12")]
    partitions: u32,

    /// Extra replicas per partition, fixed at cluster creation.
    #[arg(long, env = "NEO_REPLICAS", default_value = "0")]
    replicas: u32,
}

#[derive(Args, Debug)]
struct StorageOptions {
    /// IP:PORT to listen on for clients.
    #[arg(long, short = 'a', env = "NEO_BIND", default_value = "127.0.0.1:10200")]
    bind: Address,

    /// Comma-separated master addresses.
    #[arg(long, env = "NEO_MASTERS", value_delimiter = ',', default_value = "127.0.0.1:10100")]
    masters: Vec<Address>,

    /// Cluster name. All nodes of a cluster must agree on it.
    #[arg(long, env = "NEO_CLUSTER", default_value = "neo")]
    cluster: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match Options::parse().command {
        Command::Master(opts) => {
            let handle = Master::start(MasterConfig {
                bind: opts.bind,
                cluster: opts.cluster,
                partitions: opts.partitions,
                replicas: opts.replicas,
            })
            .await
            .context("starting master")?;
            info!(addr = %handle.addr(), "master running");
            tokio::signal::ctrl_c().await?;
            handle.shutdown();
        }
        Command::Storage(opts) => {
            let handle = StorageNode::start(StorageConfig {
                bind: opts.bind,
                masters: opts.masters,
                cluster: opts.cluster,
                id: None,
            })
            .await
            .context("starting storage")?;
            info!(addr = %handle.addr(), "storage running");
            tokio::signal::ctrl_c().await?;
            handle.shutdown();
        }
    }
    Ok(())
}
