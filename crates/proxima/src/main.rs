// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{command, Parser};
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{filter::LevelFilter, fmt, EnvFilter};

use proxima_core::api::start_api_server;
use proxima_core::crypto::Signer;
use proxima_core::ledger::{Ledger, LedgerIdentity};
use proxima_core::metrics::start_metrics_server;
use proxima_core::node::{NodeConfig, TangleNode};
use proxima_core::peering::NoPeering;
use proxima_core::rocks_store::RocksStore;
use proxima_core::sequencer::SequencerConfig;
use proxima_core::sync::SyncConfig;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    operation: Operation,
}

#[derive(Parser)]
enum Operation {
    /// Generate a node config file with dev keys. Only suitable for local
    /// runs and benchmarks: the key seeds end up in the file.
    Genesis {
        #[clap(long, value_name = "DIR", default_value = "proxima-node")]
        working_directory: PathBuf,
        #[clap(long, value_name = "INT", default_value_t = 1)]
        num_sequencers: usize,
    },
    /// Run a node from a config file.
    Run {
        #[clap(long, value_name = "FILE")]
        config_path: PathBuf,
    },
}

/// On-disk node configuration.
#[derive(Serialize, Deserialize)]
struct NodeFileConfig {
    identity: LedgerIdentity,
    store_path: PathBuf,
    api_address: Option<SocketAddr>,
    metrics_address: Option<SocketAddr>,
    sync: SyncConfig,
    /// `(key seed, amount)` per genesis chain; the controller addresses are
    /// derived from the seeds.
    chains: Vec<(u64, u64)>,
    sequencers: Vec<SequencerFileConfig>,
}

#[derive(Serialize, Deserialize)]
struct SequencerFileConfig {
    /// Index into `chains`.
    chain_index: usize,
    #[serde(flatten)]
    config: SequencerConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    fmt().with_env_filter(filter).init();

    match Args::parse().operation {
        Operation::Genesis {
            working_directory,
            num_sequencers,
        } => genesis(working_directory, num_sequencers),
        Operation::Run { config_path } => run(config_path).await,
    }
}

fn genesis(working_directory: PathBuf, num_sequencers: usize) -> Result<()> {
    std::fs::create_dir_all(&working_directory).wrap_err(format!(
        "failed to create directory '{}'",
        working_directory.display()
    ))?;
    let identity = LedgerIdentity::default_local();
    let share = identity.initial_supply / num_sequencers.max(1) as u64;
    let mut chains = Vec::new();
    let mut sequencers = Vec::new();
    for i in 0..num_sequencers.max(1) {
        let seed = 1000 + i as u64;
        let amount = if i == 0 {
            identity.initial_supply - share * (num_sequencers.max(1) as u64 - 1)
        } else {
            share
        };
        chains.push((seed, amount));
        sequencers.push(SequencerFileConfig {
            chain_index: i,
            config: SequencerConfig {
                name: format!("seq{i}"),
                ..SequencerConfig::default()
            },
        });
    }
    let config = NodeFileConfig {
        identity,
        store_path: working_directory.join("db"),
        api_address: Some(([127, 0, 0, 1], 8070).into()),
        metrics_address: Some(([127, 0, 0, 1], 9090).into()),
        sync: SyncConfig::default(),
        chains,
        sequencers,
    };
    let path = working_directory.join("node.json");
    std::fs::write(&path, serde_json::to_string_pretty(&config)?)
        .wrap_err("failed to write the node config")?;
    tracing::info!("generated node config: {}", path.display());
    Ok(())
}

async fn run(config_path: PathBuf) -> Result<()> {
    let config: NodeFileConfig = serde_json::from_str(
        &std::fs::read_to_string(&config_path)
            .wrap_err(format!("failed to read '{}'", config_path.display()))?,
    )
    .wrap_err("malformed node config")?;

    Ledger::install(config.identity.clone());

    let store = RocksStore::open(&config.store_path).wrap_err("failed to open the store")?;
    let signers: Vec<Arc<Signer>> = config
        .chains
        .iter()
        .map(|(seed, _)| Arc::new(Signer::from_seed(*seed)))
        .collect();
    let genesis_chains: Vec<_> = signers
        .iter()
        .zip(&config.chains)
        .map(|(signer, (_, amount))| (signer.address(), *amount))
        .collect();

    let node = TangleNode::start(
        Arc::new(store.state()),
        Arc::new(store.txbytes()),
        Arc::new(NoPeering),
        Arc::new(NoPeering),
        NodeConfig {
            sync: config.sync,
            genesis_chains,
            genesis_faucets: Vec::new(),
        },
    );

    for seq in &config.sequencers {
        let (chain_id, _) = node.genesis.chains[seq.chain_index];
        node.start_sequencer(chain_id, signers[seq.chain_index].clone(), seq.config.clone());
        tracing::info!("sequencer {} started on chain {:?}", seq.config.name, chain_id);
    }

    if let Some(address) = config.metrics_address {
        start_metrics_server(address, &node.registry);
    }
    if let Some(address) = config.api_address {
        start_api_server(node.clone(), address);
    }

    tokio::signal::ctrl_c()
        .await
        .wrap_err("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");
    node.shutdown().await;
    Ok(())
}
