// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use crate::crypto::{Address, Signer};
use crate::ledger::{Ledger, LedgerTime};
use crate::multistate::StateReader;
use crate::node::{NodeConfig, TangleNode};
use crate::peering::NoPeering;
use crate::store::MemStore;
use crate::sync::SyncConfig;
use crate::types::{
    ChainId, Output, OutputId, OutputKind, SequencerData, Transaction, TxBuilder,
};

/// Single-node setup backed by in-memory stores. Sync is off: there is no
/// peer to catch up from.
pub fn start_test_node(
    chains: &[(&Signer, u64)],
    faucets: &[(&Signer, u64)],
) -> Arc<TangleNode> {
    let identity = Ledger::get().identity();
    let declared: u64 = chains.iter().map(|(_, a)| a).sum::<u64>()
        + faucets.iter().map(|(_, a)| a).sum::<u64>();
    assert!(
        declared <= identity.initial_supply,
        "genesis shares exceed the supply"
    );
    let mut genesis_chains: Vec<(Address, u64)> = chains
        .iter()
        .map(|(signer, amount)| (signer.address(), *amount))
        .collect();
    // the remainder goes to the first chain
    genesis_chains[0].1 += identity.initial_supply - declared;
    let genesis_faucets: Vec<(Address, u64)> = faucets
        .iter()
        .map(|(signer, amount)| (signer.address(), *amount))
        .collect();

    TangleNode::start(
        Arc::new(MemStore::new()),
        Arc::new(MemStore::new()),
        Arc::new(NoPeering),
        Arc::new(NoPeering),
        NodeConfig {
            sync: SyncConfig {
                enabled: false,
                ..SyncConfig::default()
            },
            genesis_chains,
            genesis_faucets,
        },
    )
}

/// A single-utxo account chaining transfers, one after another.
pub struct Wallet {
    pub signer: Arc<Signer>,
    pub utxo: (OutputId, Output),
}

impl Wallet {
    /// Picks up the faucet output of `signer` from the genesis state.
    pub fn from_genesis(node: &TangleNode, signer: Arc<Signer>) -> Self {
        let reader = StateReader::new(node.state.clone(), node.genesis.root)
            .expect("genesis state exists");
        let utxo = reader
            .account_outputs(&signer.address())
            .into_iter()
            .find(|(_, o)| matches!(o.kind, OutputKind::Plain))
            .expect("faucet output exists for the wallet");
        Self { signer, utxo }
    }

    /// Spends the current utxo into a change output, optionally paying a
    /// tag-along fee. The wallet advances to the change output.
    pub fn transfer(&mut self, timestamp: LedgerTime, fee: Option<(Address, u64)>) -> Transaction {
        let amount = self.utxo.1.amount;
        let fee_amount = fee.map(|(_, a)| a).unwrap_or(0);
        assert!(fee_amount < amount, "fee above the wallet balance");
        let mut builder = TxBuilder::new(timestamp)
            .input(self.utxo.0)
            .output(Output::plain(amount - fee_amount, self.signer.address()));
        if let Some((fee_addr, fee_amount)) = fee {
            builder = builder.output(Output::plain(fee_amount, fee_addr));
        }
        let tx = builder.sign(&self.signer).expect("wallet transfer builds");
        self.utxo = (
            tx.output_id_at(0),
            tx.produced_output_at(0).expect("change output").clone(),
        );
        tx
    }
}

/// Hand-crafted non-branch milestone, for conflict scenarios where the
/// factory's pacing would get in the way.
pub fn craft_milestone(
    signer: &Signer,
    chain_id: ChainId,
    predecessor: (OutputId, Output),
    extra_inputs: &[(OutputId, Output)],
    timestamp: LedgerTime,
) -> Transaction {
    assert!(!timestamp.is_slot_boundary(), "crafted milestones are not branches");
    let mut amount = predecessor.1.amount;
    let mut builder = TxBuilder::new(timestamp).input(predecessor.0);
    for (oid, output) in extra_inputs {
        amount += output.amount;
        builder = builder.input(*oid);
    }
    builder
        .output(Output {
            amount,
            lock: signer.address(),
            kind: OutputKind::Sequencer { chain_id },
        })
        .sequencer(SequencerData {
            chain_id,
            predecessor_input_index: 0,
            sequencer_output_index: 0,
            stem_output_index: None,
        })
        .sign(signer)
        .expect("crafted milestone builds")
}
