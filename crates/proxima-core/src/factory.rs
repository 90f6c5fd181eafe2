// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use eyre::Result;
use parking_lot::Mutex;

use crate::backlog::InputBacklog;
use crate::crypto::Signer;
use crate::dag::Dag;
use crate::ledger::{Ledger, LedgerTime, Slot};
use crate::multistate::{fetch_latest_root_records, fetch_root_record, StateReader};
use crate::store::KvStore;
use crate::tip_pool::SequencerTips;
use crate::types::{
    ChainId, Output, OutputId, OutputKind, SequencerData, Transaction, TxBuilder,
};
use crate::vertex::Vtx;

/// How many foreign tips a milestone endorses at most.
const MAX_ENDORSEMENTS: usize = 2;

/// Assembles candidate milestones for one sequencer chain: chain
/// predecessor, tag-along inputs from the backlog, endorsements of other
/// tips, and the stem when the target is a slot boundary.
pub struct MilestoneFactory {
    chain_id: ChainId,
    signer: Arc<Signer>,
    dag: Arc<Dag>,
    tips: Arc<SequencerTips>,
    state: Arc<dyn KvStore>,
    backlog: Arc<InputBacklog>,
    max_tag_along_inputs: usize,
    milestones_ttl_slots: u32,
    /// Own milestones, oldest first; each holds a vertex reference.
    own_milestones: Mutex<Vec<Arc<Vtx>>>,
}

impl MilestoneFactory {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain_id: ChainId,
        signer: Arc<Signer>,
        dag: Arc<Dag>,
        tips: Arc<SequencerTips>,
        state: Arc<dyn KvStore>,
        backlog: Arc<InputBacklog>,
        max_tag_along_inputs: usize,
        milestones_ttl_slots: u32,
    ) -> Self {
        Self {
            chain_id,
            signer,
            dag,
            tips,
            state,
            backlog,
            max_tag_along_inputs,
            milestones_ttl_slots,
            own_milestones: Mutex::new(Vec::new()),
        }
    }

    pub fn add_own_milestone(&self, vid: Arc<Vtx>) {
        if !vid.reference() {
            return;
        }
        self.own_milestones.lock().push(vid);
    }

    /// Drops own milestones older than the TTL, keeping at least the latest.
    pub fn purge_own_milestones(&self, current_slot: Slot) {
        let mut dropped = Vec::new();
        {
            let mut own = self.own_milestones.lock();
            while own.len() > 1 {
                let oldest = &own[0];
                if current_slot.saturating_sub(oldest.slot()) <= self.milestones_ttl_slots {
                    break;
                }
                dropped.push(own.remove(0));
            }
        }
        for vid in dropped {
            self.dag.unreference(&vid);
        }
    }

    /// The chain output the next milestone will consume: the latest own
    /// milestone, or the chain output of the heaviest committed branch.
    pub fn own_latest_milestone_output(&self) -> Option<(OutputId, Output)> {
        if let Some(latest) = self.own_milestones.lock().last() {
            return latest.sequencer_output();
        }
        if let Some(tip) = self.tips.get_latest_milestone(&self.chain_id) {
            if let Some(ret) = tip.sequencer_output() {
                return Some(ret);
            }
        }
        let (_, record) = fetch_latest_root_records(self.state.as_ref())
            .into_iter()
            .next()?;
        let reader = StateReader::new(self.state.clone(), record.root).ok()?;
        reader.get_chain_output(&self.chain_id)
    }

    /// The branch whose committed state the next milestone extends.
    fn branch_to_extend(&self) -> Option<crate::types::TxId> {
        if let Some(latest) = self.own_milestones.lock().last() {
            return latest.baseline_branch();
        }
        fetch_latest_root_records(self.state.as_ref())
            .into_iter()
            .next()
            .map(|(txid, _)| txid)
    }

    /// Proposes a signed milestone for the target time, or None when the
    /// chain output is not available yet.
    pub fn propose(&self, target: LedgerTime) -> Result<Option<Transaction>> {
        let Some((pred_oid, pred_output)) = self.own_latest_milestone_output() else {
            return Ok(None);
        };
        let Some(extend_branch) = self.branch_to_extend() else {
            return Ok(None);
        };
        let identity = Ledger::get().identity();

        let mut builder = TxBuilder::new(target).input(pred_oid);
        let mut amount = pred_output.amount;

        for (oid, output) in self.backlog.pick_tag_along(self.max_tag_along_inputs) {
            if target.diff_ticks(&oid.timestamp()) < identity.tx_pace as i64 {
                continue;
            }
            amount += output.amount;
            builder = builder.input(oid);
        }

        let is_branch = target.is_slot_boundary();
        if is_branch {
            let record = fetch_root_record(self.state.as_ref(), &extend_branch)
                .ok_or_else(|| eyre::eyre!("branch to extend has no root record"))?;
            let reader = StateReader::new(self.state.clone(), record.root)?;
            let (stem_oid, _stem_output) = reader
                .get_stem_output()
                .ok_or_else(|| eyre::eyre!("branch state without a stem output"))?;
            let inflation = identity.branch_inflation_bonus;
            amount += inflation;
            builder = builder
                .input(stem_oid)
                .inflation(inflation)
                .output(Output {
                    amount,
                    lock: self.signer.address(),
                    kind: OutputKind::Sequencer {
                        chain_id: self.chain_id,
                    },
                })
                .output(Output {
                    amount: 0,
                    lock: self.signer.address(),
                    kind: OutputKind::Stem {
                        predecessor: stem_oid,
                    },
                })
                .sequencer(SequencerData {
                    chain_id: self.chain_id,
                    predecessor_input_index: 0,
                    sequencer_output_index: 0,
                    stem_output_index: Some(1),
                });
        } else {
            builder = builder
                .output(Output {
                    amount,
                    lock: self.signer.address(),
                    kind: OutputKind::Sequencer {
                        chain_id: self.chain_id,
                    },
                })
                .sequencer(SequencerData {
                    chain_id: self.chain_id,
                    predecessor_input_index: 0,
                    sequencer_output_index: 0,
                    stem_output_index: None,
                });
            // endorse the strongest foreign tips living on the same branch
            let mut endorsed = 0;
            for tip in self.tips.latest_milestones_descending() {
                if endorsed >= MAX_ENDORSEMENTS {
                    break;
                }
                if tip.sequencer_chain_id() == Some(self.chain_id) {
                    continue;
                }
                if tip.slot() != target.slot || tip.timestamp() >= target {
                    continue;
                }
                if tip.baseline_branch() != Some(extend_branch) {
                    continue;
                }
                builder = builder.endorse(tip.id);
                endorsed += 1;
            }
        }

        let tx = builder.sign(&self.signer)?;
        Ok(Some(tx))
    }

    /// Releases the own-milestone references. Called on shutdown.
    pub fn release_all(&self) {
        let mut own = self.own_milestones.lock();
        for vid in own.drain(..) {
            self.dag.unreference(&vid);
        }
    }
}
