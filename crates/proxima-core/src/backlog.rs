// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::crypto::Address;
use crate::dag::Dag;
use crate::ledger::Slot;
use crate::types::{Output, OutputId, OutputKind};
use crate::vertex::{Status, Vtx};

struct BacklogEntry {
    vid: Arc<Vtx>,
    index: u8,
    output: Output,
    inserted_slot: Slot,
    /// Set once the output went into a proposed milestone.
    proposed: bool,
}

/// Fee ("tag-along") outputs addressed to the sequencer, waiting to be
/// consumed by one of its milestones. Each entry holds a vertex reference.
pub struct InputBacklog {
    owner: Address,
    ttl_slots: u32,
    dag: Arc<Dag>,
    entries: Mutex<AHashMap<OutputId, BacklogEntry>>,
}

impl InputBacklog {
    pub fn new(owner: Address, ttl_slots: u32, dag: Arc<Dag>) -> Arc<Self> {
        Arc::new(Self {
            owner,
            ttl_slots,
            dag,
            entries: Mutex::new(AHashMap::new()),
        })
    }

    /// Offers every plain output of a Good vertex that is locked to the
    /// sequencer's address.
    pub fn on_good_tx(&self, vid: &Arc<Vtx>) {
        if vid.is_sequencer_milestone() {
            return;
        }
        let slot = vid.slot();
        let mut entries = self.entries.lock();
        for (index, output) in vid.known_outputs() {
            if output.lock != self.owner || !matches!(output.kind, OutputKind::Plain) {
                continue;
            }
            let oid = vid.output_id_at(index);
            if entries.contains_key(&oid) {
                continue;
            }
            if !vid.reference() {
                return;
            }
            entries.insert(
                oid,
                BacklogEntry {
                    vid: vid.clone(),
                    index,
                    output,
                    inserted_slot: slot,
                    proposed: false,
                },
            );
        }
    }

    /// Unconsumed entries for the next milestone, oldest first, capped at
    /// `max`. Marks the picked entries as proposed.
    pub fn pick_tag_along(&self, max: usize) -> Vec<(OutputId, Output)> {
        let mut entries = self.entries.lock();
        let mut candidates: Vec<&OutputId> = entries
            .iter()
            .filter(|(_, e)| {
                e.vid
                    .consumers_of(e.index)
                    .iter()
                    .all(|c| c.status() == Status::Bad)
            })
            .map(|(oid, _)| oid)
            .collect();
        candidates.sort();
        candidates.truncate(max);
        let picked: Vec<OutputId> = candidates.into_iter().cloned().collect();
        picked
            .into_iter()
            .map(|oid| {
                let entry = entries.get_mut(&oid).expect("candidate key exists");
                entry.proposed = true;
                (oid, entry.output.clone())
            })
            .collect()
    }

    /// Drops consumed and expired entries. Logs when an expired entry was
    /// ever proposed into a milestone, so an aggressive TTL is observable.
    pub fn purge(&self, current_slot: Slot) {
        let mut dropped: Vec<Arc<Vtx>> = Vec::new();
        {
            let mut entries = self.entries.lock();
            entries.retain(|oid, entry| {
                let consumed = entry
                    .vid
                    .consumers_of(entry.index)
                    .iter()
                    .any(|c| c.status() == Status::Good);
                let expired =
                    current_slot.saturating_sub(entry.inserted_slot) > self.ttl_slots;
                if consumed || expired {
                    if expired && !consumed && entry.proposed {
                        tracing::warn!(
                            "backlog: purging output {oid} that was proposed into a milestone"
                        );
                    }
                    dropped.push(entry.vid.clone());
                    false
                } else {
                    true
                }
            });
        }
        for vid in dropped {
            self.dag.unreference(&vid);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Releases every entry. Called on shutdown.
    pub fn release_all(&self) {
        let mut entries = self.entries.lock();
        for (_, entry) in entries.drain() {
            self.dag.unreference(&entry.vid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Hash32;
    use crate::ledger::LedgerTime;
    use crate::types::TxId;

    fn good_vertex_with_output(dag: &Dag, tick: u8, owner: Address, amount: u64) -> Arc<Vtx> {
        let id = TxId::new(LedgerTime::new(1, tick), false, false, Hash32::digest(&[tick]));
        let vid = dag.get_or_create_virtual(id);
        vid.ensure_output(0, &Output::plain(amount, owner));
        vid.set_status_good();
        vid
    }

    #[test]
    fn collects_own_outputs_only() {
        let dag = Arc::new(Dag::new());
        let owner = Hash32::digest(b"seq");
        let backlog = InputBacklog::new(owner, 5, dag.clone());

        let mine = good_vertex_with_output(&dag, 1, owner, 50);
        let foreign = good_vertex_with_output(&dag, 2, Hash32::digest(b"other"), 60);
        backlog.on_good_tx(&mine);
        backlog.on_good_tx(&foreign);
        assert_eq!(backlog.len(), 1);

        let picked = backlog.pick_tag_along(10);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].1.amount, 50);
    }

    #[test]
    fn ttl_purge_logs_proposed_and_releases_references(){
        let dag = Arc::new(Dag::new());
        let owner = Hash32::digest(b"seq");
        let backlog = InputBacklog::new(owner, 2, dag.clone());

        let vid = good_vertex_with_output(&dag, 1, owner, 50);
        backlog.on_good_tx(&vid);
        let before = vid.num_references();
        assert_eq!(backlog.pick_tag_along(10).len(), 1);

        backlog.purge(2); // within TTL
        assert_eq!(backlog.len(), 1);
        backlog.purge(10); // expired
        assert_eq!(backlog.len(), 0);
        assert_eq!(vid.num_references(), before - 1);
    }
}
