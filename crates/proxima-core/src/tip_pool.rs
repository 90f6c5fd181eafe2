// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};

use crate::dag::Dag;
use crate::multistate::{fetch_root_record, RootRecord, StateReader};
use crate::store::KvStore;
use crate::types::{ChainId, TxId};
use crate::vertex::{is_preferred_milestone, Vtx};

const CHAN_BUFFER_SIZE: usize = 10;

struct MilestoneData {
    vid: Arc<Vtx>,
    branch_id: TxId,
}

/// Answer of [`SequencerTips::tx_inclusion`] for one tracked tip.
#[derive(Clone, Debug)]
pub struct TxInclusion {
    pub chain_id: ChainId,
    pub branch_id: TxId,
    pub record: RootRecord,
    pub included: bool,
}

/// Latest known milestone per sequencer chain. Fed by the attacher on every
/// Good milestone; each stored tip holds one vertex reference.
pub struct SequencerTips {
    input_tx: mpsc::Sender<Arc<Vtx>>,
    dag: Arc<Dag>,
    state: Arc<dyn KvStore>,
    latest_milestones: RwLock<AHashMap<ChainId, MilestoneData>>,
}

impl SequencerTips {
    pub fn start(
        dag: Arc<Dag>,
        state: Arc<dyn KvStore>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let (input_tx, mut input_rx) = mpsc::channel::<Arc<Vtx>>(CHAN_BUFFER_SIZE);
        let pool = Arc::new(Self {
            input_tx,
            dag,
            state,
            latest_milestones: RwLock::new(AHashMap::new()),
        });
        let handle = pool.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        tracing::debug!("tippool stopping");
                        return;
                    }
                    vid = input_rx.recv() => {
                        let Some(vid) = vid else { return };
                        handle.consume(vid);
                    }
                }
            }
        });
        pool
    }

    /// Queue side: the attacher publishes Good milestones here.
    pub fn input(&self) -> mpsc::Sender<Arc<Vtx>> {
        self.input_tx.clone()
    }

    fn consume(&self, vid: Arc<Vtx>) {
        let Some(chain_id) = vid.sequencer_chain_id() else {
            tracing::warn!("tippool: milestone {} without chain id", vid.id);
            return;
        };
        let Some(branch_id) = vid.baseline_branch() else {
            tracing::warn!("tippool: milestone {} without baseline", vid.id);
            return;
        };
        let mut latest = self.latest_milestones.write();
        match latest.get(&chain_id) {
            Some(old) if Arc::ptr_eq(&old.vid, &vid) => {}
            Some(old) => {
                if Self::old_replace_with_new(&old.vid, &vid) {
                    if vid.reference() {
                        let old = latest
                            .insert(chain_id, MilestoneData { vid, branch_id })
                            .expect("entry checked above");
                        self.dag.unreference(&old.vid);
                    }
                } else {
                    tracing::trace!(
                        "tippool: incoming milestone {} did not replace {}",
                        vid.id,
                        old.vid.id
                    );
                }
            }
            None => {
                if vid.reference() {
                    latest.insert(chain_id, MilestoneData { vid, branch_id });
                }
            }
        }
    }

    /// Newer timestamp replaces older; equal timestamps fall back to the
    /// milestone preference order.
    fn old_replace_with_new(old: &Arc<Vtx>, new: &Arc<Vtx>) -> bool {
        let ts_old = old.timestamp();
        let ts_new = new.timestamp();
        if ts_old != ts_new {
            return ts_old < ts_new;
        }
        is_preferred_milestone(new, old)
    }

    pub fn get_latest_milestone(&self, chain_id: &ChainId) -> Option<Arc<Vtx>> {
        self.latest_milestones
            .read()
            .get(chain_id)
            .map(|m| m.vid.clone())
    }

    /// All tracked tips, most preferred first.
    pub fn latest_milestones_descending(&self) -> Vec<Arc<Vtx>> {
        let latest = self.latest_milestones.read();
        let mut ret: Vec<_> = latest.values().map(|m| m.vid.clone()).collect();
        ret.sort_by(|a, b| {
            if is_preferred_milestone(a, b) {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Greater
            }
        });
        ret
    }

    pub fn num_tips(&self) -> usize {
        self.latest_milestones.read().len()
    }

    /// For every tracked tip: does `txid` lie in the committed state of the
    /// tip's baseline branch?
    pub fn tx_inclusion(&self, txid: &TxId) -> Vec<TxInclusion> {
        let latest = self.latest_milestones.read();
        latest
            .iter()
            .map(|(chain_id, data)| {
                let record = fetch_root_record(self.state.as_ref(), &data.branch_id)
                    .expect("tip baseline branch has a root record");
                let included = StateReader::new(self.state.clone(), record.root)
                    .map(|reader| reader.knows_tx(txid))
                    .unwrap_or(false);
                TxInclusion {
                    chain_id: *chain_id,
                    branch_id: data.branch_id,
                    record,
                    included,
                }
            })
            .collect()
    }

    /// Releases every stored tip reference. Called on shutdown.
    pub fn release_all(&self) {
        let mut latest = self.latest_milestones.write();
        for (_, data) in latest.drain() {
            self.dag.unreference(&data.vid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Hash32;
    use crate::ledger::LedgerTime;
    use crate::store::MemStore;
    use crate::types::{Output, OutputKind};

    fn milestone(
        dag: &Dag,
        chain_id: ChainId,
        baseline: TxId,
        tick: u8,
        coverage: u64,
        seed: &[u8],
    ) -> Arc<Vtx> {
        let id = TxId::new(LedgerTime::new(1, tick), true, false, Hash32::digest(seed));
        let vid = dag.get_or_create_virtual(id);
        vid.with_virtual_mut(|v| {
            v.add_output(
                0,
                Output {
                    amount: 100,
                    lock: Hash32::digest(b"ctrl"),
                    kind: OutputKind::Sequencer { chain_id },
                },
            );
            v.set_sequencer_indices(0, None);
        });
        vid.set_baseline_branch(baseline);
        vid.set_coverage(coverage);
        vid.set_status_good();
        vid
    }

    fn branch_txid() -> TxId {
        TxId::new(LedgerTime::slot_boundary(1), true, true, Hash32::digest(b"b"))
    }

    #[tokio::test]
    async fn newer_milestone_replaces_older() {
        let dag = Arc::new(Dag::new());
        let state: Arc<dyn crate::store::KvStore> = Arc::new(MemStore::new());
        let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let pool = SequencerTips::start(dag.clone(), state, shutdown_rx);

        let chain = Hash32::digest(b"chain");
        let old = milestone(&dag, chain, branch_txid(), 5, 50, b"m1");
        let newer = milestone(&dag, chain, branch_txid(), 9, 40, b"m2");

        pool.input().send(old.clone()).await.unwrap();
        pool.input().send(newer.clone()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // younger timestamp wins even with lower coverage
        let tip = pool.get_latest_milestone(&chain).unwrap();
        assert!(Arc::ptr_eq(&tip, &newer));
        // the replaced tip gave its reference back
        assert_eq!(old.num_references(), 2); // registry + test caller

        // an older milestone does not displace the stored tip
        let stale = milestone(&dag, chain, branch_txid(), 2, 500, b"m3");
        pool.input().send(stale).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let tip = pool.get_latest_milestone(&chain).unwrap();
        assert!(Arc::ptr_eq(&tip, &newer));
    }

    #[tokio::test]
    async fn equal_timestamps_fall_back_to_preference() {
        let dag = Arc::new(Dag::new());
        let state: Arc<dyn crate::store::KvStore> = Arc::new(MemStore::new());
        let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let pool = SequencerTips::start(dag.clone(), state, shutdown_rx);

        let chain = Hash32::digest(b"chain2");
        let weak = milestone(&dag, chain, branch_txid(), 7, 10, b"w");
        let strong = milestone(&dag, chain, branch_txid(), 7, 90, b"s");

        pool.input().send(strong.clone()).await.unwrap();
        pool.input().send(weak.clone()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let tip = pool.get_latest_milestone(&chain).unwrap();
        assert!(Arc::ptr_eq(&tip, &strong));
        assert_eq!(pool.num_tips(), 1);

        pool.release_all();
        assert_eq!(pool.num_tips(), 0);
    }
}
