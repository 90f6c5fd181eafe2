// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use eyre::{bail, ensure, Result};
use serde::{Deserialize, Serialize};

use crate::crypto::{Address, Hash32};
use crate::ledger::Slot;
use crate::store::{partition_key, KvStore, PARTITION_LATEST, PARTITION_ROOT, PARTITION_TRIE};
use crate::types::{ChainId, Output, OutputId, OutputKind, TxId};

/// The only persisted per-branch metadata.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RootRecord {
    pub root: Hash32,
    pub sequencer_id: ChainId,
    pub ledger_coverage: u64,
    pub slot_inflation: u64,
    pub supply: u64,
    pub num_transactions: u32,
}

const NUM_ROOT_RECORD_FIELDS: usize = 6;

impl RootRecord {
    /// Fixed-order sequence of six length-prefixed fields.
    pub fn to_bytes(&self) -> Vec<u8> {
        assert!(self.ledger_coverage > 0, "root record without coverage");
        let fields: [&[u8]; NUM_ROOT_RECORD_FIELDS] = [
            self.sequencer_id.as_ref(),
            self.root.as_ref(),
            &self.ledger_coverage.to_be_bytes(),
            &self.slot_inflation.to_be_bytes(),
            &self.supply.to_be_bytes(),
            &self.num_transactions.to_be_bytes(),
        ];
        let mut ret = Vec::new();
        for field in fields {
            ret.extend_from_slice(&(field.len() as u16).to_be_bytes());
            ret.extend_from_slice(field);
        }
        ret
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut fields: Vec<&[u8]> = Vec::with_capacity(NUM_ROOT_RECORD_FIELDS);
        let mut rest = data;
        for _ in 0..NUM_ROOT_RECORD_FIELDS {
            ensure!(rest.len() >= 2, "root record truncated");
            let len = u16::from_be_bytes(rest[0..2].try_into().unwrap()) as usize;
            rest = &rest[2..];
            ensure!(rest.len() >= len, "root record field truncated");
            fields.push(&rest[..len]);
            rest = &rest[len..];
        }
        ensure!(rest.is_empty(), "trailing bytes in root record");
        let sequencer_id =
            Hash32::from_slice(fields[0]).ok_or_else(|| eyre::eyre!("wrong sequencer id length"))?;
        let root =
            Hash32::from_slice(fields[1]).ok_or_else(|| eyre::eyre!("wrong root length"))?;
        if fields[2].len() != 8 || fields[3].len() != 8 || fields[4].len() != 8 {
            bail!("wrong data length");
        }
        let num_tx: [u8; 4] = fields[5]
            .try_into()
            .map_err(|_| eyre::eyre!("wrong data length"))?;
        Ok(Self {
            root,
            sequencer_id,
            ledger_coverage: u64::from_be_bytes(fields[2].try_into().unwrap()),
            slot_inflation: u64::from_be_bytes(fields[3].try_into().unwrap()),
            supply: u64::from_be_bytes(fields[4].try_into().unwrap()),
            num_transactions: u32::from_be_bytes(num_tx),
        })
    }

    /// The root is dominating at `numerator/denominator` iff coverage exceeds
    /// that fraction of the doubled supply.
    pub fn is_coverage_above_threshold(&self, numerator: u64, denominator: u64) -> bool {
        assert!(
            valid_threshold_fraction(numerator, denominator),
            "invalid threshold fraction {numerator}/{denominator}"
        );
        self.ledger_coverage > absolute_coverage_threshold(self.supply, numerator, denominator)
    }
}

pub fn valid_threshold_fraction(numerator: u64, denominator: u64) -> bool {
    numerator > 0 && numerator < denominator && denominator >= 2
}

/// `2 * supply * n/d`, ordered to avoid overflow.
pub fn absolute_coverage_threshold(supply: u64, numerator: u64, denominator: u64) -> u64 {
    ((supply / denominator) * numerator) << 1
}

// ---- root record partition

fn root_key(branch_id: &TxId) -> Vec<u8> {
    partition_key(PARTITION_ROOT, branch_id.as_ref())
}

pub fn put_root_record(store: &dyn KvStore, branch_id: &TxId, record: &RootRecord) {
    assert!(branch_id.is_branch(), "root record for a non-branch txid");
    store.put(&root_key(branch_id), &record.to_bytes());
    let slot = branch_id.slot();
    if fetch_latest_slot(store).map_or(true, |latest| slot > latest) {
        store.put(
            &partition_key(PARTITION_LATEST, &[]),
            &slot.to_be_bytes(),
        );
    }
}

pub fn fetch_root_record(store: &dyn KvStore, branch_id: &TxId) -> Option<RootRecord> {
    let data = store.get(&root_key(branch_id))?;
    Some(RootRecord::from_bytes(&data).expect("malformed root record in store"))
}

pub fn fetch_latest_slot(store: &dyn KvStore) -> Option<Slot> {
    let data = store.get(&partition_key(PARTITION_LATEST, &[]))?;
    let bytes: [u8; 4] = data.as_slice().try_into().expect("malformed latest slot");
    Some(Slot::from_be_bytes(bytes))
}

/// Root records of the given slots, in key (= timestamp-major) order.
pub fn iterate_slots(store: &dyn KvStore, slots: &[Slot]) -> Vec<(TxId, RootRecord)> {
    let mut ret = Vec::new();
    for slot in slots {
        let prefix = partition_key(PARTITION_ROOT, &TxId::slot_prefix(*slot));
        for (key, value) in store.iter_prefix(&prefix) {
            let txid = TxId::from_bytes(&key[1..]).expect("malformed branch txid key");
            let record = RootRecord::from_bytes(&value).expect("malformed root record in store");
            ret.push((txid, record));
        }
    }
    ret
}

/// Branches of the latest slot, heaviest first.
pub fn fetch_latest_root_records(store: &dyn KvStore) -> Vec<(TxId, RootRecord)> {
    let Some(latest) = fetch_latest_slot(store) else {
        return Vec::new();
    };
    let mut ret = iterate_slots(store, &[latest]);
    ret.sort_by(|a, b| b.1.ledger_coverage.cmp(&a.1.ledger_coverage));
    ret
}

// ---- committed state snapshots (TRIE partition)

/// One committed branch state, stored as a delta over its predecessor. The
/// root commitment chains the deltas, so equal roots mean equal states.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateDelta {
    pub branch_id: TxId,
    pub prev_root: Option<Hash32>,
    pub created: Vec<(OutputId, Output)>,
    pub spent: Vec<OutputId>,
    pub txids: Vec<TxId>,
}

impl StateDelta {
    pub fn root(&self) -> Hash32 {
        let encoded = bincode::serialize(self).expect("state delta serializes");
        let prev = self.prev_root.unwrap_or_default();
        Hash32::digest_parts(&[prev.as_ref(), &encoded])
    }
}

/// Writes the delta under its root commitment and returns the root.
pub fn commit_state(store: &dyn KvStore, delta: &StateDelta) -> Hash32 {
    let root = delta.root();
    let encoded = bincode::serialize(delta).expect("state delta serializes");
    store.put(&partition_key(PARTITION_TRIE, root.as_ref()), &encoded);
    root
}

fn fetch_delta(store: &dyn KvStore, root: &Hash32) -> Option<StateDelta> {
    let data = store.get(&partition_key(PARTITION_TRIE, root.as_ref()))?;
    Some(bincode::deserialize(&data).expect("malformed state delta in store"))
}

/// Read access to one committed state, identified by its root. Queries walk
/// the delta chain newest-first.
#[derive(Clone)]
pub struct StateReader {
    store: Arc<dyn KvStore>,
    root: Hash32,
}

impl StateReader {
    pub fn new(store: Arc<dyn KvStore>, root: Hash32) -> Result<Self> {
        ensure!(
            store.has(&partition_key(PARTITION_TRIE, root.as_ref())),
            "unknown state root {root:?}"
        );
        Ok(Self { store, root })
    }

    pub fn root(&self) -> Hash32 {
        self.root
    }

    fn walk<T>(&self, mut visit: impl FnMut(&StateDelta) -> Option<T>) -> Option<T> {
        let mut root = Some(self.root);
        while let Some(r) = root {
            let delta = fetch_delta(self.store.as_ref(), &r).expect("broken state delta chain");
            if let Some(ret) = visit(&delta) {
                return Some(ret);
            }
            root = delta.prev_root;
        }
        None
    }

    /// Whether the output exists and is unspent in this state.
    pub fn has_utxo(&self, oid: &OutputId) -> bool {
        self.get_utxo(oid).is_some()
    }

    pub fn get_utxo(&self, oid: &OutputId) -> Option<Output> {
        self.walk(|delta| {
            if delta.spent.contains(oid) {
                return Some(None);
            }
            delta
                .created
                .iter()
                .find(|(id, _)| id == oid)
                .map(|(_, output)| Some(output.clone()))
        })
        .flatten()
    }

    /// The branch "knows" a transaction iff it is committed in its state.
    pub fn knows_tx(&self, txid: &TxId) -> bool {
        self.walk(|delta| delta.txids.contains(txid).then_some(()))
            .is_some()
    }

    /// Latest unspent output carrying the chain constraint of `chain_id`.
    pub fn get_chain_output(&self, chain_id: &ChainId) -> Option<(OutputId, Output)> {
        let mut spent: Vec<OutputId> = Vec::new();
        self.walk(|delta| {
            let found = delta.created.iter().find(|(oid, output)| {
                output.chain_id() == Some(*chain_id) && !spent.contains(oid)
            });
            if let Some((oid, output)) = found {
                return Some((*oid, output.clone()));
            }
            spent.extend_from_slice(&delta.spent);
            None
        })
    }

    /// The stem output of the branch this state was committed by.
    pub fn get_stem_output(&self) -> Option<(OutputId, Output)> {
        let mut spent: Vec<OutputId> = Vec::new();
        self.walk(|delta| {
            let found = delta
                .created
                .iter()
                .find(|(oid, output)| output.is_stem() && !spent.contains(oid));
            if let Some((oid, output)) = found {
                return Some((*oid, output.clone()));
            }
            spent.extend_from_slice(&delta.spent);
            None
        })
    }

    /// All unspent outputs locked to `address`.
    pub fn account_outputs(&self, address: &Address) -> Vec<(OutputId, Output)> {
        let mut spent: Vec<OutputId> = Vec::new();
        let mut ret: Vec<(OutputId, Output)> = Vec::new();
        self.walk(|delta| {
            for (oid, output) in &delta.created {
                if output.lock == *address
                    && !spent.contains(oid)
                    && !ret.iter().any(|(id, _)| id == oid)
                {
                    ret.push((*oid, output.clone()));
                }
            }
            spent.extend_from_slice(&delta.spent);
            None::<()>
        });
        ret
    }
}

// ---- genesis

/// The origin branch: one sequencer chain per controller plus the stem.
#[derive(Clone, Debug)]
pub struct GenesisInfo {
    pub branch_id: TxId,
    pub root: Hash32,
    /// `(chain id, chain origin output)` per controller, in argument order.
    pub chains: Vec<(ChainId, OutputId)>,
    pub stem: OutputId,
}

/// Creates the origin branch state and its root record, unless the store
/// already has one. `chains` lists `(controller address, amount)`; the
/// amounts plus the faucet outputs must sum to the initial supply.
pub fn init_genesis(
    store: &dyn KvStore,
    chains: &[(Address, u64)],
    faucets: &[(Address, u64)],
) -> GenesisInfo {
    use crate::ledger::{Ledger, LedgerTime};
    use crate::types::make_origin_chain_id;

    assert!(!chains.is_empty(), "genesis needs at least one chain");
    let identity = Ledger::get().identity();
    let total: u64 = chains.iter().map(|(_, a)| a).sum::<u64>()
        + faucets.iter().map(|(_, a)| a).sum::<u64>();
    assert_eq!(
        total, identity.initial_supply,
        "genesis outputs must add up to the initial supply"
    );

    let branch_id = TxId::new(
        LedgerTime::slot_boundary(0),
        true,
        true,
        Hash32::digest(b"proxima.genesis"),
    );
    let mut created: Vec<(OutputId, Output)> = Vec::new();
    let mut chain_list: Vec<(ChainId, OutputId)> = Vec::new();
    for (i, (controller, amount)) in chains.iter().enumerate() {
        let oid = OutputId::new(branch_id, i as u8);
        let chain_id = make_origin_chain_id(&oid);
        created.push((
            oid,
            Output {
                amount: *amount,
                lock: *controller,
                kind: OutputKind::Sequencer { chain_id },
            },
        ));
        chain_list.push((chain_id, oid));
    }
    let stem_oid = OutputId::new(branch_id, chains.len() as u8);
    created.push((
        stem_oid,
        Output {
            amount: 0,
            lock: chains[0].0,
            // the genesis stem points at itself
            kind: OutputKind::Stem {
                predecessor: stem_oid,
            },
        },
    ));
    for (i, (owner, amount)) in faucets.iter().enumerate() {
        let oid = OutputId::new(branch_id, (chains.len() + 1 + i) as u8);
        created.push((oid, Output::plain(*amount, *owner)));
    }

    if let Some(existing) = fetch_root_record(store, &branch_id) {
        return GenesisInfo {
            branch_id,
            root: existing.root,
            chains: chain_list,
            stem: stem_oid,
        };
    }

    let delta = StateDelta {
        branch_id,
        prev_root: None,
        created,
        spent: Vec::new(),
        txids: vec![branch_id],
    };
    let root = commit_state(store, &delta);
    let record = RootRecord {
        root,
        sequencer_id: chain_list[0].0,
        ledger_coverage: identity.initial_supply,
        slot_inflation: 0,
        supply: identity.initial_supply,
        num_transactions: 1,
    };
    put_root_record(store, &branch_id, &record);
    tracing::info!("genesis branch {branch_id} committed with root {root:?}");
    GenesisInfo {
        branch_id,
        root,
        chains: chain_list,
        stem: stem_oid,
    }
}

// ---- branch data

/// RootRecord plus its stem and sequencer outputs resolved from the state.
#[derive(Clone, Debug)]
pub struct BranchData {
    pub branch_id: TxId,
    pub record: RootRecord,
    pub stem: (OutputId, Output),
    pub sequencer_output: (OutputId, Output),
}

pub fn fetch_branch_data(store: &Arc<dyn KvStore>, branch_id: &TxId) -> Option<BranchData> {
    let record = fetch_root_record(store.as_ref(), branch_id)?;
    let reader = StateReader::new(store.clone(), record.root).expect("root record without state");
    let stem = reader.get_stem_output().expect("branch state without stem");
    let sequencer_output = reader
        .get_chain_output(&record.sequencer_id)
        .expect("branch state without sequencer output");
    Some(BranchData {
        branch_id: *branch_id,
        record,
        stem,
        sequencer_output,
    })
}

/// Walks the chain of branches backwards by stem predecessor, preferring the
/// heaviest branch within each slot, for up to `n_back` slots.
pub fn heaviest_chain_n_slots_back(store: &Arc<dyn KvStore>, n_back: usize) -> Vec<BranchData> {
    let latest = fetch_latest_root_records(store.as_ref());
    let Some((heaviest_id, _)) = latest.first() else {
        return Vec::new();
    };
    let mut ret = Vec::new();
    let mut current = fetch_branch_data(store, heaviest_id).expect("latest branch has data");
    loop {
        let pred_branch = match &current.stem.1.kind {
            OutputKind::Stem { predecessor } => predecessor.txid,
            _ => unreachable!("stem output has stem kind"),
        };
        // the genesis stem points at itself
        let reached_genesis = pred_branch == current.branch_id;
        ret.push(current);
        if ret.len() >= n_back || reached_genesis {
            break;
        }
        match fetch_branch_data(store, &pred_branch) {
            Some(bd) => current = bd,
            None => break,
        }
    }
    ret
}

/// True if `predecessor` is committed in the state of `descendant`.
pub fn branch_is_descendant_of(
    store: &Arc<dyn KvStore>,
    descendant: &TxId,
    predecessor: &TxId,
) -> bool {
    assert!(descendant.is_branch(), "descendant must be a branch");
    if descendant == predecessor {
        return true;
    }
    if descendant.timestamp() < predecessor.timestamp() {
        return false;
    }
    let Some(record) = fetch_root_record(store.as_ref(), descendant) else {
        return false;
    };
    match StateReader::new(store.clone(), record.root) {
        Ok(reader) => reader.knows_tx(predecessor),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Hash32;
    use crate::ledger::LedgerTime;
    use crate::store::MemStore;

    fn branch_txid(slot: Slot, seed: &[u8]) -> TxId {
        TxId::new(
            LedgerTime::slot_boundary(slot),
            true,
            true,
            Hash32::digest(seed),
        )
    }

    fn record(root: Hash32, coverage: u64, supply: u64) -> RootRecord {
        RootRecord {
            root,
            sequencer_id: Hash32::digest(b"chain"),
            ledger_coverage: coverage,
            slot_inflation: 5,
            supply,
            num_transactions: 17,
        }
    }

    #[test]
    fn root_record_roundtrip() {
        let r = record(Hash32::digest(b"root"), 1_000_000, 2_000_000);
        let decoded = RootRecord::from_bytes(&r.to_bytes()).unwrap();
        assert_eq!(decoded, r);
    }

    #[test]
    fn root_record_rejects_length_mismatch() {
        let r = record(Hash32::digest(b"root"), 1, 1);
        let mut data = r.to_bytes();
        data.push(0); // trailing byte
        assert!(RootRecord::from_bytes(&data).is_err());
        let data = r.to_bytes();
        assert!(RootRecord::from_bytes(&data[..data.len() - 1]).is_err());
    }

    #[test]
    fn coverage_threshold() {
        // supply 1000, threshold 1/2 -> dominating iff coverage > 1000
        let supply = 1000;
        assert!(!record(Hash32::default(), 1000, supply).is_coverage_above_threshold(1, 2));
        assert!(record(Hash32::default(), 1001, supply).is_coverage_above_threshold(1, 2));
        assert!(valid_threshold_fraction(1, 2));
        assert!(!valid_threshold_fraction(0, 2));
        assert!(!valid_threshold_fraction(2, 2));
        assert!(!valid_threshold_fraction(1, 1));
    }

    #[test]
    fn latest_slot_tracks_maximum() {
        let store = MemStore::new();
        let r = record(Hash32::digest(b"r"), 10, 100);
        put_root_record(&store, &branch_txid(5, b"a"), &r);
        assert_eq!(fetch_latest_slot(&store), Some(5));
        put_root_record(&store, &branch_txid(3, b"b"), &r);
        assert_eq!(fetch_latest_slot(&store), Some(5));
        put_root_record(&store, &branch_txid(9, b"c"), &r);
        assert_eq!(fetch_latest_slot(&store), Some(9));
    }

    #[test]
    fn slot_iteration_sees_only_requested_slots() {
        let store = MemStore::new();
        let r = record(Hash32::digest(b"r"), 10, 100);
        put_root_record(&store, &branch_txid(1, b"a"), &r);
        put_root_record(&store, &branch_txid(1, b"b"), &r);
        put_root_record(&store, &branch_txid(2, b"c"), &r);
        assert_eq!(iterate_slots(&store, &[1]).len(), 2);
        assert_eq!(iterate_slots(&store, &[2]).len(), 1);
        assert_eq!(iterate_slots(&store, &[3]).len(), 0);
        assert_eq!(iterate_slots(&store, &[1, 2]).len(), 3);
    }

    #[test]
    fn heaviest_chain_walks_stem_predecessors() {
        use crate::ledger::Ledger;

        let store: Arc<dyn KvStore> = Arc::new(MemStore::new());
        let controller = Hash32::digest(b"controller");
        let supply = Ledger::get().identity().initial_supply;
        let genesis = init_genesis(store.as_ref(), &[(controller, supply)], &[]);

        // two competing branches at slot 1, both extending the genesis stem
        let mut commit_branch = |seed: &[u8], coverage: u64| -> TxId {
            let branch = branch_txid(1, seed);
            let chain_id = genesis.chains[0].0;
            let delta = StateDelta {
                branch_id: branch,
                prev_root: Some(genesis.root),
                created: vec![
                    (
                        OutputId::new(branch, 0),
                        Output {
                            amount: supply,
                            lock: controller,
                            kind: OutputKind::Sequencer { chain_id },
                        },
                    ),
                    (
                        OutputId::new(branch, 1),
                        Output {
                            amount: 0,
                            lock: controller,
                            kind: OutputKind::Stem {
                                predecessor: genesis.stem,
                            },
                        },
                    ),
                ],
                spent: vec![genesis.chains[0].1, genesis.stem],
                txids: vec![branch],
            };
            let root = commit_state(store.as_ref(), &delta);
            put_root_record(
                store.as_ref(),
                &branch,
                &RootRecord {
                    root,
                    sequencer_id: chain_id,
                    ledger_coverage: coverage,
                    slot_inflation: 0,
                    supply,
                    num_transactions: 2,
                },
            );
            branch
        };
        let _light = commit_branch(b"light", supply + 10);
        let heavy = commit_branch(b"heavy", supply + 500);

        let chain = heaviest_chain_n_slots_back(&store, 10);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].branch_id, heavy);
        assert_eq!(chain[1].branch_id, genesis.branch_id);
        // the walk stops at the self-referential genesis stem
        assert!(matches!(
            &chain[1].stem.1.kind,
            OutputKind::Stem { predecessor } if *predecessor == genesis.stem
        ));
    }

    #[test]
    fn state_reader_shadows_spent_outputs() {
        let store: Arc<dyn KvStore> = Arc::new(MemStore::new());
        let b0 = branch_txid(1, b"b0");
        let oid = OutputId::new(b0, 0);
        let lock = Hash32::digest(b"owner");
        let root0 = commit_state(
            store.as_ref(),
            &StateDelta {
                branch_id: b0,
                prev_root: None,
                created: vec![(oid, Output::plain(100, lock))],
                spent: vec![],
                txids: vec![b0],
            },
        );
        let b1 = branch_txid(2, b"b1");
        let oid1 = OutputId::new(b1, 0);
        let root1 = commit_state(
            store.as_ref(),
            &StateDelta {
                branch_id: b1,
                prev_root: Some(root0),
                created: vec![(oid1, Output::plain(100, lock))],
                spent: vec![oid],
                txids: vec![b1],
            },
        );

        let r0 = StateReader::new(store.clone(), root0).unwrap();
        assert!(r0.has_utxo(&oid));
        assert!(!r0.has_utxo(&oid1));
        assert!(r0.knows_tx(&b0));
        assert!(!r0.knows_tx(&b1));

        let r1 = StateReader::new(store.clone(), root1).unwrap();
        assert!(!r1.has_utxo(&oid));
        assert!(r1.has_utxo(&oid1));
        assert!(r1.knows_tx(&b0));
        assert_eq!(r1.account_outputs(&lock).len(), 1);
    }
}
