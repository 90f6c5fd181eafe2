// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{
    fmt,
    sync::atomic::{AtomicU32, Ordering},
    sync::{Arc, Weak},
};

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::ledger::{LedgerTime, Slot};
use crate::types::{make_origin_chain_id, ChainId, Output, OutputId, Transaction, TxId, NIL_CHAIN_ID};

pub const FLAG_VERTEX_DEFINED: u8 = 0x01;
pub const FLAG_BASELINE_SOLID: u8 = 0x02;
pub const FLAG_ENDORSEMENTS_SOLID: u8 = 0x04;
pub const FLAG_INPUTS_SOLID: u8 = 0x08;
pub const FLAG_CONSTRAINTS_VALID: u8 = 0x10;

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum Status {
    Undefined,
    Good,
    Bad,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Undefined => write!(f, "UNDEF"),
            Status::Good => write!(f, "GOOD"),
            Status::Bad => write!(f, "BAD"),
        }
    }
}

/// Full vertex: parsed body plus resolved dependency pointers. A `None`
/// slot is a dependency that has not been solidified yet.
pub struct VertexBody {
    pub tx: Transaction,
    pub inputs: Vec<Option<Arc<Vtx>>>,
    pub endorsements: Vec<Option<Arc<Vtx>>>,
}

impl VertexBody {
    pub fn new(tx: Transaction) -> Self {
        let inputs = vec![None; tx.num_inputs()];
        let endorsements = vec![None; tx.num_endorsements()];
        Self {
            tx,
            inputs,
            endorsements,
        }
    }

    pub fn all_inputs_solid(&self) -> bool {
        self.inputs.iter().all(|i| i.is_some())
    }

    pub fn all_endorsements_solid(&self) -> bool {
        self.endorsements.iter().all(|e| e.is_some())
    }

    /// Input slot consuming the chain predecessor, for sequencer txs.
    pub fn chain_predecessor(&self) -> Option<&Option<Arc<Vtx>>> {
        let seq = self.tx.sequencer_data()?;
        self.inputs.get(seq.predecessor_input_index as usize)
    }
}

/// Partially materialised transaction: only some produced outputs are known.
#[derive(Default)]
pub struct VirtualTx {
    outputs: AHashMap<u8, Output>,
    /// `(sequencer output index, stem output index)` when known.
    sequencer_indices: Option<(u8, Option<u8>)>,
}

impl VirtualTx {
    pub fn add_output(&mut self, index: u8, output: Output) {
        self.outputs.entry(index).or_insert(output);
    }

    pub fn output_at(&self, index: u8) -> Option<&Output> {
        self.outputs.get(&index)
    }

    pub fn set_sequencer_indices(&mut self, sequencer: u8, stem: Option<u8>) {
        self.sequencer_indices = Some((sequencer, stem));
    }
}

enum Shape {
    Virtual(VirtualTx),
    Full(Box<VertexBody>),
    Deleted,
}

struct Inner {
    shape: Shape,
    flags: u8,
    err: Option<String>,
    coverage: Option<u64>,
    baseline: Option<TxId>,
}

/// The DAG node: stable identity, mutable shape. The outer `Arc<Vtx>` stays
/// valid for the whole lifetime; shape conversions happen in place.
pub struct Vtx {
    pub id: TxId,
    inner: RwLock<Inner>,
    // DAG liveness count, separate from Arc memory ownership. Starts at 1
    // (the registry's own reference); 0 is terminal and publishes Deleted.
    references: AtomicU32,
    // Back-edges are weak: consumers never keep a vertex alive.
    consumers: Mutex<AHashMap<u8, Vec<Weak<Vtx>>>>,
    poke: Mutex<Option<Arc<Notify>>>,
}

impl Vtx {
    pub fn new_virtual(id: TxId) -> Arc<Self> {
        Arc::new(Self {
            id,
            inner: RwLock::new(Inner {
                shape: Shape::Virtual(VirtualTx::default()),
                flags: 0,
                err: None,
                coverage: None,
                baseline: None,
            }),
            references: AtomicU32::new(1),
            consumers: Mutex::new(AHashMap::new()),
            poke: Mutex::new(None),
        })
    }

    fn panic_access_deleted(&self) -> ! {
        panic!("deleted vertex accessed: {}", self.id)
    }

    // ---- identity

    pub fn timestamp(&self) -> LedgerTime {
        self.id.timestamp()
    }

    pub fn slot(&self) -> Slot {
        self.id.slot()
    }

    pub fn is_branch(&self) -> bool {
        self.id.is_branch()
    }

    pub fn is_sequencer_milestone(&self) -> bool {
        self.id.is_sequencer()
    }

    // ---- shape access

    pub fn is_full_vertex(&self) -> bool {
        matches!(self.inner.read().shape, Shape::Full(_))
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.inner.read().shape, Shape::Virtual(_))
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.inner.read().shape, Shape::Deleted)
    }

    pub fn with_full<R>(&self, f: impl FnOnce(&VertexBody) -> R) -> Option<R> {
        match &self.inner.read().shape {
            Shape::Full(body) => Some(f(body)),
            Shape::Virtual(_) => None,
            Shape::Deleted => self.panic_access_deleted(),
        }
    }

    pub fn with_full_mut<R>(&self, f: impl FnOnce(&mut VertexBody) -> R) -> Option<R> {
        match &mut self.inner.write().shape {
            Shape::Full(body) => Some(f(body)),
            Shape::Virtual(_) => None,
            Shape::Deleted => self.panic_access_deleted(),
        }
    }

    pub fn with_virtual_mut<R>(&self, f: impl FnOnce(&mut VirtualTx) -> R) -> Option<R> {
        match &mut self.inner.write().shape {
            Shape::Virtual(v) => Some(f(v)),
            Shape::Full(_) => None,
            Shape::Deleted => self.panic_access_deleted(),
        }
    }

    /// Upgrades Virtual to Full in place when the parsed body arrives.
    /// Returns false if the vertex already is a full vertex.
    pub fn convert_virtual_to_full(&self, tx: Transaction) -> bool {
        assert_eq!(*tx.id(), self.id, "txid mismatch in shape conversion");
        let mut inner = self.inner.write();
        match &inner.shape {
            Shape::Virtual(_) => {
                let mut flags = inner.flags;
                if !tx.is_sequencer_milestone() {
                    // baseline and endorsements are no concern for
                    // non-sequencer transactions
                    flags |= FLAG_BASELINE_SOLID | FLAG_ENDORSEMENTS_SOLID;
                }
                inner.shape = Shape::Full(Box::new(VertexBody::new(tx)));
                inner.flags = flags;
                true
            }
            Shape::Full(_) => false,
            Shape::Deleted => self.panic_access_deleted(),
        }
    }

    /// Sheds the full body of a branch whose state is committed, keeping the
    /// produced outputs materialised. Returns the dropped dependency
    /// pointers so the caller can release their references.
    pub fn convert_full_to_virtual(&self) -> Vec<Arc<Vtx>> {
        let mut inner = self.inner.write();
        match std::mem::replace(&mut inner.shape, Shape::Deleted) {
            Shape::Full(body) => {
                let mut virtual_tx = VirtualTx::default();
                for (idx, output) in body.tx.produced_outputs().iter().enumerate() {
                    virtual_tx.add_output(idx as u8, output.clone());
                }
                if let Some(seq) = body.tx.sequencer_data() {
                    virtual_tx
                        .set_sequencer_indices(seq.sequencer_output_index, seq.stem_output_index);
                }
                inner.shape = Shape::Virtual(virtual_tx);
                let mut dropped: Vec<Arc<Vtx>> = Vec::new();
                dropped.extend(body.inputs.into_iter().flatten());
                dropped.extend(body.endorsements.into_iter().flatten());
                dropped
            }
            virtual_shape @ Shape::Virtual(_) => {
                inner.shape = virtual_shape;
                Vec::new()
            }
            Shape::Deleted => self.panic_access_deleted(),
        }
    }

    /// Tombstones the vertex and returns the forward edges it held.
    pub fn mark_deleted(&self) -> Vec<Arc<Vtx>> {
        let mut inner = self.inner.write();
        match std::mem::replace(&mut inner.shape, Shape::Deleted) {
            Shape::Full(body) => {
                let mut dropped: Vec<Arc<Vtx>> = Vec::new();
                dropped.extend(body.inputs.into_iter().flatten());
                dropped.extend(body.endorsements.into_iter().flatten());
                dropped
            }
            Shape::Virtual(_) => Vec::new(),
            Shape::Deleted => self.panic_access_deleted(),
        }
    }

    // ---- produced outputs

    /// Output at `index` if materialised. Panics on a deleted vertex.
    pub fn output_at(&self, index: u8) -> Option<Output> {
        match &self.inner.read().shape {
            Shape::Full(body) => body.tx.produced_output_at(index).cloned(),
            Shape::Virtual(v) => v.output_at(index).cloned(),
            Shape::Deleted => self.panic_access_deleted(),
        }
    }

    /// `(available, wrong_index)` in the manner of the output resolver.
    pub fn has_output_at(&self, index: u8) -> (bool, bool) {
        match &self.inner.read().shape {
            Shape::Full(body) => {
                if index as usize >= body.tx.num_produced_outputs() {
                    (false, true)
                } else {
                    (true, false)
                }
            }
            Shape::Virtual(v) => (v.output_at(index).is_some(), false),
            Shape::Deleted => (false, false),
        }
    }

    /// All currently materialised produced outputs.
    pub fn known_outputs(&self) -> Vec<(u8, Output)> {
        match &self.inner.read().shape {
            Shape::Full(body) => body
                .tx
                .produced_outputs()
                .iter()
                .enumerate()
                .map(|(i, o)| (i as u8, o.clone()))
                .collect(),
            Shape::Virtual(v) => {
                let mut ret: Vec<_> = v.outputs.iter().map(|(i, o)| (*i, o.clone())).collect();
                ret.sort_by_key(|(i, _)| *i);
                ret
            }
            Shape::Deleted => self.panic_access_deleted(),
        }
    }

    /// Stores an output delivered for a virtual vertex; on a full vertex
    /// checks consistency instead. False means the index is out of range.
    pub fn ensure_output(&self, index: u8, output: &Output) -> bool {
        match &mut self.inner.write().shape {
            Shape::Full(body) => match body.tx.produced_output_at(index) {
                Some(existing) => {
                    assert_eq!(existing, output, "inconsistent output data at {index}");
                    true
                }
                None => false,
            },
            Shape::Virtual(v) => {
                v.add_output(index, output.clone());
                true
            }
            Shape::Deleted => self.panic_access_deleted(),
        }
    }

    pub fn output_id_at(&self, index: u8) -> OutputId {
        OutputId::new(self.id, index)
    }

    /// Chain id, when it can be read from the body or the materialised
    /// sequencer output.
    pub fn sequencer_chain_id(&self) -> Option<ChainId> {
        match &self.inner.read().shape {
            Shape::Full(body) => body.tx.sequencer_chain_id(),
            Shape::Virtual(v) => {
                let (seq_idx, _) = v.sequencer_indices?;
                let output = v.output_at(seq_idx)?;
                let chain_id = output.chain_id()?;
                if chain_id == NIL_CHAIN_ID {
                    Some(make_origin_chain_id(&self.output_id_at(seq_idx)))
                } else {
                    Some(chain_id)
                }
            }
            Shape::Deleted => self.panic_access_deleted(),
        }
    }

    /// The sequencer output of a milestone, when materialised.
    pub fn sequencer_output(&self) -> Option<(OutputId, Output)> {
        match &self.inner.read().shape {
            Shape::Full(body) => {
                let seq = body.tx.sequencer_data()?;
                let output = body.tx.produced_output_at(seq.sequencer_output_index)?;
                Some((
                    self.output_id_at(seq.sequencer_output_index),
                    output.clone(),
                ))
            }
            Shape::Virtual(v) => {
                let (seq_idx, _) = v.sequencer_indices?;
                let output = v.output_at(seq_idx)?;
                Some((self.output_id_at(seq_idx), output.clone()))
            }
            Shape::Deleted => self.panic_access_deleted(),
        }
    }

    /// The stem output of a branch, when materialised.
    pub fn stem_output(&self) -> Option<(OutputId, Output)> {
        match &self.inner.read().shape {
            Shape::Full(body) => {
                let seq = body.tx.sequencer_data()?;
                let stem_idx = seq.stem_output_index?;
                let output = body.tx.produced_output_at(stem_idx)?;
                Some((self.output_id_at(stem_idx), output.clone()))
            }
            Shape::Virtual(v) => {
                let (_, stem_idx) = v.sequencer_indices?;
                let stem_idx = stem_idx?;
                let output = v.output_at(stem_idx)?;
                Some((self.output_id_at(stem_idx), output.clone()))
            }
            Shape::Deleted => self.panic_access_deleted(),
        }
    }

    // ---- status and flags

    pub fn flags(&self) -> u8 {
        self.inner.read().flags
    }

    pub fn flags_up(&self, mask: u8) -> bool {
        self.inner.read().flags & mask == mask
    }

    pub fn set_flags_up(&self, mask: u8) {
        self.inner.write().flags |= mask;
    }

    pub fn status(&self) -> Status {
        let inner = self.inner.read();
        Self::status_of(&inner)
    }

    fn status_of(inner: &Inner) -> Status {
        if inner.flags & FLAG_VERTEX_DEFINED == 0 {
            debug_assert!(inner.err.is_none());
            Status::Undefined
        } else if inner.err.is_some() {
            Status::Bad
        } else {
            Status::Good
        }
    }

    /// Terminal transition to Good. Must happen at most once.
    pub fn set_status_good(&self) {
        let mut inner = self.inner.write();
        assert_eq!(
            Self::status_of(&inner),
            Status::Undefined,
            "status already defined for {}",
            self.id
        );
        inner.flags |= FLAG_VERTEX_DEFINED;
    }

    /// Race-tolerant variant for vertices defined from the committed state:
    /// several attachers may resolve the same ancestor concurrently.
    /// Returns false if the status was already terminal.
    pub fn try_set_status_good(&self) -> bool {
        let mut inner = self.inner.write();
        if Self::status_of(&inner) != Status::Undefined {
            return false;
        }
        inner.flags |= FLAG_VERTEX_DEFINED;
        true
    }

    /// Terminal transition to Bad with the reason.
    pub fn set_status_bad(&self, reason: impl Into<String>) {
        let mut inner = self.inner.write();
        assert_eq!(
            Self::status_of(&inner),
            Status::Undefined,
            "status already defined for {}",
            self.id
        );
        inner.err = Some(reason.into());
        inner.flags |= FLAG_VERTEX_DEFINED;
    }

    pub fn error(&self) -> Option<String> {
        self.inner.read().err.clone()
    }

    pub fn is_bad_or_deleted(&self) -> bool {
        let inner = self.inner.read();
        Self::status_of(&inner) == Status::Bad || matches!(inner.shape, Shape::Deleted)
    }

    // ---- baseline and coverage

    pub fn baseline_branch(&self) -> Option<TxId> {
        if self.id.is_branch() {
            return Some(self.id);
        }
        self.inner.read().baseline
    }

    pub fn set_baseline_branch(&self, branch: TxId) {
        assert!(branch.is_branch(), "baseline must be a branch txid");
        let mut inner = self.inner.write();
        inner.baseline = Some(branch);
        inner.flags |= FLAG_BASELINE_SOLID;
    }

    pub fn coverage(&self) -> Option<u64> {
        self.inner.read().coverage
    }

    pub fn set_coverage(&self, coverage: u64) {
        self.inner.write().coverage = Some(coverage);
    }

    pub fn coverage_sum(&self) -> u64 {
        self.coverage().unwrap_or(0)
    }

    // ---- reference counting

    /// Acquire a DAG reference; false means the vertex is being torn down.
    pub fn reference(&self) -> bool {
        self.references
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n == 0 {
                    None
                } else {
                    assert!(n < u32::MAX, "reference overflow on {}", self.id);
                    Some(n + 1)
                }
            })
            .is_ok()
    }

    /// Release a DAG reference; returns the remaining count.
    pub fn unreference(&self) -> u32 {
        let prev = self.references.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "unreference of a deleted vertex {}", self.id);
        prev - 1
    }

    pub fn num_references(&self) -> u32 {
        self.references.load(Ordering::Acquire)
    }

    // ---- consumer index

    /// Registers `consumer` as a spender of produced output `index` and
    /// returns all currently known consumers of that output.
    pub fn attach_consumer(&self, index: u8, consumer: &Arc<Vtx>) -> Vec<Arc<Vtx>> {
        let mut consumers = self.consumers.lock();
        let list = consumers.entry(index).or_default();
        if !list
            .iter()
            .any(|w| w.as_ptr() == Arc::as_ptr(consumer))
        {
            list.push(Arc::downgrade(consumer));
        }
        list.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn consumers_of(&self, index: u8) -> Vec<Arc<Vtx>> {
        let consumers = self.consumers.lock();
        consumers
            .get(&index)
            .map(|list| list.iter().filter_map(Weak::upgrade).collect())
            .unwrap_or_default()
    }

    /// `(consumed outputs, conflict sets)` for introspection.
    pub fn num_consumers(&self) -> (usize, usize) {
        let mut consumers = self.consumers.lock();
        let mut consumed = 0;
        let mut conflicts = 0;
        for list in consumers.values_mut() {
            list.retain(|w| w.strong_count() > 0);
            if !list.is_empty() {
                consumed += 1;
            }
            if list.len() > 1 {
                conflicts += 1;
            }
        }
        (consumed, conflicts)
    }

    // ---- poke slot

    /// Installs the wake-up target of the attacher currently waiting on this
    /// vertex. A single slot: the newest registration wins.
    pub fn set_poke_target(&self, notify: Arc<Notify>) {
        *self.poke.lock() = Some(notify);
    }

    pub fn clear_poke_target(&self) {
        *self.poke.lock() = None;
    }

    /// Non-blocking: flips the waiter's notification if one is installed.
    pub fn poke(&self) {
        let target = self.poke.lock().clone();
        if let Some(notify) = target {
            notify.notify_one();
        }
    }
}

impl fmt::Debug for Vtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        let shape = match &inner.shape {
            Shape::Full(_) => "vertex",
            Shape::Virtual(_) => "virtualTx",
            Shape::Deleted => "deleted",
        };
        write!(
            f,
            "{} {} ({}, flags {:08b}, refs {})",
            self.id,
            shape,
            Self::status_of(&inner),
            inner.flags,
            self.num_references(),
        )
    }
}

/// Strong preference order between milestones: higher coverage first, then
/// younger timestamp, then bigger txid.
pub fn is_preferred_base(cov1: u64, cov2: u64, id1: &TxId, id2: &TxId) -> bool {
    match cov1.cmp(&cov2) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => {
            if id1.timestamp() == id2.timestamp() {
                id1.0 > id2.0
            } else {
                id2.timestamp() < id1.timestamp()
            }
        }
    }
}

pub fn is_preferred_milestone(a: &Arc<Vtx>, b: &Arc<Vtx>) -> bool {
    assert!(
        a.is_sequencer_milestone() && b.is_sequencer_milestone(),
        "preference is defined on sequencer milestones"
    );
    if Arc::ptr_eq(a, b) {
        return false;
    }
    is_preferred_base(a.coverage_sum(), b.coverage_sum(), &a.id, &b.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Hash32;

    fn txid(slot: Slot, tick: u8, seed: &[u8]) -> TxId {
        TxId::new(LedgerTime::new(slot, tick), false, false, Hash32::digest(seed))
    }

    fn seq_txid(slot: Slot, tick: u8, seed: &[u8]) -> TxId {
        TxId::new(
            LedgerTime::new(slot, tick),
            true,
            tick == 0,
            Hash32::digest(seed),
        )
    }

    #[test]
    fn status_transitions_are_terminal() {
        let v = Vtx::new_virtual(txid(1, 1, b"a"));
        assert_eq!(v.status(), Status::Undefined);
        v.set_status_good();
        assert_eq!(v.status(), Status::Good);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            v.set_status_bad("late")
        }));
        assert!(result.is_err());
    }

    #[test]
    fn bad_carries_reason() {
        let v = Vtx::new_virtual(txid(1, 2, b"b"));
        v.set_status_bad("double-spend in past cone");
        assert_eq!(v.status(), Status::Bad);
        assert_eq!(v.error().unwrap(), "double-spend in past cone");
    }

    #[test]
    fn reference_counting_is_terminal_at_zero() {
        let v = Vtx::new_virtual(txid(1, 3, b"c"));
        assert_eq!(v.num_references(), 1);
        assert!(v.reference());
        assert_eq!(v.unreference(), 1);
        assert_eq!(v.unreference(), 0);
        // zero is terminal: no resurrection
        assert!(!v.reference());
    }

    #[test]
    fn deleted_access_panics() {
        let v = Vtx::new_virtual(txid(1, 4, b"d"));
        v.mark_deleted();
        assert!(v.is_deleted());
        let result =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| v.output_at(0)));
        assert!(result.is_err());
    }

    #[test]
    fn virtual_outputs_accumulate() {
        let v = Vtx::new_virtual(txid(2, 5, b"e"));
        assert_eq!(v.has_output_at(0), (false, false));
        assert!(v.ensure_output(0, &Output::plain(100, Hash32::digest(b"o"))));
        assert_eq!(v.has_output_at(0), (true, false));
        assert_eq!(v.output_at(0).unwrap().amount, 100);
        assert_eq!(v.known_outputs().len(), 1);
    }

    #[test]
    fn consumer_index_tracks_conflicts() {
        let produced = Vtx::new_virtual(txid(1, 1, b"p"));
        let a = Vtx::new_virtual(txid(1, 2, b"x"));
        let b = Vtx::new_virtual(txid(1, 3, b"y"));
        assert_eq!(produced.attach_consumer(0, &a).len(), 1);
        // registering the same consumer twice does not duplicate
        assert_eq!(produced.attach_consumer(0, &a).len(), 1);
        assert_eq!(produced.attach_consumer(0, &b).len(), 2);
        assert_eq!(produced.num_consumers(), (1, 1));
        // back-edges are weak: dropping a consumer prunes it
        drop(b);
        assert_eq!(produced.num_consumers(), (1, 0));
    }

    #[test]
    fn baseline_of_branch_is_itself() {
        let branch = Vtx::new_virtual(seq_txid(3, 0, b"br"));
        assert_eq!(branch.baseline_branch(), Some(branch.id));
        let plain = Vtx::new_virtual(txid(3, 5, b"pl"));
        assert_eq!(plain.baseline_branch(), None);
        plain.set_baseline_branch(branch.id);
        assert_eq!(plain.baseline_branch(), Some(branch.id));
        assert!(plain.flags_up(FLAG_BASELINE_SOLID));
    }

    #[test]
    fn milestone_preference_order() {
        let id_old = seq_txid(1, 10, b"m1");
        let id_young = seq_txid(1, 20, b"m2");
        // higher coverage wins
        assert!(is_preferred_base(100, 50, &id_old, &id_young));
        assert!(!is_preferred_base(50, 100, &id_young, &id_old));
        // equal coverage: younger timestamp wins
        assert!(is_preferred_base(100, 100, &id_young, &id_old));
        assert!(!is_preferred_base(100, 100, &id_old, &id_young));
        // equal coverage and timestamp: bigger id wins
        let a = seq_txid(1, 10, b"aa");
        let b = seq_txid(1, 10, b"bb");
        let bigger = if a.0 > b.0 { a } else { b };
        let smaller = if a.0 > b.0 { b } else { a };
        assert!(is_preferred_base(7, 7, &bigger, &smaller));
        assert!(!is_preferred_base(7, 7, &smaller, &bigger));
    }

    #[test]
    fn poke_notifies_installed_target() {
        let v = Vtx::new_virtual(txid(1, 6, b"f"));
        v.poke(); // no target installed: a no-op
        let notify = Arc::new(Notify::new());
        v.set_poke_target(notify.clone());
        v.poke();
        // the permit is stored, so the next await returns immediately
        let fut = notify.notified();
        futures::pin_mut!(fut);
        assert!(futures::FutureExt::now_or_never(fut).is_some());
    }
}
