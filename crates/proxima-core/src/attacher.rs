// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use tokio::sync::{watch, Notify};
use tokio::time::{sleep, sleep_until, Duration, Instant};

use crate::constraints;
use crate::dag::Dag;
use crate::metrics::Metrics;
use crate::multistate::{
    commit_state, fetch_latest_root_records, fetch_root_record, put_root_record, RootRecord,
    StateDelta, StateReader,
};
use crate::peering::{Gossip, PullRequest, TxGossip, TxMetadata, TxSource};
use crate::poker::Poker;
use crate::store::KvStore;
use crate::tip_pool::SequencerTips;
use crate::types::{Output, OutputId, OutputKind, Transaction, TxId};
use crate::vertex::{
    is_preferred_base, Status, Vtx, FLAG_BASELINE_SOLID, FLAG_CONSTRAINTS_VALID,
    FLAG_ENDORSEMENTS_SOLID, FLAG_INPUTS_SOLID,
};

/// Deadline for milestone submissions from own sequencers.
pub const MILESTONE_ATTACH_TIMEOUT: Duration = Duration::from_secs(5);
/// Deadline for ordinary transactions.
pub const DEFAULT_ATTACH_TIMEOUT: Duration = Duration::from_secs(30);

const FOREIGN_STATUS_POLL: Duration = Duration::from_millis(10);
/// Safety net against a poke racing the Wait registration: suspended
/// attachers re-enter the step at this cadence even without a wake-up.
const SUSPEND_RECHECK: Duration = Duration::from_millis(200);

/// Shared collaborators of every attacher task.
pub struct AttacherEnv {
    pub dag: Arc<Dag>,
    pub poker: Arc<Poker>,
    pub state: Arc<dyn KvStore>,
    pub tips: Arc<SequencerTips>,
    pub pull: Arc<dyn PullRequest>,
    pub gossip: Arc<dyn Gossip>,
    pub metrics: Arc<Metrics>,
    pub shutdown: watch::Receiver<bool>,
}

enum StepOutcome {
    /// Status went terminal; publication side effects follow.
    Done,
    Bad(String),
    /// Cannot classify yet: wait for the listed vertices.
    Suspend(Vec<TxId>),
}

enum BaselineState {
    Ready {
        record: RootRecord,
        reader: StateReader,
    },
    Waiting(Vec<TxId>),
}

struct Cone {
    /// Non-committed full vertices of the past cone, self included,
    /// sorted by txid.
    vertices: Vec<Arc<Vtx>>,
    ids: AHashSet<TxId>,
}

/// Cooperative task solidifying one transaction: resolves dependencies,
/// propagates the baseline, checks conflicts, validates constraints,
/// computes coverage and publishes Good or Bad exactly once.
pub struct Attacher {
    env: Arc<AttacherEnv>,
    vid: Arc<Vtx>,
    notify: Arc<Notify>,
    source: TxSource,
}

/// Entry point: spawned when raw bytes passed the basic parse. Returns the
/// vertex after its status went terminal (or the deadline hit).
pub async fn attach_transaction(
    env: Arc<AttacherEnv>,
    tx: Transaction,
    source: TxSource,
    timeout: Duration,
) -> Arc<Vtx> {
    let vid = if tx.id().is_branch() {
        env.dag
            .ensure_branch(*tx.id())
            .expect("branch flag verified at parse")
    } else {
        env.dag.get_or_create_virtual(*tx.id())
    };
    let owns_status = vid.convert_virtual_to_full(tx);
    let attacher = Attacher {
        env: env.clone(),
        vid: vid.clone(),
        notify: Arc::new(Notify::new()),
        source,
    };
    if owns_status {
        attacher.run(timeout).await;
    } else {
        // another attacher owns this vertex: just wait for its verdict
        attacher.wait_foreign(timeout).await;
    }
    env.dag.unreference(&vid);
    vid
}

impl Attacher {
    async fn run(self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut shutdown = self.env.shutdown.clone();
        self.vid.set_poke_target(self.notify.clone());

        loop {
            if self.vid.status() != Status::Undefined {
                break;
            }
            match self.step() {
                StepOutcome::Done => break,
                StepOutcome::Bad(reason) => {
                    tracing::debug!("attacher: {} marked bad: {}", self.vid.id, reason);
                    self.vid.set_status_bad(reason);
                    break;
                }
                StepOutcome::Suspend(waiting_for) => {
                    for wanted in &waiting_for {
                        self.env
                            .poker
                            .wake_me_when(*wanted, self.vid.clone())
                            .await;
                    }
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = sleep(SUSPEND_RECHECK) => {}
                        _ = sleep_until(deadline) => {
                            self.vid.set_status_bad("timeout");
                            break;
                        }
                        _ = shutdown.changed() => {
                            self.vid.set_status_bad("cancelled");
                            break;
                        }
                    }
                }
            }
        }
        self.vid.clear_poke_target();
        self.publish().await;
    }

    async fn wait_foreign(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while self.vid.status() == Status::Undefined && Instant::now() < deadline {
            sleep(FOREIGN_STATUS_POLL).await;
        }
    }

    /// Publication: wake waiters, hand Good milestones to the tips pool,
    /// gossip further.
    async fn publish(&self) {
        match self.vid.status() {
            Status::Good => {
                self.env.metrics.attached_good_total.inc();
                if self.vid.is_sequencer_milestone() {
                    let _ = self.env.tips.input().send(self.vid.clone()).await;
                }
                if let Some(tx_bytes) = self.vid.with_full(|body| body.tx.bytes().to_vec()) {
                    let mut metadata = TxMetadata::new(self.source);
                    if self.vid.is_branch() {
                        metadata.state_root = fetch_root_record(self.env.state.as_ref(), &self.vid.id)
                            .map(|r| r.root);
                    }
                    self.env.gossip.gossip_tx(TxGossip { metadata, tx_bytes });
                    self.env.metrics.gossiped_tx_total.inc();
                }
                if self.vid.is_branch() {
                    // the state is committed: the full body is no longer
                    // needed, only the produced outputs stay materialised
                    for dropped in self.vid.convert_full_to_virtual() {
                        self.env.dag.unreference(&dropped);
                    }
                }
            }
            Status::Bad => {
                self.env.metrics.attached_bad_total.inc();
            }
            Status::Undefined => unreachable!("attacher exits with a terminal status"),
        }
        self.env.poker.poke_all_with(self.vid.id).await;
    }

    /// One solidification pass; re-entered on every wake-up.
    fn step(&self) -> StepOutcome {
        // phase 1: baseline selection
        if !self.vid.flags_up(FLAG_BASELINE_SOLID) {
            match self.solidify_baseline() {
                Ok(branch) => self.vid.set_baseline_branch(branch),
                Err(outcome) => return outcome,
            }
        }

        // the committed state everything below resolves against
        let (record, reader) = match self.baseline_state() {
            Ok(BaselineState::Ready { record, reader }) => (record, reader),
            Ok(BaselineState::Waiting(deps)) => return StepOutcome::Suspend(deps),
            Err(reason) => return StepOutcome::Bad(reason),
        };

        // phase 2: dependency resolution
        match self.solidify_dependencies(&reader) {
            Ok(missing) if !missing.is_empty() => return StepOutcome::Suspend(missing),
            Ok(_) => {}
            Err(reason) => return StepOutcome::Bad(reason),
        }
        self.vid
            .set_flags_up(FLAG_INPUTS_SOLID | FLAG_ENDORSEMENTS_SOLID);

        // phase 3: past-cone merge and conflict check
        let cone = self.collect_past_cone(&reader);
        if let Err(reason) = self.check_conflicts(&cone) {
            return StepOutcome::Bad(reason);
        }

        // phase 4: constraint validation
        if !self.vid.flags_up(FLAG_CONSTRAINTS_VALID) {
            let validated = self
                .vid
                .with_full(|body| {
                    constraints::validate(&body.tx, |i| {
                        let oid = body.tx.input_at(i)?;
                        body.inputs[i as usize]
                            .as_ref()
                            .and_then(|dep| dep.output_at(oid.index))
                    })
                })
                .expect("own vertex is full");
            if let Err(err) = validated {
                return StepOutcome::Bad(format!("constraint validation failed: {err}"));
            }
            self.vid.set_flags_up(FLAG_CONSTRAINTS_VALID);
        }

        // phase 5: ledger coverage
        if self.vid.is_sequencer_milestone() {
            let coverage = record.ledger_coverage
                + cone
                    .vertices
                    .iter()
                    .map(|v| {
                        v.known_outputs()
                            .iter()
                            .map(|(_, o)| o.amount)
                            .sum::<u64>()
                    })
                    .sum::<u64>();
            self.vid.set_coverage(coverage);
        }

        // phase 6: publication; competing consumers with the same baseline
        // are arbitrated by the milestone preference order
        if let Err(reason) = self.arbitrate(&cone) {
            return StepOutcome::Bad(reason);
        }
        if self.vid.is_branch() {
            self.commit_branch(&cone, &record);
        }
        self.vid.set_status_good();
        StepOutcome::Done
    }

    // ---- phase 1

    /// `Ok(branch)` when decided; `Err(StepOutcome)` to suspend or fail.
    fn solidify_baseline(&self) -> Result<TxId, StepOutcome> {
        if self.vid.is_branch() {
            // a branch is its own baseline
            return Ok(self.vid.id);
        }
        debug_assert!(self.vid.is_sequencer_milestone());

        let pred_index = self
            .vid
            .with_full(|body| {
                body.tx
                    .sequencer_data()
                    .expect("sequencer tx has sequencer data")
                    .predecessor_input_index
            })
            .expect("own vertex is full");
        let pred = match self.resolve_input_pointer(pred_index) {
            Ok(pred) => pred,
            Err(outcome) => return Err(outcome),
        };
        match pred.status() {
            Status::Bad => {
                return Err(StepOutcome::Bad(format!(
                    "chain predecessor {} is bad",
                    pred.id
                )))
            }
            Status::Undefined => {
                self.request_tx(&pred);
                return Err(StepOutcome::Suspend(vec![pred.id]));
            }
            Status::Good => {}
        }
        if let Some(baseline) = pred.baseline_branch() {
            return Ok(baseline);
        }

        // predecessor carries no baseline (chain origin): take it from the
        // endorsement with the highest coverage
        let endorsed_ids = self
            .vid
            .with_full(|body| body.tx.endorsements().to_vec())
            .expect("own vertex is full");
        let mut waiting = Vec::new();
        let mut best: Option<(u64, TxId)> = None;
        for (i, txid) in endorsed_ids.iter().enumerate() {
            let endorsed = match self.resolve_endorsement_pointer(i as u8, *txid) {
                Ok(endorsed) => endorsed,
                Err(outcome) => return Err(outcome),
            };
            match endorsed.status() {
                Status::Bad => {
                    return Err(StepOutcome::Bad(format!("endorsed tx {} is bad", txid)))
                }
                Status::Undefined => {
                    self.request_tx(&endorsed);
                    waiting.push(*txid);
                }
                Status::Good => {
                    if let Some(baseline) = endorsed.baseline_branch() {
                        let coverage = endorsed.coverage_sum();
                        if best.map_or(true, |(c, _)| coverage > c) {
                            best = Some((coverage, baseline));
                        }
                    }
                }
            }
        }
        if let Some((_, baseline)) = best {
            return Ok(baseline);
        }
        if waiting.is_empty() {
            return Err(StepOutcome::Bad(
                "unable to determine the baseline branch".to_string(),
            ));
        }
        Err(StepOutcome::Suspend(waiting))
    }

    /// Branch whose committed state this vertex resolves against: the
    /// baseline, or for a branch vertex the predecessor branch its stem
    /// points back to. Ordinary transactions fall back to the heaviest
    /// known branch.
    fn support_branch(&self) -> Option<TxId> {
        if self.vid.is_branch() {
            let pred = self
                .vid
                .with_full(|body| {
                    let seq = body.tx.sequencer_data().expect("branch has sequencer data");
                    let stem_index = seq.stem_output_index.expect("branch has a stem output");
                    let stem = body
                        .tx
                        .produced_output_at(stem_index)
                        .expect("index checked at parse");
                    match &stem.kind {
                        OutputKind::Stem { predecessor } => predecessor.txid,
                        _ => unreachable!("stem kind checked at parse"),
                    }
                })
                .expect("own vertex is full");
            return Some(pred);
        }
        if self.vid.is_sequencer_milestone() {
            return self.vid.baseline_branch();
        }
        fetch_latest_root_records(self.env.state.as_ref())
            .first()
            .map(|(txid, _)| *txid)
    }

    fn baseline_state(&self) -> Result<BaselineState, String> {
        let Some(branch) = self.support_branch() else {
            return Ok(BaselineState::Waiting(Vec::new()));
        };
        let Some(record) = fetch_root_record(self.env.state.as_ref(), &branch) else {
            // branch not committed here yet; pull it and wait
            let vtx = self.env.dag.get_or_create_virtual(branch);
            self.request_tx(&vtx);
            self.env.dag.unreference(&vtx);
            return Ok(BaselineState::Waiting(vec![branch]));
        };
        let reader = StateReader::new(self.env.state.clone(), record.root)
            .map_err(|e| format!("baseline state unavailable: {e}"))?;
        Ok(BaselineState::Ready { record, reader })
    }

    // ---- phase 2

    /// Resolves the pointer of input slot `i`, creating a Virtual vertex if
    /// needed. The edge keeps the acquired reference.
    fn resolve_input_pointer(&self, i: u8) -> Result<Arc<Vtx>, StepOutcome> {
        let existing = self
            .vid
            .with_full(|body| body.inputs[i as usize].clone())
            .expect("own vertex is full");
        if let Some(dep) = existing {
            return Ok(dep);
        }
        let oid = self
            .vid
            .with_full(|body| *body.tx.input_at(i).expect("index checked at parse"))
            .expect("own vertex is full");
        let dep = self.env.dag.get_or_create_virtual(oid.txid);
        if dep.status() == Status::Bad {
            let reason = format!("input {} is bad", oid.txid);
            self.env.dag.unreference(&dep);
            return Err(StepOutcome::Bad(reason));
        }
        self.vid
            .with_full_mut(|body| body.inputs[i as usize] = Some(dep.clone()))
            .expect("own vertex is full");
        dep.attach_consumer(oid.index, &self.vid);
        Ok(dep)
    }

    fn resolve_endorsement_pointer(&self, i: u8, txid: TxId) -> Result<Arc<Vtx>, StepOutcome> {
        let existing = self
            .vid
            .with_full(|body| body.endorsements[i as usize].clone())
            .expect("own vertex is full");
        if let Some(dep) = existing {
            return Ok(dep);
        }
        let dep = self.env.dag.get_or_create_virtual(txid);
        self.vid
            .with_full_mut(|body| body.endorsements[i as usize] = Some(dep.clone()))
            .expect("own vertex is full");
        Ok(dep)
    }

    fn request_tx(&self, vtx: &Arc<Vtx>) {
        if vtx.is_virtual() {
            self.env.pull.pull_tx(vtx.id);
            self.env.metrics.pull_requests_total.inc();
        }
    }

    /// Returns the txids still blocking solidification; empty means all
    /// inputs and endorsements are solid.
    fn solidify_dependencies(&self, reader: &StateReader) -> Result<Vec<TxId>, String> {
        let mut missing: Vec<TxId> = Vec::new();

        let num_inputs = self
            .vid
            .with_full(|body| body.tx.num_inputs())
            .expect("own vertex is full");
        for i in 0..num_inputs as u8 {
            let oid = self
                .vid
                .with_full(|body| *body.tx.input_at(i).expect("index checked at parse"))
                .expect("own vertex is full");
            let dep = match self.resolve_input_pointer(i) {
                Ok(dep) => dep,
                Err(StepOutcome::Bad(reason)) => return Err(reason),
                Err(_) => unreachable!("pointer resolution never suspends"),
            };
            match dep.status() {
                Status::Bad => return Err(format!("input {} is bad", dep.id)),
                Status::Good => {
                    match dep.has_output_at(oid.index) {
                        (true, _) => {}
                        (false, true) => {
                            return Err(format!("wrong output index in {oid}"));
                        }
                        (false, false) => {
                            // good virtual vertex lacking this output: the
                            // committed state is authoritative
                            if let Some(output) = reader.get_utxo(&oid) {
                                dep.ensure_output(oid.index, &output);
                            } else if reader.knows_tx(&oid.txid) {
                                return Err(format!(
                                    "output {oid} already consumed in the baseline state"
                                ));
                            } else {
                                self.request_tx(&dep);
                                missing.push(oid.txid);
                            }
                        }
                    }
                }
                Status::Undefined => {
                    if dep.is_virtual() {
                        if let Some(output) = reader.get_utxo(&oid) {
                            // committed in the baseline: materialise and
                            // define in one step
                            dep.ensure_output(oid.index, &output);
                            dep.try_set_status_good();
                        } else if reader.knows_tx(&oid.txid) {
                            return Err(format!(
                                "output {oid} already consumed in the baseline state"
                            ));
                        } else {
                            self.request_tx(&dep);
                            missing.push(oid.txid);
                        }
                    } else {
                        // full vertex with an attacher in flight
                        missing.push(oid.txid);
                    }
                }
            }
        }

        let endorsed_ids = self
            .vid
            .with_full(|body| body.tx.endorsements().to_vec())
            .expect("own vertex is full");
        for (i, txid) in endorsed_ids.iter().enumerate() {
            let dep = match self.resolve_endorsement_pointer(i as u8, *txid) {
                Ok(dep) => dep,
                Err(StepOutcome::Bad(reason)) => return Err(reason),
                Err(_) => unreachable!("pointer resolution never suspends"),
            };
            match dep.status() {
                Status::Bad => return Err(format!("endorsed tx {} is bad", dep.id)),
                Status::Good => {
                    // the endorsed cone must live on our baseline or one of
                    // its committed ancestors
                    if let Some(endorsed_baseline) = dep.baseline_branch() {
                        let compatible = Some(endorsed_baseline) == self.vid.baseline_branch()
                            || reader.knows_tx(&endorsed_baseline);
                        if !compatible {
                            return Err(format!(
                                "incompatible baseline in endorsed tx {}",
                                dep.id
                            ));
                        }
                    }
                }
                Status::Undefined => {
                    self.request_tx(&dep);
                    missing.push(*txid);
                }
            }
        }

        missing.sort();
        missing.dedup();
        Ok(missing)
    }

    // ---- phase 3

    /// Transitive closure of input and endorsement edges, bounded by the
    /// baseline: branches and committed vertices are boundaries.
    fn collect_past_cone(&self, reader: &StateReader) -> Cone {
        let mut ids = AHashSet::new();
        let mut vertices: Vec<Arc<Vtx>> = Vec::new();
        let mut stack = vec![self.vid.clone()];
        while let Some(v) = stack.pop() {
            if ids.contains(&v.id) {
                continue;
            }
            if v.id != self.vid.id {
                if v.is_branch() || reader.knows_tx(&v.id) {
                    continue;
                }
            }
            if !v.is_full_vertex() {
                continue;
            }
            ids.insert(v.id);
            v.with_full(|body| {
                stack.extend(body.inputs.iter().flatten().cloned());
                stack.extend(body.endorsements.iter().flatten().cloned());
            });
            vertices.push(v);
        }
        vertices.sort_by_key(|v| v.id);
        Cone { vertices, ids }
    }

    /// Baseline a vertex competes on. A branch is its own baseline, so two
    /// branches extending the same predecessor are alternative states, not
    /// conflicts; only consumers within one baseline can double-spend.
    fn effective_baseline(v: &Arc<Vtx>) -> Option<TxId> {
        v.baseline_branch()
    }

    fn check_conflicts(&self, cone: &Cone) -> Result<(), String> {
        let mut consumed: AHashMap<OutputId, TxId> = AHashMap::new();
        let own_baseline = Self::effective_baseline(&self.vid);
        for v in &cone.vertices {
            let inputs: Vec<(OutputId, Option<Arc<Vtx>>)> = v
                .with_full(|body| {
                    body.tx
                        .inputs()
                        .iter()
                        .cloned()
                        .zip(body.inputs.iter().cloned())
                        .collect()
                })
                .unwrap_or_default();
            for (oid, dep) in inputs {
                if let Some(prev) = consumed.insert(oid, v.id) {
                    if prev != v.id {
                        return Err("double-spend in past cone".to_string());
                    }
                }
                // defer to an established Good consumer outside the cone
                // competing on the same baseline
                let Some(dep) = dep else { continue };
                for other in dep.consumers_of(oid.index) {
                    if other.id == v.id || cone.ids.contains(&other.id) {
                        continue;
                    }
                    if other.status() == Status::Good
                        && Self::effective_baseline(&other) == own_baseline
                    {
                        return Err(format!(
                            "conflict: output {oid} is already consumed by {}",
                            other.id
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    // ---- phase 6

    /// Final arbitration against still-undefined competitors on the same
    /// baseline: the preferred one proceeds, the other marks itself Bad.
    fn arbitrate(&self, cone: &Cone) -> Result<(), String> {
        let own_baseline = Self::effective_baseline(&self.vid);
        for v in &cone.vertices {
            let inputs: Vec<(OutputId, Option<Arc<Vtx>>)> = v
                .with_full(|body| {
                    body.tx
                        .inputs()
                        .iter()
                        .cloned()
                        .zip(body.inputs.iter().cloned())
                        .collect()
                })
                .unwrap_or_default();
            for (oid, dep) in inputs {
                let Some(dep) = dep else { continue };
                for other in dep.consumers_of(oid.index) {
                    if other.id == v.id || cone.ids.contains(&other.id) {
                        continue;
                    }
                    if Self::effective_baseline(&other) != own_baseline {
                        continue;
                    }
                    match other.status() {
                        Status::Good => {
                            return Err(format!(
                                "conflict: output {oid} is already consumed by {}",
                                other.id
                            ));
                        }
                        Status::Undefined => {
                            if is_preferred_base(
                                other.coverage_sum(),
                                self.vid.coverage_sum(),
                                &other.id,
                                &self.vid.id,
                            ) {
                                return Err(format!(
                                    "conflict: output {oid} is claimed by the preferred {}",
                                    other.id
                                ));
                            }
                        }
                        Status::Bad => {}
                    }
                }
            }
        }
        Ok(())
    }

    /// The single-writer path: builds the state delta of the new branch and
    /// commits it together with a fresh RootRecord.
    fn commit_branch(&self, cone: &Cone, prev: &RootRecord) {
        let mut created: Vec<(OutputId, Output)> = Vec::new();
        let mut spent: Vec<OutputId> = Vec::new();
        let mut txids: Vec<TxId> = Vec::new();
        let mut inflation: u64 = 0;
        for v in &cone.vertices {
            v.with_full(|body| {
                for (idx, output) in body.tx.produced_outputs().iter().enumerate() {
                    created.push((body.tx.output_id_at(idx as u8), output.clone()));
                }
                spent.extend(body.tx.inputs().iter().cloned());
                inflation += body.tx.slot_inflation();
            });
            txids.push(v.id);
        }
        let delta = StateDelta {
            branch_id: self.vid.id,
            prev_root: Some(prev.root),
            created,
            spent,
            txids,
        };
        let root = commit_state(self.env.state.as_ref(), &delta);
        let record = RootRecord {
            root,
            sequencer_id: self
                .vid
                .sequencer_chain_id()
                .expect("branch carries a chain id"),
            ledger_coverage: self.vid.coverage_sum(),
            slot_inflation: inflation,
            supply: prev.supply + inflation,
            num_transactions: prev.num_transactions + cone.vertices.len() as u32,
        };
        put_root_record(self.env.state.as_ref(), &self.vid.id, &record);
        self.env.metrics.branches_committed_total.inc();
        tracing::info!(
            "branch {} committed: coverage {}, supply {}, {} transactions",
            self.vid.id,
            record.ledger_coverage,
            record.supply,
            record.num_transactions
        );
    }
}
