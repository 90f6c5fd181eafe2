// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::attacher::{attach_transaction, AttacherEnv, MILESTONE_ATTACH_TIMEOUT};
use crate::backlog::InputBacklog;
use crate::crypto::Signer;
use crate::factory::MilestoneFactory;
use crate::ledger::{Ledger, LedgerTime};
use crate::peering::TxSource;
use crate::types::ChainId;
use crate::vertex::{Status, Vtx};

/// Tunable threshold of the emit-branch-now heuristic, `pace * NUM / DEN`
/// ticks ahead of the clock.
const BOUNDARY_ROUND_UP_NUM: u32 = 2;
const BOUNDARY_ROUND_UP_DEN: u32 = 3;

const TIPPOOL_WAIT_POLL: Duration = Duration::from_millis(10);
const FIRST_MILESTONE_WAIT: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SequencerConfig {
    pub name: String,
    /// Minimum ticks between own milestones; clamped to the protocol floor.
    pub pace: u32,
    /// Stop after this logical time.
    pub max_target_ts: Option<LedgerTime>,
    /// Stop after this many branch outputs.
    pub max_branches: Option<usize>,
    /// Wait after node start before the first milestone.
    pub delay_start: Duration,
    pub backlog_ttl_slots: u32,
    pub milestones_ttl_slots: u32,
    pub max_tag_along_inputs: usize,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            name: "seq".to_string(),
            pace: 5,
            max_target_ts: None,
            max_branches: None,
            delay_start: Duration::ZERO,
            backlog_ttl_slots: 10,
            milestones_ttl_slots: 2,
            max_tag_along_inputs: 20,
        }
    }
}

/// One task per configured sequencer: deterministic pacing and emission of
/// new milestones on its chain.
pub struct Sequencer {
    env: Arc<AttacherEnv>,
    chain_id: ChainId,
    config: SequencerConfig,
    factory: Arc<MilestoneFactory>,
    backlog: Arc<InputBacklog>,
}

impl Sequencer {
    /// Spawns the main loop. The returned backlog must be fed with Good
    /// transactions by the owner of the transaction pipeline.
    pub fn start(
        env: Arc<AttacherEnv>,
        chain_id: ChainId,
        signer: Arc<Signer>,
        mut config: SequencerConfig,
    ) -> (Arc<InputBacklog>, JoinHandle<()>) {
        let floor = Ledger::get().identity().sequencer_pace;
        if config.pace < floor {
            tracing::warn!(
                "sequencer {}: pace {} below the protocol floor, using {}",
                config.name,
                config.pace,
                floor
            );
            config.pace = floor;
        }
        let backlog = InputBacklog::new(signer.address(), config.backlog_ttl_slots, env.dag.clone());
        let factory = Arc::new(MilestoneFactory::new(
            chain_id,
            signer,
            env.dag.clone(),
            env.tips.clone(),
            env.state.clone(),
            backlog.clone(),
            config.max_tag_along_inputs,
            config.milestones_ttl_slots,
        ));
        let sequencer = Sequencer {
            env,
            chain_id,
            config,
            factory,
            backlog: backlog.clone(),
        };
        let handle = tokio::spawn(async move { sequencer.main_loop().await });
        (backlog, handle)
    }

    async fn main_loop(self) {
        if self.config.delay_start > Duration::ZERO {
            tracing::info!(
                "sequencer {}: waiting {:?} before start",
                self.config.name,
                self.config.delay_start
            );
            sleep(self.config.delay_start).await;
        }
        if !self.ensure_first_milestone().await {
            tracing::error!(
                "sequencer {}: no milestone output to start from, exiting",
                self.config.name
            );
            return;
        }
        tracing::info!(
            "sequencer {} starting on chain {:?} with pace {}",
            self.config.name,
            self.chain_id,
            self.config.pace
        );

        let mut shutdown = self.env.shutdown.clone();
        let mut prev_target = LedgerTime::default();
        let mut branch_count = 0usize;
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Some(max) = self.config.max_branches {
                if branch_count >= max {
                    tracing::info!(
                        "sequencer {}: reached the branch limit {max}, stopping",
                        self.config.name
                    );
                    break;
                }
            }

            let target = self.next_target_time().await;
            assert!(
                target >= prev_target,
                "target {target} went backwards from {prev_target}"
            );
            if let Some((prev_oid, _)) = self.factory.own_latest_milestone_output() {
                assert!(
                    target.diff_ticks(&prev_oid.timestamp()) >= self.config.pace as i64,
                    "target {target} closer than the pace to {}",
                    prev_oid.timestamp()
                );
            }
            prev_target = target;
            if let Some(max_ts) = self.config.max_target_ts {
                if target > max_ts {
                    tracing::info!(
                        "sequencer {}: target {target} beyond {max_ts}, stopping",
                        self.config.name
                    );
                    break;
                }
            }

            // align with ledger time before emitting
            let wait = Ledger::get().sleep_duration_until(target);
            if !wait.is_zero() {
                tokio::select! {
                    _ = sleep(wait) => {}
                    _ = shutdown.changed() => break,
                }
            }

            let now_slot = Ledger::get().slot_now();
            self.backlog.purge(now_slot);
            self.factory.purge_own_milestones(now_slot);

            let milestone = match self.factory.propose(target) {
                Ok(Some(tx)) => tx,
                Ok(None) => continue,
                Err(err) => {
                    tracing::error!(
                        "sequencer {}: failed to assemble a milestone for {target}: {err}",
                        self.config.name
                    );
                    continue;
                }
            };
            let Some(vid) = self.submit_milestone(milestone).await else {
                continue;
            };
            self.factory.add_own_milestone(vid.clone());
            self.env.metrics.milestones_produced_total.inc();
            if vid.is_branch() {
                branch_count += 1;
                self.env.metrics.branches_produced_total.inc();
            }
        }

        self.factory.release_all();
        self.backlog.release_all();
        tracing::info!("sequencer {} stopped", self.config.name);
    }

    async fn ensure_first_milestone(&self) -> bool {
        let deadline = Instant::now() + FIRST_MILESTONE_WAIT;
        while Instant::now() < deadline {
            if self.factory.own_latest_milestone_output().is_some() {
                return true;
            }
            sleep(TIPPOOL_WAIT_POLL).await;
        }
        false
    }

    /// `max(prev + pace, now + 1)`, rounded up to the next slot boundary
    /// when the result lands too close to it.
    async fn next_target_time(&self) -> LedgerTime {
        let ledger = Ledger::get();
        let prev = self
            .factory
            .own_latest_milestone_output()
            .map(|(oid, _)| oid.timestamp())
            .expect("checked at start");

        // the clock must reach the previous milestone first
        let behind = ledger.sleep_duration_until(prev);
        if !behind.is_zero() {
            tracing::warn!(
                "sequencer {}: clock is behind the previous milestone {prev}, sleeping {behind:?}",
                self.config.name
            );
            sleep(behind).await;
        }
        let nowis = ledger.time_now();

        let pace = self.config.pace;
        let mut minimum = prev.add_ticks(pace).max(nowis.add_ticks(1));
        let next_boundary = nowis.next_slot_boundary();
        if minimum >= next_boundary {
            return minimum;
        }
        let ticks_ahead = (pace * BOUNDARY_ROUND_UP_NUM) / BOUNDARY_ROUND_UP_DEN;
        minimum = minimum.max(nowis.add_ticks(ticks_ahead));
        if minimum >= next_boundary {
            return minimum;
        }
        if minimum.ticks_to_next_slot_boundary() <= pace {
            // close enough to the boundary: emit a branch instead
            return next_boundary;
        }
        minimum
    }

    /// Submits via the attacher and waits for the milestone to land in the
    /// tips pool within the submit timeout.
    async fn submit_milestone(&self, tx: crate::types::Transaction) -> Option<Arc<Vtx>> {
        let txid = *tx.id();
        let deadline = Instant::now() + MILESTONE_ATTACH_TIMEOUT;
        let vid = attach_transaction(
            self.env.clone(),
            tx,
            TxSource::Sequencer,
            MILESTONE_ATTACH_TIMEOUT,
        )
        .await;
        if vid.status() != Status::Good {
            tracing::error!(
                "sequencer {}: milestone {txid} failed to attach: {:?}",
                self.config.name,
                vid.error()
            );
            return None;
        }
        while Instant::now() < deadline {
            if let Some(tip) = self.env.tips.get_latest_milestone(&self.chain_id) {
                if Arc::ptr_eq(&tip, &vid) {
                    return Some(vid);
                }
            }
            sleep(TIPPOOL_WAIT_POLL).await;
        }
        tracing::error!(
            "sequencer {}: milestone {txid} did not reach the tippool in time",
            self.config.name
        );
        None
    }
}
