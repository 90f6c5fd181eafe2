// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::time::{interval, Duration, Instant};

use crate::ledger::{Ledger, Slot};
use crate::metrics::Metrics;
use crate::multistate::fetch_latest_slot;
use crate::peering::PullRequest;
use crate::store::KvStore;
use crate::types::TxId;

pub const MAX_SYNC_PORTION_SLOTS: u32 = 100;
pub const DEFAULT_SYNC_TOLERANCE_SLOTS: u32 = 10;

const CHECK_SYNC_EVERY: Duration = Duration::from_millis(500);
/// When to repeat a portion pull that did not arrive.
const PORTION_EXPECTED_IN: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    pub enabled: bool,
    pub sync_portion_slots: u32,
    pub sync_tolerance_threshold_slots: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sync_portion_slots: MAX_SYNC_PORTION_SLOTS,
            sync_tolerance_threshold_slots: DEFAULT_SYNC_TOLERANCE_SLOTS,
        }
    }
}

/// Monitors how far the latest committed slot lags behind the clock and
/// drives bulk pulls of branch portions while behind. While syncing, the
/// live transaction flow is filtered through [`SyncManager::ignore_future_txid`].
pub struct SyncManager {
    state: Arc<dyn KvStore>,
    pull: Arc<dyn PullRequest>,
    metrics: Arc<Metrics>,
    portion_slots: u32,
    tolerance_slots: u32,
    latest_slot_in_db: AtomicU32,
    end_of_portion: Notify,
    /// Clock source; tests override it.
    now_slot: Box<dyn Fn() -> Slot + Send + Sync>,
}

impl SyncManager {
    pub fn start(
        state: Arc<dyn KvStore>,
        pull: Arc<dyn PullRequest>,
        metrics: Arc<Metrics>,
        config: SyncConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Option<Arc<Self>> {
        Self::start_with_clock(
            state,
            pull,
            metrics,
            config,
            shutdown,
            Box::new(|| Ledger::get().slot_now()),
        )
    }

    pub fn start_with_clock(
        state: Arc<dyn KvStore>,
        pull: Arc<dyn PullRequest>,
        metrics: Arc<Metrics>,
        config: SyncConfig,
        mut shutdown: watch::Receiver<bool>,
        now_slot: Box<dyn Fn() -> Slot + Send + Sync>,
    ) -> Option<Arc<Self>> {
        if !config.enabled {
            tracing::info!("sync manager is disabled");
            return None;
        }
        let mut portion_slots = config.sync_portion_slots;
        if portion_slots < 1 || portion_slots > MAX_SYNC_PORTION_SLOTS {
            portion_slots = MAX_SYNC_PORTION_SLOTS;
        }
        let mut tolerance_slots = config.sync_tolerance_threshold_slots;
        if tolerance_slots < 1 || tolerance_slots > portion_slots / 2 {
            tolerance_slots = DEFAULT_SYNC_TOLERANCE_SLOTS.min(portion_slots / 2).max(1);
        }
        let manager = Arc::new(Self {
            state,
            pull,
            metrics,
            portion_slots,
            tolerance_slots,
            latest_slot_in_db: AtomicU32::new(0),
            end_of_portion: Notify::new(),
            now_slot,
        });
        tracing::info!(
            "sync manager started: portion {} slots, tolerance {} slots",
            manager.portion_slots,
            manager.tolerance_slots
        );
        let handle = manager.clone();
        tokio::spawn(async move {
            let mut requested_until: Slot = 0;
            let mut portion_deadline: Option<Instant> = None;
            let mut check = interval(CHECK_SYNC_EVERY);
            check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        tracing::info!("sync manager stopped");
                        return;
                    }
                    _ = handle.end_of_portion.notified() => {
                        handle.check_sync(true, &mut requested_until, &mut portion_deadline);
                    }
                    _ = check.tick() => {
                        handle.check_sync(false, &mut requested_until, &mut portion_deadline);
                    }
                }
            }
        });
        Some(manager)
    }

    fn check_sync(
        &self,
        end_of_portion: bool,
        requested_until: &mut Slot,
        portion_deadline: &mut Option<Instant>,
    ) {
        let latest = fetch_latest_slot(self.state.as_ref()).unwrap_or(0);
        self.latest_slot_in_db.store(latest, Ordering::Release);

        let slot_now = (self.now_slot)();
        let behind = slot_now.saturating_sub(latest);
        self.metrics.sync_slots_behind.set(behind as i64);
        if behind <= self.tolerance_slots {
            // synced or almost synced
            *requested_until = 0;
            *portion_deadline = None;
            return;
        }
        tracing::info!(
            "sync manager: latest committed slot {latest} is behind slot {slot_now} by {behind}"
        );

        if latest < *requested_until {
            // portion already requested but not here yet
            if !end_of_portion
                && portion_deadline.map_or(false, |deadline| Instant::now() < deadline)
            {
                return;
            }
        }
        *requested_until = (latest + self.portion_slots).min(slot_now);
        *portion_deadline = Some(Instant::now() + PORTION_EXPECTED_IN);
        self.pull
            .pull_portion(latest, self.portion_slots as usize);
        self.metrics.pull_requests_total.inc();
    }

    /// Signalled by the pipeline when a pulled portion has been consumed.
    pub fn notify_end_of_portion(&self) {
        self.end_of_portion.notify_one();
    }

    /// While seriously behind, the current transaction flow is ignored so
    /// the node can catch up on committed branches first.
    pub fn ignore_future_txid(&self, txid: &TxId) -> bool {
        let slot_now = (self.now_slot)();
        let latest = self.latest_slot_in_db.load(Ordering::Acquire);
        if slot_now.saturating_sub(latest) < self.tolerance_slots {
            return false;
        }
        let ignore = txid.slot() + 2 >= slot_now;
        if ignore && txid.is_branch() {
            tracing::info!("sync manager: ignoring {txid} while syncing");
        }
        ignore
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Hash32;
    use crate::ledger::LedgerTime;
    use crate::multistate::{put_root_record, RootRecord};
    use crate::peering::{ChannelPeering, PeerMessage};
    use crate::store::MemStore;

    fn commit_stub_branch(store: &dyn KvStore, slot: Slot) {
        let branch = TxId::new(
            LedgerTime::slot_boundary(slot),
            true,
            true,
            Hash32::digest(&slot.to_be_bytes()),
        );
        let record = RootRecord {
            root: Hash32::digest(b"root"),
            sequencer_id: Hash32::digest(b"chain"),
            ledger_coverage: 1,
            slot_inflation: 0,
            supply: 1,
            num_transactions: 1,
        };
        put_root_record(store, &branch, &record);
    }

    /// Start behind by 20 slots with tolerance 5: portions are requested
    /// until the gap closes below the tolerance, then requests stop.
    #[tokio::test]
    async fn catch_up_until_within_tolerance() {
        let state: Arc<dyn KvStore> = Arc::new(MemStore::new());
        commit_stub_branch(state.as_ref(), 0);
        let (peering, mut requests) = ChannelPeering::new();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let wall_clock_slot: Slot = 20;
        let manager = SyncManager::start_with_clock(
            state.clone(),
            Arc::new(peering),
            Metrics::new_for_tests(),
            SyncConfig {
                enabled: true,
                sync_portion_slots: 12,
                sync_tolerance_threshold_slots: 5,
            },
            shutdown_rx,
            Box::new(move || wall_clock_slot),
        )
        .unwrap();

        // first check fires a portion request from slot 0
        let request = tokio::time::timeout(Duration::from_secs(2), requests.recv())
            .await
            .expect("portion request expected")
            .unwrap();
        let PeerMessage::PullPortion { starting_slot, max_slots } = request else {
            panic!("unexpected request {request:?}");
        };
        assert_eq!(starting_slot, 0);
        assert_eq!(max_slots, 12);

        // the portion arrives: branches up to slot 12 get committed
        for slot in 1..=12 {
            commit_stub_branch(state.as_ref(), slot);
        }
        manager.notify_end_of_portion();

        // still behind by 8 > tolerance: a second portion is requested
        let request = tokio::time::timeout(Duration::from_secs(2), requests.recv())
            .await
            .expect("second portion request expected")
            .unwrap();
        let PeerMessage::PullPortion { starting_slot, .. } = request else {
            panic!("unexpected request {request:?}");
        };
        assert_eq!(starting_slot, 12);

        for slot in 13..=16 {
            commit_stub_branch(state.as_ref(), slot);
        }
        manager.notify_end_of_portion();

        // behind by 4 <= tolerance 5: after the catch-up phase drains, no
        // more portion requests are issued
        tokio::time::sleep(Duration::from_millis(1200)).await;
        while requests.try_recv().is_ok() {}
        let quiet =
            tokio::time::timeout(Duration::from_millis(1500), requests.recv()).await;
        assert!(quiet.is_err(), "no further requests expected, got {quiet:?}");

        // and the live flow is accepted again
        let live = TxId::new(LedgerTime::new(19, 5), false, false, Hash32::digest(b"x"));
        assert!(!manager.ignore_future_txid(&live));
    }

    #[tokio::test]
    async fn future_txids_are_filtered_while_behind() {
        let state: Arc<dyn KvStore> = Arc::new(MemStore::new());
        commit_stub_branch(state.as_ref(), 0);
        let (peering, _requests) = ChannelPeering::new();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let manager = SyncManager::start_with_clock(
            state,
            Arc::new(peering),
            Metrics::new_for_tests(),
            SyncConfig {
                enabled: true,
                sync_portion_slots: 50,
                sync_tolerance_threshold_slots: 5,
            },
            shutdown_rx,
            Box::new(|| 30),
        )
        .unwrap();

        // let the first check populate the latest-slot cache
        tokio::time::sleep(Duration::from_millis(700)).await;

        let near_now = TxId::new(LedgerTime::new(29, 1), false, false, Hash32::digest(b"a"));
        assert!(manager.ignore_future_txid(&near_now));
        let old = TxId::new(LedgerTime::new(10, 1), false, false, Hash32::digest(b"b"));
        assert!(!manager.ignore_future_txid(&old));
    }
}
