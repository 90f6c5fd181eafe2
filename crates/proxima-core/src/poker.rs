// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use ahash::AHashMap;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, Instant};

use crate::types::TxId;
use crate::vertex::Vtx;

const CHAN_BUFFER_SIZE: usize = 10;
const SWEEP_PERIOD: Duration = Duration::from_secs(1);
const TTL_WANTED: Duration = Duration::from_secs(60);

enum Cmd {
    /// Record the waiter under `wanted` and refresh the list's TTL.
    Wait { wanted: TxId, waiter: Arc<Vtx> },
    /// Poke every recorded waiter of `wanted` and drop the list.
    PokeAll { wanted: TxId },
}

struct WaitingList {
    waiting: Vec<Arc<Vtx>>,
    keep_until: Instant,
}

/// Wake-up bus: attachers register "I am waiting on X"; the publisher of X
/// pokes all of them. Commands run strictly in arrival order on a single
/// consumer task; a periodic sweep drops expired lists as a safety net
/// against leaked waiters.
pub struct Poker {
    cmd_tx: mpsc::Sender<Cmd>,
    pokes_delivered: AtomicU64,
}

impl Poker {
    pub fn start(mut shutdown: watch::Receiver<bool>) -> Arc<Self> {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(CHAN_BUFFER_SIZE);
        let poker = Arc::new(Self {
            cmd_tx,
            pokes_delivered: AtomicU64::new(0),
        });
        let handle = poker.clone();
        tokio::spawn(async move {
            let mut lists: AHashMap<TxId, WaitingList> = AHashMap::new();
            let mut sweep = interval(SWEEP_PERIOD);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        tracing::debug!("poker stopping");
                        return;
                    }
                    cmd = cmd_rx.recv() => {
                        let Some(cmd) = cmd else { return };
                        handle.consume(&mut lists, cmd);
                    }
                    _ = sweep.tick() => {
                        Self::periodic_sweep(&mut lists);
                    }
                }
            }
        });
        poker
    }

    fn consume(&self, lists: &mut AHashMap<TxId, WaitingList>, cmd: Cmd) {
        match cmd {
            Cmd::Wait { wanted, waiter } => {
                let list = lists.entry(wanted).or_insert_with(|| WaitingList {
                    waiting: Vec::new(),
                    keep_until: Instant::now() + TTL_WANTED,
                });
                if !list
                    .waiting
                    .iter()
                    .any(|v| Arc::ptr_eq(v, &waiter))
                {
                    list.waiting.push(waiter);
                }
                list.keep_until = Instant::now() + TTL_WANTED;
            }
            Cmd::PokeAll { wanted } => {
                if let Some(list) = lists.remove(&wanted) {
                    self.pokes_delivered
                        .fetch_add(list.waiting.len() as u64, Ordering::Relaxed);
                    for waiter in list.waiting {
                        waiter.poke();
                    }
                }
            }
        }
    }

    fn periodic_sweep(lists: &mut AHashMap<TxId, WaitingList>) {
        let now = Instant::now();
        lists.retain(|_, list| list.keep_until > now);
    }

    /// "Poke `waiter` when `wanted` changes status."
    pub async fn wake_me_when(&self, wanted: TxId, waiter: Arc<Vtx>) {
        let _ = self.cmd_tx.send(Cmd::Wait { wanted, waiter }).await;
    }

    /// Wakes every attacher registered on `wanted`.
    pub async fn poke_all_with(&self, wanted: TxId) {
        let _ = self.cmd_tx.send(Cmd::PokeAll { wanted }).await;
    }

    /// Total pokes delivered since start.
    pub fn pokes_delivered(&self) -> u64 {
        self.pokes_delivered.load(Ordering::Relaxed)
    }
}
