// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use eyre::{bail, Result};
use parking_lot::{Mutex, RwLock};
use prometheus::Registry;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::attacher::{attach_transaction, AttacherEnv, DEFAULT_ATTACH_TIMEOUT};
use crate::backlog::InputBacklog;
use crate::crypto::{Address, Signer};
use crate::dag::Dag;
use crate::ledger::Ledger;
use crate::metrics::Metrics;
use crate::multistate::{init_genesis, GenesisInfo};
use crate::peering::{Gossip, PeerMessage, PullRequest, PullServer, TxGossip, TxSource};
use crate::poker::Poker;
use crate::sequencer::{Sequencer, SequencerConfig};
use crate::store::KvStore;
use crate::sync::{SyncConfig, SyncManager};
use crate::tip_pool::SequencerTips;
use crate::types::{ChainId, Transaction, TxId};
use crate::vertex::{Status, Vtx};

/// Cooperative shutdown: after this deadline the supervisor stops waiting
/// and reports the components still running.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct NodeConfig {
    pub sync: SyncConfig,
    /// `(controller address, amount)` of the genesis chains.
    pub genesis_chains: Vec<(Address, u64)>,
    /// Plain outputs carved out of the genesis supply.
    pub genesis_faucets: Vec<(Address, u64)>,
}

/// The core tangle engine of one node: registry, poker, tips pool, state,
/// sync manager and the transaction-in pipeline, wired together.
pub struct TangleNode {
    pub dag: Arc<Dag>,
    pub poker: Arc<Poker>,
    pub tips: Arc<SequencerTips>,
    pub state: Arc<dyn KvStore>,
    pub txbytes: Arc<dyn KvStore>,
    pub metrics: Arc<Metrics>,
    pub registry: Registry,
    pub genesis: GenesisInfo,
    env: Arc<AttacherEnv>,
    sync: Option<Arc<SyncManager>>,
    backlogs: RwLock<Vec<Arc<InputBacklog>>>,
    sequencers: Mutex<Vec<(String, JoinHandle<()>)>>,
    shutdown_tx: watch::Sender<bool>,
}

impl TangleNode {
    pub fn start(
        state: Arc<dyn KvStore>,
        txbytes: Arc<dyn KvStore>,
        gossip: Arc<dyn Gossip>,
        pull: Arc<dyn PullRequest>,
        config: NodeConfig,
    ) -> Arc<Self> {
        let genesis = init_genesis(state.as_ref(), &config.genesis_chains, &config.genesis_faucets);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registry = Registry::new();
        let metrics = Metrics::new(&registry);
        let dag = Arc::new(Dag::new());
        let poker = Poker::start(shutdown_rx.clone());
        let tips = SequencerTips::start(dag.clone(), state.clone(), shutdown_rx.clone());

        let env = Arc::new(AttacherEnv {
            dag: dag.clone(),
            poker: poker.clone(),
            state: state.clone(),
            tips: tips.clone(),
            pull: pull.clone(),
            gossip,
            metrics: metrics.clone(),
            shutdown: shutdown_rx.clone(),
        });
        let sync = SyncManager::start(
            state.clone(),
            pull,
            metrics.clone(),
            config.sync,
            shutdown_rx,
        );

        let node = Arc::new(Self {
            dag,
            poker,
            tips,
            state,
            txbytes,
            metrics,
            registry,
            genesis,
            env,
            sync,
            backlogs: RwLock::new(Vec::new()),
            sequencers: Mutex::new(Vec::new()),
            shutdown_tx,
        });
        node.load_genesis_vertex();
        node
    }

    /// Materialises the genesis branch in the registry so the first
    /// milestone of every chain can solidify against it.
    fn load_genesis_vertex(&self) {
        let vid = self
            .dag
            .ensure_branch(self.genesis.branch_id)
            .expect("genesis txid is a branch");
        let reader = crate::multistate::StateReader::new(self.state.clone(), self.genesis.root)
            .expect("genesis state exists");
        for (chain_id, oid) in &self.genesis.chains {
            let (_, output) = reader
                .get_chain_output(chain_id)
                .expect("genesis chain output exists");
            vid.ensure_output(oid.index, &output);
        }
        let (stem_oid, stem) = reader.get_stem_output().expect("genesis stem exists");
        vid.ensure_output(stem_oid.index, &stem);
        if vid.status() == Status::Undefined {
            vid.set_coverage(Ledger::get().identity().initial_supply);
            vid.set_status_good();
        }
        // the genesis vertex is kept alive by the registry's own reference
        self.dag.unreference(&vid);
    }

    pub fn env(&self) -> Arc<AttacherEnv> {
        self.env.clone()
    }

    pub fn sync_manager(&self) -> Option<Arc<SyncManager>> {
        self.sync.clone()
    }

    pub fn pull_server(&self) -> PullServer {
        PullServer::new(self.txbytes.clone(), self.state.clone())
    }

    /// Starts a sequencer on `chain_id` controlled by `signer` and registers
    /// its backlog with the transaction pipeline.
    pub fn start_sequencer(
        &self,
        chain_id: ChainId,
        signer: Arc<Signer>,
        config: SequencerConfig,
    ) {
        let name = config.name.clone();
        let (backlog, handle) = Sequencer::start(self.env.clone(), chain_id, signer, config);
        self.backlogs.write().push(backlog);
        self.sequencers.lock().push((name, handle));
    }

    /// Accepts raw transaction bytes: basic parse, then an attacher task in
    /// the background. Returns the txid on acceptance.
    pub fn tx_in(self: &Arc<Self>, tx_bytes: &[u8], source: TxSource) -> Result<TxId> {
        let tx = self.accept_tx(tx_bytes, source)?;
        let txid = *tx.id();
        let node = self.clone();
        tokio::spawn(async move {
            let vid = attach_transaction(node.env.clone(), tx, source, DEFAULT_ATTACH_TIMEOUT).await;
            node.offer_to_backlogs(&vid);
        });
        Ok(txid)
    }

    /// Like [`TangleNode::tx_in`], but waits for the terminal status.
    pub async fn tx_in_wait(
        self: &Arc<Self>,
        tx_bytes: &[u8],
        source: TxSource,
        wait_timeout: Duration,
    ) -> Result<Arc<Vtx>> {
        let tx = self.accept_tx(tx_bytes, source)?;
        let attach = attach_transaction(self.env.clone(), tx, source, wait_timeout);
        let vid = match timeout(wait_timeout + Duration::from_millis(100), attach).await {
            Ok(vid) => vid,
            Err(_) => bail!("timeout waiting for the attacher"),
        };
        self.offer_to_backlogs(&vid);
        Ok(vid)
    }

    fn accept_tx(&self, tx_bytes: &[u8], source: TxSource) -> Result<Transaction> {
        let tx = Transaction::from_bytes(tx_bytes)?;
        if source != TxSource::Sequencer {
            if let Some(sync) = &self.sync {
                if sync.ignore_future_txid(tx.id()) {
                    bail!("transaction {} ignored while syncing", tx.id());
                }
            }
        }
        self.metrics.transactions_in_total.inc();
        self.txbytes.put(tx.id().as_ref(), tx_bytes);
        Ok(tx)
    }

    fn offer_to_backlogs(&self, vid: &Arc<Vtx>) {
        if vid.status() != Status::Good {
            return;
        }
        for backlog in self.backlogs.read().iter() {
            backlog.on_good_tx(vid);
        }
    }

    /// Inbound peer traffic: gossip frames feed the pipeline, pull requests
    /// are answered from the stores through `reply`.
    pub fn handle_peer_message(
        self: &Arc<Self>,
        message: PeerMessage,
        reply: impl Fn(TxGossip),
    ) {
        match message {
            PeerMessage::Gossip(frame) => {
                let was_pull_response = frame.metadata.is_response_to_pull;
                if let Err(err) = self.tx_in(&frame.tx_bytes, TxSource::Peer) {
                    tracing::debug!("peer transaction dropped: {err:#}");
                }
                if was_pull_response {
                    if let Some(sync) = &self.sync {
                        sync.notify_end_of_portion();
                    }
                }
            }
            PeerMessage::PullTx(txids) => {
                for frame in self.pull_server().serve_pull_tx(&txids) {
                    reply(frame);
                }
            }
            PeerMessage::PullPortion {
                starting_slot,
                max_slots,
            } => {
                for frame in self
                    .pull_server()
                    .serve_pull_portion(starting_slot, max_slots)
                {
                    reply(frame);
                }
            }
        }
    }

    /// Cooperative shutdown: signal every task, wait up to the grace
    /// deadline, log the laggards, release all held references.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        let handles: Vec<(String, JoinHandle<()>)> = self.sequencers.lock().drain(..).collect();
        for (name, handle) in handles {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if timeout(remaining, handle).await.is_err() {
                tracing::error!("component still running after the grace period: sequencer {name}");
            }
        }
        self.tips.release_all();
        for backlog in self.backlogs.read().iter() {
            backlog.release_all();
        }
        self.dag.purge();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerTime;
    use crate::multistate::{fetch_latest_slot, heaviest_chain_n_slots_back, iterate_slots};
    use crate::peering::{Framed, PeerMessage, TxMetadata};
    use crate::test_util::{craft_milestone, start_test_node, Wallet};

    const WAIT_POLL: Duration = Duration::from_millis(20);

    async fn wait_until(what: &str, timeout: Duration, mut cond: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + timeout;
        while !cond() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for: {what}"
            );
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    fn seq_signer() -> Arc<Signer> {
        Arc::new(Signer::from_seed(100))
    }

    fn wallet_signer() -> Arc<Signer> {
        Arc::new(Signer::from_seed(200))
    }

    /// One sequencer, a stream of fee-paying user transactions. All of them
    /// reach Good, none Bad, and branch coverage grows strictly along the
    /// heaviest chain.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn single_chain_scenario() {
        let seq = seq_signer();
        let wallet_key = wallet_signer();
        let node = start_test_node(&[(seq.as_ref(), 0)], &[(wallet_key.as_ref(), 1_000_000)]);
        let (chain_id, _) = node.genesis.chains[0];
        node.start_sequencer(
            chain_id,
            seq.clone(),
            SequencerConfig {
                name: "seq0".to_string(),
                pace: 5,
                ..SequencerConfig::default()
            },
        );

        let mut wallet = Wallet::from_genesis(&node, wallet_key);
        let fee_address = seq.address();
        let base_ticks = Ledger::get().time_now().as_ticks() + 2;
        for i in 0..200u64 {
            let ts = LedgerTime::from_ticks(base_ticks + i * 2);
            let tx = wallet.transfer(ts, Some((fee_address, 10)));
            let vid = node
                .tx_in_wait(tx.bytes(), TxSource::Api, Duration::from_secs(10))
                .await
                .expect("basic parse passes");
            assert_eq!(vid.status(), Status::Good, "tx {i}: {:?}", vid.error());
        }
        assert_eq!(node.metrics.attached_bad_total.get(), 0);

        wait_until("two committed branches", Duration::from_secs(10), || {
            fetch_latest_slot(node.state.as_ref()).unwrap_or(0) >= 2
        })
        .await;
        let chain = heaviest_chain_n_slots_back(&node.state, 10);
        assert!(chain.len() >= 2);
        for pair in chain.windows(2) {
            // newest first: coverage strictly grows along the chain
            assert!(
                pair[0].record.ledger_coverage > pair[1].record.ledger_coverage,
                "coverage not monotone: {} then {}",
                pair[0].record.ledger_coverage,
                pair[1].record.ledger_coverage
            );
        }
        // the tip dominates its own baseline
        let tip = node.tips.get_latest_milestone(&chain_id).expect("tip exists");
        let baseline = tip.baseline_branch().expect("tip has a baseline");
        let record = crate::multistate::fetch_root_record(node.state.as_ref(), &baseline)
            .expect("baseline committed");
        assert!(tip.coverage_sum() >= record.ledger_coverage);

        node.shutdown().await;
    }

    /// Two sequencers with different stake shares. Every slot ends with one
    /// strictly heaviest branch, and the tips pool prefers it.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_chains_scenario() {
        let s1 = Arc::new(Signer::from_seed(101));
        let s2 = Arc::new(Signer::from_seed(102));
        let faucet_key = wallet_signer();
        let node = start_test_node(
            &[(s1.as_ref(), 550_000_000_000), (s2.as_ref(), 400_000_000_000)],
            &[(faucet_key.as_ref(), 50_000_000_000)],
        );
        let (chain1, _) = node.genesis.chains[0];
        let (chain2, _) = node.genesis.chains[1];
        let config = |name: &str| SequencerConfig {
            name: name.to_string(),
            pace: 7,
            max_branches: Some(3),
            ..SequencerConfig::default()
        };
        node.start_sequencer(chain1, s1, config("seq1"));
        node.start_sequencer(chain2, s2, config("seq2"));

        wait_until("both chains produced branches", Duration::from_secs(15), || {
            node.metrics.branches_produced_total.get() >= 4
        })
        .await;

        let latest = fetch_latest_slot(node.state.as_ref()).unwrap();
        let mut slots_with_two = 0;
        for slot in 1..=latest {
            let mut records = iterate_slots(node.state.as_ref(), &[slot]);
            if records.len() < 2 {
                continue;
            }
            slots_with_two += 1;
            records.sort_by(|a, b| b.1.ledger_coverage.cmp(&a.1.ledger_coverage));
            assert!(
                records[0].1.ledger_coverage > records[1].1.ledger_coverage,
                "slot {slot}: no strictly heaviest branch"
            );
        }
        assert!(slots_with_two > 0, "no slot had competing branches");

        // the heaviest chain walk lands on the strictly heaviest latest branch
        let heaviest = heaviest_chain_n_slots_back(&node.state, 1);
        let latest_records = iterate_slots(node.state.as_ref(), &[latest]);
        assert!(latest_records
            .iter()
            .all(|(txid, r)| *txid == heaviest[0].branch_id
                || r.ledger_coverage < heaviest[0].record.ledger_coverage));

        // and the pool hands out tips in preference order
        let tips = node.tips.latest_milestones_descending();
        assert_eq!(tips.len(), 2);
        assert!(tips[0].coverage_sum() >= tips[1].coverage_sum());
        assert!(
            [Some(chain1), Some(chain2)].contains(&tips[0].sequencer_chain_id())
        );

        node.shutdown().await;
    }

    /// Two milestones of the same chain race for the same fee output and
    /// chain predecessor: exactly one ends Good, the other Bad("conflict").
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn double_spend_race_scenario() {
        let seq = seq_signer();
        let wallet_key = wallet_signer();
        let node = start_test_node(&[(seq.as_ref(), 0)], &[(wallet_key.as_ref(), 1_000_000)]);
        let (chain_id, chain_origin) = node.genesis.chains[0];

        // a fee output both milestones will try to consume
        let mut wallet = Wallet::from_genesis(&node, wallet_key);
        let fee_tx = wallet.transfer(LedgerTime::new(0, 2), Some((seq.address(), 100)));
        let fee_vid = node
            .tx_in_wait(fee_tx.bytes(), TxSource::Api, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(fee_vid.status(), Status::Good);
        let fee = (
            fee_tx.output_id_at(1),
            fee_tx.produced_output_at(1).unwrap().clone(),
        );

        let reader = crate::multistate::StateReader::new(node.state.clone(), node.genesis.root)
            .unwrap();
        let predecessor = reader.get_chain_output(&chain_id).unwrap();
        assert_eq!(predecessor.0, chain_origin);

        let m1 = craft_milestone(&seq, chain_id, predecessor.clone(), &[fee.clone()], LedgerTime::new(0, 10));
        let m2 = craft_milestone(&seq, chain_id, predecessor, &[fee], LedgerTime::new(0, 11));

        let (a, b) = tokio::join!(
            node.tx_in_wait(m1.bytes(), TxSource::Api, Duration::from_secs(5)),
            node.tx_in_wait(m2.bytes(), TxSource::Api, Duration::from_secs(5)),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        let statuses = [a.status(), b.status()];
        assert!(
            statuses.contains(&Status::Good) && statuses.contains(&Status::Bad),
            "expected exactly one Good and one Bad, got {statuses:?}"
        );
        let loser = if a.status() == Status::Bad { &a } else { &b };
        let winner = if a.status() == Status::Good { &a } else { &b };
        assert!(
            loser.error().unwrap().contains("conflict"),
            "loser error: {:?}",
            loser.error()
        );
        // the pool only ever saw the winner
        let tip = node.tips.get_latest_milestone(&chain_id).expect("tip stored");
        assert!(Arc::ptr_eq(&tip, winner));

        node.shutdown().await;
    }

    /// Transactions submitted in reverse dependency order all solidify via
    /// poker wake-ups.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn out_of_order_arrival_scenario() {
        let wallet_key = wallet_signer();
        let seq = seq_signer();
        let node = start_test_node(&[(seq.as_ref(), 0)], &[(wallet_key.as_ref(), 1_000_000)]);

        let mut wallet = Wallet::from_genesis(&node, wallet_key);
        let txs: Vec<_> = (0..100u64)
            .map(|i| wallet.transfer(LedgerTime::from_ticks(1 + i), None))
            .collect();

        let mut txids = Vec::new();
        for tx in txs.iter().rev() {
            txids.push(node.tx_in(tx.bytes(), TxSource::Api).unwrap());
        }

        wait_until("all transactions defined", Duration::from_secs(20), || {
            txids.iter().all(|txid| {
                node.dag
                    .get(txid)
                    .map_or(false, |vid| vid.status() != Status::Undefined)
            })
        })
        .await;
        for txid in &txids {
            let vid = node.dag.get(txid).unwrap();
            assert_eq!(vid.status(), Status::Good, "{txid}: {:?}", vid.error());
        }
        // 99 dependency edges; the ones not satisfied synchronously were
        // woken by the poker
        let pokes = node.poker.pokes_delivered();
        assert!(pokes > 0 && pokes <= 99, "unexpected poke count {pokes}");

        node.shutdown().await;
    }

    /// A transaction delivered by a peer stays Good after the peer is gone.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn peer_delivered_tx_survives_peer() {
        let wallet_key = wallet_signer();
        let seq = seq_signer();
        let node = start_test_node(&[(seq.as_ref(), 0)], &[(wallet_key.as_ref(), 1_000_000)]);
        let mut wallet = Wallet::from_genesis(&node, wallet_key);
        let tx = wallet.transfer(LedgerTime::new(0, 3), None);

        let frame = Framed::encode(PeerMessage::Gossip(crate::peering::TxGossip {
            metadata: TxMetadata::new(TxSource::Peer),
            tx_bytes: tx.bytes().to_vec(),
        }));
        let message = Framed::decode(&frame).unwrap();
        node.handle_peer_message(message, |_| {});

        let txid = *tx.id();
        wait_until("peer tx defined", Duration::from_secs(5), || {
            node.dag
                .get(&txid)
                .map_or(false, |vid| vid.status() != Status::Undefined)
        })
        .await;
        // the "peer" and its channel are gone; the vertex stays Good
        assert_eq!(node.dag.get(&txid).unwrap().status(), Status::Good);

        node.shutdown().await;
    }

    /// After the sequencer stops, tips are released and the registry purge
    /// brings every reference count back to zero.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reference_counts_balance_on_shutdown() {
        let seq = seq_signer();
        let wallet_key = wallet_signer();
        let node = start_test_node(&[(seq.as_ref(), 0)], &[(wallet_key.as_ref(), 1_000_000)]);
        let (chain_id, _) = node.genesis.chains[0];
        node.start_sequencer(
            chain_id,
            seq.clone(),
            SequencerConfig {
                name: "seq0".to_string(),
                pace: 5,
                max_branches: Some(1),
                ..SequencerConfig::default()
            },
        );

        let mut wallet = Wallet::from_genesis(&node, wallet_key);
        let mut vids = Vec::new();
        for i in 0..5u64 {
            let tx = wallet.transfer(
                LedgerTime::from_ticks(2 + i),
                Some((seq.address(), 10)),
            );
            let vid = node
                .tx_in_wait(tx.bytes(), TxSource::Api, Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(vid.status(), Status::Good);
            vids.push(vid);
        }
        // the sequencer stops on its own after the first branch
        wait_until("sequencer produced its branch", Duration::from_secs(10), || {
            node.metrics.branches_produced_total.get() >= 1
        })
        .await;

        node.shutdown().await;
        assert_eq!(node.dag.num_vertices(), 0, "registry not empty after purge");
        for vid in &vids {
            assert_eq!(vid.num_references(), 0);
        }
    }

    /// Uniqueness of interning under concurrent submission of the same tx.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_tx_submitted_twice_uses_one_vertex() {
        let wallet_key = wallet_signer();
        let seq = seq_signer();
        let node = start_test_node(&[(seq.as_ref(), 0)], &[(wallet_key.as_ref(), 1_000_000)]);
        let mut wallet = Wallet::from_genesis(&node, wallet_key);
        let tx = wallet.transfer(LedgerTime::new(0, 4), None);

        let (a, b) = tokio::join!(
            node.tx_in_wait(tx.bytes(), TxSource::Api, Duration::from_secs(5)),
            node.tx_in_wait(tx.bytes(), TxSource::Peer, Duration::from_secs(5)),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.status(), Status::Good);

        node.shutdown().await;
    }

    /// Malformed bytes are rejected at the door.
    #[tokio::test]
    async fn parse_error_rejects_submission() {
        let seq = seq_signer();
        let node = start_test_node(&[(seq.as_ref(), 0)], &[]);
        assert!(node.tx_in(b"definitely not a transaction", TxSource::Api).is_err());
        assert_eq!(node.metrics.transactions_in_total.get(), 0);
        node.shutdown().await;
    }
}
