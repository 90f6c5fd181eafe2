// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use eyre::{ensure, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::crypto::Hash32;
use crate::ledger::{Ledger, Slot};
use crate::multistate::{fetch_root_record, heaviest_chain_n_slots_back};
use crate::store::KvStore;
use crate::types::TxId;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TxSource {
    Api,
    Peer,
    Sequencer,
    Store,
}

/// Metadata travelling with gossiped transaction bytes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxMetadata {
    pub source: TxSource,
    pub is_response_to_pull: bool,
    /// State root after the branch, set on pull responses for branches.
    pub state_root: Option<Hash32>,
}

impl TxMetadata {
    pub fn new(source: TxSource) -> Self {
        Self {
            source,
            is_response_to_pull: false,
            state_root: None,
        }
    }
}

/// One gossip frame: metadata plus raw transaction bytes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxGossip {
    pub metadata: TxMetadata,
    pub tx_bytes: Vec<u8>,
}

/// Contracts of the three peer streams. Bit layout of the transport framing
/// is out of scope; these are the messages it carries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PeerMessage {
    Gossip(TxGossip),
    /// Txids the requester wants; the responder streams gossip frames with
    /// `is_response_to_pull` set.
    PullTx(Vec<TxId>),
    /// The responder streams branch transactions of the heaviest chain.
    PullPortion { starting_slot: Slot, max_slots: usize },
}

/// Wire frame keyed by the ledger-library hash: nodes with incompatible
/// ledgers simply ignore each other.
#[derive(Serialize, Deserialize)]
pub struct Framed {
    pub library_hash: Hash32,
    pub message: PeerMessage,
}

impl Framed {
    pub fn encode(message: PeerMessage) -> Vec<u8> {
        let framed = Framed {
            library_hash: Ledger::get().identity().library_hash(),
            message,
        };
        bincode::serialize(&framed).expect("peer message serializes")
    }

    pub fn decode(data: &[u8]) -> Result<PeerMessage> {
        let framed: Framed = bincode::deserialize(data)?;
        ensure!(
            framed.library_hash == Ledger::get().identity().library_hash(),
            "incompatible ledger library hash"
        );
        Ok(framed.message)
    }
}

/// "Send tx" contract consumed by the attacher on publication.
pub trait Gossip: Send + Sync {
    fn gossip_tx(&self, frame: TxGossip);
}

/// "Request tx" / "request portion" contract consumed by the attacher and
/// the sync manager.
pub trait PullRequest: Send + Sync {
    fn pull_tx(&self, txid: TxId);
    fn pull_portion(&self, starting_slot: Slot, max_slots: usize);
}

/// Single-node wiring: nowhere to gossip to, nobody to pull from.
pub struct NoPeering;

impl Gossip for NoPeering {
    fn gossip_tx(&self, _frame: TxGossip) {}
}

impl PullRequest for NoPeering {
    fn pull_tx(&self, _txid: TxId) {}
    fn pull_portion(&self, _starting_slot: Slot, _max_slots: usize) {}
}

/// Channel-backed shim: every outgoing message lands on a queue the owner
/// of the other end drains. Used by the in-process wiring and by tests.
pub struct ChannelPeering {
    out: mpsc::UnboundedSender<PeerMessage>,
}

impl ChannelPeering {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PeerMessage>) {
        let (out, rx) = mpsc::unbounded_channel();
        (Self { out }, rx)
    }
}

impl Gossip for ChannelPeering {
    fn gossip_tx(&self, frame: TxGossip) {
        let _ = self.out.send(PeerMessage::Gossip(frame));
    }
}

impl PullRequest for ChannelPeering {
    fn pull_tx(&self, txid: TxId) {
        let _ = self.out.send(PeerMessage::PullTx(vec![txid]));
    }

    fn pull_portion(&self, starting_slot: Slot, max_slots: usize) {
        let _ = self.out.send(PeerMessage::PullPortion {
            starting_slot,
            max_slots,
        });
    }
}

/// Serves pull requests from the raw-transaction store and the committed
/// branch chain.
pub struct PullServer {
    txbytes: Arc<dyn KvStore>,
    state: Arc<dyn KvStore>,
}

impl PullServer {
    pub fn new(txbytes: Arc<dyn KvStore>, state: Arc<dyn KvStore>) -> Self {
        Self { txbytes, state }
    }

    /// Gossip frames for every requested transaction we have.
    pub fn serve_pull_tx(&self, txids: &[TxId]) -> Vec<TxGossip> {
        txids
            .iter()
            .filter_map(|txid| {
                let tx_bytes = self.txbytes.get(txid.as_ref())?;
                let state_root = if txid.is_branch() {
                    fetch_root_record(self.state.as_ref(), txid).map(|r| r.root)
                } else {
                    None
                };
                Some(TxGossip {
                    metadata: TxMetadata {
                        source: TxSource::Peer,
                        is_response_to_pull: true,
                        state_root,
                    },
                    tx_bytes,
                })
            })
            .collect()
    }

    /// Branch transactions of the heaviest chain from `starting_slot`
    /// forward, oldest first.
    pub fn serve_pull_portion(&self, starting_slot: Slot, max_slots: usize) -> Vec<TxGossip> {
        let mut chain = heaviest_chain_n_slots_back(&self.state, usize::MAX);
        chain.retain(|bd| bd.branch_id.slot() >= starting_slot);
        chain.reverse(); // oldest first
        chain.truncate(max_slots);
        let branch_ids: Vec<TxId> = chain.iter().map(|bd| bd.branch_id).collect();
        self.serve_pull_tx(&branch_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Hash32;
    use crate::ledger::LedgerTime;

    #[test]
    fn frame_roundtrip() {
        let txid = TxId::new(LedgerTime::new(1, 1), false, false, Hash32::digest(b"t"));
        let encoded = Framed::encode(PeerMessage::PullTx(vec![txid]));
        match Framed::decode(&encoded).unwrap() {
            PeerMessage::PullTx(ids) => assert_eq!(ids, vec![txid]),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn frame_rejects_foreign_library_hash() {
        let framed = Framed {
            library_hash: Hash32::digest(b"some other ledger"),
            message: PeerMessage::PullPortion {
                starting_slot: 0,
                max_slots: 10,
            },
        };
        let encoded = bincode::serialize(&framed).unwrap();
        assert!(Framed::decode(&encoded).is_err());
    }

    #[test]
    fn channel_peering_delivers_requests() {
        let (peering, mut rx) = ChannelPeering::new();
        let txid = TxId::new(LedgerTime::new(2, 3), false, false, Hash32::digest(b"p"));
        peering.pull_tx(txid);
        peering.pull_portion(5, 20);
        match rx.try_recv().unwrap() {
            PeerMessage::PullTx(ids) => assert_eq!(ids, vec![txid]),
            other => panic!("unexpected message {other:?}"),
        }
        match rx.try_recv().unwrap() {
            PeerMessage::PullPortion {
                starting_slot,
                max_slots,
            } => {
                assert_eq!(starting_slot, 5);
                assert_eq!(max_slots, 20);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}
