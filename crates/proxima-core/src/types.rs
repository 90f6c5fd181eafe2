// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use eyre::{bail, ensure, Result};
use serde::{Deserialize, Serialize};

use crate::crypto::{Address, Hash32, PublicKey, SignatureBytes, Signer};
use crate::ledger::{LedgerTime, Slot, TICKS_PER_SLOT};

pub const TXID_SIZE: usize = 32;

const FLAG_SEQUENCER: u8 = 0x01;
const FLAG_BRANCH: u8 = 0x02;

/// Transaction id: 32 bytes with the logical timestamp and the
/// sequencer/branch flags embedded in the first six bytes, the rest taken
/// from the essence digest. Byte-wise ordering is therefore timestamp-major.
#[derive(
    Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Default, Serialize, Deserialize,
)]
pub struct TxId(pub [u8; TXID_SIZE]);

impl TxId {
    pub fn new(
        timestamp: LedgerTime,
        is_sequencer: bool,
        is_branch: bool,
        essence_digest: Hash32,
    ) -> Self {
        assert!(
            !is_branch || (is_sequencer && timestamp.is_slot_boundary()),
            "branch flag requires a sequencer tx on a slot boundary"
        );
        let mut bytes = [0u8; TXID_SIZE];
        bytes[0..4].copy_from_slice(&timestamp.slot.to_be_bytes());
        bytes[4] = timestamp.tick;
        bytes[5] = if is_sequencer { FLAG_SEQUENCER } else { 0 }
            | if is_branch { FLAG_BRANCH } else { 0 };
        bytes[6..].copy_from_slice(&essence_digest.0[..TXID_SIZE - 6]);
        Self(bytes)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let bytes: [u8; TXID_SIZE] = data.try_into().map_err(|_| eyre::eyre!("wrong txid size"))?;
        let ret = Self(bytes);
        ensure!((ret.0[4] as u32) < TICKS_PER_SLOT, "txid tick out of range");
        ensure!(
            ret.0[5] & !(FLAG_SEQUENCER | FLAG_BRANCH) == 0,
            "unknown txid flags"
        );
        if ret.is_branch() {
            ensure!(
                ret.is_sequencer() && ret.timestamp().is_slot_boundary(),
                "inconsistent branch flag"
            );
        }
        Ok(ret)
    }

    pub fn timestamp(&self) -> LedgerTime {
        LedgerTime {
            slot: Slot::from_be_bytes(self.0[0..4].try_into().unwrap()),
            tick: self.0[4],
        }
    }

    pub fn slot(&self) -> Slot {
        self.timestamp().slot
    }

    pub fn is_sequencer(&self) -> bool {
        self.0[5] & FLAG_SEQUENCER != 0
    }

    pub fn is_branch(&self) -> bool {
        self.0[5] & FLAG_BRANCH != 0
    }

    /// First key bytes of every txid in `slot`; used for prefix iteration.
    pub fn slot_prefix(slot: Slot) -> [u8; 4] {
        slot.to_be_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let data = hex::decode(s)?;
        Self::from_bytes(&data)
    }

    pub fn short_string(&self) -> String {
        let kind = match (self.is_branch(), self.is_sequencer()) {
            (true, _) => "br",
            (false, true) => "sq",
            _ => "",
        };
        format!("[{}{}]{}", self.timestamp(), kind, hex::encode(&self.0[6..10]))
    }
}

impl AsRef<[u8]> for TxId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_string())
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_string())
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct OutputId {
    pub txid: TxId,
    pub index: u8,
}

impl OutputId {
    pub fn new(txid: TxId, index: u8) -> Self {
        Self { txid, index }
    }

    pub fn timestamp(&self) -> LedgerTime {
        self.txid.timestamp()
    }
}

impl fmt::Debug for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.txid, self.index)
    }
}

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.txid, self.index)
    }
}

/// Id of a sequencer chain, derived from the chain origin output.
pub type ChainId = Hash32;

/// Marks a chain origin output; the effective chain id is derived from the
/// output id at first use.
pub const NIL_CHAIN_ID: ChainId = Hash32([0; 32]);

pub fn make_origin_chain_id(origin: &OutputId) -> ChainId {
    Hash32::digest_parts(&[origin.txid.as_ref(), &[origin.index]])
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum OutputKind {
    Plain,
    /// Carries the sequencer chain constraint.
    Sequencer { chain_id: ChainId },
    /// Branch-only output committing to the previous branch's stem.
    Stem { predecessor: OutputId },
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub amount: u64,
    pub lock: Address,
    pub kind: OutputKind,
}

impl Output {
    pub fn plain(amount: u64, lock: Address) -> Self {
        Self {
            amount,
            lock,
            kind: OutputKind::Plain,
        }
    }

    pub fn is_stem(&self) -> bool {
        matches!(self.kind, OutputKind::Stem { .. })
    }

    pub fn chain_id(&self) -> Option<ChainId> {
        match &self.kind {
            OutputKind::Sequencer { chain_id } => Some(*chain_id),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SequencerData {
    pub chain_id: ChainId,
    /// Input consuming the chain predecessor output.
    pub predecessor_input_index: u8,
    pub sequencer_output_index: u8,
    /// Present iff the transaction is a branch.
    pub stem_output_index: Option<u8>,
}

/// Unsigned part of the transaction; the essence digest feeds both the
/// signature and the txid.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxEssence {
    pub timestamp: LedgerTime,
    pub inputs: Vec<OutputId>,
    pub endorsements: Vec<TxId>,
    pub outputs: Vec<Output>,
    pub sequencer: Option<SequencerData>,
    pub slot_inflation: u64,
    pub public_key: PublicKey,
}

impl TxEssence {
    pub fn digest(&self) -> Hash32 {
        let encoded = bincode::serialize(self).expect("essence serializes");
        Hash32::digest(&encoded)
    }
}

#[derive(Serialize, Deserialize)]
struct TxWire {
    essence: TxEssence,
    signature: SignatureBytes,
}

/// Fully parsed transaction. Construction goes through [`Transaction::from_bytes`]
/// (basic parse: structure, flags, index bounds) or [`TxBuilder::sign`];
/// semantic validation is the constraint validator's job.
#[derive(Clone, Debug)]
pub struct Transaction {
    id: TxId,
    essence: TxEssence,
    signature: SignatureBytes,
    bytes: Vec<u8>,
}

impl Transaction {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let wire: TxWire = bincode::deserialize(data)?;
        let essence = wire.essence;
        ensure!(
            (essence.timestamp.tick as u32) < TICKS_PER_SLOT,
            "timestamp tick out of range"
        );
        ensure!(!essence.outputs.is_empty(), "transaction produces no outputs");
        ensure!(
            essence.inputs.len() <= u8::MAX as usize
                && essence.outputs.len() <= u8::MAX as usize,
            "too many inputs or outputs"
        );
        match &essence.sequencer {
            Some(seq) => {
                ensure!(!essence.inputs.is_empty(), "sequencer tx without inputs");
                ensure!(
                    (seq.predecessor_input_index as usize) < essence.inputs.len(),
                    "predecessor input index out of bounds"
                );
                let seq_out = essence
                    .outputs
                    .get(seq.sequencer_output_index as usize)
                    .ok_or_else(|| eyre::eyre!("sequencer output index out of bounds"))?;
                ensure!(
                    matches!(seq_out.kind, OutputKind::Sequencer { .. }),
                    "sequencer output has wrong kind"
                );
                let is_branch = essence.timestamp.is_slot_boundary();
                match (is_branch, seq.stem_output_index) {
                    (true, Some(idx)) => {
                        let stem = essence
                            .outputs
                            .get(idx as usize)
                            .ok_or_else(|| eyre::eyre!("stem output index out of bounds"))?;
                        ensure!(stem.is_stem(), "stem output has wrong kind");
                    }
                    (true, None) => bail!("branch tx without stem output"),
                    (false, Some(_)) => bail!("stem output outside a slot boundary"),
                    (false, None) => {}
                }
            }
            None => {
                ensure!(
                    essence.endorsements.is_empty(),
                    "endorsements on a non-sequencer tx"
                );
            }
        }
        for endorsed in &essence.endorsements {
            ensure!(endorsed.is_sequencer(), "endorsed txid is not a sequencer tx");
            ensure!(
                endorsed.slot() == essence.timestamp.slot
                    && endorsed.timestamp() < essence.timestamp,
                "endorsement must point backwards within the slot"
            );
        }
        for (i, input) in essence.inputs.iter().enumerate() {
            ensure!(
                input.timestamp() < essence.timestamp,
                "input {input} not earlier than the transaction"
            );
            ensure!(
                !essence.inputs[..i].contains(input),
                "duplicate input {input}"
            );
        }
        for (i, endorsed) in essence.endorsements.iter().enumerate() {
            ensure!(
                !essence.endorsements[..i].contains(endorsed),
                "duplicate endorsement"
            );
        }

        let is_sequencer = essence.sequencer.is_some();
        let is_branch = is_sequencer && essence.timestamp.is_slot_boundary();
        let id = TxId::new(essence.timestamp, is_sequencer, is_branch, essence.digest());
        Ok(Self {
            id,
            essence,
            signature: wire.signature,
            bytes: data.to_vec(),
        })
    }

    pub fn id(&self) -> &TxId {
        &self.id
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn timestamp(&self) -> LedgerTime {
        self.essence.timestamp
    }

    pub fn slot(&self) -> Slot {
        self.essence.timestamp.slot
    }

    pub fn is_sequencer_milestone(&self) -> bool {
        self.essence.sequencer.is_some()
    }

    pub fn is_branch(&self) -> bool {
        self.id.is_branch()
    }

    pub fn num_inputs(&self) -> usize {
        self.essence.inputs.len()
    }

    pub fn input_at(&self, i: u8) -> Option<&OutputId> {
        self.essence.inputs.get(i as usize)
    }

    pub fn inputs(&self) -> &[OutputId] {
        &self.essence.inputs
    }

    pub fn num_endorsements(&self) -> usize {
        self.essence.endorsements.len()
    }

    pub fn endorsements(&self) -> &[TxId] {
        &self.essence.endorsements
    }

    pub fn num_produced_outputs(&self) -> usize {
        self.essence.outputs.len()
    }

    pub fn produced_output_at(&self, idx: u8) -> Option<&Output> {
        self.essence.outputs.get(idx as usize)
    }

    pub fn produced_outputs(&self) -> &[Output] {
        &self.essence.outputs
    }

    pub fn output_id_at(&self, idx: u8) -> OutputId {
        OutputId::new(self.id, idx)
    }

    pub fn sequencer_data(&self) -> Option<&SequencerData> {
        self.essence.sequencer.as_ref()
    }

    /// Effective chain id: resolves the origin marker to the derived id.
    pub fn sequencer_chain_id(&self) -> Option<ChainId> {
        let seq = self.essence.sequencer.as_ref()?;
        if seq.chain_id == NIL_CHAIN_ID {
            Some(make_origin_chain_id(
                &self.output_id_at(seq.sequencer_output_index),
            ))
        } else {
            Some(seq.chain_id)
        }
    }

    pub fn slot_inflation(&self) -> u64 {
        self.essence.slot_inflation
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.essence.public_key
    }

    pub fn signature(&self) -> &SignatureBytes {
        &self.signature
    }

    pub fn essence_digest(&self) -> Hash32 {
        self.essence.digest()
    }

    pub fn total_produced_amount(&self) -> u64 {
        self.essence.outputs.iter().map(|o| o.amount).sum()
    }
}

/// Builder used by the milestone factory and by tests.
pub struct TxBuilder {
    pub timestamp: LedgerTime,
    pub inputs: Vec<OutputId>,
    pub endorsements: Vec<TxId>,
    pub outputs: Vec<Output>,
    pub sequencer: Option<SequencerData>,
    pub slot_inflation: u64,
}

impl TxBuilder {
    pub fn new(timestamp: LedgerTime) -> Self {
        Self {
            timestamp,
            inputs: Vec::new(),
            endorsements: Vec::new(),
            outputs: Vec::new(),
            sequencer: None,
            slot_inflation: 0,
        }
    }

    pub fn input(mut self, oid: OutputId) -> Self {
        self.inputs.push(oid);
        self
    }

    pub fn endorse(mut self, txid: TxId) -> Self {
        self.endorsements.push(txid);
        self
    }

    pub fn output(mut self, output: Output) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn sequencer(mut self, data: SequencerData) -> Self {
        self.sequencer = Some(data);
        self
    }

    pub fn inflation(mut self, amount: u64) -> Self {
        self.slot_inflation = amount;
        self
    }

    /// Signs the essence and runs it back through the basic parse, so a
    /// built transaction is indistinguishable from a received one.
    pub fn sign(self, signer: &Signer) -> Result<Transaction> {
        let essence = TxEssence {
            timestamp: self.timestamp,
            inputs: self.inputs,
            endorsements: self.endorsements,
            outputs: self.outputs,
            sequencer: self.sequencer,
            slot_inflation: self.slot_inflation,
            public_key: signer.public_key(),
        };
        let signature = signer.sign(essence.digest().as_ref());
        let wire = TxWire { essence, signature };
        let bytes = bincode::serialize(&wire)?;
        Transaction::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> Signer {
        Signer::from_seed(1)
    }

    fn genesis_oid() -> OutputId {
        OutputId::new(
            TxId::new(LedgerTime::new(0, 0), false, false, Hash32::digest(b"g")),
            0,
        )
    }

    #[test]
    fn txid_embeds_timestamp_and_flags() {
        let id = TxId::new(LedgerTime::new(7, 0), true, true, Hash32::digest(b"x"));
        assert_eq!(id.timestamp(), LedgerTime::new(7, 0));
        assert!(id.is_sequencer());
        assert!(id.is_branch());
        assert_eq!(&id.0[0..4], &TxId::slot_prefix(7));

        let plain = TxId::new(LedgerTime::new(7, 3), false, false, Hash32::digest(b"y"));
        assert!(!plain.is_sequencer());
        assert!(!plain.is_branch());
        assert!(plain > id); // byte order follows timestamps
    }

    #[test]
    fn txid_rejects_inconsistent_flags() {
        let mut bytes = TxId::new(LedgerTime::new(3, 5), false, false, Hash32::digest(b"z")).0;
        bytes[5] = FLAG_BRANCH; // branch without sequencer flag
        assert!(TxId::from_bytes(&bytes).is_err());
        bytes[4] = 200; // tick out of range
        assert!(TxId::from_bytes(&bytes).is_err());
    }

    #[test]
    fn build_parse_roundtrip() {
        let signer = signer();
        let tx = TxBuilder::new(LedgerTime::new(1, 10))
            .input(genesis_oid())
            .output(Output::plain(1000, signer.address()))
            .sign(&signer)
            .unwrap();
        let parsed = Transaction::from_bytes(tx.bytes()).unwrap();
        assert_eq!(parsed.id(), tx.id());
        assert_eq!(parsed.num_inputs(), 1);
        assert_eq!(parsed.produced_output_at(0).unwrap().amount, 1000);
        assert!(!parsed.is_sequencer_milestone());
    }

    #[test]
    fn branch_requires_stem() {
        let signer = signer();
        let chain_id = make_origin_chain_id(&genesis_oid());
        let err = TxBuilder::new(LedgerTime::new(2, 0))
            .input(genesis_oid())
            .output(Output {
                amount: 500,
                lock: signer.address(),
                kind: OutputKind::Sequencer { chain_id },
            })
            .sequencer(SequencerData {
                chain_id,
                predecessor_input_index: 0,
                sequencer_output_index: 0,
                stem_output_index: None,
            })
            .sign(&signer);
        assert!(err.is_err());
    }

    #[test]
    fn endorsement_must_stay_in_slot() {
        let signer = signer();
        let chain_id = make_origin_chain_id(&genesis_oid());
        let endorsed = TxId::new(LedgerTime::new(1, 1), true, false, Hash32::digest(b"e"));
        let err = TxBuilder::new(LedgerTime::new(2, 5))
            .input(genesis_oid())
            .endorse(endorsed)
            .output(Output {
                amount: 500,
                lock: signer.address(),
                kind: OutputKind::Sequencer { chain_id },
            })
            .sequencer(SequencerData {
                chain_id,
                predecessor_input_index: 0,
                sequencer_output_index: 0,
                stem_output_index: None,
            })
            .sign(&signer);
        assert!(err.is_err());
    }
}
