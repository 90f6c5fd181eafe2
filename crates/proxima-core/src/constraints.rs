// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use eyre::{bail, ensure, Result};

use crate::ledger::Ledger;
use crate::types::{
    make_origin_chain_id, ChainId, Output, OutputId, OutputKind, Transaction, NIL_CHAIN_ID,
};

/// Chain id carried by a consumed output; a NIL marker resolves to the id
/// derived from the output's own id.
fn effective_chain_id(output: &Output, oid: &OutputId) -> Option<ChainId> {
    let chain_id = output.chain_id()?;
    if chain_id == NIL_CHAIN_ID {
        Some(make_origin_chain_id(oid))
    } else {
        Some(chain_id)
    }
}

/// The pure constraint validator: `(tx, consumed-output-resolver) -> ok/err`.
/// The resolver returns the output consumed by input `i`; all of them must be
/// materialised before validation makes sense.
pub fn validate(tx: &Transaction, resolve: impl Fn(u8) -> Option<Output>) -> Result<()> {
    let mut consumed: Vec<Output> = Vec::with_capacity(tx.num_inputs());
    for i in 0..tx.num_inputs() as u8 {
        match resolve(i) {
            Some(output) => consumed.push(output),
            None => bail!("input #{i} is not available"),
        }
    }

    // signature over the essence digest
    let digest = tx.essence_digest();
    ensure!(
        tx.public_key().verify(tx.signature(), digest.as_ref()),
        "invalid signature"
    );

    // balance: consumed + inflation == produced
    let consumed_total: u64 = consumed.iter().map(|o| o.amount).sum();
    let produced_total = tx.total_produced_amount();
    ensure!(
        consumed_total + tx.slot_inflation() == produced_total,
        "unbalanced: consumed {consumed_total} + inflation {} != produced {produced_total}",
        tx.slot_inflation()
    );

    let identity = Ledger::get().identity();
    if tx.is_branch() {
        ensure!(
            tx.slot_inflation() <= identity.branch_inflation_bonus,
            "slot inflation above the branch bonus"
        );
    } else {
        ensure!(tx.slot_inflation() == 0, "inflation outside a branch");
    }

    // pace: inputs must be at least tx_pace ticks older
    for input in tx.inputs() {
        ensure!(
            tx.timestamp().diff_ticks(&input.timestamp()) >= identity.tx_pace as i64,
            "input {input} violates the transaction pace"
        );
    }

    // locks: every consumed output must be controlled by the signer; stem
    // outputs carry no lock and are consumable by branches only
    let signer_address = tx.public_key().address();
    for (i, output) in consumed.iter().enumerate() {
        if output.is_stem() {
            ensure!(tx.is_branch(), "stem output consumed outside a branch");
        } else {
            ensure!(
                output.lock == signer_address,
                "input #{i} is not controlled by the signer"
            );
        }
    }

    // produced amounts: zero value is allowed on the stem only
    for (i, output) in tx.produced_outputs().iter().enumerate() {
        ensure!(
            output.amount > 0 || output.is_stem(),
            "produced output #{i} has zero amount"
        );
    }

    if let Some(seq) = tx.sequencer_data() {
        let chain_id = tx.sequencer_chain_id().expect("sequencer tx has a chain id");
        let pred_index = seq.predecessor_input_index;
        let pred_oid = tx
            .input_at(pred_index)
            .expect("predecessor index checked at parse");
        let pred_output = &consumed[pred_index as usize];
        ensure!(
            effective_chain_id(pred_output, pred_oid) == Some(chain_id),
            "chain predecessor of {chain_id:?} not found at input #{pred_index}"
        );
        let seq_out = tx
            .produced_output_at(seq.sequencer_output_index)
            .expect("sequencer output checked at parse");
        let produced_chain = seq_out.chain_id().expect("sequencer output kind");
        ensure!(
            produced_chain == chain_id || produced_chain == NIL_CHAIN_ID,
            "produced sequencer output continues a different chain"
        );

        if let Some(stem_index) = seq.stem_output_index {
            let stem_out = tx
                .produced_output_at(stem_index)
                .expect("stem output checked at parse");
            let OutputKind::Stem { predecessor } = &stem_out.kind else {
                unreachable!("stem kind checked at parse");
            };
            let consumes_predecessor = tx.inputs().iter().enumerate().any(|(i, oid)| {
                oid == predecessor && consumed[i].is_stem()
            });
            ensure!(
                consumes_predecessor,
                "produced stem does not commit to a consumed stem"
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Hash32, Signer};
    use crate::ledger::LedgerTime;
    use crate::types::{OutputId, TxBuilder, TxId};

    fn genesis_output(signer: &Signer, amount: u64) -> (OutputId, Output) {
        let txid = TxId::new(LedgerTime::new(0, 0), false, false, Hash32::digest(b"gen"));
        (OutputId::new(txid, 0), Output::plain(amount, signer.address()))
    }

    #[test]
    fn valid_transfer_passes() {
        let signer = Signer::from_seed(3);
        let (oid, consumed) = genesis_output(&signer, 700);
        let tx = TxBuilder::new(LedgerTime::new(1, 10))
            .input(oid)
            .output(Output::plain(700, Hash32::digest(b"recipient")))
            .sign(&signer)
            .unwrap();
        validate(&tx, |_| Some(consumed.clone())).unwrap();
    }

    #[test]
    fn unbalanced_transfer_fails() {
        let signer = Signer::from_seed(3);
        let (oid, consumed) = genesis_output(&signer, 700);
        let tx = TxBuilder::new(LedgerTime::new(1, 10))
            .input(oid)
            .output(Output::plain(800, Hash32::digest(b"recipient")))
            .sign(&signer)
            .unwrap();
        let err = validate(&tx, |_| Some(consumed.clone())).unwrap_err();
        assert!(err.to_string().contains("unbalanced"));
    }

    #[test]
    fn foreign_lock_fails() {
        let owner = Signer::from_seed(3);
        let thief = Signer::from_seed(4);
        let (oid, consumed) = genesis_output(&owner, 700);
        let tx = TxBuilder::new(LedgerTime::new(1, 10))
            .input(oid)
            .output(Output::plain(700, thief.address()))
            .sign(&thief)
            .unwrap();
        let err = validate(&tx, |_| Some(consumed.clone())).unwrap_err();
        assert!(err.to_string().contains("not controlled"));
    }

    #[test]
    fn missing_input_fails() {
        let signer = Signer::from_seed(3);
        let (oid, _) = genesis_output(&signer, 700);
        let tx = TxBuilder::new(LedgerTime::new(1, 10))
            .input(oid)
            .output(Output::plain(700, signer.address()))
            .sign(&signer)
            .unwrap();
        assert!(validate(&tx, |_| None).is_err());
    }

    #[test]
    fn inflation_outside_branch_fails() {
        let signer = Signer::from_seed(3);
        let (oid, consumed) = genesis_output(&signer, 700);
        let tx = TxBuilder::new(LedgerTime::new(1, 10))
            .input(oid)
            .output(Output::plain(710, signer.address()))
            .inflation(10)
            .sign(&signer)
            .unwrap();
        let err = validate(&tx, |_| Some(consumed.clone())).unwrap_err();
        assert!(err.to_string().contains("inflation"));
    }
}
