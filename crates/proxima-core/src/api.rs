// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::Query,
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::crypto::Hash32;
use crate::ledger::Ledger;
use crate::multistate::{
    fetch_latest_root_records, fetch_latest_slot, heaviest_chain_n_slots_back,
    valid_threshold_fraction, StateReader,
};
use crate::node::TangleNode;
use crate::peering::TxSource;
use crate::tip_pool::TxInclusion;
use crate::types::TxId;
use crate::vertex::Status;

/// Inclusion of `tx` across the current tips, as percentages. `weak` counts
/// every tip, `strong` only tips whose root dominates at `n/d`. Tips whose
/// inclusion cannot be resolved count as not-included.
pub fn inclusion_score(inclusions: &[TxInclusion], numerator: u64, denominator: u64) -> (u64, u64) {
    if inclusions.is_empty() {
        return (0, 0);
    }
    let included = inclusions.iter().filter(|i| i.included).count() as u64;
    let weak = included * 100 / inclusions.len() as u64;

    let dominating: Vec<_> = inclusions
        .iter()
        .filter(|i| i.record.is_coverage_above_threshold(numerator, denominator))
        .collect();
    if dominating.is_empty() {
        return (weak, 0);
    }
    let strong_included = dominating.iter().filter(|i| i.included).count() as u64;
    let strong = strong_included * 100 / dominating.len() as u64;
    (weak, strong)
}

pub fn start_api_server(node: Arc<TangleNode>, address: SocketAddr) -> JoinHandle<Result<(), std::io::Error>> {
    let app = Router::new()
        .route("/get_ledger_id", get(get_ledger_id))
        .route("/get_account_outputs", get(get_account_outputs))
        .route("/get_chain_output", get(get_chain_output))
        .route("/get_output", get(get_output))
        .route("/query_tx_status", get(query_tx_status))
        .route("/query_inclusion_score", get(query_inclusion_score))
        .route("/submit_tx", post(submit_tx))
        .route("/sync_info", get(sync_info))
        .route("/node_info", get(node_info))
        .route("/peers_info", get(peers_info))
        .route("/sequ_stats", get(sequ_stats))
        .route("/get_latest_reliable_branch", get(get_latest_reliable_branch))
        .layer(Extension(node));

    tracing::info!("api server booted on {address}");
    tokio::spawn(async move {
        let listener = TcpListener::bind(&address).await?;
        axum::serve(listener, app).await
    })
}

fn error_json(message: impl std::fmt::Display) -> Json<Value> {
    Json(json!({ "error": message.to_string() }))
}

fn latest_state_reader(node: &TangleNode) -> Result<StateReader> {
    let (_, record) = fetch_latest_root_records(node.state.as_ref())
        .into_iter()
        .next()
        .ok_or_else(|| eyre::eyre!("no committed branches"))?;
    StateReader::new(node.state.clone(), record.root)
}

fn output_json(oid: &crate::types::OutputId, output: &crate::types::Output) -> Value {
    json!({
        "output_id": format!("{}:{}", oid.txid.to_hex(), oid.index),
        "amount": output.amount,
        "lock": output.lock.to_hex(),
        "raw": hex::encode(bincode::serialize(output).expect("output serializes")),
    })
}

async fn get_ledger_id() -> Json<Value> {
    let identity = Ledger::get().identity();
    let encoded = bincode::serialize(identity).expect("ledger identity serializes");
    Json(json!({
        "ledger_id": hex::encode(encoded),
        "library_hash": identity.library_hash().to_hex(),
        "description": identity.description,
    }))
}

#[derive(Deserialize)]
struct AddressQuery {
    address: String,
}

async fn get_account_outputs(
    Extension(node): Extension<Arc<TangleNode>>,
    Query(query): Query<AddressQuery>,
) -> Json<Value> {
    let Some(address) = hex::decode(&query.address)
        .ok()
        .and_then(|b| Hash32::from_slice(&b))
    else {
        return error_json("malformed address");
    };
    match latest_state_reader(&node) {
        Ok(reader) => {
            let outputs: Vec<Value> = reader
                .account_outputs(&address)
                .iter()
                .map(|(oid, output)| output_json(oid, output))
                .collect();
            Json(json!({ "outputs": outputs }))
        }
        Err(err) => error_json(err),
    }
}

#[derive(Deserialize)]
struct ChainQuery {
    chain_id: String,
}

async fn get_chain_output(
    Extension(node): Extension<Arc<TangleNode>>,
    Query(query): Query<ChainQuery>,
) -> Json<Value> {
    let Some(chain_id) = hex::decode(&query.chain_id)
        .ok()
        .and_then(|b| Hash32::from_slice(&b))
    else {
        return error_json("malformed chain id");
    };
    match latest_state_reader(&node) {
        Ok(reader) => match reader.get_chain_output(&chain_id) {
            Some((oid, output)) => Json(output_json(&oid, &output)),
            None => error_json("chain output not found"),
        },
        Err(err) => error_json(err),
    }
}

#[derive(Deserialize)]
struct OutputQuery {
    /// `<txid hex>:<index>`
    output_id: String,
}

async fn get_output(
    Extension(node): Extension<Arc<TangleNode>>,
    Query(query): Query<OutputQuery>,
) -> Json<Value> {
    let Some((txid_hex, index)) = query.output_id.split_once(':') else {
        return error_json("malformed output id");
    };
    let (Ok(txid), Ok(index)) = (TxId::from_hex(txid_hex), index.parse::<u8>()) else {
        return error_json("malformed output id");
    };
    let oid = crate::types::OutputId::new(txid, index);
    match latest_state_reader(&node) {
        Ok(reader) => match reader.get_utxo(&oid) {
            Some(output) => Json(output_json(&oid, &output)),
            None => error_json("output not found"),
        },
        Err(err) => error_json(err),
    }
}

#[derive(Deserialize)]
struct TxQuery {
    txid: String,
}

#[derive(Serialize)]
struct InclusionJson {
    chain_id: String,
    branch_id: String,
    coverage: u64,
    supply: u64,
    included: bool,
}

fn inclusion_json(inclusions: &[TxInclusion]) -> Vec<InclusionJson> {
    inclusions
        .iter()
        .map(|i| InclusionJson {
            chain_id: i.chain_id.to_hex(),
            branch_id: i.branch_id.to_hex(),
            coverage: i.record.ledger_coverage,
            supply: i.record.supply,
            included: i.included,
        })
        .collect()
}

async fn query_tx_status(
    Extension(node): Extension<Arc<TangleNode>>,
    Query(query): Query<TxQuery>,
) -> Json<Value> {
    let Ok(txid) = TxId::from_hex(&query.txid) else {
        return error_json("malformed txid");
    };
    let (status, error) = match node.dag.get(&txid) {
        Some(vid) => (vid.status(), vid.error()),
        None => (Status::Undefined, None),
    };
    let inclusions = node.tips.tx_inclusion(&txid);
    Json(json!({
        "status": status.to_string(),
        "error": error,
        "inclusion": inclusion_json(&inclusions),
    }))
}

#[derive(Deserialize)]
struct InclusionScoreQuery {
    txid: String,
    #[serde(default = "default_numerator")]
    numerator: u64,
    #[serde(default = "default_denominator")]
    denominator: u64,
}

fn default_numerator() -> u64 {
    2
}

fn default_denominator() -> u64 {
    3
}

async fn query_inclusion_score(
    Extension(node): Extension<Arc<TangleNode>>,
    Query(query): Query<InclusionScoreQuery>,
) -> Json<Value> {
    let Ok(txid) = TxId::from_hex(&query.txid) else {
        return error_json("malformed txid");
    };
    if !valid_threshold_fraction(query.numerator, query.denominator) {
        return error_json("invalid threshold fraction");
    }
    let inclusions = node.tips.tx_inclusion(&txid);
    let (weak, strong) = inclusion_score(&inclusions, query.numerator, query.denominator);
    Json(json!({ "weak": weak, "strong": strong }))
}

async fn submit_tx(
    Extension(node): Extension<Arc<TangleNode>>,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    match node.tx_in(&body, TxSource::Api) {
        Ok(txid) => (StatusCode::OK, Json(json!({ "txid": txid.to_hex() }))),
        Err(err) => (StatusCode::BAD_REQUEST, error_json(format!("{err:#}"))),
    }
}

async fn sync_info(Extension(node): Extension<Arc<TangleNode>>) -> Json<Value> {
    let latest_slot = fetch_latest_slot(node.state.as_ref()).unwrap_or(0);
    let slot_now = Ledger::get().slot_now();
    Json(json!({
        "synced": slot_now.saturating_sub(latest_slot) <= 1,
        "latest_slot": latest_slot,
        "slot_now": slot_now,
    }))
}

async fn node_info(Extension(node): Extension<Arc<TangleNode>>) -> Json<Value> {
    Json(json!({
        "num_vertices": node.dag.num_vertices(),
        "num_tips": node.tips.num_tips(),
        "latest_slot": fetch_latest_slot(node.state.as_ref()).unwrap_or(0),
    }))
}

async fn peers_info() -> Json<Value> {
    // peer discovery lives outside the core engine
    Json(json!({ "peers": [] }))
}

async fn sequ_stats(Extension(node): Extension<Arc<TangleNode>>) -> Json<Value> {
    let tips: Vec<Value> = node
        .tips
        .latest_milestones_descending()
        .iter()
        .map(|tip| {
            json!({
                "txid": tip.id.to_hex(),
                "chain_id": tip.sequencer_chain_id().map(|c| c.to_hex()),
                "coverage": tip.coverage_sum(),
                "timestamp": tip.timestamp().to_string(),
            })
        })
        .collect();
    Json(json!({ "tips": tips }))
}

async fn get_latest_reliable_branch(
    Extension(node): Extension<Arc<TangleNode>>,
) -> Json<Value> {
    let chain = heaviest_chain_n_slots_back(&node.state, 10);
    let reliable = chain.iter().find(|bd| {
        bd.record.is_coverage_above_threshold(default_numerator(), default_denominator())
    });
    match reliable.or(chain.first()) {
        Some(bd) => Json(json!({
            "branch_id": bd.branch_id.to_hex(),
            "root": bd.record.root.to_hex(),
            "coverage": bd.record.ledger_coverage,
            "slot": bd.branch_id.slot(),
        })),
        None => error_json("no committed branches"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Hash32;
    use crate::ledger::LedgerTime;
    use crate::multistate::RootRecord;

    fn inclusion(included: bool, coverage: u64, supply: u64) -> TxInclusion {
        TxInclusion {
            chain_id: Hash32::digest(b"chain"),
            branch_id: TxId::new(
                LedgerTime::slot_boundary(1),
                true,
                true,
                Hash32::digest(&coverage.to_be_bytes()),
            ),
            record: RootRecord {
                root: Hash32::digest(b"root"),
                sequencer_id: Hash32::digest(b"chain"),
                ledger_coverage: coverage,
                slot_inflation: 0,
                supply,
                num_transactions: 1,
            },
            included,
        }
    }

    #[test]
    fn inclusion_score_boundary() {
        // all four tips above the 1/2 threshold: coverage > supply
        let tips = vec![
            inclusion(true, 1500, 1000),
            inclusion(true, 1500, 1000),
            inclusion(false, 1500, 1000),
            inclusion(false, 1500, 1000),
        ];
        assert_eq!(inclusion_score(&tips, 1, 2), (50, 50));
    }

    #[test]
    fn inclusion_score_no_tips() {
        assert_eq!(inclusion_score(&[], 1, 2), (0, 0));
    }

    #[test]
    fn inclusion_score_no_dominating_tips() {
        let tips = vec![inclusion(true, 10, 1000), inclusion(false, 10, 1000)];
        assert_eq!(inclusion_score(&tips, 1, 2), (50, 0));
    }
}
