// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{http::StatusCode, routing::get, Extension, Router};
use prometheus::{
    register_int_counter_with_registry, register_int_gauge_with_registry, IntCounter, IntGauge,
    Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const METRICS_ROUTE: &str = "/metrics";

pub struct Metrics {
    pub transactions_in_total: IntCounter,
    pub attached_good_total: IntCounter,
    pub attached_bad_total: IntCounter,
    pub branches_committed_total: IntCounter,
    pub milestones_produced_total: IntCounter,
    pub branches_produced_total: IntCounter,
    pub pull_requests_total: IntCounter,
    pub gossiped_tx_total: IntCounter,
    pub sync_slots_behind: IntGauge,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Arc<Self> {
        Arc::new(Self {
            transactions_in_total: register_int_counter_with_registry!(
                "transactions_in_total",
                "Raw transactions accepted after basic parse",
                registry,
            )
            .unwrap(),
            attached_good_total: register_int_counter_with_registry!(
                "attached_good_total",
                "Vertices that reached status Good",
                registry,
            )
            .unwrap(),
            attached_bad_total: register_int_counter_with_registry!(
                "attached_bad_total",
                "Vertices that reached status Bad",
                registry,
            )
            .unwrap(),
            branches_committed_total: register_int_counter_with_registry!(
                "branches_committed_total",
                "Branch states committed to the multistate store",
                registry,
            )
            .unwrap(),
            milestones_produced_total: register_int_counter_with_registry!(
                "milestones_produced_total",
                "Milestones produced by own sequencers",
                registry,
            )
            .unwrap(),
            branches_produced_total: register_int_counter_with_registry!(
                "branches_produced_total",
                "Branch milestones produced by own sequencers",
                registry,
            )
            .unwrap(),
            pull_requests_total: register_int_counter_with_registry!(
                "pull_requests_total",
                "Transaction pull requests issued",
                registry,
            )
            .unwrap(),
            gossiped_tx_total: register_int_counter_with_registry!(
                "gossiped_tx_total",
                "Transactions handed to the gossip shim",
                registry,
            )
            .unwrap(),
            sync_slots_behind: register_int_gauge_with_registry!(
                "sync_slots_behind",
                "Distance between the latest committed slot and the clock",
                registry,
            )
            .unwrap(),
        })
    }

    pub fn new_for_tests() -> Arc<Self> {
        Self::new(&Registry::new())
    }
}

pub fn start_metrics_server(
    address: SocketAddr,
    registry: &Registry,
) -> JoinHandle<Result<(), std::io::Error>> {
    let app = Router::new()
        .route(METRICS_ROUTE, get(metrics))
        .layer(Extension(registry.clone()));

    tracing::info!("metrics server booted on {address}");
    tokio::spawn(async move {
        let listener = TcpListener::bind(&address).await?;
        axum::serve(listener, app).await
    })
}

async fn metrics(registry: Extension<Registry>) -> (StatusCode, String) {
    let metrics_families = registry.gather();
    match TextEncoder.encode_to_string(&metrics_families) {
        Ok(metrics) => (StatusCode::OK, metrics),
        Err(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Unable to encode metrics: {error}"),
        ),
    }
}
