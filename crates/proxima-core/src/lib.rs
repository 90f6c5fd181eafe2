// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

pub mod api;
pub mod attacher;
pub mod backlog;
pub mod constraints;
pub mod crypto;
pub mod dag;
pub mod factory;
pub mod ledger;
pub mod metrics;
pub mod multistate;
pub mod node;
pub mod peering;
pub mod poker;
pub mod rocks_store;
pub mod sequencer;
pub mod store;
pub mod sync;
pub mod test_util;
pub mod tip_pool;
pub mod types;
pub mod vertex;
