// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use ahash::AHashMap;
use eyre::{ensure, Result};
use parking_lot::RwLock;

use crate::types::TxId;
use crate::vertex::Vtx;

/// The vertex registry: interns exactly one live [`Vtx`] per txid.
/// Holds one reference of its own per vertex; eviction happens when the
/// reference count drops to zero.
#[derive(Default)]
pub struct Dag {
    vertices: RwLock<AHashMap<TxId, Arc<Vtx>>>,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing vertex without acquiring a reference; the caller must not
    /// store the pointer beyond the current operation.
    pub fn get(&self, txid: &TxId) -> Option<Arc<Vtx>> {
        self.vertices.read().get(txid).cloned()
    }

    /// Returns the vertex for `txid`, inserting a Virtual one if absent.
    /// The caller receives +1 reference and must release it through
    /// [`Dag::unreference`].
    pub fn get_or_create_virtual(&self, txid: TxId) -> Arc<Vtx> {
        if let Some(existing) = self.vertices.read().get(&txid) {
            if existing.reference() {
                return existing.clone();
            }
        }
        let mut vertices = self.vertices.write();
        if let Some(existing) = vertices.get(&txid) {
            if existing.reference() {
                return existing.clone();
            }
        }
        // either absent or caught mid-teardown; a fresh vertex replaces
        // the stale entry
        let fresh = Vtx::new_virtual(txid);
        assert!(fresh.reference(), "fresh vertex is referencable");
        vertices.insert(txid, fresh.clone());
        fresh
    }

    /// Like [`Dag::get_or_create_virtual`] for a branch transaction.
    pub fn ensure_branch(&self, txid: TxId) -> Result<Arc<Vtx>> {
        ensure!(txid.is_branch(), "{txid} is not flagged as a branch");
        Ok(self.get_or_create_virtual(txid))
    }

    /// Releases one reference; a vertex reaching zero is tombstoned,
    /// removed from the registry and its forward edges are released in turn.
    pub fn unreference(&self, vtx: &Arc<Vtx>) {
        let mut pending = vec![vtx.clone()];
        while let Some(v) = pending.pop() {
            if v.unreference() > 0 {
                continue;
            }
            {
                let mut vertices = self.vertices.write();
                if let Some(entry) = vertices.get(&v.id) {
                    if Arc::ptr_eq(entry, &v) {
                        vertices.remove(&v.id);
                    }
                }
            }
            pending.extend(v.mark_deleted());
        }
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.read().len()
    }

    pub fn vertices(&self) -> Vec<Arc<Vtx>> {
        self.vertices.read().values().cloned().collect()
    }

    /// Drops the registry's own reference of every vertex. Called on
    /// shutdown after all other holders released theirs; balanced runs end
    /// with an empty registry.
    pub fn purge(&self) {
        for vtx in self.vertices() {
            self.unreference(&vtx);
        }
    }
}
