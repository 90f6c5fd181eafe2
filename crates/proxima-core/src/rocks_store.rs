// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;
use std::sync::Arc;

use eyre::{Context, Result};
use rocksdb::{ColumnFamilyDescriptor, Options, WriteOptions, DB};

use crate::store::KvStore;

/// Column family with the three byte-tagged state partitions.
const CF_STATE: &str = "state";
/// Column family with raw transaction bytes keyed by txid, serving pull.
const CF_TXBYTES: &str = "txbytes";

/// RocksDB-backed persistence. One database, one column family per
/// namespace; each namespace is exposed as its own [`KvStore`].
pub struct RocksStore {
    db: Arc<DB>,
}

impl RocksStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_write_buffer_size(64 * 1024 * 1024);
        opts.set_max_background_jobs(4);
        opts.set_level_compaction_dynamic_level_bytes(true);
        opts.optimize_for_point_lookup(1024);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_STATE, Options::default()),
            ColumnFamilyDescriptor::new(CF_TXBYTES, Options::default()),
        ];
        let db = DB::open_cf_descriptors(&opts, path, cf_descriptors)
            .wrap_err("failed to open rocksdb")?;
        Ok(Self { db: Arc::new(db) })
    }

    pub fn state(&self) -> RocksPartition {
        RocksPartition {
            db: self.db.clone(),
            cf: CF_STATE,
        }
    }

    pub fn txbytes(&self) -> RocksPartition {
        RocksPartition {
            db: self.db.clone(),
            cf: CF_TXBYTES,
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush().wrap_err("rocksdb flush failed")?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct RocksPartition {
    db: Arc<DB>,
    cf: &'static str,
}

impl RocksPartition {
    fn cf_handle(&self) -> &rocksdb::ColumnFamily {
        self.db
            .cf_handle(self.cf)
            .expect("column family exists by construction")
    }

    fn write_opts() -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(false);
        opts
    }
}

impl KvStore for RocksPartition {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.db
            .get_cf(self.cf_handle(), key)
            .expect("rocksdb read")
    }

    fn put(&self, key: &[u8], value: &[u8]) {
        self.db
            .put_cf_opt(self.cf_handle(), key, value, &Self::write_opts())
            .expect("rocksdb write");
    }

    fn delete(&self, key: &[u8]) {
        self.db
            .delete_cf_opt(self.cf_handle(), key, &Self::write_opts())
            .expect("rocksdb delete");
    }

    fn iter_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let cf = self.cf_handle();
        let mut iter = self.db.raw_iterator_cf(cf);
        iter.seek(prefix);
        let mut entries = Vec::new();
        while iter.valid() {
            let key = iter.key().expect("valid iterator has a key");
            if !key.starts_with(prefix) {
                break;
            }
            let value = iter.value().expect("valid iterator has a value");
            entries.push((key.to_vec(), value.to_vec()));
            iter.next();
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::partition_key;

    #[test]
    fn open_put_get_iterate() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        let state = store.state();
        state.put(&partition_key(1, b"aa"), b"1");
        state.put(&partition_key(1, b"ab"), b"2");
        state.put(&partition_key(2, b"zz"), b"3");

        assert_eq!(state.get(&partition_key(1, b"aa")), Some(b"1".to_vec()));
        assert_eq!(state.iter_prefix(&[1]).len(), 2);
        assert_eq!(state.iter_prefix(&[2]).len(), 1);

        // namespaces do not leak into each other
        let txbytes = store.txbytes();
        assert_eq!(txbytes.get(&partition_key(1, b"aa")), None);
    }
}
