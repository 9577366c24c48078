//! RocksDB backend.

use crate::kv::{BatchOp, KeyValue, KeyValueStore, WriteBatch};
use crate::{Result, StoreConfig};
use rocksdb::{DB, Direction, IteratorMode, Options};
use std::path::Path;

/// All sub-databases in a single RocksDB keyspace, separated by prefix byte.
pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    /// Open or create a store at the given path.
    pub fn open(path: &Path, config: &StoreConfig) -> Result<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);

        db_opts.set_write_buffer_size(config.write_buffer_size);
        db_opts.set_max_write_buffer_number(config.max_write_buffer_number);
        db_opts.set_target_file_size_base(config.target_file_size_base);
        db_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        if let Some(bits) = config.bloom_filter_bits {
            let mut block_opts = rocksdb::BlockBasedOptions::default();
            block_opts.set_bloom_filter(bits, false);
            db_opts.set_block_based_table_factory(&block_opts);
        }

        let db = DB::open(&db_opts, path)?;

        tracing::debug!("Opened RocksDB at {}", path.display());

        Ok(Self { db })
    }
}

impl KeyValueStore for RocksStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        Ok(self.db.put(key, value)?)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        Ok(self.db.delete(key)?)
    }

    fn iter_prefix(&self, prefix: &[u8]) -> Result<Vec<KeyValue>> {
        let mut entries = Vec::new();
        for item in self.db.iterator(IteratorMode::From(prefix, Direction::Forward)) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key.into_vec(), value.into_vec()));
        }
        Ok(entries)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        let mut rocks_batch = rocksdb::WriteBatch::default();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => rocks_batch.put(key, value),
                BatchOp::Delete { key } => rocks_batch.delete(key),
            }
        }

        // Atomic write
        self.db.write(rocks_batch)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rocks_prefix_scan() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(temp_dir.path(), &StoreConfig::default()).unwrap();

        let mut batch = WriteBatch::default();
        batch.put(vec![5, 1], vec![1]);
        batch.put(vec![5, 0, 7], vec![2]);
        batch.put(vec![6], vec![3]);
        store.write_batch(batch).unwrap();
        store.delete(&[5, 1]).unwrap();
        store.put(&[5, 2], &[4]).unwrap();

        let entries = store.iter_prefix(&[5]).unwrap();
        assert_eq!(entries, vec![(vec![5, 0, 7], vec![2]), (vec![5, 2], vec![4])]);
        assert_eq!(store.get(&[6]).unwrap(), Some(vec![3]));
        assert_eq!(store.get(&[5, 1]).unwrap(), None);
    }
}
