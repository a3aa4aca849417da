//! RocksDB-backed room store.
//!
//! One column family, `rooms`, keyed by `room_type/room_id`. Values are
//! bincode-encoded records whose document blob is LZ4 compressed.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Options, SingleThreaded, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::{DocumentStore, PersistedState, StoreError};
use crate::key::{RoomId, RoomKey, RoomType};

const CF_ROOMS: &str = "rooms";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("meridian_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// On-disk record. The blob is stored compressed; everything else verbatim.
#[derive(Serialize, Deserialize)]
struct StoredRecord {
    room_type: String,
    room_id: String,
    version: u64,
    updated_at: u64,
    compressed_blob: Vec<u8>,
}

impl StoredRecord {
    fn encode(state: &PersistedState) -> Result<Vec<u8>, StoreError> {
        let record = StoredRecord {
            room_type: state.room_type.to_string(),
            room_id: state.room_id.to_string(),
            version: state.version,
            updated_at: state.updated_at,
            compressed_blob: lz4_flex::compress_prepend_size(&state.blob),
        };
        bincode::serde::encode_to_vec(&record, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<PersistedState, StoreError> {
        let (record, _): (StoredRecord, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        let blob = lz4_flex::decompress_size_prepended(&record.compressed_blob)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        Ok(PersistedState {
            room_type: RoomType::new(record.room_type)
                .map_err(|e| StoreError::Deserialization(e.to_string()))?,
            room_id: RoomId::new(record.room_id)
                .map_err(|e| StoreError::Deserialization(e.to_string()))?,
            blob,
            version: record.version,
            updated_at: record.updated_at,
        })
    }
}

pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let mut cf_opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        cf_opts.set_block_based_table_factory(&block_opts);
        // Blobs are already LZ4 compressed by us.
        cf_opts.set_compression_type(DBCompressionType::None);
        cf_opts.optimize_for_point_lookup(config.block_cache_size as u64);

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![ColumnFamilyDescriptor::new(CF_ROOMS, cf_opts)],
        )?;

        log::info!("Opened room store at {}", config.path.display());
        Ok(Self { db, config })
    }

    pub fn path(&self) -> &PathBuf {
        &self.config.path
    }

    /// Keys of every persisted room.
    pub fn list_rooms(&self) -> Result<Vec<RoomKey>, StoreError> {
        let cf = self.cf()?;
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (_, value) = item?;
            keys.push(StoredRecord::decode(&value)?.key());
        }
        Ok(keys)
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(CF_ROOMS)
            .ok_or_else(|| StoreError::Database(format!("missing column family {CF_ROOMS}")))
    }
}

impl DocumentStore for RocksStore {
    fn put(&self, key: &RoomKey, state: &PersistedState) -> Result<(), StoreError> {
        let cf = self.cf()?;
        let encoded = StoredRecord::encode(state)?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.put_cf_opt(cf, key.storage_key(), encoded, &write_opts)?;
        Ok(())
    }

    fn get(&self, key: &RoomKey) -> Result<Option<PersistedState>, StoreError> {
        let cf = self.cf()?;
        match self.db.get_cf(cf, key.storage_key())? {
            Some(bytes) => StoredRecord::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_get_missing_is_none() {
        let (_dir, store) = open_temp();
        let key = RoomKey::parse("flow", "missing").unwrap();
        assert!(store.get(&key).unwrap().is_none());
    }

    #[test]
    fn test_put_get_roundtrip_compressed() {
        let (_dir, store) = open_temp();
        let key = RoomKey::parse("flow", "r1").unwrap();
        let blob = b"layer layer layer layer layer layer".repeat(64);

        store.put(&key, &PersistedState::new(&key, blob.clone(), 3)).unwrap();

        let loaded = store.get(&key).unwrap().unwrap();
        assert_eq!(loaded.blob, blob);
        assert_eq!(loaded.version, 3);
        assert_eq!(loaded.key(), key);
    }

    #[test]
    fn test_rooms_are_isolated_by_type() {
        let (_dir, store) = open_temp();
        let flow = RoomKey::parse("flow", "same").unwrap();
        let page = RoomKey::parse("page", "same").unwrap();

        store.put(&flow, &PersistedState::new(&flow, vec![1], 1)).unwrap();
        store.put(&page, &PersistedState::new(&page, vec![2], 1)).unwrap();

        assert_eq!(store.get(&flow).unwrap().unwrap().blob, vec![1]);
        assert_eq!(store.get(&page).unwrap().unwrap().blob, vec![2]);

        let mut listed = store.list_rooms().unwrap();
        listed.sort();
        assert_eq!(listed, vec![flow, page]);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let key = RoomKey::parse("text", "notes").unwrap();
        {
            let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
            store.put(&key, &PersistedState::new(&key, vec![0, 1, 2], 7)).unwrap();
        }
        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
        let loaded = store.get(&key).unwrap().unwrap();
        assert_eq!(loaded.version, 7);
        assert_eq!(loaded.blob, vec![0, 1, 2]);
    }
}
