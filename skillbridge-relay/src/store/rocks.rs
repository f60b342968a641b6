//! RocksDB-backed message log.
//!
//! Column families:
//! - `rooms`    — Room records keyed by session id (idempotent provisioning)
//! - `messages` — LZ4-compressed message records, keyed by `room_id:seq`
//! - `metadata` — Per-room counters, plus the global append sequence
//!
//! The message key embeds a monotonically increasing global sequence
//! number, so a forward prefix scan over one room's keys replays its
//! history in insertion order — the order that is authoritative for
//! `chat-history`.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use crate::protocol::{unix_millis, Message, MessageKind};

use super::{MessageStore, RoomRecord, StoreError};

/// Column family names.
const CF_ROOMS: &str = "rooms";
const CF_MESSAGES: &str = "messages";
const CF_METADATA: &str = "metadata";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_ROOMS, CF_MESSAGES, CF_METADATA];

/// Reserved metadata key holding the next append sequence number.
/// Eight bytes long, so it can never collide with a 16-byte room key.
const SEQUENCE_KEY: &[u8] = b"sequence";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false — RocksDB's WAL
    /// already covers crash atomicity)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("skillbridge_data"),
            block_cache_size: 64 * 1024 * 1024, // 64MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024, // 16MB
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// Per-room counters stored alongside the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RoomMeta {
    room_id: Uuid,
    message_count: u64,
    /// Sequence number of the latest append.
    last_seq: u64,
    created_at: u64,
    updated_at: u64,
}

impl RoomMeta {
    fn new(room_id: Uuid) -> Self {
        let now = unix_millis();
        Self {
            room_id,
            message_count: 0,
            last_seq: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed message store.
///
/// Append-only: messages are written once, never updated, never
/// deleted. Bloom filters and a block cache keep room history reads
/// fast; every append is an atomic write batch (message + room meta +
/// sequence counter).
pub struct RocksMessageStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    /// Store configuration
    config: StoreConfig,
    /// Global append sequence, recovered on open
    sequence: AtomicU64,
    /// Serializes room provisioning so two racing `ensure_room` calls
    /// cannot mint two rooms for one session
    provision_lock: Mutex<()>,
}

impl RocksMessageStore {
    /// Open the message store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024); // 128MB WAL limit
        db_opts.increase_parallelism(num_cpus());

        // Build column family descriptors with per-CF options
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let cf_opts = Self::cf_options(name, &config);
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let sequence = Self::recover_sequence(&db);

        Ok(Self {
            db,
            config,
            sequence: AtomicU64::new(sequence),
            provision_lock: Mutex::new(()),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        // Block-based table with bloom filter and cache
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024); // 16KB blocks
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_ROOMS => {
                // Small records, point-looked-up by session id
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_MESSAGES => {
                // Many small writes, prefix-scanned by room id
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_METADATA => {
                // Small values, frequent reads
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Recover the global append sequence from metadata.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> u64 {
        let cf = match db.cf_handle(CF_METADATA) {
            Some(cf) => cf,
            None => return 0,
        };

        match db.get_cf(&cf, SEQUENCE_KEY) {
            Ok(Some(bytes)) if bytes.len() >= 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes[..8]);
                u64::from_be_bytes(buf)
            }
            _ => 0,
        }
    }

    /// Load per-room counters.
    fn load_room_meta(&self, room_id: Uuid) -> Result<RoomMeta, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, room_id.as_bytes())? {
            Some(bytes) => RoomMeta::decode(&bytes),
            None => Err(StoreError::NotFound(room_id)),
        }
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// The next append sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    /// Build a message key: room_id (16 bytes) + sequence (8 bytes big-endian).
    fn message_key(room_id: Uuid, seq: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(room_id.as_bytes());
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }
}

impl MessageStore for RocksMessageStore {
    fn ensure_room(
        &self,
        session_id: Uuid,
        learner_id: Uuid,
        mentor_id: Uuid,
    ) -> Result<RoomRecord, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        let key = session_id.as_bytes().to_vec();

        let _guard = self
            .provision_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(bytes) = self.db.get_cf(&cf, &key)? {
            let (record, _) =
                bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                    .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            return Ok(record);
        }

        let record = RoomRecord {
            room_id: Uuid::new_v4(),
            session_id,
            learner_id,
            mentor_id,
            created_at: unix_millis(),
        };
        let encoded = bincode::serde::encode_to_vec(&record, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.put_cf_opt(&cf, &key, &encoded, &write_opts)?;

        Ok(record)
    }

    fn append(
        &self,
        room_id: Uuid,
        sender_id: Uuid,
        kind: MessageKind,
        content: &str,
    ) -> Result<Message, StoreError> {
        let cf_messages = self.cf(CF_MESSAGES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let message = Message {
            id: Uuid::new_v4(),
            room_id,
            sender_id,
            kind,
            content: content.to_owned(),
            created_at: unix_millis(),
        };

        let encoded = bincode::serde::encode_to_vec(&message, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let mut meta = self
            .load_room_meta(room_id)
            .unwrap_or_else(|_| RoomMeta::new(room_id));
        meta.message_count += 1;
        meta.last_seq = seq;
        meta.updated_at = message.created_at;

        // Atomic batch: message + room counters + global sequence
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_messages, Self::message_key(room_id, seq), &compressed);
        batch.put_cf(&cf_meta, room_id.as_bytes(), &meta.encode()?);
        batch.put_cf(&cf_meta, SEQUENCE_KEY, (seq + 1).to_be_bytes());

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(message)
    }

    fn history(&self, room_id: Uuid) -> Result<Vec<Message>, StoreError> {
        let cf = self.cf(CF_MESSAGES)?;

        let start_key = Self::message_key(room_id, 0);
        let mut messages = Vec::new();

        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );

        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;

            // Stop once we've passed this room's key prefix
            if key.len() < 24 || &key[..16] != room_id.as_bytes() {
                break;
            }

            let decompressed = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::CompressionError(e.to_string()))?;
            let (message, _) =
                bincode::serde::decode_from_slice(&decompressed, bincode::config::standard())
                    .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            messages.push(message);
        }

        Ok(messages)
    }

    fn message_count(&self, room_id: Uuid) -> Result<u64, StoreError> {
        match self.load_room_meta(room_id) {
            Ok(meta) => Ok(meta.message_count),
            Err(StoreError::NotFound(_)) => Ok(0),
            Err(e) => Err(e),
        }
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    /// Create a temp directory for test database.
    fn temp_db_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("skillbridge_test_rocks_{name}_{}", Uuid::new_v4()))
    }

    /// Clean up test database.
    fn cleanup(path: &Path) {
        let _ = fs::remove_dir_all(path);
    }

    #[test]
    fn test_store_open_close() {
        let path = temp_db_path("open_close");
        let config = StoreConfig::for_testing(&path);
        let store = RocksMessageStore::open(config).unwrap();
        assert!(store.path().exists());
        assert_eq!(store.sequence(), 0);
        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_append_history_roundtrip() {
        let path = temp_db_path("roundtrip");
        let config = StoreConfig::for_testing(&path);
        let store = RocksMessageStore::open(config).unwrap();

        let room = Uuid::new_v4();
        let sender = Uuid::new_v4();

        let stored = store.append(room, sender, MessageKind::Text, "hi").unwrap();
        assert_eq!(stored.room_id, room);
        assert!(stored.created_at > 0);

        let history = store.history(room).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0], stored);

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_history_insertion_order() {
        let path = temp_db_path("order");
        let config = StoreConfig::for_testing(&path);
        let store = RocksMessageStore::open(config).unwrap();

        let room = Uuid::new_v4();
        let sender = Uuid::new_v4();
        for text in ["one", "two", "three", "four"] {
            store.append(room, sender, MessageKind::Text, text).unwrap();
        }

        let history = store.history(room).unwrap();
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["one", "two", "three", "four"]);
        assert!(history.windows(2).all(|w| w[0].created_at <= w[1].created_at));

        // Stable under repeated queries
        assert_eq!(store.history(room).unwrap(), history);

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_rooms_do_not_interleave() {
        let path = temp_db_path("isolation");
        let config = StoreConfig::for_testing(&path);
        let store = RocksMessageStore::open(config).unwrap();

        let (r1, r2) = (Uuid::new_v4(), Uuid::new_v4());
        let sender = Uuid::new_v4();

        store.append(r1, sender, MessageKind::Text, "a1").unwrap();
        store.append(r2, sender, MessageKind::Text, "b1").unwrap();
        store.append(r1, sender, MessageKind::Text, "a2").unwrap();

        let h1 = store.history(r1).unwrap();
        let h2 = store.history(r2).unwrap();
        assert_eq!(h1.len(), 2);
        assert_eq!(h2.len(), 1);
        assert_eq!(h1[0].content, "a1");
        assert_eq!(h1[1].content, "a2");
        assert_eq!(store.message_count(r1).unwrap(), 2);
        assert_eq!(store.message_count(r2).unwrap(), 1);

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_unknown_room_history_is_empty() {
        let path = temp_db_path("unknown");
        let config = StoreConfig::for_testing(&path);
        let store = RocksMessageStore::open(config).unwrap();

        assert!(store.history(Uuid::new_v4()).unwrap().is_empty());
        assert_eq!(store.message_count(Uuid::new_v4()).unwrap(), 0);

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_sequence_recovered_across_reopen() {
        let path = temp_db_path("reopen");
        let room = Uuid::new_v4();
        let sender = Uuid::new_v4();

        {
            let store = RocksMessageStore::open(StoreConfig::for_testing(&path)).unwrap();
            store.append(room, sender, MessageKind::Text, "before").unwrap();
            store.append(room, sender, MessageKind::Text, "restart").unwrap();
            assert_eq!(store.sequence(), 2);
        }

        let store = RocksMessageStore::open(StoreConfig::for_testing(&path)).unwrap();
        assert_eq!(store.sequence(), 2);
        store.append(room, sender, MessageKind::Text, "after").unwrap();

        let history = store.history(room).unwrap();
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["before", "restart", "after"]);

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_ensure_room_idempotent_across_reopen() {
        let path = temp_db_path("ensure_room");
        let session = Uuid::new_v4();
        let (learner, mentor) = (Uuid::new_v4(), Uuid::new_v4());

        let first = {
            let store = RocksMessageStore::open(StoreConfig::for_testing(&path)).unwrap();
            let first = store.ensure_room(session, learner, mentor).unwrap();
            assert_eq!(store.ensure_room(session, learner, mentor).unwrap(), first);
            first
        };

        let store = RocksMessageStore::open(StoreConfig::for_testing(&path)).unwrap();
        let again = store.ensure_room(session, learner, mentor).unwrap();
        assert_eq!(again, first);

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_file_reference_roundtrip() {
        let path = temp_db_path("file_ref");
        let store = RocksMessageStore::open(StoreConfig::for_testing(&path)).unwrap();

        let room = Uuid::new_v4();
        let wire = "report.pdf::https://cdn.example/report.pdf";
        store
            .append(room, Uuid::new_v4(), MessageKind::File, wire)
            .unwrap();

        let history = store.history(room).unwrap();
        assert_eq!(history[0].content, wire);
        assert_eq!(history[0].kind, MessageKind::File);

        drop(store);
        cleanup(&path);
    }
}
