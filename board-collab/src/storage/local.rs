//! RocksDB-backed local store.
//!
//! Column families:
//! - `snapshots`: board id → LZ4-compressed JSON [`BoardSnapshot`]
//! - `pending`: big-endian sequence → JSON [`PendingChange`], so key order is FIFO order
//! - `meta`: small keyed values (last successful sync)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::StoreError;
use crate::offline::PendingChange;
use crate::replica::BoardSnapshot;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_PENDING: &str = "pending";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_PENDING, CF_META];

const KEY_LAST_SYNC: &[u8] = b"last_sync";

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    pub bloom_filter_bits: i32,
    /// fsync every write. Pending changes must survive a crash, so on by default.
    pub sync_writes: bool,
    pub max_open_files: i32,
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("board_collab_data"),
            block_cache_size: 32 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

pub struct LocalStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Next pending-change sequence number.
    sequence: AtomicU64,
}

impl LocalStore {
    /// Open (or create) the store and recover the pending sequence.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        let sequence = Self::recover_sequence(&db);
        log::info!(
            "Opened local store at {} (next pending seq {sequence})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            sequence: AtomicU64::new(sequence),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SNAPSHOTS => {
                // Values are already LZ4 frames.
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_PENDING => {
                // Append at the tail, scan from the head.
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
            }
            CF_META => {
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> u64 {
        let Some(cf) = db.cf_handle(CF_PENDING) else {
            return 0;
        };
        let mut iter = db.iterator_cf(&cf, IteratorMode::End);
        match iter.next() {
            Some(Ok((key, _))) => decode_seq(&key).map_or(0, |seq| seq + 1),
            _ => 0,
        }
    }

    // ─── Board Snapshots ──────────────────────────────────────────────

    pub fn save_snapshot(&self, snapshot: &BoardSnapshot) -> Result<(), StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let json = serde_json::to_vec(snapshot).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&json);
        self.db.put_cf_opt(&cf, snapshot.board_id.as_bytes(), &compressed, &self.write_options())?;
        log::debug!(
            "Saved snapshot of board {} ({} → {} bytes)",
            snapshot.board_id,
            json.len(),
            compressed.len()
        );
        Ok(())
    }

    pub fn load_snapshot(&self, board_id: &str) -> Result<Option<BoardSnapshot>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let Some(compressed) = self.db.get_cf(&cf, board_id.as_bytes())? else {
            return Ok(None);
        };
        let json = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let snapshot = serde_json::from_slice(&json).map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(Some(snapshot))
    }

    pub fn delete_snapshot(&self, board_id: &str) -> Result<(), StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        self.db.delete_cf_opt(&cf, board_id.as_bytes(), &self.write_options())?;
        Ok(())
    }

    /// Board ids with a stored snapshot.
    pub fn snapshot_boards(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let mut boards = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            boards.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(boards)
    }

    // ─── Pending Changes ──────────────────────────────────────────────

    /// Persist a change at the tail of the queue. Returns its sequence.
    pub fn append_pending(&self, change: &PendingChange) -> Result<u64, StoreError> {
        let cf = self.cf(CF_PENDING)?;
        let value = serde_json::to_vec(change).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.db.put_cf_opt(&cf, seq.to_be_bytes(), &value, &self.write_options())?;
        Ok(seq)
    }

    pub fn remove_pending(&self, seq: u64) -> Result<(), StoreError> {
        self.remove_pending_batch(&[seq])
    }

    /// Remove several entries atomically.
    pub fn remove_pending_batch(&self, seqs: &[u64]) -> Result<(), StoreError> {
        if seqs.is_empty() {
            return Ok(());
        }
        let cf = self.cf(CF_PENDING)?;
        let mut batch = WriteBatch::default();
        for seq in seqs {
            batch.delete_cf(&cf, seq.to_be_bytes());
        }
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    /// All pending changes in FIFO order.
    pub fn load_pending(&self) -> Result<Vec<(u64, PendingChange)>, StoreError> {
        let cf = self.cf(CF_PENDING)?;
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item?;
            let Some(seq) = decode_seq(&key) else {
                log::warn!("Skipping pending entry with malformed key ({} bytes)", key.len());
                continue;
            };
            match serde_json::from_slice::<PendingChange>(&value) {
                Ok(change) => entries.push((seq, change)),
                Err(e) => log::error!("Skipping unreadable pending change {seq}: {e}"),
            }
        }
        Ok(entries)
    }

    pub fn pending_count(&self) -> Result<usize, StoreError> {
        let cf = self.cf(CF_PENDING)?;
        let mut count = 0;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn set_last_sync(&self, timestamp: u64) -> Result<(), StoreError> {
        let cf = self.cf(CF_META)?;
        self.db.put_cf_opt(&cf, KEY_LAST_SYNC, timestamp.to_be_bytes(), &self.write_options())?;
        Ok(())
    }

    pub fn last_sync(&self) -> Result<Option<u64>, StoreError> {
        let cf = self.cf(CF_META)?;
        Ok(self.db.get_cf(&cf, KEY_LAST_SYNC)?.as_deref().and_then(decode_seq))
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("path", &self.config.path)
            .field("sequence", &self.sequence.load(Ordering::Relaxed))
            .finish()
    }
}

fn decode_seq(bytes: &[u8]) -> Option<u64> {
    let buf: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(buf))
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
