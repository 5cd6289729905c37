//! RocksDB-backed durable store.
//!
//! One database per store name under [`RocksConfig::root`]. Column families:
//! - `entries`: persisted key → blob (LZ4 compressed blocks)
//! - `meta`: [`StoreMeta`] under a single well-known key
//!
//! Commits are `WriteBatch`es, so each debounced flush is atomic.

use std::future::Future;
use std::path::{Path, PathBuf};

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, IteratorMode, Options,
    WriteBatch, WriteOptions, DB,
};
use tidepool_core::Blob;

use super::{validate_name, DurableBackend, DurableHandle, PendingWrite, PersistError, StoreMeta};

const CF_ENTRIES: &str = "entries";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_ENTRIES, CF_META];

const META_KEY: &[u8] = b"store";

/// Backend configuration.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    /// Directory holding one database per store name
    pub root: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every commit (default: false)
    pub sync_writes: bool,
    /// Max open files per database (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("tidepool_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl RocksConfig {
    /// Small caches under `root`, usually a temp directory.
    pub fn for_testing(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RocksBackend {
    config: RocksConfig,
}

impl RocksBackend {
    pub fn new(config: RocksConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RocksConfig {
        &self.config
    }

    /// Database directory for `name`.
    pub fn db_path(&self, name: &str) -> PathBuf {
        self.config.root.join(name)
    }

    fn cf_options(&self, name: &str) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(self.config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(self.config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(self.config.write_buffer_size);

        match name {
            CF_ENTRIES => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(3);
            }
            CF_META => {
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(self.config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }
}

impl DurableBackend for RocksBackend {
    type Handle = RocksHandle;

    fn open(&self, name: &str, schema_version: u32) -> Result<RocksHandle, PersistError> {
        validate_name(name)?;
        let path = self.db_path(name);

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(self.config.max_open_files);
        db_opts.set_keep_log_file_num(3);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|cf| ColumnFamilyDescriptor::new(*cf, self.cf_options(cf)))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, &path, cf_descriptors)?;
        let handle = RocksHandle {
            db,
            path,
            sync_writes: self.config.sync_writes,
        };

        let stored = handle.load_meta()?;
        if let Some(meta) = StoreMeta::reconcile(stored, schema_version)? {
            handle.save_meta(&meta)?;
        }

        log::info!("opened rocksdb store '{name}' at {}", handle.path.display());
        Ok(handle)
    }
}

/// An open RocksDB database.
pub struct RocksHandle {
    db: DB,
    path: PathBuf,
    sync_writes: bool,
}

impl RocksHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored metadata, `None` for a fresh database.
    pub fn load_meta(&self) -> Result<Option<StoreMeta>, PersistError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(cf, META_KEY)? {
            Some(bytes) => StoreMeta::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn save_meta(&self, meta: &StoreMeta) -> Result<(), PersistError> {
        let cf = self.cf(CF_META)?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db.put_cf_opt(cf, META_KEY, meta.encode()?, &write_opts)?;
        Ok(())
    }

    /// Point lookup of one persisted entry.
    pub fn get(&self, key: &str) -> Result<Option<Blob>, PersistError> {
        let cf = self.cf(CF_ENTRIES)?;
        Ok(self.db.get_cf(cf, key.as_bytes())?)
    }

    /// Apply `writes` in one `WriteBatch`.
    pub fn write_batch(&self, writes: &[(String, PendingWrite)]) -> Result<(), PersistError> {
        let cf = self.cf(CF_ENTRIES)?;
        let mut batch = WriteBatch::default();
        for (key, write) in writes {
            match write {
                PendingWrite::Put(blob) => batch.put_cf(cf, key.as_bytes(), blob),
                PendingWrite::Delete => batch.delete_cf(cf, key.as_bytes()),
            }
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, PersistError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PersistError::Database(format!("Column family '{name}' not found")))
    }
}

impl DurableHandle for RocksHandle {
    fn load_all(&self) -> Result<Vec<(String, Blob)>, PersistError> {
        let cf = self.cf(CF_ENTRIES)?;
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            let key = String::from_utf8(key.into_vec())
                .map_err(|e| PersistError::Corrupt(format!("non-utf8 key: {e}")))?;
            entries.push((key, value.into_vec()));
        }
        Ok(entries)
    }

    fn commit(
        &self,
        writes: &[(String, PendingWrite)],
    ) -> impl Future<Output = Result<(), PersistError>> {
        std::future::ready(self.write_batch(writes))
    }
}
