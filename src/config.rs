//! CELLAR - Storage Configuration
//! `EngineOptions` holds every engine tunable; `StorageConfig` adds the
//! database lifecycle policy and the injected logger on top of it.
//!
//! Options are plain values built before open. Setters consume and return
//! `self`, so chains apply in order and a later setter wins when two of them
//! touch the same field.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::logger::{LogAdapter, SharedLogger, StorageLogger};

/// Required master encryption key length in bytes (AES-256).
pub const ENCRYPTION_KEY_SIZE: usize = 32;

/// Default data-key rotation period (7 days).
pub const DEFAULT_KEY_ROTATION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default cap on buffered records while restoring a backup.
pub const DEFAULT_MAX_PENDING_WRITES: usize = 4096;

/// Default number of records per value-log segment.
pub const DEFAULT_VALUE_LOG_MAX_ENTRIES: u32 = 1_000_000;

/// Default value-log segment size limit in bytes (1 GiB - 1).
pub const DEFAULT_VALUE_LOG_FILE_SIZE: u64 = (1 << 30) - 1;

/// Default permission bits for provisioned directories.
pub const DEFAULT_DIR_PERM: u32 = 0o700;

/// Sub-directory holding the key registry.
pub const KEY_DIR: &str = "key";

/// Sub-directory holding value-log segments.
pub const VALUE_DIR: &str = "value";

/// What to do when the data directory does or does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DbAction {
    /// Open creates the directory layout when it is missing.
    #[default]
    CreateIfNotExist,
    /// Open fails with `DatabaseNotExist` when the directory is missing.
    FailIfNotExist,
    /// Create wipes an existing directory first.
    DeleteIfExist,
}

/// Block compression requested from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Snappy,
    Zstd { level: i32 },
}

/// How table or value files are loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadingMode {
    FileIO,
    LoadToRam,
    #[default]
    MemoryMap,
}

/// When checksums are verified while reading persisted data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumVerificationMode {
    /// Never verify; corrupt frames are decoded as-is.
    NoVerification,
    /// Verify each frame as it is loaded.
    #[default]
    OnTableRead,
    OnBlockRead,
    OnTableAndBlockRead,
}

impl ChecksumVerificationMode {
    pub fn verifies(self) -> bool {
        self != ChecksumVerificationMode::NoVerification
    }
}

/// Tunable parameters for the storage engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Directory for key metadata (key registry).
    pub dir: PathBuf,
    /// Directory for value-log segments.
    pub value_dir: PathBuf,
    pub read_only: bool,
    /// Keep everything in memory; no files are touched.
    pub in_memory: bool,
    /// Versions of a key retained once no reader needs older ones.
    pub num_versions_to_keep: usize,
    /// fsync the value log on every commit.
    pub sync_writes: bool,
    pub table_loading_mode: LoadingMode,
    pub value_log_loading_mode: LoadingMode,
    pub encryption_key: Option<Vec<u8>>,
    pub encryption_key_rotation: Duration,
    /// Truncate a torn value-log tail instead of refusing to open.
    pub truncate: bool,
    pub compression: Compression,
    pub logger: SharedLogger,
    pub max_table_size: u64,
    pub level_size_multiplier: u32,
    pub max_levels: u32,
    pub value_threshold: usize,
    pub num_memtables: u32,
    pub block_size: usize,
    pub bloom_false_positive: f64,
    pub keep_l0_in_memory: bool,
    pub block_cache_size: u64,
    pub index_cache_size: u64,
    pub load_blooms_on_open: bool,
    pub num_level_zero_tables: u32,
    pub num_level_zero_tables_stall: u32,
    pub level_one_size: u64,
    pub value_log_file_size: u64,
    pub value_log_max_entries: u32,
    pub num_compactors: u32,
    /// Run one space-reclamation pass when the engine closes.
    pub compact_l0_on_close: bool,
    pub log_rotates_to_flush: u32,
    /// Verify value-log checksums on replay even when the checksum mode is off.
    pub verify_value_checksum: bool,
    pub bypass_lock_guard: bool,
    pub checksum_verification_mode: ChecksumVerificationMode,
    pub detect_conflicts: bool,
    /// Records buffered before a restore batch is applied.
    pub max_pending_writes: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data"),
            value_dir: PathBuf::from("./data"),
            read_only: false,
            in_memory: false,
            num_versions_to_keep: 1,
            sync_writes: true,
            table_loading_mode: LoadingMode::MemoryMap,
            value_log_loading_mode: LoadingMode::MemoryMap,
            encryption_key: None,
            encryption_key_rotation: DEFAULT_KEY_ROTATION,
            truncate: false,
            compression: Compression::None,
            logger: SharedLogger::default(),
            max_table_size: 64 << 20,
            level_size_multiplier: 10,
            max_levels: 7,
            value_threshold: 1 << 10,
            num_memtables: 5,
            block_size: 4 * 1024,
            bloom_false_positive: 0.01,
            keep_l0_in_memory: false,
            block_cache_size: 0,
            index_cache_size: 0,
            load_blooms_on_open: false,
            num_level_zero_tables: 5,
            num_level_zero_tables_stall: 15,
            level_one_size: 256 << 20,
            value_log_file_size: DEFAULT_VALUE_LOG_FILE_SIZE,
            value_log_max_entries: DEFAULT_VALUE_LOG_MAX_ENTRIES,
            num_compactors: 2,
            compact_l0_on_close: false,
            log_rotates_to_flush: 2,
            verify_value_checksum: false,
            bypass_lock_guard: false,
            checksum_verification_mode: ChecksumVerificationMode::OnTableRead,
            detect_conflicts: true,
            max_pending_writes: DEFAULT_MAX_PENDING_WRITES,
        }
    }
}

impl EngineOptions {
    /// Options with key and value data stored in the same directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self::default().with_data_dir(data_dir)
    }

    /// Options for a purely in-memory engine.
    pub fn in_memory() -> Self {
        Self::default().with_in_memory()
    }

    pub fn with_read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn with_in_memory(mut self) -> Self {
        self.in_memory = true;
        self
    }

    pub fn with_num_versions_to_keep(mut self, num: usize) -> Self {
        self.num_versions_to_keep = num;
        self
    }

    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        self.dir = data_dir.clone();
        self.value_dir = data_dir;
        self
    }

    /// Split layout: `<data_dir>/key` and `<data_dir>/value`.
    pub fn with_key_value_dir(mut self, data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        self.dir = data_dir.join(KEY_DIR);
        self.value_dir = data_dir.join(VALUE_DIR);
        self
    }

    pub fn with_key_memory_map(mut self) -> Self {
        self.table_loading_mode = LoadingMode::MemoryMap;
        self
    }

    pub fn with_key_file_io(mut self) -> Self {
        self.table_loading_mode = LoadingMode::FileIO;
        self
    }

    pub fn with_key_ram(mut self) -> Self {
        self.table_loading_mode = LoadingMode::LoadToRam;
        self
    }

    pub fn with_value_memory_map(mut self) -> Self {
        self.value_log_loading_mode = LoadingMode::MemoryMap;
        self
    }

    pub fn with_value_file_io(mut self) -> Self {
        self.value_log_loading_mode = LoadingMode::FileIO;
        self
    }

    pub fn with_value_ram(mut self) -> Self {
        self.value_log_loading_mode = LoadingMode::LoadToRam;
        self
    }

    /// Encrypt persisted data; also resets the rotation period to the default.
    pub fn with_encryption_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.encryption_key = Some(key.into());
        self.encryption_key_rotation = DEFAULT_KEY_ROTATION;
        self
    }

    pub fn with_encryption_key_rotation(mut self, period: Duration) -> Self {
        self.encryption_key_rotation = period;
        self
    }

    pub fn with_truncate(mut self) -> Self {
        self.truncate = true;
        self
    }

    /// `true` selects zstd at level 9, `false` disables compression.
    pub fn with_compression(mut self, zstd: bool) -> Self {
        self.compression = if zstd {
            Compression::Zstd { level: 9 }
        } else {
            Compression::None
        };
        self
    }

    pub fn with_snappy(mut self) -> Self {
        self.compression = Compression::Snappy;
        self
    }

    /// Route engine messages to the `log` facade.
    pub fn with_logger(mut self, debug: bool) -> Self {
        self.logger = SharedLogger::new(LogAdapter::new(debug));
        self
    }

    /// Route engine messages to the `log` facade under `target`.
    pub fn with_named_logger(mut self, target: impl Into<String>, debug: bool) -> Self {
        self.logger = SharedLogger::new(LogAdapter::with_target(target, debug));
        self
    }

    pub fn with_custom_logger(mut self, logger: Arc<dyn StorageLogger>) -> Self {
        self.logger = SharedLogger(logger);
        self
    }

    pub fn with_max_table_size(mut self, size: u64) -> Self {
        self.max_table_size = size;
        self
    }

    pub fn with_level_size_multiplier(mut self, value: u32) -> Self {
        self.level_size_multiplier = value;
        self
    }

    pub fn with_max_levels(mut self, value: u32) -> Self {
        self.max_levels = value;
        self
    }

    pub fn with_value_threshold(mut self, threshold: usize) -> Self {
        self.value_threshold = threshold;
        self
    }

    pub fn with_num_memtables(mut self, value: u32) -> Self {
        self.num_memtables = value;
        self
    }

    pub fn with_block_size(mut self, value: usize) -> Self {
        self.block_size = value;
        self
    }

    pub fn with_bloom_false_positive(mut self, value: f64) -> Self {
        self.bloom_false_positive = value;
        self
    }

    pub fn with_keep_l0_in_memory(mut self) -> Self {
        self.keep_l0_in_memory = true;
        self
    }

    pub fn with_block_cache_size(mut self, value: u64) -> Self {
        self.block_cache_size = value;
        self
    }

    pub fn with_index_cache_size(mut self, value: u64) -> Self {
        self.index_cache_size = value;
        self
    }

    pub fn with_load_blooms_on_open(mut self) -> Self {
        self.load_blooms_on_open = true;
        self
    }

    pub fn with_num_level_zero_tables(mut self, value: u32) -> Self {
        self.num_level_zero_tables = value;
        self
    }

    pub fn with_num_level_zero_tables_stall(mut self, value: u32) -> Self {
        self.num_level_zero_tables_stall = value;
        self
    }

    pub fn with_level_one_size(mut self, value: u64) -> Self {
        self.level_one_size = value;
        self
    }

    pub fn with_value_log_file_size(mut self, value: u64) -> Self {
        self.value_log_file_size = value;
        self
    }

    pub fn with_value_log_max_entries(mut self, value: u32) -> Self {
        self.value_log_max_entries = value;
        self
    }

    pub fn with_num_compactors(mut self, value: u32) -> Self {
        self.num_compactors = value;
        self
    }

    pub fn with_compact_l0_on_close(mut self) -> Self {
        self.compact_l0_on_close = true;
        self
    }

    pub fn with_log_rotates_to_flush(mut self, value: u32) -> Self {
        self.log_rotates_to_flush = value;
        self
    }

    pub fn with_verify_value_checksum(mut self) -> Self {
        self.verify_value_checksum = true;
        self
    }

    pub fn with_bypass_lock_guard(mut self) -> Self {
        self.bypass_lock_guard = true;
        self
    }

    pub fn with_checksum_verification_mode(mut self, mode: ChecksumVerificationMode) -> Self {
        self.checksum_verification_mode = mode;
        self
    }

    pub fn with_detect_conflicts(mut self, enabled: bool) -> Self {
        self.detect_conflicts = enabled;
        self
    }

    pub fn with_max_pending_writes(mut self, value: usize) -> Self {
        self.max_pending_writes = value;
        self
    }
}

/// Database-level configuration: where the data lives, what to do when it
/// does (not) exist, how to log, and the engine options to open with.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub action: DbAction,
    /// Permission bits for provisioned directories (unix only).
    pub dir_perm: u32,
    /// Replaces the engine logger with a debug-enabled `LogAdapter`.
    pub debug: bool,
    /// Overrides both `debug` and the engine options' logger when set.
    pub logger: Option<SharedLogger>,
    pub options: EngineOptions,
}

impl StorageConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            action: DbAction::default(),
            dir_perm: DEFAULT_DIR_PERM,
            debug: false,
            logger: None,
            options: EngineOptions::default(),
        }
    }

    pub fn with_action(mut self, action: DbAction) -> Self {
        self.action = action;
        self
    }

    pub fn with_dir_perm(mut self, perm: u32) -> Self {
        self.dir_perm = perm;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn StorageLogger>) -> Self {
        self.logger = Some(SharedLogger(logger));
        self
    }

    /// Apply engine option setters in order.
    pub fn with_options(mut self, apply: impl FnOnce(EngineOptions) -> EngineOptions) -> Self {
        self.options = apply(self.options);
        self
    }

    pub fn key_dir(&self) -> PathBuf {
        self.data_dir.join(KEY_DIR)
    }

    pub fn value_dir(&self) -> PathBuf {
        self.data_dir.join(VALUE_DIR)
    }

    /// The logger the engine will be opened with: the injected one, then
    /// the debug adapter when `debug` is set, then the engine options' own.
    pub fn logger(&self) -> SharedLogger {
        match &self.logger {
            Some(logger) => logger.clone(),
            None if self.debug => SharedLogger::new(LogAdapter::new(true)),
            None => self.options.logger.clone(),
        }
    }

    /// Engine options with the `<data>/key` + `<data>/value` layout and the
    /// configured logger applied on top of `options`.
    pub fn engine_options(&self) -> EngineOptions {
        let mut opts = self.options.clone().with_key_value_dir(&self.data_dir);
        opts.logger = self.logger();
        opts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = EngineOptions::default();
        assert_eq!(opts.num_versions_to_keep, 1);
        assert!(opts.detect_conflicts);
        assert_eq!(opts.max_pending_writes, 4096);
        assert_eq!(opts.encryption_key_rotation, DEFAULT_KEY_ROTATION);
        assert_eq!(opts.compression, Compression::None);
        assert_eq!(opts.checksum_verification_mode, ChecksumVerificationMode::OnTableRead);
    }

    #[test]
    fn test_later_setter_wins() {
        let opts = EngineOptions::default()
            .with_data_dir("/tmp/a")
            .with_key_value_dir("/tmp/b");
        assert_eq!(opts.dir, PathBuf::from("/tmp/b/key"));
        assert_eq!(opts.value_dir, PathBuf::from("/tmp/b/value"));

        let opts = EngineOptions::default()
            .with_compression(true)
            .with_snappy();
        assert_eq!(opts.compression, Compression::Snappy);

        let opts = EngineOptions::default()
            .with_snappy()
            .with_compression(true);
        assert_eq!(opts.compression, Compression::Zstd { level: 9 });
    }

    #[test]
    fn test_independent_options_commute() {
        let a = EngineOptions::default().with_read_only().with_num_versions_to_keep(3);
        let b = EngineOptions::default().with_num_versions_to_keep(3).with_read_only();
        assert_eq!(a.read_only, b.read_only);
        assert_eq!(a.num_versions_to_keep, b.num_versions_to_keep);
    }

    #[test]
    fn test_encryption_key_resets_rotation() {
        let opts = EngineOptions::default()
            .with_encryption_key_rotation(Duration::from_secs(60))
            .with_encryption_key(vec![7u8; ENCRYPTION_KEY_SIZE]);
        assert_eq!(opts.encryption_key_rotation, DEFAULT_KEY_ROTATION);
        assert_eq!(opts.encryption_key.as_deref().map(|k| k.len()), Some(32));
    }

    #[test]
    fn test_storage_config_layout() {
        let config = StorageConfig::new("/var/lib/cellar")
            .with_action(DbAction::FailIfNotExist)
            .with_options(|o| o.with_data_dir("/elsewhere").with_truncate());
        let opts = config.engine_options();
        assert_eq!(opts.dir, PathBuf::from("/var/lib/cellar/key"));
        assert_eq!(opts.value_dir, PathBuf::from("/var/lib/cellar/value"));
        assert!(opts.truncate);
        assert_eq!(config.action, DbAction::FailIfNotExist);
    }

    #[test]
    fn test_engine_logger_survives_storage_config() {
        use crate::logger::tests::CaptureLogger;

        let capture = Arc::new(CaptureLogger::default());
        let config = StorageConfig::new("/data").with_options(|o| o.with_custom_logger(capture.clone()));
        config.engine_options().logger.info("from engine");
        assert_eq!(capture.lines.lock().as_slice(), ["INFO from engine"]);

        // An injected storage logger takes precedence.
        let injected = Arc::new(CaptureLogger::default());
        let config = config.with_logger(injected.clone());
        config.engine_options().logger.info("from storage");
        assert_eq!(capture.lines.lock().len(), 1);
        assert_eq!(injected.lines.lock().as_slice(), ["INFO from storage"]);
    }
}
