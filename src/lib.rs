//! CELLAR - Versioned Embedded Key-Value Storage
//!
//! A storage facade over a transactional embedded engine: versioned,
//! TTL-aware, prefix-scoped reads and writes with optimistic concurrency.
//!
//! ## Features
//! - **Storage facade**: get / set / compare-and-set / atomic update /
//!   remove / enumerate / list keys, each in its own transaction
//! - **Operation builders**: fluent requests, counters, serde objects
//! - **TTL**: absolute expiry stored, remaining seconds derived per read
//! - **LogEngine**: MVCC memtable over a segmented, CRC32-checked value log
//! - **Encryption at rest**: AES-256-GCM data keys with rotation
//! - **Backup/Restore**: incremental, version-preserving streams
//! - **Space reclamation**: discard-ratio driven segment rewrites
//!
//! ## Example
//! ```no_run
//! use cellar::{Storage, StorageConfig};
//!
//! let storage = Storage::new("example", &StorageConfig::new("./data")).unwrap();
//! storage.set_raw(b"", b"k", b"v1", 0).unwrap();
//! let entry = storage.get_raw(b"", b"k", true).unwrap().unwrap();
//! assert!(storage.compare_and_set_raw(b"", b"k", b"v2", 0, entry.version).unwrap());
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod logger;
pub mod ops;
pub mod storage;
pub mod types;

pub use config::{DbAction, EngineOptions, StorageConfig};
pub use engine::{Engine, LogEngine};
pub use error::{EngineError, Result, StorageError};
pub use lifecycle::{create_database, database_exists, open_database};
pub use logger::{LogAdapter, StorageLogger};
pub use storage::Storage;
pub use types::RawEntry;
