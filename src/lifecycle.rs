//! CELLAR - Database Lifecycle
//! Provisioning and opening of a database directory according to the
//! configured `DbAction`. The layout is `<data>/key` for the key registry
//! and `<data>/value` for value-log segments.

use std::fs;
use std::path::Path;

use crate::config::{DbAction, StorageConfig, DEFAULT_DIR_PERM, ENCRYPTION_KEY_SIZE};
use crate::engine::{Engine, LogEngine};
use crate::error::{Result, StorageError};
use crate::logger::StorageLogger;

/// Returns true if `data_dir` exists.
pub fn database_exists(data_dir: &Path) -> bool {
    data_dir.exists()
}

/// Create an empty database at `config.data_dir`.
///
/// An existing directory is removed first under `DbAction::DeleteIfExist`,
/// otherwise this fails with `DatabaseExist`. The store is materialized by
/// an open/close round-trip.
pub fn create_database(config: &StorageConfig) -> Result<()> {
    let logger = config.logger();
    logger.info(&format!("create database in {}", config.data_dir.display()));

    if database_exists(&config.data_dir) {
        logger.info(&format!("data directory already exists: {}", config.data_dir.display()));
        if config.action != DbAction::DeleteIfExist {
            return Err(StorageError::DatabaseExist(config.data_dir.clone()));
        }
        if let Err(err) = fs::remove_dir_all(&config.data_dir) {
            logger.error(&format!(
                "failed to delete directory {}: {}",
                config.data_dir.display(),
                err
            ));
            return Err(err.into());
        }
    }

    create_all_directories(config, &*logger)?;
    let engine = open_database(config)?;
    engine
        .close()
        .map_err(|err| StorageError::engine_op("close", err))
}

/// Open the database at `config.data_dir`, provisioning it first when it
/// is missing and the action is `CreateIfNotExist`.
pub fn open_database(config: &StorageConfig) -> Result<LogEngine> {
    if let Some(key) = &config.options.encryption_key {
        if key.len() != ENCRYPTION_KEY_SIZE {
            return Err(StorageError::InvalidKeySize {
                expected: ENCRYPTION_KEY_SIZE,
                actual: key.len(),
            });
        }
    }

    let logger = config.logger();
    let options = config.engine_options();
    if options.in_memory {
        return LogEngine::open(options).map_err(|err| StorageError::engine_op("open", err));
    }

    if !database_exists(&config.data_dir) {
        if config.action != DbAction::CreateIfNotExist {
            return Err(StorageError::DatabaseNotExist(config.data_dir.clone()));
        }
        create_all_directories(config, &*logger)?;
    }

    LogEngine::open(options).map_err(|err| StorageError::engine_op("open", err))
}

/// Create the data, key and value directories.
pub fn create_all_directories(config: &StorageConfig, logger: &dyn StorageLogger) -> Result<()> {
    let key_dir = config.key_dir();
    let value_dir = config.value_dir();
    logger.info(&format!(
        "create directories: {}, {}, {}",
        config.data_dir.display(),
        key_dir.display(),
        value_dir.display()
    ));

    for dir in [config.data_dir.as_path(), key_dir.as_path(), value_dir.as_path()] {
        if let Err(err) = create_dir_if_needed(dir, config.dir_perm) {
            logger.error(&format!("failed to create directory {}: {}", dir.display(), err));
            return Err(err);
        }
    }
    Ok(())
}

/// Create a single directory with `perm` (0 selects the default) unless it
/// already exists.
pub fn create_dir_if_needed(dir: &Path, perm: u32) -> Result<()> {
    if dir.exists() {
        return Ok(());
    }
    let perm = if perm == 0 { DEFAULT_DIR_PERM } else { perm };

    #[cfg(unix)]
    {
        use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
        fs::DirBuilder::new().mode(perm).create(dir)?;
        fs::set_permissions(dir, fs::Permissions::from_mode(perm))?;
    }
    #[cfg(not(unix))]
    {
        let _ = perm;
        fs::create_dir(dir)?;
    }
    Ok(())
}
