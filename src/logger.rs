//! CELLAR - Logger Injection
//! A four-severity logging capability handed to the engine at open time.

use std::fmt;
use std::sync::Arc;

/// Default `log` target for engine messages.
pub const DEFAULT_LOG_TARGET: &str = "cellar";

/// Logging capability injected into the storage layer.
pub trait StorageLogger: Send + Sync {
    fn error(&self, msg: &str);
    fn warn(&self, msg: &str);
    fn info(&self, msg: &str);
    fn debug(&self, msg: &str);
}

/// Forwards to the `log` facade under a fixed target.
///
/// Debug messages are dropped unless the adapter was built with `debug`.
#[derive(Debug, Clone)]
pub struct LogAdapter {
    target: String,
    debug: bool,
}

impl LogAdapter {
    pub fn new(debug: bool) -> Self {
        Self::with_target(DEFAULT_LOG_TARGET, debug)
    }

    /// Adapter logging under a caller-chosen target, e.g. one per store.
    pub fn with_target(target: impl Into<String>, debug: bool) -> Self {
        Self {
            target: target.into(),
            debug,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn debug_enabled(&self) -> bool {
        self.debug
    }
}

impl StorageLogger for LogAdapter {
    fn error(&self, msg: &str) {
        log::error!(target: self.target.as_str(), "{}", msg);
    }

    fn warn(&self, msg: &str) {
        log::warn!(target: self.target.as_str(), "{}", msg);
    }

    fn info(&self, msg: &str) {
        log::info!(target: self.target.as_str(), "{}", msg);
    }

    fn debug(&self, msg: &str) {
        if self.debug {
            log::debug!(target: self.target.as_str(), "{}", msg);
        }
    }
}

/// Shared handle to an injected logger.
#[derive(Clone)]
pub struct SharedLogger(pub Arc<dyn StorageLogger>);

impl SharedLogger {
    pub fn new(logger: impl StorageLogger + 'static) -> Self {
        Self(Arc::new(logger))
    }
}

impl Default for SharedLogger {
    fn default() -> Self {
        Self::new(LogAdapter::new(false))
    }
}

impl fmt::Debug for SharedLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedLogger")
    }
}

impl std::ops::Deref for SharedLogger {
    type Target = dyn StorageLogger;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}
