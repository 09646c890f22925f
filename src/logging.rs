//! Process-wide logging context.
//!
//! Replaces the singleton logger of the original implementation with an
//! explicit context constructed once at startup and threaded through the
//! [`crate::experiment::Experiment`]. Counts warnings/errors emitted during a
//! run so callers can decide whether a "succeeded with warnings" run is
//! acceptable without re-parsing log output.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Thin wrapper over the `log` facade that also keeps running counters.
///
/// Construct once per process (or per test); dropping it does not tear down
/// the global logger, since `log`'s logger is itself process-global, but it
/// gives call sites a concrete handle to pass around instead of reaching for
/// bare `log::warn!` everywhere.
pub struct LoggingContext {
    warnings: AtomicUsize,
    errors: AtomicUsize,
}

impl Default for LoggingContext {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingContext {
    pub fn new() -> Self {
        Self {
            warnings: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
        }
    }

    /// Initialise `env_logger` if no logger is installed yet. Safe to call
    /// multiple times; subsequent calls are no-ops.
    pub fn init_env_logger() {
        let _ = env_logger::try_init();
    }

    pub fn warn(&self, msg: &str) {
        self.warnings.fetch_add(1, Ordering::Relaxed);
        log::warn!("{msg}");
    }

    pub fn error(&self, msg: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        log::error!("{msg}");
    }

    pub fn info(&self, msg: &str) {
        log::info!("{msg}");
    }

    pub fn debug(&self, msg: &str) {
        log::debug!("{msg}");
    }

    pub fn warning_count(&self) -> usize {
        self.warnings.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> usize {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.warnings.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }
}
