//! Cooperative progress reporting and cancellation.
//!
//! Replaces the callback-style progress handler of the original
//! implementation with a trait polled at frame boundaries (integration) and
//! at each Levenberg-Marquardt iteration (refinement). Stages unwind
//! cooperatively on [`Cancel::Abort`]: in-flight regions are reset and
//! partial per-peak writes that already committed are kept, matching
//! `spec.md` §5.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancel {
    Continue,
    Abort,
}

pub trait ProgressSink: Send + Sync {
    /// Human-readable description of the current stage.
    fn set_status(&self, _status: &str) {}

    /// Fraction complete, in `[0.0, 1.0]`.
    fn set_progress(&self, _fraction: f64) {}

    /// Polled at frame boundaries and LM iterations. Returning
    /// [`Cancel::Abort`] requests cooperative unwind of the current stage.
    fn poll(&self) -> Cancel {
        Cancel::Continue
    }
}

/// Default sink: never cancels, discards all status updates.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {}

/// A progress sink backed by a crossbeam channel, for callers that want to
/// observe progress from another thread (e.g. a GUI, out of scope here) or
/// request cancellation externally.
pub struct ChannelProgress {
    status_tx: crossbeam::channel::Sender<String>,
    cancel: std::sync::Arc<std::sync::atomic::AtomicBool>,
    fraction: std::sync::Arc<std::sync::atomic::AtomicU64>,
}

impl ChannelProgress {
    pub fn new() -> (Self, crossbeam::channel::Receiver<String>) {
        let (status_tx, status_rx) = crossbeam::channel::unbounded();
        (
            Self {
                status_tx,
                cancel: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
                fraction: std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0)),
            },
            status_rx,
        )
    }

    /// Request the running stage abort at its next poll point.
    pub fn request_cancel(&self) {
        self.cancel.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn progress(&self) -> f64 {
        f64::from_bits(self.fraction.load(std::sync::atomic::Ordering::Relaxed))
    }
}

impl ProgressSink for ChannelProgress {
    fn set_status(&self, status: &str) {
        let _ = self.status_tx.try_send(status.to_string());
    }

    fn set_progress(&self, fraction: f64) {
        self.fraction
            .store(fraction.to_bits(), std::sync::atomic::Ordering::Relaxed);
    }

    fn poll(&self) -> Cancel {
        if self.cancel.load(std::sync::atomic::Ordering::Relaxed) {
            Cancel::Abort
        } else {
            Cancel::Continue
        }
    }
}
