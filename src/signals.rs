//! Interrupt handling.
//!
//! The binary listens for OS signals on the async runtime and bumps a
//! [`Shutdown`] counter. Blocking loops in the executor and the log printer
//! hold a [`ShutdownWatch`] taken when they begin and abort with a shutdown
//! error as soon as a signal arrives after that point. Taking a new watch
//! after handling one interrupt lets a second interrupt abort the cleanup.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Process-wide interrupt counter
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    signals: Arc<AtomicUsize>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an interrupt
    pub fn trigger(&self) {
        let count = self.signals.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(count, "Shutdown requested");
    }

    /// Number of interrupts received so far
    pub fn count(&self) -> usize {
        self.signals.load(Ordering::SeqCst)
    }

    /// Watch for interrupts arriving from now on
    pub fn watch(&self) -> ShutdownWatch {
        ShutdownWatch {
            signals: Arc::clone(&self.signals),
            baseline: self.count(),
        }
    }
}

/// Snapshot of the interrupt counter taken when a blocking run begins
#[derive(Debug, Clone)]
pub struct ShutdownWatch {
    signals: Arc<AtomicUsize>,
    baseline: usize,
}

impl ShutdownWatch {
    pub fn requested(&self) -> bool {
        self.signals.load(Ordering::SeqCst) > self.baseline
    }
}

/// Completes when the process receives a termination signal.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_only_sees_later_signals() {
        let shutdown = Shutdown::new();
        shutdown.trigger();

        let watch = shutdown.watch();
        assert!(!watch.requested());

        shutdown.trigger();
        assert!(watch.requested());
        assert!(!shutdown.watch().requested());
        assert_eq!(shutdown.count(), 2);
    }
}
