//! Process-level state shared by parallel runs
//!
//! The global concurrency limit, the current progress writer, the ANSI
//! preference and the interrupt counter are shared by every operation in the
//! process. They live in an [`ExecContext`] that is handed to each entry
//! point; [`ExecContext::global`] provides a default instance.

use super::limit::GlobalLimit;
use crate::progress::{AnsiMode, ProgressWriter};
use crate::signals::Shutdown;
use crossterm::tty::IsTty;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, OnceLock};

static GLOBAL: OnceLock<Arc<ExecContext>> = OnceLock::new();

#[derive(Debug, Clone, Copy)]
struct AnsiPreference {
    mode: AnsiMode,
    opted_out: bool,
}

/// Shared execution context
pub struct ExecContext {
    limit: Arc<GlobalLimit>,
    ansi: RwLock<AnsiPreference>,
    writer: Mutex<Option<Arc<ProgressWriter>>>,
    shutdown: Shutdown,
}

impl ExecContext {
    pub fn new() -> Self {
        Self {
            limit: Arc::new(GlobalLimit::default()),
            ansi: RwLock::new(AnsiPreference {
                mode: AnsiMode::Auto,
                opted_out: false,
            }),
            writer: Mutex::new(None),
            shutdown: Shutdown::new(),
        }
    }

    /// Default context for callers that do not carry their own
    pub fn global() -> Arc<ExecContext> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(ExecContext::new())))
    }

    pub fn limit(&self) -> &Arc<GlobalLimit> {
        &self.limit
    }

    /// Set the process-wide ANSI preference. Only writers created afterwards
    /// pick it up, so this belongs at startup.
    pub fn set_ansi_mode(&self, mode: AnsiMode, opted_out: bool) {
        *self.ansi.write() = AnsiPreference { mode, opted_out };
    }

    pub fn ansi_mode(&self) -> AnsiMode {
        self.ansi.read().mode
    }

    /// Whether ANSI sequences should be written to stderr
    pub fn stderr_ansi(&self) -> bool {
        let pref = *self.ansi.read();
        pref.mode.enabled(std::io::stderr().is_tty(), pref.opted_out)
    }

    /// The current progress writer, created on first use
    pub fn writer(&self) -> Arc<ProgressWriter> {
        let mut writer = self.writer.lock();
        if let Some(existing) = writer.as_ref() {
            return Arc::clone(existing);
        }
        let created = Arc::new(ProgressWriter::stderr(self.stderr_ansi()));
        *writer = Some(Arc::clone(&created));
        created
    }

    /// Install a specific writer as the current one
    pub fn set_writer(&self, writer: ProgressWriter) -> Arc<ProgressWriter> {
        let writer = Arc::new(writer);
        *self.writer.lock() = Some(Arc::clone(&writer));
        writer
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }
}

impl Default for ExecContext {
    fn default() -> Self {
        Self::new()
    }
}
