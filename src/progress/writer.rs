//! Per-object status lines

use crossterm::cursor::{MoveDown, MoveUp};
use crossterm::queue;
use crossterm::style::{Print, Stylize};
use crossterm::terminal::{Clear, ClearType};
use parking_lot::Mutex;
use std::fmt;
use std::io::{self, Write};

/// Status shown at the end of an object's line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStatus {
    Done,
    Error,
    /// The action succeeded but its result counts as a failure
    Failed,
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressStatus::Done => write!(f, "done"),
            ProgressStatus::Error => write!(f, "error"),
            ProgressStatus::Failed => write!(f, "failed"),
        }
    }
}

struct Lines {
    out: Box<dyn Write + Send>,
    lines: Vec<String>,
    width: usize,
}

/// Writes status messages for operations happening in parallel.
///
/// Each operation has its own line; with ANSI enabled the cursor jumps to
/// that line and overwrites it.
pub struct ProgressWriter {
    inner: Mutex<Lines>,
    ansi: bool,
}

impl ProgressWriter {
    pub fn new(out: Box<dyn Write + Send>, ansi: bool) -> Self {
        Self {
            inner: Mutex::new(Lines {
                out,
                lines: Vec::new(),
                width: 0,
            }),
            ansi,
        }
    }

    pub fn stderr(ansi: bool) -> Self {
        Self::new(Box::new(io::stderr()), ansi)
    }

    pub fn ansi(&self) -> bool {
        self.ansi
    }

    pub fn width(&self) -> usize {
        self.inner.lock().width
    }

    /// Register the lines of a run and print them without a status. Both
    /// happen under one lock so concurrent runs cannot interleave and the
    /// registration order stays the on-screen order.
    pub fn register<S: AsRef<str>>(&self, msg: &str, names: &[S]) {
        let keys: Vec<String> = names.iter().map(|name| line_key(msg, name.as_ref())).collect();
        let mut inner = self.inner.lock();
        for key in &keys {
            inner.width = inner.width.max(key.chars().count());
        }

        let width = inner.width;
        let mut result = Ok(());
        for key in keys {
            result = result.and_then(|_| write!(inner.out, "{:<width$} ... \r\n", key));
            inner.lines.push(key);
        }
        log_failure(result.and_then(|_| inner.out.flush()));
    }

    pub fn write(&self, msg: &str, name: &str, status: ProgressStatus) {
        let result = if self.ansi {
            self.write_ansi(msg, name, status)
        } else {
            self.write_plain(msg, name, status)
        };
        log_failure(result);
    }

    /// Free-form output that must not interleave with status updates
    pub fn write_raw(&self, text: &str) {
        let mut inner = self.inner.lock();
        let result = inner
            .out
            .write_all(text.as_bytes())
            .and_then(|_| inner.out.flush());
        log_failure(result);
    }

    fn write_ansi(&self, msg: &str, name: &str, status: ProgressStatus) -> io::Result<()> {
        let key = line_key(msg, name);
        let mut inner = self.inner.lock();

        // The latest registration of a key is the one still on screen
        let Some(position) = inner.lines.iter().rposition(|line| *line == key) else {
            drop(inner);
            return self.write_plain(msg, name, status);
        };
        let diff = (inner.lines.len() - position) as u16;
        let width = inner.width;
        let line = format!("{:<width$} ... {}\r", key, colored(status));

        queue!(
            inner.out,
            MoveUp(diff),
            Clear(ClearType::CurrentLine),
            Print("\r"),
            Print(line),
            MoveDown(diff)
        )?;
        inner.out.flush()
    }

    fn write_plain(&self, msg: &str, name: &str, status: ProgressStatus) -> io::Result<()> {
        let mut inner = self.inner.lock();
        let width = inner.width;
        write!(inner.out, "{:<width$} ... {}\r\n", line_key(msg, name), status)?;
        inner.out.flush()
    }
}

fn line_key(msg: &str, name: &str) -> String {
    format!("{} {}", msg, name)
}

fn colored(status: ProgressStatus) -> String {
    let text = status.to_string();
    match status {
        ProgressStatus::Done => text.dark_green().to_string(),
        ProgressStatus::Error | ProgressStatus::Failed => text.dark_red().to_string(),
    }
}

fn log_failure(result: io::Result<()>) {
    if let Err(e) = result {
        tracing::debug!("Failed to write progress output: {}", e);
    }
}
