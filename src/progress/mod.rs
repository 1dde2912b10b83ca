//! Progress display for parallel operations
//!
//! Every object of a parallel run gets one line. On an interactive terminal
//! the line is rewritten in place when its status changes; otherwise a new
//! line is appended for each change.

pub mod writer;

pub use writer::{ProgressStatus, ProgressWriter};

use serde::{Deserialize, Serialize};

/// When to emit ANSI control sequences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AnsiMode {
    Never,
    Always,
    #[default]
    Auto,
}

impl AnsiMode {
    /// Decide for a destination. `auto` needs a TTY and no opt-out.
    pub fn enabled(self, is_tty: bool, opted_out: bool) -> bool {
        match self {
            AnsiMode::Never => false,
            AnsiMode::Always => true,
            AnsiMode::Auto => is_tty && !opted_out,
        }
    }
}

impl std::str::FromStr for AnsiMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "never" => Ok(AnsiMode::Never),
            "always" => Ok(AnsiMode::Always),
            "auto" => Ok(AnsiMode::Auto),
            other => Err(format!("invalid ANSI mode '{}': expected never, always or auto", other)),
        }
    }
}

impl std::fmt::Display for AnsiMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnsiMode::Never => write!(f, "never"),
            AnsiMode::Always => write!(f, "always"),
            AnsiMode::Auto => write!(f, "auto"),
        }
    }
}
