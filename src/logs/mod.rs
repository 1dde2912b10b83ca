//! Log multiplexing
//!
//! Follows the output of many containers at once and prints it as one
//! stream, each line prefixed with the name of the container it came from.

pub mod presenter;
pub mod printer;
pub mod split;

pub use presenter::{build_log_presenters, max_name_width, LogPresenter, PresenterCycle};
pub use printer::LogPrinter;
pub use split::{split_buffer, SplitBuffer};
