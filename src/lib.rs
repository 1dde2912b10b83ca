//! Convoy - multi-container orchestration for compose projects
//!
//! Convoy reads compose files and drives the containers of every service
//! through a container engine. The core is a dependency-aware parallel
//! executor shared by all commands:
//!
//! - Bounded, dependency-ordered fan-out with per-object outcomes
//! - Live progress lines for every object of a run
//! - Multiplexed, prefixed log output that follows containers across restarts
//! - Compose file parsing, interpolation and validation
//! - An in-process container engine

pub mod compose;
pub mod container;
pub mod engine;
pub mod error;
pub mod logging;
pub mod logs;
pub mod parallel;
pub mod progress;
pub mod settings;
pub mod signals;

#[cfg(test)]
mod test_utils;

pub use error::{ConvoyError, Result};
