//! Container management module
//!
//! An in-process container engine: container records, their simulated
//! programs and the [`ContainerManager`] implementing [`crate::engine::Engine`].

pub mod config;
pub mod lifecycle;
pub mod program;
pub mod runtime;

pub use config::{ContainerConfig, ContainerStatus, HealthCheck, PortMapping, Protocol};
pub use lifecycle::ContainerManager;
pub use program::Program;
pub use runtime::{Container, LogEntry};
