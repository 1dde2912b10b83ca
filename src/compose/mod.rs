//! Compose projects
//!
//! Loading compose files and running the commands that act on a project's
//! services and containers.

pub mod config;
pub mod parser;
pub mod project;
pub mod service;

pub use config::{ComposeConfig, DependencyCondition, PullPolicy, ServiceConfig};
pub use parser::ComposeParser;
pub use project::{project_dir, LogSettings, Project, UpOptions};
pub use service::{BuildAction, Service, DEFAULT_TIMEOUT};
