//! Container engine capability
//!
//! Orchestration only ever talks to an [`Engine`]: create, start, stop and
//! inspect containers, stream their logs and watch engine events. The
//! in-process implementation lives in [`crate::container`].

use crate::container::{ContainerConfig, ContainerStatus};
use crate::error::ApiError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::time::Duration;

/// Label holding the project a container belongs to
pub const LABEL_PROJECT: &str = "com.docker.compose.project";
/// Label holding the service a container belongs to
pub const LABEL_SERVICE: &str = "com.docker.compose.service";
/// Label holding the replica number within the service
pub const LABEL_CONTAINER_NUMBER: &str = "com.docker.compose.container-number";

/// Log drivers whose output can be read back through the engine
const API_LOG_DRIVERS: &[&str] = &["json-file", "local", "journald"];

/// Raw log output, in arbitrary chunks
pub type LogStream = Box<dyn Iterator<Item = Result<Vec<u8>, ApiError>> + Send>;

/// Live engine events. Blocks until the next event arrives.
pub type EventStream = Box<dyn Iterator<Item = EngineEvent> + Send>;

/// Identity of a container as seen by orchestration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRef {
    pub id: String,
    pub name: String,
    pub project: String,
    pub service: String,
    pub number: u32,
    pub log_driver: Option<String>,
}

impl ContainerRef {
    pub fn from_config(config: &ContainerConfig) -> Self {
        let label = |key: &str| config.labels.get(key).cloned().unwrap_or_default();
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            project: label(LABEL_PROJECT),
            service: label(LABEL_SERVICE),
            number: label(LABEL_CONTAINER_NUMBER).parse().unwrap_or(1),
            log_driver: config.log_driver.clone(),
        }
    }

    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(12)]
    }

    /// `service-number`, the name used as log prefix
    pub fn name_without_project(&self) -> String {
        format!("{}-{}", self.service, self.number)
    }

    /// Whether logs can be streamed through the engine
    pub fn has_api_logs(&self) -> bool {
        match self.log_driver.as_deref() {
            None => true,
            Some(driver) => API_LOG_DRIVERS.contains(&driver),
        }
    }
}

impl PartialEq for ContainerRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ContainerRef {}

impl Hash for ContainerRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Health reported by a container's healthcheck
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Starting,
    Healthy,
    Unhealthy,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Health::Starting => write!(f, "starting"),
            Health::Healthy => write!(f, "healthy"),
            Health::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Runtime state returned by inspect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerState {
    pub status: ContainerStatus,
    pub exit_code: Option<i64>,
    /// `None` when no healthcheck is configured
    pub health: Option<Health>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        matches!(self.status, ContainerStatus::Running | ContainerStatus::Paused)
    }

    pub fn is_paused(&self) -> bool {
        self.status == ContainerStatus::Paused
    }

    /// Short human readable state for listings
    pub fn human_readable(&self) -> String {
        match (self.status, self.health, self.exit_code) {
            (ContainerStatus::Running, Some(health), _) => format!("Up ({})", health),
            (ContainerStatus::Running, None, _) => "Up".to_string(),
            (ContainerStatus::Paused, _, _) => "Paused".to_string(),
            (ContainerStatus::Created, _, _) => "Created".to_string(),
            (_, _, Some(code)) => format!("Exit {}", code),
            (status, _, None) => status.to_string(),
        }
    }
}

/// Where to start reading logs and whether to keep following
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogOptions {
    pub follow: bool,
    /// Only the last N lines; `None` for all
    pub tail: Option<usize>,
    pub since: Option<DateTime<Utc>>,
    pub timestamps: bool,
}

/// Selects containers by project and service
#[derive(Debug, Clone, Default)]
pub struct ContainerFilter {
    pub project: Option<String>,
    /// Empty matches every service
    pub services: Vec<String>,
    /// Include stopped containers
    pub all: bool,
}

impl ContainerFilter {
    pub fn project(project: &str) -> Self {
        Self {
            project: Some(project.to_string()),
            ..Self::default()
        }
    }

    pub fn services(mut self, services: &[String]) -> Self {
        self.services = services.to_vec();
        self
    }

    pub fn all(mut self, all: bool) -> Self {
        self.all = all;
        self
    }

    pub fn matches(&self, container: &ContainerRef, state: &ContainerState) -> bool {
        if let Some(project) = &self.project {
            if &container.project != project {
                return false;
            }
        }
        if !self.services.is_empty() && !self.services.contains(&container.service) {
            return false;
        }
        self.all || state.is_running()
    }
}

/// What happened to a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    Create,
    Start,
    Restart,
    Die,
    Stop,
    Kill,
    Pause,
    Unpause,
    Destroy,
    HealthStatus(Health),
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventAction::Create => write!(f, "create"),
            EventAction::Start => write!(f, "start"),
            EventAction::Restart => write!(f, "restart"),
            EventAction::Die => write!(f, "die"),
            EventAction::Stop => write!(f, "stop"),
            EventAction::Kill => write!(f, "kill"),
            EventAction::Pause => write!(f, "pause"),
            EventAction::Unpause => write!(f, "unpause"),
            EventAction::Destroy => write!(f, "destroy"),
            EventAction::HealthStatus(health) => write!(f, "health_status: {}", health),
        }
    }
}

/// Container event emitted by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub time: DateTime<Utc>,
    pub action: EventAction,
    pub id: String,
    pub container: ContainerRef,
    pub attributes: HashMap<String, String>,
}

/// Subscription filter for [`Engine::events`]
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub project: Option<String>,
}

impl EventFilter {
    pub fn project(project: &str) -> Self {
        Self {
            project: Some(project.to_string()),
        }
    }

    pub fn matches(&self, event: &EngineEvent) -> bool {
        self.project
            .as_ref()
            .map_or(true, |project| &event.container.project == project)
    }
}

/// The operations orchestration needs from a container engine.
///
/// Every method may block; callers run them on worker threads.
pub trait Engine: Send + Sync {
    fn create(&self, config: ContainerConfig) -> Result<ContainerRef, ApiError>;

    fn start(&self, id: &str) -> Result<(), ApiError>;

    fn stop(&self, id: &str, timeout: Duration) -> Result<(), ApiError>;

    /// Send a signal such as `SIGKILL` or `SIGTERM`
    fn kill(&self, id: &str, signal: &str) -> Result<(), ApiError>;

    fn restart(&self, id: &str, timeout: Duration) -> Result<(), ApiError>;

    fn pause(&self, id: &str) -> Result<(), ApiError>;

    fn unpause(&self, id: &str) -> Result<(), ApiError>;

    fn remove(&self, id: &str, force: bool) -> Result<(), ApiError>;

    fn inspect(&self, id: &str) -> Result<ContainerState, ApiError>;

    fn list(&self, filter: &ContainerFilter) -> Result<Vec<ContainerRef>, ApiError>;

    fn logs(&self, id: &str, options: &LogOptions) -> Result<LogStream, ApiError>;

    fn events(&self, filter: &EventFilter) -> Result<EventStream, ApiError>;

    /// Block until the container is no longer running and return its exit code
    fn wait(&self, id: &str) -> Result<i64, ApiError>;

    fn image_exists(&self, image: &str) -> Result<bool, ApiError>;

    fn pull(&self, image: &str) -> Result<(), ApiError>;

    fn build(&self, tag: &str, context: &Path) -> Result<(), ApiError>;
}

/// Signal number for a signal name (`SIGKILL`, `KILL` or `9`)
pub fn signal_number(signal: &str) -> Option<i64> {
    let name = signal.trim().to_ascii_uppercase();
    if let Ok(number) = name.parse::<i64>() {
        return Some(number);
    }
    let name = name.strip_prefix("SIG").unwrap_or(&name);
    let number = match name {
        "HUP" => 1,
        "INT" => 2,
        "QUIT" => 3,
        "KILL" => 9,
        "USR1" => 10,
        "USR2" => 12,
        "TERM" => 15,
        _ => return None,
    };
    Some(number)
}
