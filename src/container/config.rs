//! Records describing a container to the engine

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle state of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Exited,
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Exited => "exited",
        };
        f.write_str(status)
    }
}

/// Everything the engine needs to create a container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub id: String,
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: String,
    pub ports: Vec<PortMapping>,
    /// Project, service and replica number live here
    pub labels: BTreeMap<String, String>,
    /// `None` for the engine default
    pub log_driver: Option<String>,
    pub healthcheck: Option<HealthCheck>,
}

impl ContainerConfig {
    /// Configuration with a fresh ID and no command
    pub fn new(name: &str, image: &str) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            name: name.to_string(),
            image: image.to_string(),
            cmd: Vec::new(),
            entrypoint: Vec::new(),
            env: BTreeMap::new(),
            working_dir: "/".to_string(),
            ports: Vec::new(),
            labels: BTreeMap::new(),
            log_driver: None,
            healthcheck: None,
        }
    }

    pub fn cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = cmd;
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn log_driver(mut self, driver: &str) -> Self {
        self.log_driver = Some(driver.to_string());
        self
    }

    pub fn healthcheck(mut self, healthcheck: HealthCheck) -> Self {
        self.healthcheck = Some(healthcheck);
        self
    }

    /// Entrypoint followed by command
    pub fn full_command(&self) -> Vec<String> {
        self.entrypoint.iter().chain(&self.cmd).cloned().collect()
    }
}

/// A published port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Host address to bind; all interfaces when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: Protocol,
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}->{}/{}",
            self.host_ip.as_deref().unwrap_or("0.0.0.0"),
            self.host_port,
            self.container_port,
            self.protocol
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

/// Healthcheck command and schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Check command; exit code 0 means healthy
    pub test: Vec<String>,
    /// Delay before the first check
    #[serde(with = "millis")]
    pub interval: Duration,
}

impl HealthCheck {
    pub fn new(test: Vec<String>, interval: Duration) -> Self {
        Self { test, interval }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
