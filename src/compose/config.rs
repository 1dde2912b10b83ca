//! Compose file configuration types

use crate::container::{HealthCheck, PortMapping, Protocol};
use crate::error::{ConvoyError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

static DURATION_UNIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?)(us|ms|s|m|h)").expect("duration pattern is valid")
});

/// Interval between healthchecks when the file does not set one
pub const DEFAULT_HEALTHCHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Compose file configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeConfig {
    /// Compose file version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Project name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Services, by name
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Image name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Build configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildConfig>,
    /// Command to run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandConfig>,
    /// Entrypoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<CommandConfig>,
    /// Fixed container name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    /// Environment variables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentConfig>,
    /// Port mappings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<PortConfig>>,
    /// Service dependencies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<DependsOnConfig>,
    /// Deploy configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy: Option<DeployConfig>,
    /// Number of containers, takes precedence over `deploy.replicas`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
    /// Healthcheck configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthcheckConfig>,
    /// Labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<LabelsConfig>,
    /// Logging configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
    /// Working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Signal sent by `kill` when none is given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,
    /// Time to wait for a graceful stop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_grace_period: Option<String>,
    /// Pull policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_policy: Option<String>,
}

impl ServiceConfig {
    /// Overlay `other` on top of this service. Fields set in `other` win.
    pub fn merge(&mut self, other: ServiceConfig) {
        self.image = other.image.or(self.image.take());
        self.build = other.build.or(self.build.take());
        self.command = other.command.or(self.command.take());
        self.entrypoint = other.entrypoint.or(self.entrypoint.take());
        self.container_name = other.container_name.or(self.container_name.take());
        self.environment = match (self.environment.take(), other.environment) {
            (Some(base), Some(overlay)) => Some(EnvironmentConfig::Map(
                base.entries().into_iter().chain(overlay.entries()).collect(),
            )),
            (base, overlay) => overlay.or(base),
        };
        self.ports = other.ports.or(self.ports.take());
        self.depends_on = other.depends_on.or(self.depends_on.take());
        self.deploy = other.deploy.or(self.deploy.take());
        self.scale = other.scale.or(self.scale.take());
        self.healthcheck = other.healthcheck.or(self.healthcheck.take());
        self.labels = match (self.labels.take(), other.labels) {
            (Some(base), Some(overlay)) => {
                let mut labels = base.to_map();
                labels.extend(overlay.to_map());
                Some(LabelsConfig::Map(labels))
            }
            (base, overlay) => overlay.or(base),
        };
        self.logging = other.logging.or(self.logging.take());
        self.working_dir = other.working_dir.or(self.working_dir.take());
        self.stop_signal = other.stop_signal.or(self.stop_signal.take());
        self.stop_grace_period = other.stop_grace_period.or(self.stop_grace_period.take());
        self.pull_policy = other.pull_policy.or(self.pull_policy.take());
    }

    /// Dependencies with their start conditions, in file order for the list
    /// form and sorted by name for the map form
    pub fn dependencies(&self) -> Result<Vec<(String, DependencyCondition)>> {
        match &self.depends_on {
            None => Ok(Vec::new()),
            Some(DependsOnConfig::Array(names)) => Ok(names
                .iter()
                .map(|name| (name.clone(), DependencyCondition::ServiceStarted))
                .collect()),
            Some(DependsOnConfig::Map(map)) => map
                .iter()
                .map(|(name, condition)| {
                    let condition = match &condition.condition {
                        Some(condition) => condition.parse()?,
                        None => DependencyCondition::ServiceStarted,
                    };
                    Ok((name.clone(), condition))
                })
                .collect(),
        }
    }

    /// Names of the services this one depends on
    pub fn dependency_names(&self) -> Vec<String> {
        match &self.depends_on {
            None => Vec::new(),
            Some(DependsOnConfig::Array(names)) => names.clone(),
            Some(DependsOnConfig::Map(map)) => map.keys().cloned().collect(),
        }
    }

    /// Number of containers to run
    pub fn replicas(&self) -> u32 {
        self.scale
            .or_else(|| self.deploy.as_ref().and_then(|deploy| deploy.replicas))
            .unwrap_or(1)
    }

    pub fn command_args(&self) -> Vec<String> {
        self.command.as_ref().map(CommandConfig::args).unwrap_or_default()
    }

    pub fn entrypoint_args(&self) -> Vec<String> {
        self.entrypoint.as_ref().map(CommandConfig::args).unwrap_or_default()
    }

    /// Environment with unset map entries taken from the process environment
    pub fn environment_map(&self) -> BTreeMap<String, String> {
        self.environment
            .as_ref()
            .map(|env| {
                env.entries()
                    .into_iter()
                    .filter_map(|(key, value)| {
                        let value = value.or_else(|| std::env::var(&key).ok())?;
                        Some((key, value))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn label_map(&self) -> BTreeMap<String, String> {
        self.labels.as_ref().map(LabelsConfig::to_map).unwrap_or_default()
    }

    pub fn port_mappings(&self) -> Result<Vec<PortMapping>> {
        self.ports
            .iter()
            .flatten()
            .map(PortConfig::to_mapping)
            .collect()
    }

    /// Healthcheck to configure on the containers, if any
    pub fn healthcheck(&self) -> Result<Option<HealthCheck>> {
        let Some(config) = &self.healthcheck else {
            return Ok(None);
        };
        if config.disable == Some(true) {
            return Ok(None);
        }
        let test = match &config.test {
            None => return Ok(None),
            Some(HealthcheckTest::Command(command)) => {
                vec!["CMD-SHELL".to_string(), command.clone()]
            }
            Some(HealthcheckTest::Array(test)) => test.clone(),
        };
        if test.first().map(String::as_str) == Some("NONE") {
            return Ok(None);
        }
        let interval = match &config.interval {
            Some(interval) => parse_duration(interval)?,
            None => DEFAULT_HEALTHCHECK_INTERVAL,
        };
        Ok(Some(HealthCheck::new(test, interval)))
    }

    pub fn stop_timeout(&self) -> Result<Option<Duration>> {
        self.stop_grace_period
            .as_deref()
            .map(parse_duration)
            .transpose()
    }

    pub fn log_driver(&self) -> Option<&str> {
        self.logging.as_ref().and_then(|logging| logging.driver.as_deref())
    }

    pub fn pull_policy(&self) -> Result<Option<PullPolicy>> {
        self.pull_policy.as_deref().map(str::parse).transpose()
    }
}

/// Build configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BuildConfig {
    /// Simple context path
    Simple(String),
    /// Full build configuration
    Full(BuildConfigFull),
}

impl BuildConfig {
    pub fn context(&self) -> &str {
        match self {
            BuildConfig::Simple(context) => context,
            BuildConfig::Full(full) => full.context.as_deref().unwrap_or("."),
        }
    }
}

/// Full build configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildConfigFull {
    /// Build context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Dockerfile path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
    /// Build arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<BTreeMap<String, String>>,
}

/// Command configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    /// Shell command string
    Shell(String),
    /// Exec form array
    Exec(Vec<String>),
}

impl CommandConfig {
    /// Argument vector. The string form is split like a shell would,
    /// honouring single and double quotes.
    pub fn args(&self) -> Vec<String> {
        match self {
            CommandConfig::Shell(command) => split_command(command),
            CommandConfig::Exec(args) => args.clone(),
        }
    }
}

fn split_command(command: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for c in command.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        args.push(current);
    }
    args
}

/// Environment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentConfig {
    /// Array of KEY=value strings
    Array(Vec<String>),
    /// Map of key to value
    Map(BTreeMap<String, Option<String>>),
}

impl EnvironmentConfig {
    /// Key/value pairs; `None` for a key without a value
    pub fn entries(&self) -> Vec<(String, Option<String>)> {
        match self {
            EnvironmentConfig::Array(items) => items
                .iter()
                .map(|item| match item.split_once('=') {
                    Some((key, value)) => (key.to_string(), Some(value.to_string())),
                    None => (item.clone(), None),
                })
                .collect(),
            EnvironmentConfig::Map(map) => map
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        }
    }
}

/// Port configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortConfig {
    /// Short syntax: "8080:80"
    Short(String),
    /// Long syntax
    Long(PortConfigLong),
}

impl PortConfig {
    pub fn to_mapping(&self) -> Result<PortMapping> {
        match self {
            PortConfig::Short(spec) => parse_port(spec),
            PortConfig::Long(long) => {
                let host_port = match &long.published {
                    Some(published) => parse_port_number(published)?,
                    None => long.target,
                };
                let protocol = long.protocol.as_deref().unwrap_or("tcp");
                Ok(PortMapping {
                    host_ip: long.host_ip.clone(),
                    host_port,
                    container_port: long.target,
                    protocol: parse_protocol(protocol)?,
                })
            }
        }
    }
}

/// Long port configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfigLong {
    /// Target port in container
    pub target: u16,
    /// Published port on host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
    /// Protocol (tcp/udp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
}

/// Parse `[ip:][host:]container[/protocol]`
fn parse_port(spec: &str) -> Result<PortMapping> {
    let (ports, protocol) = match spec.split_once('/') {
        Some((ports, protocol)) => (ports, parse_protocol(protocol)?),
        None => (spec, Protocol::Tcp),
    };

    let parts: Vec<&str> = ports.rsplitn(3, ':').collect();
    let (ip, host, container) = match parts.as_slice() {
        [container] => (None, *container, *container),
        [container, host] => (None, *host, *container),
        [container, host, ip] => (Some(ip.to_string()), *host, *container),
        _ => return Err(ConvoyError::InvalidConfig(format!("Invalid port: {}", spec))),
    };

    Ok(PortMapping {
        host_ip: ip,
        host_port: parse_port_number(host)?,
        container_port: parse_port_number(container)?,
        protocol,
    })
}

fn parse_port_number(port: &str) -> Result<u16> {
    port.trim()
        .parse()
        .map_err(|_| ConvoyError::InvalidConfig(format!("Invalid port number: {}", port)))
}

fn parse_protocol(protocol: &str) -> Result<Protocol> {
    match protocol {
        "tcp" => Ok(Protocol::Tcp),
        "udp" => Ok(Protocol::Udp),
        other => Err(ConvoyError::InvalidConfig(format!(
            "Invalid protocol: {}",
            other
        ))),
    }
}

/// Depends on configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOnConfig {
    /// Array of service names
    Array(Vec<String>),
    /// Map of service to condition
    Map(BTreeMap<String, DependsOnCondition>),
}

/// Depends on condition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependsOnCondition {
    /// Condition to wait for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// What a dependency has to reach before dependents start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DependencyCondition {
    #[default]
    ServiceStarted,
    ServiceHealthy,
    ServiceCompletedSuccessfully,
}

impl FromStr for DependencyCondition {
    type Err = ConvoyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "service_started" => Ok(DependencyCondition::ServiceStarted),
            "service_healthy" => Ok(DependencyCondition::ServiceHealthy),
            "service_completed_successfully" => {
                Ok(DependencyCondition::ServiceCompletedSuccessfully)
            }
            other => Err(ConvoyError::InvalidConfig(format!(
                "Unknown depends_on condition: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for DependencyCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyCondition::ServiceStarted => write!(f, "service_started"),
            DependencyCondition::ServiceHealthy => write!(f, "service_healthy"),
            DependencyCondition::ServiceCompletedSuccessfully => {
                write!(f, "service_completed_successfully")
            }
        }
    }
}

/// Deploy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Number of replicas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
}

/// Healthcheck configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthcheckConfig {
    /// Test command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<HealthcheckTest>,
    /// Interval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    /// Disable healthcheck
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable: Option<bool>,
}

/// Healthcheck test
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HealthcheckTest {
    /// Command string
    Command(String),
    /// Command array
    Array(Vec<String>),
}

/// Labels configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LabelsConfig {
    /// Array of "key=value" strings
    Array(Vec<String>),
    /// Map of key to value
    Map(BTreeMap<String, String>),
}

impl LabelsConfig {
    pub fn to_map(&self) -> BTreeMap<String, String> {
        match self {
            LabelsConfig::Array(items) => items
                .iter()
                .map(|item| match item.split_once('=') {
                    Some((key, value)) => (key.to_string(), value.to_string()),
                    None => (item.clone(), String::new()),
                })
                .collect(),
            LabelsConfig::Map(map) => map.clone(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    /// Options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<BTreeMap<String, String>>,
}

/// When to pull a service image
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PullPolicy {
    /// Always pull before creating containers
    Always,
    /// Pull only when the image is not present
    Missing,
    /// Never pull; a missing image is an error
    Never,
}

impl FromStr for PullPolicy {
    type Err = ConvoyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "always" => Ok(PullPolicy::Always),
            "missing" | "if_not_present" => Ok(PullPolicy::Missing),
            "never" => Ok(PullPolicy::Never),
            other => Err(ConvoyError::InvalidConfig(format!(
                "Invalid pull policy: {}",
                other
            ))),
        }
    }
}

/// Parse a compose duration such as `1m30s`, `500ms` or `10`
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let invalid = || ConvoyError::InvalidConfig(format!("Invalid duration: {}", value));
    if let Ok(secs) = value.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).map_err(|_| invalid());
    }

    let unit = &*DURATION_UNIT;

    let mut total = 0.0;
    let mut consumed = 0;
    for caps in unit.captures_iter(value) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        if whole.start() != consumed {
            return Err(invalid());
        }
        consumed = whole.end();

        let amount: f64 = caps[1].parse().map_err(|_| invalid())?;
        total += match &caps[2] {
            "us" => amount / 1_000_000.0,
            "ms" => amount / 1_000.0,
            "s" => amount,
            "m" => amount * 60.0,
            _ => amount * 3600.0,
        };
    }

    if consumed == 0 || consumed != value.len() {
        return Err(invalid());
    }
    Duration::try_from_secs_f64(total).map_err(|_| invalid())
}
