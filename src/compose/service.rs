//! A service of a compose project and the containers it runs

use super::config::{DependencyCondition, PullPolicy, ServiceConfig};
use crate::container::ContainerConfig;
use crate::engine::{
    ContainerFilter, ContainerRef, Engine, Health, LABEL_CONTAINER_NUMBER, LABEL_PROJECT,
    LABEL_SERVICE,
};
use crate::error::{ApiError, ExecError};
use crate::parallel::{parallel_execute, ExecContext};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default time to wait for containers to stop
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Whether images are built before containers are created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildAction {
    /// Build only when the image is missing
    #[default]
    None,
    /// Always build services that can be built
    Force,
    /// Never build; a missing image of a buildable service is an error
    Skip,
}

/// One service of a project.
///
/// Equality and hashing only look at the name, so services can be scheduled
/// by the parallel executor.
#[derive(Clone)]
pub struct Service {
    name: String,
    project: String,
    config: Arc<ServiceConfig>,
    dependencies: Vec<(String, DependencyCondition)>,
    engine: Arc<dyn Engine>,
    working_dir: PathBuf,
}

impl Service {
    pub fn new(
        name: &str,
        project: &str,
        config: ServiceConfig,
        engine: Arc<dyn Engine>,
        working_dir: PathBuf,
    ) -> crate::error::Result<Self> {
        let dependencies = config.dependencies()?;
        Ok(Self {
            name: name.to_string(),
            project: project.to_string(),
            config: Arc::new(config),
            dependencies,
            engine,
            working_dir,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Services this one depends on, with the condition each must reach
    pub fn dependencies(&self) -> &[(String, DependencyCondition)] {
        &self.dependencies
    }

    pub fn dependency_names(&self) -> impl Iterator<Item = &str> {
        self.dependencies.iter().map(|(name, _)| name.as_str())
    }

    pub fn replicas(&self) -> usize {
        self.config.replicas() as usize
    }

    /// Image the containers run; built services default to `project-service`
    pub fn image_name(&self) -> String {
        self.config
            .image
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.project, self.name))
    }

    pub fn can_be_built(&self) -> bool {
        self.config.build.is_some()
    }

    pub fn container_name(&self, number: u32) -> String {
        match &self.config.container_name {
            Some(name) => name.clone(),
            None => format!("{}-{}-{}", self.project, self.name, number),
        }
    }

    pub fn stop_timeout(&self, timeout: Option<Duration>) -> Duration {
        timeout
            .or_else(|| self.config.stop_timeout().ok().flatten())
            .unwrap_or(DEFAULT_TIMEOUT)
    }

    /// Engine configuration for replica `number`
    pub fn container_config(&self, number: u32) -> Result<ContainerConfig, ExecError> {
        let invalid = |e: crate::error::ConvoyError| ExecError::OperationFailed(e.to_string());

        let mut config = ContainerConfig::new(&self.container_name(number), &self.image_name())
            .cmd(self.config.command_args());
        config.entrypoint = self.config.entrypoint_args();
        config.env.extend(self.config.environment_map());
        config.labels.extend(self.config.label_map());
        config.ports = self.config.port_mappings().map_err(invalid)?;
        config.healthcheck = self.config.healthcheck().map_err(invalid)?;
        if let Some(dir) = &self.config.working_dir {
            config.working_dir = dir.clone();
        }
        if let Some(driver) = self.config.log_driver() {
            config = config.log_driver(driver);
        }

        Ok(config
            .label(LABEL_PROJECT, &self.project)
            .label(LABEL_SERVICE, &self.name)
            .label(LABEL_CONTAINER_NUMBER, &number.to_string()))
    }

    /// Containers of this service, running only unless `all`
    pub fn containers(&self, all: bool) -> Result<Vec<ContainerRef>, ApiError> {
        let filter = ContainerFilter::project(&self.project)
            .services(std::slice::from_ref(&self.name))
            .all(all);
        self.engine.list(&filter)
    }

    /// Make sure the image exists, building or pulling it as needed
    pub fn ensure_image(
        &self,
        build: BuildAction,
        pull: Option<PullPolicy>,
    ) -> Result<(), ExecError> {
        let policy = match pull {
            Some(policy) => policy,
            None => self
                .config
                .pull_policy()
                .map_err(|e| ExecError::OperationFailed(e.to_string()))?
                .unwrap_or(PullPolicy::Missing),
        };
        let image = self.image_name();

        if self.can_be_built() && build == BuildAction::Force {
            return self.build();
        }

        if !self.can_be_built() && policy == PullPolicy::Always {
            self.engine.pull(&image)?;
            return Ok(());
        }

        if self.engine.image_exists(&image)? {
            return Ok(());
        }

        if !self.can_be_built() {
            if policy == PullPolicy::Never {
                return Err(ApiError::ImageNotFound(image).into());
            }
            self.engine.pull(&image)?;
            return Ok(());
        }

        if build == BuildAction::Skip {
            return Err(ExecError::OperationFailed(format!(
                "Service {} needs to be built, but --no-build was passed.",
                self.name
            )));
        }

        self.build()?;
        tracing::warn!(
            "Image for service {} was built because it did not already exist. To rebuild this image you must use `convoy build` or `convoy up --build`.",
            self.name
        );
        Ok(())
    }

    /// Build the service image from its context
    pub fn build(&self) -> Result<(), ExecError> {
        let Some(build) = &self.config.build else {
            return Err(ExecError::OperationFailed(format!(
                "Service {} has no build configuration",
                self.name
            )));
        };
        let context = self.working_dir.join(build.context());
        tracing::info!("Building {}", self.name);
        self.engine.build(&self.image_name(), &context)?;
        Ok(())
    }

    /// Bring the service to its replica count: remove extra containers,
    /// start stopped ones and create the missing ones.
    pub fn converge(
        &self,
        ctx: &ExecContext,
        start: bool,
        timeout: Option<Duration>,
    ) -> Result<Vec<ContainerRef>, ExecError> {
        let mut containers = self.containers(true)?;
        let replicas = self.replicas();

        if containers.len() > replicas {
            let extra = containers.split_off(replicas);
            self.downscale(ctx, extra, timeout)?;
        }

        if start && !containers.is_empty() {
            let engine = Arc::clone(&self.engine);
            let (_, errors) = parallel_execute(
                ctx,
                containers.clone(),
                move |container: &ContainerRef| {
                    if !engine.inspect(&container.id)?.is_running() {
                        engine.start(&container.id)?;
                    }
                    Ok(())
                },
                |container: &ContainerRef| container.name.clone(),
                "Starting",
            )?;
            fail_on_errors(errors)?;
        }

        let missing = replicas - containers.len();
        if missing > 0 {
            let next = containers.iter().map(|c| c.number).max().unwrap_or(0) + 1;
            let numbers: Vec<u32> = (next..).take(missing).collect();
            let creator = self.clone();
            let namer = self.clone();
            let (created, errors) = parallel_execute(
                ctx,
                numbers,
                move |number: &u32| creator.create_container(*number, start),
                move |number: &u32| namer.container_name(*number),
                "Creating",
            )?;
            fail_on_errors(errors)?;
            containers.extend(created);
        }

        containers.sort_by_key(|c| c.number);
        Ok(containers)
    }

    fn create_container(&self, number: u32, start: bool) -> Result<ContainerRef, ExecError> {
        let container = self.engine.create(self.container_config(number)?)?;
        if start {
            self.engine.start(&container.id)?;
        }
        Ok(container)
    }

    fn downscale(
        &self,
        ctx: &ExecContext,
        containers: Vec<ContainerRef>,
        timeout: Option<Duration>,
    ) -> Result<(), ExecError> {
        let engine = Arc::clone(&self.engine);
        let timeout = self.stop_timeout(timeout);
        let (_, errors) = parallel_execute(
            ctx,
            containers,
            move |container: &ContainerRef| {
                engine.stop(&container.id, timeout)?;
                engine.remove(&container.id, false)?;
                Ok(())
            },
            |container: &ContainerRef| container.name.clone(),
            "Stopping and removing",
        )?;
        fail_on_errors(errors)
    }

    /// Start the existing containers of this service
    pub fn start(&self) -> Result<Vec<ContainerRef>, ExecError> {
        let containers = self.containers(true)?;
        for container in &containers {
            if !self.engine.inspect(&container.id)?.is_running() {
                tracing::info!("Starting {}", container);
                self.engine.start(&container.id)?;
            }
        }
        Ok(containers)
    }

    /// Whether every running container reports healthy. Pending checks
    /// count as not yet healthy.
    pub fn is_healthy(&self) -> Result<bool, ExecError> {
        let mut result = true;
        for container in self.containers(false)? {
            match self.engine.inspect(&container.id)?.health {
                None => return Err(ExecError::NoHealthCheckConfigured(self.name.clone())),
                Some(Health::Starting) => result = false,
                Some(Health::Unhealthy) => {
                    return Err(ExecError::HealthCheckFailed(container.short_id().to_string()))
                }
                Some(Health::Healthy) => {}
            }
        }
        Ok(result)
    }

    /// Whether every container has exited, failing on a non-zero exit
    pub fn is_completed_successfully(&self) -> Result<bool, ExecError> {
        let mut result = true;
        for container in self.containers(true)? {
            let state = self.engine.inspect(&container.id)?;
            if state.is_running() || state.exit_code.is_none() {
                result = false;
                continue;
            }
            let exit_code = state.exit_code.unwrap_or(0);
            if exit_code != 0 {
                return Err(ExecError::CompletedUnsuccessfully {
                    container: container.name.clone(),
                    exit_code,
                });
            }
        }
        Ok(result)
    }

    /// Readiness predicate for a dependency condition
    pub fn is_ready(&self, condition: DependencyCondition) -> Result<bool, ExecError> {
        match condition {
            DependencyCondition::ServiceStarted => Ok(true),
            DependencyCondition::ServiceHealthy => self.is_healthy(),
            DependencyCondition::ServiceCompletedSuccessfully => self.is_completed_successfully(),
        }
    }
}

/// Nested runs report their own errors; the first one fails the caller
fn fail_on_errors(errors: BTreeMap<String, String>) -> Result<(), ExecError> {
    match errors.into_values().next() {
        Some(error) => Err(ExecError::OperationFailed(error)),
        None => Ok(()),
    }
}

impl PartialEq for Service {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Service {}

impl Hash for Service {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("project", &self.project)
            .finish()
    }
}
