//! Compose project orchestration
//!
//! A [`Project`] is the set of services of one compose file bound to an
//! engine. Every command fans out over services or containers through the
//! parallel executor: service-level runs follow `depends_on`, stop runs
//! follow it backwards, and the rest run without ordering.

use super::config::{ComposeConfig, DependencyCondition, PullPolicy};
use super::service::{BuildAction, Service};
use crate::engine::{
    signal_number, ContainerFilter, ContainerRef, Engine, EventFilter, EventStream, LogOptions,
};
use crate::error::{ConvoyError, ExecError, Result};
use crate::logs::{build_log_presenters, LogPrinter};
use crate::parallel::{graph, parallel_execute, Dependency, ExecContext, ParallelExecution};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Options of [`Project::up`]
#[derive(Debug, Clone)]
pub struct UpOptions {
    /// Services to bring up; empty for all
    pub services: Vec<String>,
    /// Also bring up the dependencies of the named services
    pub include_deps: bool,
    pub build: BuildAction,
    /// Overrides the per-service pull policy
    pub pull: Option<PullPolicy>,
    /// Start the containers, or only create them
    pub start: bool,
    pub timeout: Option<Duration>,
}

impl Default for UpOptions {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            include_deps: true,
            build: BuildAction::None,
            pull: None,
            start: true,
            timeout: None,
        }
    }
}

/// How the log multiplexer presents lines
#[derive(Debug, Clone, Default)]
pub struct LogSettings {
    pub monochrome: bool,
    pub no_prefix: bool,
    pub options: LogOptions,
}

/// Compose project
pub struct Project {
    name: String,
    /// Services in dependency order
    services: Vec<Service>,
    engine: Arc<dyn Engine>,
    ctx: Arc<ExecContext>,
}

impl Project {
    pub fn from_config(
        name: &str,
        config: &ComposeConfig,
        engine: Arc<dyn Engine>,
        ctx: Arc<ExecContext>,
        working_dir: &Path,
    ) -> Result<Self> {
        let names: Vec<String> = config.services.keys().cloned().collect();
        let order = graph::topological_order(&names, |name| {
            config
                .services
                .get(name)
                .map(|service| service.dependency_names())
                .unwrap_or_default()
        })
        .map_err(|cycle| {
            ConvoyError::Compose(format!(
                "Circular dependency between services: {}",
                cycle.join(" -> ")
            ))
        })?;

        let mut services = Vec::with_capacity(order.len());
        for service_name in order {
            let Some(service_config) = config.services.get(&service_name) else {
                continue;
            };
            services.push(Service::new(
                &service_name,
                name,
                service_config.clone(),
                Arc::clone(&engine),
                working_dir.to_path_buf(),
            )?);
        }

        Ok(Self {
            name: name.to_string(),
            services,
            engine,
            ctx,
        })
    }

    /// Project name normalized to lowercase letters, digits, `-` and `_`
    pub fn normalize_name(name: &str) -> String {
        name.to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect()
    }

    /// Project name from an explicit value, the compose file, or the
    /// directory holding it
    pub fn resolve_name(
        explicit: Option<&str>,
        config: &ComposeConfig,
        working_dir: &Path,
    ) -> Result<String> {
        let candidate = explicit
            .map(str::to_string)
            .or_else(|| config.name.clone())
            .or_else(|| {
                working_dir
                    .file_name()
                    .map(|dir| dir.to_string_lossy().into_owned())
            })
            .unwrap_or_default();

        let name = Self::normalize_name(&candidate);
        if name.is_empty() {
            return Err(ConvoyError::InvalidConfig(format!(
                "Invalid project name \"{}\": use a project name with at least one letter or digit",
                candidate
            )));
        }
        Ok(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn context(&self) -> &Arc<ExecContext> {
        &self.ctx
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn service(&self, name: &str) -> Result<&Service> {
        self.services
            .iter()
            .find(|s| s.name() == name)
            .ok_or_else(|| ConvoyError::ServiceNotFound(name.to_string()))
    }

    /// Services by name in dependency order; all services when `names` is
    /// empty. With `include_deps` the dependencies of the named services are
    /// added as well.
    pub fn services(&self, names: &[String], include_deps: bool) -> Result<Vec<Service>> {
        if names.is_empty() {
            return Ok(self.services.clone());
        }

        let mut wanted: HashSet<String> = HashSet::new();
        let mut pending: Vec<String> = Vec::new();
        for name in names {
            self.service(name)?;
            pending.push(name.clone());
        }
        while let Some(name) = pending.pop() {
            if !wanted.insert(name.clone()) {
                continue;
            }
            if include_deps {
                let service = self.service(&name)?;
                pending.extend(service.dependency_names().map(str::to_string));
            }
        }

        Ok(self
            .services
            .iter()
            .filter(|s| wanted.contains(s.name()))
            .cloned()
            .collect())
    }

    /// Containers of the named services (all when empty), running only
    /// unless `all`
    pub fn containers(&self, names: &[String], all: bool) -> Result<Vec<ContainerRef>> {
        for name in names {
            self.service(name)?;
        }
        let filter = ContainerFilter::project(&self.name)
            .services(names)
            .all(all);
        Ok(self.engine.list(&filter)?)
    }

    /// Engine events of this project
    pub fn events(&self) -> Result<EventStream> {
        Ok(self.engine.events(&EventFilter::project(&self.name))?)
    }

    /// Create and start the containers of the requested services in
    /// dependency order, waiting on each dependency's condition
    pub fn up(&self, options: &UpOptions) -> Result<Vec<ContainerRef>> {
        let services = self.services(&options.services, options.include_deps)?;
        tracing::info!("Bringing up project {}", self.name);

        let by_name: HashMap<String, Service> = services
            .iter()
            .map(|s| (s.name().to_string(), s.clone()))
            .collect();

        let ctx = Arc::clone(&self.ctx);
        let build = options.build;
        let pull = options.pull;
        let start = options.start;
        let timeout = options.timeout;

        let (results, errors) = ParallelExecution::new(services, move |service: &Service| {
            service.ensure_image(build, pull)?;
            service.converge(&ctx, start, timeout)
        })
        .dependencies(move |service: &Service| service_dependencies(service, &by_name, start))
        .without_global_limit()
        .run(&self.ctx)?;

        if !errors.is_empty() {
            return Err(ConvoyError::Compose(
                "Encountered errors while bringing up the project.".to_string(),
            ));
        }
        Ok(results.into_iter().flatten().collect())
    }

    /// Start existing containers in dependency order. A service without
    /// containers is reported as failed but does not hold back its
    /// dependents.
    pub fn start(&self, names: &[String]) -> Result<Vec<ContainerRef>> {
        let services = self.services(names, false)?;
        let by_name: HashMap<String, Service> = services
            .iter()
            .map(|s| (s.name().to_string(), s.clone()))
            .collect();

        let (results, _) = ParallelExecution::new(services, |service: &Service| service.start())
            .message("Starting")
            .dependencies(move |service: &Service| service_dependencies(service, &by_name, true))
            .fail_check(|_, containers: &Vec<ContainerRef>| containers.is_empty())
            .run(&self.ctx)?;

        let containers: Vec<ContainerRef> = results.into_iter().flatten().collect();
        if containers.is_empty() {
            return Err(ConvoyError::Compose("No containers to start".to_string()));
        }
        Ok(containers)
    }

    /// Stop containers, dependents before their dependencies
    pub fn stop(&self, names: &[String], timeout: Option<Duration>) -> Result<()> {
        let containers = self.containers(names, false)?;
        let dependents = self.reverse_dependencies();
        let timeouts = self.stop_timeouts(timeout);
        let engine = Arc::clone(&self.engine);
        let members = containers.clone();

        ParallelExecution::new(containers, move |container: &ContainerRef| {
            let timeout = timeouts
                .get(&container.service)
                .copied()
                .unwrap_or(super::service::DEFAULT_TIMEOUT);
            engine.stop(&container.id, timeout)?;
            Ok(())
        })
        .name(|container: &ContainerRef| container.name.clone())
        .message("Stopping")
        .dependencies(move |container: &ContainerRef| {
            let Some(services) = dependents.get(&container.service) else {
                return Vec::new();
            };
            members
                .iter()
                .filter(|other| services.contains(&other.service))
                .cloned()
                .map(Dependency::new)
                .collect()
        })
        .run(&self.ctx)?;
        Ok(())
    }

    pub fn kill(&self, names: &[String], signal: &str) -> Result<()> {
        if signal_number(signal).is_none() {
            return Err(ConvoyError::Usage(format!("Unknown signal: {}", signal)));
        }
        let engine = Arc::clone(&self.engine);
        let signal = signal.to_string();
        self.for_each_container(names, false, "Killing", move |container| {
            engine.kill(&container.id, &signal)?;
            Ok(())
        })
    }

    pub fn restart(&self, names: &[String], timeout: Option<Duration>) -> Result<Vec<ContainerRef>> {
        let containers = self.containers(names, true)?;
        let engine = Arc::clone(&self.engine);
        let timeouts = self.stop_timeouts(timeout);
        parallel_execute(
            &self.ctx,
            containers.clone(),
            move |container: &ContainerRef| {
                let timeout = timeouts
                    .get(&container.service)
                    .copied()
                    .unwrap_or(super::service::DEFAULT_TIMEOUT);
                engine.restart(&container.id, timeout)?;
                Ok(())
            },
            |container: &ContainerRef| container.name.clone(),
            "Restarting",
        )?;
        Ok(containers)
    }

    pub fn pause(&self, names: &[String]) -> Result<()> {
        let engine = Arc::clone(&self.engine);
        self.for_each_container(names, false, "Pausing", move |container| {
            engine.pause(&container.id)?;
            Ok(())
        })
    }

    pub fn unpause(&self, names: &[String]) -> Result<()> {
        let engine = Arc::clone(&self.engine);
        self.for_each_container(names, false, "Unpausing", move |container| {
            engine.unpause(&container.id)?;
            Ok(())
        })
    }

    /// Remove stopped containers
    pub fn remove_stopped(&self, names: &[String]) -> Result<Vec<ContainerRef>> {
        let stopped: Vec<ContainerRef> = self
            .containers(names, true)?
            .into_iter()
            .filter(|c| {
                self.engine
                    .inspect(&c.id)
                    .map(|state| !state.is_running())
                    .unwrap_or(false)
            })
            .collect();

        let engine = Arc::clone(&self.engine);
        parallel_execute(
            &self.ctx,
            stopped.clone(),
            move |container: &ContainerRef| {
                engine.remove(&container.id, false)?;
                Ok(())
            },
            |container: &ContainerRef| container.name.clone(),
            "Removing",
        )?;
        Ok(stopped)
    }

    /// Stop everything, then remove every container of the project
    pub fn down(&self, timeout: Option<Duration>) -> Result<()> {
        self.stop(&[], timeout)?;
        self.remove_stopped(&[])?;
        Ok(())
    }

    /// Build the images of buildable services
    pub fn build(&self, names: &[String]) -> Result<()> {
        let mut buildable = Vec::new();
        for service in self.services(names, false)? {
            if service.can_be_built() {
                buildable.push(service);
            } else {
                tracing::info!("{} uses an image, skipping", service.name());
            }
        }

        let (_, errors) = parallel_execute(
            &self.ctx,
            buildable,
            |service: &Service| service.build(),
            |service: &Service| service.name().to_string(),
            "Building",
        )?;
        if !errors.is_empty() {
            return Err(ConvoyError::Compose("Failed to build images".to_string()));
        }
        Ok(())
    }

    /// Log multiplexer over `containers`, with prefixes sized for the
    /// project's service names
    pub fn log_printer(
        &self,
        containers: Vec<ContainerRef>,
        settings: &LogSettings,
        output: Box<dyn Write + Send>,
    ) -> LogPrinter {
        let presenters =
            build_log_presenters(&self.service_names(), settings.monochrome, !settings.no_prefix);
        LogPrinter::new(containers, presenters, Arc::clone(&self.engine), output)
            .log_options(settings.options.clone())
            .shutdown(self.ctx.shutdown().watch())
    }

    /// Exit code of an attached `up` that ended: the exit code of the
    /// `exit_code_from` service, or else the non-zero exit code of the
    /// container that stopped everything.
    pub fn compute_exit_code(
        &self,
        exit_code_from: Option<&str>,
        attached: &[ContainerRef],
        cascade_starter: Option<&str>,
    ) -> Result<i64> {
        if let Some(service) = exit_code_from {
            let candidates: Vec<&ContainerRef> =
                attached.iter().filter(|c| c.service == service).collect();
            if candidates.is_empty() {
                tracing::error!("No containers of service \"{}\" were run.", service);
                return Ok(2);
            }
            let mut exit_code = 0;
            for container in candidates {
                let code = self.engine.inspect(&container.id)?.exit_code.unwrap_or(0);
                if code != 0 {
                    exit_code = code;
                    break;
                }
            }
            return Ok(exit_code);
        }

        let Some(starter) = cascade_starter else {
            return Ok(0);
        };
        for container in self.containers(&[], true)? {
            if container.name != starter {
                continue;
            }
            let state = self.engine.inspect(&container.id)?;
            if !state.is_running() {
                return Ok(state.exit_code.unwrap_or(0));
            }
        }
        Ok(0)
    }

    fn for_each_container<F>(&self, names: &[String], all: bool, msg: &str, action: F) -> Result<()>
    where
        F: Fn(&ContainerRef) -> std::result::Result<(), ExecError> + Send + Sync + 'static,
    {
        let containers = self.containers(names, all)?;
        parallel_execute(
            &self.ctx,
            containers,
            action,
            |container: &ContainerRef| container.name.clone(),
            msg,
        )?;
        Ok(())
    }

    /// For every service, the services that depend on it
    fn reverse_dependencies(&self) -> HashMap<String, HashSet<String>> {
        let mut dependents: HashMap<String, HashSet<String>> = HashMap::new();
        for service in &self.services {
            for dep in service.dependency_names() {
                dependents
                    .entry(dep.to_string())
                    .or_default()
                    .insert(service.name().to_string());
            }
        }
        dependents
    }

    fn stop_timeouts(&self, timeout: Option<Duration>) -> HashMap<String, Duration> {
        self.services
            .iter()
            .map(|s| (s.name().to_string(), s.stop_timeout(timeout)))
            .collect()
    }
}

/// Dependencies of a service within a service-level run. Conditions only
/// apply when containers are started.
fn service_dependencies(
    service: &Service,
    by_name: &HashMap<String, Service>,
    check_conditions: bool,
) -> Vec<Dependency<Service>> {
    service
        .dependencies()
        .iter()
        .filter_map(|(name, condition)| {
            let dep = by_name.get(name)?.clone();
            let condition = *condition;
            if !check_conditions || condition == DependencyCondition::ServiceStarted {
                return Some(Dependency::new(dep));
            }
            Some(Dependency::with_check(dep, move |s: &Service| s.is_ready(condition)))
        })
        .collect()
}

/// Working directory of a project: the directory of its first compose file
pub fn project_dir(files: &[PathBuf]) -> PathBuf {
    files
        .first()
        .and_then(|file| file.parent())
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::ComposeParser;
    use crate::container::ContainerManager;
    use crate::progress::ProgressWriter;
    use crate::test_utils::SharedBuffer;
    use std::time::Instant;

    struct Fixture {
        project: Project,
        engine: ContainerManager,
        output: SharedBuffer,
    }

    fn fixture(yaml: &str) -> Fixture {
        let config = ComposeParser::with_env(HashMap::new()).parse_str(yaml).unwrap();
        ComposeParser::validate(&config).unwrap();

        let engine = ContainerManager::new();
        engine.add_image("busybox");

        let output = SharedBuffer::new();
        let ctx = Arc::new(ExecContext::new());
        ctx.set_writer(ProgressWriter::new(Box::new(output.clone()), false));

        let project = Project::from_config(
            "demo",
            &config,
            Arc::new(engine.clone()),
            ctx,
            &std::env::temp_dir(),
        )
        .unwrap();
        Fixture {
            project,
            engine,
            output,
        }
    }

    const STACK: &str = r#"
services:
  web:
    image: busybox
    depends_on: [api]
  api:
    image: busybox
    depends_on: [db]
  db:
    image: busybox
"#;

    /// Last status printed for a progress line
    fn status(output: &str, key: &str) -> Option<String> {
        output
            .split("\r\n")
            .filter(|line| line.starts_with(&format!("{} ", key)))
            .filter_map(|line| line.split(" ... ").nth(1))
            .filter(|status| !status.is_empty())
            .last()
            .map(str::to_string)
    }

    fn names(containers: &[ContainerRef]) -> Vec<String> {
        let mut names: Vec<String> = containers.iter().map(|c| c.name.clone()).collect();
        names.sort();
        names
    }

    #[test]
    fn test_services_in_dependency_order() {
        let f = fixture(STACK);
        assert_eq!(f.project.service_names(), vec!["db", "api", "web"]);

        let only_api = f.project.services(&["api".to_string()], true).unwrap();
        let only_api: Vec<&str> = only_api.iter().map(|s| s.name()).collect();
        assert_eq!(only_api, vec!["db", "api"]);

        let no_deps = f.project.services(&["api".to_string()], false).unwrap();
        assert_eq!(no_deps.len(), 1);

        assert!(matches!(
            f.project.services(&["nope".to_string()], true),
            Err(ConvoyError::ServiceNotFound(_))
        ));
    }

    #[test]
    fn test_up_creates_every_service() {
        let f = fixture(STACK);
        let containers = f.project.up(&UpOptions::default()).unwrap();
        assert_eq!(names(&containers), vec!["demo-api-1", "demo-db-1", "demo-web-1"]);
        assert_eq!(f.project.containers(&[], false).unwrap().len(), 3);

        let output = f.output.contents();
        assert_eq!(status(&output, "Creating demo-db-1").as_deref(), Some("done"));

        // a second up converges without creating anything
        f.project.up(&UpOptions::default()).unwrap();
        assert_eq!(f.engine.count(), 3);
    }

    #[test]
    fn test_up_without_deps() {
        let f = fixture(STACK);
        let options = UpOptions {
            services: vec!["web".to_string()],
            include_deps: false,
            ..UpOptions::default()
        };
        let containers = f.project.up(&options).unwrap();
        assert_eq!(names(&containers), vec!["demo-web-1"]);
    }

    #[test]
    fn test_up_waits_for_completed_dependency() {
        let f = fixture(
            r#"
services:
  migrate:
    image: busybox
    command: sh -c "sleep 0.2; echo migrated"
  app:
    image: busybox
    depends_on:
      migrate:
        condition: service_completed_successfully
"#,
        );

        let started = Instant::now();
        f.project.up(&UpOptions::default()).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));

        let migrate = &f.project.containers(&["migrate".to_string()], true).unwrap()[0];
        let state = f.engine.inspect(&migrate.id).unwrap();
        assert_eq!(state.exit_code, Some(0));
        assert_eq!(f.project.containers(&["app".to_string()], false).unwrap().len(), 1);
    }

    #[test]
    fn test_up_failed_dependency_skips_dependents() {
        let f = fixture(
            r#"
services:
  migrate:
    image: busybox
    command: exit 1
  app:
    image: busybox
    depends_on:
      migrate:
        condition: service_completed_successfully
"#,
        );

        let err = f.project.up(&UpOptions::default()).unwrap_err();
        assert!(err.to_string().contains("Encountered errors"));
        assert!(f.project.containers(&["app".to_string()], true).unwrap().is_empty());
        assert!(f
            .output
            .contents()
            .contains("ERROR: for app  Service \"demo-migrate-1\" didn't complete successfully: exit 1"));
    }

    #[test]
    fn test_up_missing_image_is_reraised() {
        let f = fixture(
            r#"
services:
  web:
    image: ghost
    pull_policy: never
  db:
    image: busybox
"#,
        );

        match f.project.up(&UpOptions::default()) {
            Err(ConvoyError::Api(e)) => assert_eq!(e.status_code(), 404),
            other => panic!("unexpected: {:?}", other.map(|c| c.len())),
        }
        // the independent branch still ran
        assert_eq!(f.project.containers(&["db".to_string()], false).unwrap().len(), 1);

        let retry = UpOptions {
            pull: Some(PullPolicy::Always),
            ..UpOptions::default()
        };
        f.project.up(&retry).unwrap();
        assert_eq!(f.project.containers(&["web".to_string()], false).unwrap().len(), 1);
    }

    #[test]
    fn test_start_soft_fails_services_without_containers() {
        let f = fixture(STACK);
        let options = UpOptions {
            services: vec!["db".to_string()],
            include_deps: false,
            start: false,
            ..UpOptions::default()
        };
        f.project.up(&options).unwrap();

        let started = f.project.start(&[]).unwrap();
        assert_eq!(names(&started), vec!["demo-db-1"]);

        let output = f.output.contents();
        assert_eq!(status(&output, "Starting db").as_deref(), Some("done"));
        assert_eq!(status(&output, "Starting api").as_deref(), Some("failed"));
        assert_eq!(status(&output, "Starting web").as_deref(), Some("failed"));
    }

    #[test]
    fn test_start_without_containers_fails() {
        let f = fixture(STACK);
        let err = f.project.start(&[]).unwrap_err();
        assert_eq!(err.to_string(), "Compose error: No containers to start");
    }

    #[test]
    fn test_stop_in_reverse_order() {
        let f = fixture(STACK);
        f.project.up(&UpOptions::default()).unwrap();
        let events = f.project.events().unwrap();

        f.project.stop(&[], Some(Duration::from_secs(1))).unwrap();
        assert!(f.project.containers(&[], false).unwrap().is_empty());

        let stopped: Vec<String> = events
            .filter(|e| e.action == crate::engine::EventAction::Stop)
            .take(3)
            .map(|e| e.container.service)
            .collect();
        assert_eq!(stopped, vec!["web", "api", "db"]);
    }

    #[test]
    fn test_down_removes_everything() {
        let f = fixture(STACK);
        f.project.up(&UpOptions::default()).unwrap();
        f.project.down(None).unwrap();
        assert_eq!(f.engine.count(), 0);
        assert_eq!(
            status(&f.output.contents(), "Removing demo-web-1").as_deref(),
            Some("done")
        );
    }

    #[test]
    fn test_pause_unpause_and_kill() {
        let f = fixture(STACK);
        f.project.up(&UpOptions::default()).unwrap();

        f.project.pause(&["web".to_string()]).unwrap();
        let web = &f.project.containers(&["web".to_string()], false).unwrap()[0];
        assert!(f.engine.inspect(&web.id).unwrap().is_paused());

        f.project.unpause(&["web".to_string()]).unwrap();
        assert!(!f.engine.inspect(&web.id).unwrap().is_paused());

        f.project.kill(&[], "SIGKILL").unwrap();
        let state = f.engine.inspect(&web.id).unwrap();
        assert_eq!(state.exit_code, Some(137));
    }

    #[test]
    fn test_kill_rejects_unknown_signal() {
        let f = fixture(STACK);
        f.project.up(&UpOptions::default()).unwrap();

        let err = f.project.kill(&[], "SIGBOGUS").unwrap_err();
        assert!(matches!(err, ConvoyError::Usage(ref msg) if msg == "Unknown signal: SIGBOGUS"));
        let web = &f.project.containers(&["web".to_string()], false).unwrap()[0];
        assert!(f.engine.inspect(&web.id).unwrap().is_running());
    }

    #[test]
    fn test_restart_brings_back_stopped_containers() {
        let f = fixture(STACK);
        f.project.up(&UpOptions::default()).unwrap();
        f.project.stop(&["db".to_string()], None).unwrap();

        let restarted = f.project.restart(&["db".to_string()], None).unwrap();
        assert_eq!(restarted.len(), 1);
        assert_eq!(f.project.containers(&["db".to_string()], false).unwrap().len(), 1);
    }

    #[test]
    fn test_remove_only_touches_stopped() {
        let f = fixture(STACK);
        f.project.up(&UpOptions::default()).unwrap();
        f.project.stop(&["web".to_string()], None).unwrap();

        let removed = f.project.remove_stopped(&[]).unwrap();
        assert_eq!(names(&removed), vec!["demo-web-1"]);
        assert_eq!(f.engine.count(), 2);
    }

    #[test]
    fn test_build_skips_image_services() {
        let dir = tempfile::tempdir().unwrap();
        let config = ComposeParser::with_env(HashMap::new())
            .parse_str("services:\n  app:\n    build: .\n  db:\n    image: busybox\n")
            .unwrap();
        let engine = ContainerManager::new();
        let ctx = Arc::new(ExecContext::new());
        ctx.set_writer(ProgressWriter::new(Box::new(SharedBuffer::new()), false));
        let project =
            Project::from_config("demo", &config, Arc::new(engine.clone()), ctx, dir.path())
                .unwrap();

        project.build(&[]).unwrap();
        assert!(engine.image_exists("demo-app").unwrap());
        assert!(!engine.image_exists("busybox").unwrap());
    }

    #[test]
    fn test_exit_code_from_service() {
        let f = fixture(
            r#"
services:
  job:
    image: busybox
    command: exit 4
  server:
    image: busybox
"#,
        );
        let containers = f.project.up(&UpOptions::default()).unwrap();
        let job = containers.iter().find(|c| c.service == "job").unwrap();
        f.engine.wait(&job.id).unwrap();

        assert_eq!(f.project.compute_exit_code(Some("job"), &containers, None).unwrap(), 4);
        assert_eq!(f.project.compute_exit_code(Some("other"), &containers, None).unwrap(), 2);
        assert_eq!(
            f.project
                .compute_exit_code(None, &containers, Some("demo-job-1"))
                .unwrap(),
            4
        );
        assert_eq!(f.project.compute_exit_code(None, &containers, None).unwrap(), 0);
    }

    #[test]
    fn test_project_names() {
        assert_eq!(Project::normalize_name("My App_1"), "myapp_1");
        let config = ComposeConfig::default();
        assert_eq!(
            Project::resolve_name(None, &config, Path::new("/srv/Shop-Front")).unwrap(),
            "shop-front"
        );
        assert_eq!(
            Project::resolve_name(Some("explicit"), &config, Path::new("/srv/x")).unwrap(),
            "explicit"
        );
        assert!(Project::resolve_name(Some("!!!"), &config, Path::new("/")).is_err());
    }

    #[test]
    fn test_project_dir() {
        assert_eq!(project_dir(&[PathBuf::from("compose.yaml")]), PathBuf::from("."));
        assert_eq!(
            project_dir(&[PathBuf::from("/srv/app/compose.yaml")]),
            PathBuf::from("/srv/app")
        );
    }
}
