//! Container lifecycle management

use super::config::ContainerConfig;
use super::program::{Program, Step};
use super::runtime::{Cell, Container};
use crate::engine::{
    self, ContainerFilter, ContainerRef, ContainerState, Engine, EngineEvent, EventAction,
    EventFilter, EventStream, Health, LogOptions, LogStream,
};
use crate::error::{ApiError, Result};
use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const STATE_FILE: &str = "engine.json";

/// Persisted form of the manager
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    containers: Vec<Container>,
    images: BTreeSet<String>,
}

struct Inner {
    /// All containers indexed by ID
    containers: RwLock<HashMap<String, Arc<Cell>>>,
    /// Images available locally
    images: RwLock<BTreeSet<String>>,
    subscribers: Mutex<Vec<(EventFilter, Sender<EngineEvent>)>>,
    state_file: Option<PathBuf>,
}

/// In-process container engine.
///
/// Containers run simulated programs (see [`Program`]) on their own threads.
/// With a state directory the container table is saved after every change
/// and restored on open; containers that were running keep running.
#[derive(Clone)]
pub struct ContainerManager {
    inner: Arc<Inner>,
}

impl ContainerManager {
    /// Create an in-memory container manager
    pub fn new() -> Self {
        Self::with_state(None, Snapshot::default())
    }

    /// Open a persistent container manager rooted at `base_path`
    pub fn open(base_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(base_path)?;
        let state_file = base_path.join(STATE_FILE);

        let snapshot = if state_file.exists() {
            let content = std::fs::read_to_string(&state_file)?;
            serde_json::from_str(&content)?
        } else {
            Snapshot::default()
        };

        tracing::debug!(
            "Loaded {} containers from {}",
            snapshot.containers.len(),
            state_file.display()
        );
        Ok(Self::with_state(Some(state_file), snapshot))
    }

    /// Default state directory
    pub fn default_state_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("convoy"))
    }

    fn with_state(state_file: Option<PathBuf>, snapshot: Snapshot) -> Self {
        let manager = Self {
            inner: Arc::new(Inner {
                containers: RwLock::new(HashMap::new()),
                images: RwLock::new(snapshot.images),
                subscribers: Mutex::new(Vec::new()),
                state_file,
            }),
        };

        for mut container in snapshot.containers {
            let resume = container.is_running();
            let generation = if resume { container.start() } else { 0 };
            if resume {
                container.health = container.config.healthcheck.as_ref().map(|_| Health::Healthy);
            }
            let id = container.id().to_string();
            let cell = Arc::new(Cell::new(container));
            manager.inner.containers.write().insert(id.clone(), Arc::clone(&cell));

            if resume {
                let program = Program::parse_script("serve");
                if let Err(e) = manager.spawn_program(&id, cell, generation, program) {
                    tracing::warn!("Failed to resume container {}: {}", id, e);
                }
            }
        }

        manager
    }

    /// Make an image available without pulling it
    pub fn add_image(&self, image: &str) {
        self.inner.images.write().insert(normalize_image(image));
        self.persist();
    }

    pub fn images(&self) -> Vec<String> {
        self.inner.images.read().iter().cloned().collect()
    }

    /// Get container count
    pub fn count(&self) -> usize {
        self.inner.containers.read().len()
    }

    /// Find container by name
    pub fn find_by_name(&self, name: &str) -> Option<ContainerRef> {
        self.inner
            .containers
            .read()
            .values()
            .map(|cell| cell.lock())
            .find(|c| c.config.name == name)
            .map(|c| c.reference())
    }

    fn cell(&self, id: &str) -> std::result::Result<Arc<Cell>, ApiError> {
        let containers = self.inner.containers.read();
        if let Some(cell) = containers.get(id) {
            return Ok(Arc::clone(cell));
        }
        // Accept names and unique ID prefixes as well
        containers
            .values()
            .find(|cell| {
                let c = cell.lock();
                c.config.name == id || c.id().starts_with(id)
            })
            .cloned()
            .ok_or_else(|| ApiError::NotFound(id.to_string()))
    }

    fn emit(&self, container: ContainerRef, action: EventAction, time: DateTime<Utc>) {
        let event = EngineEvent {
            time,
            action,
            id: container.id.clone(),
            attributes: HashMap::from([("name".to_string(), container.name.clone())]),
            container,
        };
        tracing::trace!("Event {} for {}", event.action, event.container);

        self.inner
            .subscribers
            .lock()
            .retain(|(filter, tx)| !filter.matches(&event) || tx.send(event.clone()).is_ok());
    }

    /// Save the container table if the manager is persistent
    fn persist(&self) {
        let Some(path) = &self.inner.state_file else {
            return;
        };

        let snapshot = Snapshot {
            containers: self
                .inner
                .containers
                .read()
                .values()
                .map(|cell| cell.lock().clone())
                .collect(),
            images: self.inner.images.read().clone(),
        };

        let result = serde_json::to_string_pretty(&snapshot)
            .map_err(std::io::Error::from)
            .and_then(|json| std::fs::write(path, json));
        if let Err(e) = result {
            tracing::warn!("Failed to save engine state to {}: {}", path.display(), e);
        }
    }

    fn spawn_program(
        &self,
        id: &str,
        cell: Arc<Cell>,
        generation: u64,
        program: Program,
    ) -> std::result::Result<(), ApiError> {
        let manager = self.clone();
        thread::Builder::new()
            .name(format!("container-{}", short(id)))
            .spawn(move || manager.run_program(cell, generation, program))
            .map(|_| ())
            .map_err(|e| ApiError::Status {
                code: 500,
                explanation: format!("failed to start container process: {}", e),
            })
    }

    fn run_program(&self, cell: Arc<Cell>, generation: u64, program: Program) {
        let mut status = 0;
        for step in program.steps() {
            match step {
                Step::Echo(text) => {
                    if !cell.wait_unpaused(generation) {
                        return;
                    }
                    cell.update(|c| c.append_log(text));
                    status = 0;
                }
                Step::Sleep(duration) => {
                    if !cell.sleep(generation, *duration) {
                        return;
                    }
                }
                Step::Status(code) => status = *code,
                Step::Exit(code) => {
                    status = *code;
                    break;
                }
                Step::Serve => {
                    cell.wait_stopped(generation);
                    return;
                }
            }
        }
        self.finish(&cell, generation, status);
    }

    /// The program of run `generation` exited on its own
    fn finish(&self, cell: &Cell, generation: u64, exit_code: i64) {
        let container = cell.update(|c| {
            if !c.is_current(generation) {
                return None;
            }
            c.exit(exit_code);
            Some(c.reference())
        });

        if let Some(container) = container {
            tracing::debug!("Container {} exited with code {}", container, exit_code);
            self.emit(container, EventAction::Die, Utc::now());
            self.persist();
        }
    }

    fn spawn_healthcheck(&self, cell: Arc<Cell>, generation: u64) {
        let Some(check) = cell.lock().config.healthcheck.clone() else {
            return;
        };
        let manager = self.clone();
        let spawned = thread::Builder::new()
            .name("healthcheck".to_string())
            .spawn(move || {
                if !cell.sleep(generation, check.interval) {
                    return;
                }
                let health = if Program::parse_test(&check.test).check_status() == 0 {
                    Health::Healthy
                } else {
                    Health::Unhealthy
                };
                let container = cell.update(|c| {
                    if !c.is_current(generation) {
                        return None;
                    }
                    c.health = Some(health);
                    Some(c.reference())
                });
                if let Some(container) = container {
                    manager.emit(container, EventAction::HealthStatus(health), Utc::now());
                }
            });
        if let Err(e) = spawned {
            tracing::warn!("Failed to start healthcheck: {}", e);
        }
    }

    /// End the current run from outside. Returns the container if it was running.
    fn terminate(&self, cell: &Cell, exit_code: i64) -> Option<ContainerRef> {
        cell.update(|c| {
            if !c.is_running() {
                return None;
            }
            c.exit(exit_code);
            Some(c.reference())
        })
    }
}

impl Default for ContainerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for ContainerManager {
    fn create(&self, config: ContainerConfig) -> std::result::Result<ContainerRef, ApiError> {
        let image = normalize_image(&config.image);
        if !self.inner.images.read().contains(&image) {
            return Err(ApiError::ImageNotFound(config.image.clone()));
        }

        let container = Container::new(config);
        let reference = container.reference();
        {
            let mut containers = self.inner.containers.write();
            let existing = containers
                .values()
                .map(|cell| cell.lock())
                .find(|c| c.config.name == reference.name)
                .map(|c| c.id().to_string());
            if let Some(existing) = existing {
                return Err(ApiError::Conflict(format!(
                    "The container name \"/{}\" is already in use by container \"{}\"",
                    reference.name, existing
                )));
            }
            containers.insert(reference.id.clone(), Arc::new(Cell::new(container)));
        }

        tracing::debug!("Created container {} ({})", reference, reference.short_id());
        self.emit(reference.clone(), EventAction::Create, Utc::now());
        self.persist();
        Ok(reference)
    }

    fn start(&self, id: &str) -> std::result::Result<(), ApiError> {
        let cell = self.cell(id)?;
        let started = cell.update(|c| {
            if c.is_running() {
                return None;
            }
            let generation = c.start();
            let program = Program::parse(&c.config.full_command());
            Some((generation, program, c.reference(), c.started_at.unwrap_or_else(Utc::now)))
        });

        let Some((generation, program, container, started_at)) = started else {
            // Already running
            return Ok(());
        };

        if let Err(e) = self.spawn_program(&container.id, Arc::clone(&cell), generation, program) {
            cell.update(|c| c.exit(-1));
            return Err(e);
        }
        self.spawn_healthcheck(cell, generation);

        self.emit(container, EventAction::Start, started_at);
        self.persist();
        Ok(())
    }

    fn stop(&self, id: &str, timeout: Duration) -> std::result::Result<(), ApiError> {
        let cell = self.cell(id)?;
        tracing::debug!("Stopping {} with timeout {:?}", id, timeout);

        if let Some(container) = self.terminate(&cell, 0) {
            self.emit(container.clone(), EventAction::Die, Utc::now());
            self.emit(container, EventAction::Stop, Utc::now());
            self.persist();
        }
        Ok(())
    }

    fn kill(&self, id: &str, signal: &str) -> std::result::Result<(), ApiError> {
        let number = engine::signal_number(signal).ok_or_else(|| ApiError::Status {
            code: 400,
            explanation: format!("Invalid signal: {}", signal),
        })?;
        let cell = self.cell(id)?;
        let not_running = {
            let c = cell.lock();
            (!c.is_running()).then(|| c.not_running())
        };
        if let Some(e) = not_running {
            return Err(e);
        }

        if let Some(container) = self.terminate(&cell, 128 + number) {
            self.emit(container.clone(), EventAction::Kill, Utc::now());
            self.emit(container, EventAction::Die, Utc::now());
            self.persist();
        }
        Ok(())
    }

    fn restart(&self, id: &str, timeout: Duration) -> std::result::Result<(), ApiError> {
        self.stop(id, timeout)?;
        self.start(id)?;
        let container = self.cell(id)?.lock().reference();
        self.emit(container, EventAction::Restart, Utc::now());
        Ok(())
    }

    fn pause(&self, id: &str) -> std::result::Result<(), ApiError> {
        let cell = self.cell(id)?;
        let container = cell.update(|c| c.pause().map(|_| c.reference()))?;
        self.emit(container, EventAction::Pause, Utc::now());
        self.persist();
        Ok(())
    }

    fn unpause(&self, id: &str) -> std::result::Result<(), ApiError> {
        let cell = self.cell(id)?;
        let container = cell.update(|c| c.unpause().map(|_| c.reference()))?;
        self.emit(container, EventAction::Unpause, Utc::now());
        self.persist();
        Ok(())
    }

    fn remove(&self, id: &str, force: bool) -> std::result::Result<(), ApiError> {
        let cell = self.cell(id)?;
        let (running, container) = {
            let c = cell.lock();
            (c.is_running(), c.reference())
        };

        if running {
            if !force {
                return Err(ApiError::Conflict(format!(
                    "You cannot remove a running container {}. Stop the container before attempting removal or force remove",
                    container.id
                )));
            }
            if self.terminate(&cell, 137).is_some() {
                self.emit(container.clone(), EventAction::Kill, Utc::now());
                self.emit(container.clone(), EventAction::Die, Utc::now());
            }
        }

        cell.update(|c| c.removed = true);
        self.inner.containers.write().remove(&container.id);
        tracing::debug!("Removed container {}", container);
        self.emit(container, EventAction::Destroy, Utc::now());
        self.persist();
        Ok(())
    }

    fn inspect(&self, id: &str) -> std::result::Result<ContainerState, ApiError> {
        Ok(self.cell(id)?.lock().state())
    }

    fn list(&self, filter: &ContainerFilter) -> std::result::Result<Vec<ContainerRef>, ApiError> {
        let mut result: Vec<ContainerRef> = self
            .inner
            .containers
            .read()
            .values()
            .map(|cell| {
                let c = cell.lock();
                (c.reference(), c.state())
            })
            .filter(|(container, state)| filter.matches(container, state))
            .map(|(container, _)| container)
            .collect();
        result.sort_by(|a, b| (&a.service, a.number).cmp(&(&b.service, b.number)));
        Ok(result)
    }

    fn logs(&self, id: &str, options: &LogOptions) -> std::result::Result<LogStream, ApiError> {
        let cell = self.cell(id)?;
        let (cursor, generation) = {
            let c = cell.lock();
            (c.log_cursor(options.since, options.tail), c.generation)
        };
        Ok(Box::new(LogReader {
            cell,
            cursor,
            generation,
            follow: options.follow,
            timestamps: options.timestamps,
        }))
    }

    fn events(&self, filter: &EventFilter) -> std::result::Result<EventStream, ApiError> {
        let (tx, rx) = channel::unbounded();
        self.inner.subscribers.lock().push((filter.clone(), tx));
        Ok(Box::new(rx.into_iter()))
    }

    fn wait(&self, id: &str) -> std::result::Result<i64, ApiError> {
        let cell = self.cell(id)?;
        let mut c = cell.lock();
        while c.is_running() && !c.removed {
            cell.wait(&mut c);
        }
        if c.removed && c.exit_code.is_none() {
            return Err(ApiError::NotFound(id.to_string()));
        }
        Ok(c.exit_code.unwrap_or(0))
    }

    fn image_exists(&self, image: &str) -> std::result::Result<bool, ApiError> {
        Ok(self.inner.images.read().contains(&normalize_image(image)))
    }

    fn pull(&self, image: &str) -> std::result::Result<(), ApiError> {
        if image.trim().is_empty() {
            return Err(ApiError::Status {
                code: 400,
                explanation: "image name must not be empty".to_string(),
            });
        }
        tracing::info!("Pulling {}", image);
        self.add_image(image);
        Ok(())
    }

    fn build(&self, tag: &str, context: &Path) -> std::result::Result<(), ApiError> {
        if !context.is_dir() {
            return Err(ApiError::Status {
                code: 400,
                explanation: format!("build context {} is not a directory", context.display()),
            });
        }
        tracing::info!("Building {} from {}", tag, context.display());
        self.add_image(tag);
        Ok(())
    }
}

/// Stream over a container's log buffer
struct LogReader {
    cell: Arc<Cell>,
    cursor: usize,
    generation: u64,
    follow: bool,
    timestamps: bool,
}

impl Iterator for LogReader {
    type Item = std::result::Result<Vec<u8>, ApiError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut c = self.cell.lock();
        loop {
            if self.cursor < c.logs.len() {
                let chunk: String = c.logs[self.cursor..]
                    .iter()
                    .map(|entry| entry.render(self.timestamps))
                    .collect();
                self.cursor = c.logs.len();
                return Some(Ok(chunk.into_bytes()));
            }
            // A follower ends with the run it attached to
            if !self.follow || c.removed || c.generation != self.generation || !c.is_running() {
                return None;
            }
            self.cell.wait(&mut c);
        }
    }
}

/// `busybox` and `busybox:latest` are the same image
fn normalize_image(image: &str) -> String {
    let name_part = image.rsplit('/').next().unwrap_or(image);
    if name_part.contains(':') || image.contains('@') {
        image.to_string()
    } else {
        format!("{}:latest", image)
    }
}

fn short(id: &str) -> &str {
    &id[..id.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerStatus, HealthCheck};
    use crate::engine::{LABEL_CONTAINER_NUMBER, LABEL_PROJECT, LABEL_SERVICE};
    use std::time::Instant;
    use tempfile::TempDir;

    fn manager() -> ContainerManager {
        let manager = ContainerManager::new();
        manager.add_image("busybox");
        manager
    }

    fn config(service: &str, cmd: &str) -> ContainerConfig {
        ContainerConfig::new(&format!("proj-{}-1", service), "busybox")
            .cmd(vec!["sh".into(), "-c".into(), cmd.into()])
            .label(LABEL_PROJECT, "proj")
            .label(LABEL_SERVICE, service)
            .label(LABEL_CONTAINER_NUMBER, "1")
    }

    fn read_all(stream: LogStream) -> String {
        let bytes: Vec<u8> = stream.flat_map(|chunk| chunk.unwrap()).collect();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_create_requires_image() {
        let manager = ContainerManager::new();
        let err = manager.create(config("web", "true")).unwrap_err();
        assert!(matches!(err, ApiError::ImageNotFound(ref image) if image == "busybox"));

        manager.pull("busybox:latest").unwrap();
        assert!(manager.image_exists("busybox").unwrap());
        assert!(manager.create(config("web", "true")).is_ok());
    }

    #[test]
    fn test_duplicate_name_conflicts() {
        let manager = manager();
        manager.create(config("web", "true")).unwrap();
        let err = manager.create(config("web", "true")).unwrap_err();
        assert_eq!(err.status_code(), 409);
    }

    #[test]
    fn test_echo_program_exits() {
        let manager = manager();
        let c = manager.create(config("app", "echo hello; echo world; exit 3")).unwrap();
        manager.start(&c.id).unwrap();

        assert_eq!(manager.wait(&c.id).unwrap(), 3);
        let logs = read_all(manager.logs(&c.id, &LogOptions::default()).unwrap());
        assert_eq!(logs, "hello\nworld\n");
        assert_eq!(manager.inspect(&c.id).unwrap().status, ContainerStatus::Exited);
    }

    #[test]
    fn test_server_runs_until_stopped() {
        let manager = manager();
        let c = manager.create(config("web", "nginx")).unwrap();
        manager.start(&c.id).unwrap();
        assert!(manager.inspect(&c.id).unwrap().is_running());

        manager.stop(&c.id, Duration::from_secs(10)).unwrap();
        let state = manager.inspect(&c.id).unwrap();
        assert!(!state.is_running());
        assert_eq!(state.exit_code, Some(0));
    }

    #[test]
    fn test_kill_sets_signal_exit_code() {
        let manager = manager();
        let c = manager.create(config("web", "nginx")).unwrap();
        manager.start(&c.id).unwrap();
        manager.kill(&c.id, "SIGKILL").unwrap();
        assert_eq!(manager.wait(&c.id).unwrap(), 137);
        assert!(manager.kill(&c.id, "SIGKILL").is_err());
    }

    #[test]
    fn test_follow_ends_when_container_stops() {
        let manager = manager();
        let c = manager.create(config("app", "echo one; sleep 0.05; echo two")).unwrap();
        manager.start(&c.id).unwrap();

        let options = LogOptions {
            follow: true,
            ..LogOptions::default()
        };
        let logs = read_all(manager.logs(&c.id, &options).unwrap());
        assert_eq!(logs, "one\ntwo\n");
    }

    #[test]
    fn test_events_are_broadcast() {
        let manager = manager();
        let mut events = manager.events(&EventFilter::project("proj")).unwrap();
        let mut other = manager.events(&EventFilter::project("other")).unwrap();

        let c = manager.create(config("web", "nginx")).unwrap();
        manager.start(&c.id).unwrap();
        manager.stop(&c.id, Duration::from_secs(1)).unwrap();

        let actions: Vec<EventAction> = (0..4).filter_map(|_| events.next()).map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![EventAction::Create, EventAction::Start, EventAction::Die, EventAction::Stop]
        );

        manager.create(
            ContainerConfig::new("elsewhere", "busybox").label(LABEL_PROJECT, "other"),
        )
        .unwrap();
        assert_eq!(other.next().unwrap().action, EventAction::Create);
    }

    #[test]
    fn test_remove_running_requires_force() {
        let manager = manager();
        let c = manager.create(config("web", "nginx")).unwrap();
        manager.start(&c.id).unwrap();

        assert!(matches!(manager.remove(&c.id, false), Err(ApiError::Conflict(_))));
        manager.remove(&c.id, true).unwrap();
        assert!(matches!(manager.inspect(&c.id), Err(ApiError::NotFound(_))));
        assert_eq!(manager.count(), 0);
    }

    #[test]
    fn test_healthcheck_reports_status() {
        let manager = manager();
        let healthy = manager
            .create(config("db", "postgres").healthcheck(HealthCheck::new(
                vec!["CMD".into(), "true".into()],
                Duration::from_millis(10),
            )))
            .unwrap();
        manager.start(&healthy.id).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while manager.inspect(&healthy.id).unwrap().health == Some(Health::Starting) {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(manager.inspect(&healthy.id).unwrap().health, Some(Health::Healthy));
    }

    #[test]
    fn test_list_filters_by_service() {
        let manager = manager();
        let web = manager.create(config("web", "nginx")).unwrap();
        manager.create(config("db", "postgres")).unwrap();
        manager.start(&web.id).unwrap();

        let running = manager.list(&ContainerFilter::project("proj")).unwrap();
        assert_eq!(running, vec![web.clone()]);

        let all = manager.list(&ContainerFilter::project("proj").all(true)).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].service, "db");
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let id = {
            let manager = ContainerManager::open(dir.path()).unwrap();
            manager.add_image("busybox");
            let c = manager.create(config("web", "nginx")).unwrap();
            manager.start(&c.id).unwrap();
            c.id
        };

        let reopened = ContainerManager::open(dir.path()).unwrap();
        assert!(reopened.image_exists("busybox").unwrap());
        assert!(reopened.inspect(&id).unwrap().is_running());
        reopened.stop(&id, Duration::from_secs(1)).unwrap();
        assert!(!reopened.inspect(&id).unwrap().is_running());
    }

    #[test]
    fn test_lookup_by_name() {
        let manager = manager();
        let c = manager.create(config("web", "nginx")).unwrap();
        assert_eq!(manager.find_by_name("proj-web-1"), Some(c.clone()));
        assert!(manager.inspect("proj-web-1").is_ok());
        assert!(manager.inspect(&c.id[..8]).is_ok());
    }

    #[test]
    fn test_normalize_image() {
        assert_eq!(normalize_image("busybox"), "busybox:latest");
        assert_eq!(normalize_image("busybox:1.36"), "busybox:1.36");
        assert_eq!(normalize_image("localhost:5000/app"), "localhost:5000/app:latest");
    }
}
