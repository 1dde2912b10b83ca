//! Container runtime state

use super::config::{ContainerConfig, ContainerStatus};
use crate::engine::{ContainerRef, ContainerState, Health};
use crate::error::ApiError;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// One line of container output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub line: String,
}

impl LogEntry {
    /// Line as the engine streams it, newline terminated
    pub fn render(&self, timestamps: bool) -> String {
        if timestamps {
            format!(
                "{} {}\n",
                self.time.to_rfc3339_opts(SecondsFormat::Nanos, true),
                self.line
            )
        } else {
            format!("{}\n", self.line)
        }
    }
}

/// Container instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    /// Container configuration
    pub config: ContainerConfig,
    pub status: ContainerStatus,
    pub exit_code: Option<i64>,
    pub health: Option<Health>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub logs: Vec<LogEntry>,
    /// Bumped on every start; program threads of older runs see the change and end
    #[serde(skip)]
    pub generation: u64,
    #[serde(skip)]
    pub removed: bool,
}

impl Container {
    /// Create a new container
    pub fn new(config: ContainerConfig) -> Self {
        Self {
            config,
            status: ContainerStatus::Created,
            exit_code: None,
            health: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            logs: Vec::new(),
            generation: 0,
            removed: false,
        }
    }

    /// Get container ID
    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn reference(&self) -> ContainerRef {
        ContainerRef::from_config(&self.config)
    }

    pub fn state(&self) -> ContainerState {
        ContainerState {
            status: self.status,
            exit_code: self.exit_code,
            health: self.health,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }

    /// Check if container is running
    pub fn is_running(&self) -> bool {
        matches!(self.status, ContainerStatus::Running | ContainerStatus::Paused)
    }

    /// Whether the run identified by `generation` is still going
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.is_running() && !self.removed
    }

    /// Start the container. Returns the new run generation.
    pub fn start(&mut self) -> u64 {
        self.generation += 1;
        self.status = ContainerStatus::Running;
        self.exit_code = None;
        self.started_at = Some(Utc::now());
        self.finished_at = None;
        self.health = self.config.healthcheck.as_ref().map(|_| Health::Starting);
        self.generation
    }

    /// Record the end of the current run
    pub fn exit(&mut self, exit_code: i64) {
        self.status = ContainerStatus::Exited;
        self.exit_code = Some(exit_code);
        self.finished_at = Some(Utc::now());
        self.health = None;
    }

    /// Pause the container
    pub fn pause(&mut self) -> Result<(), ApiError> {
        match self.status {
            ContainerStatus::Running => {
                self.status = ContainerStatus::Paused;
                Ok(())
            }
            ContainerStatus::Paused => Err(ApiError::Conflict(format!(
                "Container {} is already paused",
                self.id()
            ))),
            _ => Err(self.not_running()),
        }
    }

    /// Unpause the container
    pub fn unpause(&mut self) -> Result<(), ApiError> {
        if self.status != ContainerStatus::Paused {
            return Err(ApiError::Conflict(format!(
                "Container {} is not paused",
                self.id()
            )));
        }
        self.status = ContainerStatus::Running;
        Ok(())
    }

    pub fn not_running(&self) -> ApiError {
        ApiError::Conflict(format!("Container {} is not running", self.id()))
    }

    pub fn append_log(&mut self, line: &str) {
        self.logs.push(LogEntry {
            time: Utc::now(),
            line: line.to_string(),
        });
    }

    /// Index of the first entry to stream for the given starting point
    pub fn log_cursor(&self, since: Option<DateTime<Utc>>, tail: Option<usize>) -> usize {
        let mut cursor = since
            .map(|since| self.logs.partition_point(|entry| entry.time < since))
            .unwrap_or(0);
        if let Some(tail) = tail {
            cursor = cursor.max(self.logs.len().saturating_sub(tail));
        }
        cursor
    }
}

/// A container record plus the condition variable signalled on every change
#[derive(Debug)]
pub struct Cell {
    record: Mutex<Container>,
    changed: Condvar,
}

impl Cell {
    pub fn new(container: Container) -> Self {
        Self {
            record: Mutex::new(container),
            changed: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Container> {
        self.record.lock()
    }

    /// Apply a change and wake everyone waiting on this container
    pub fn update<T>(&self, change: impl FnOnce(&mut Container) -> T) -> T {
        let mut record = self.record.lock();
        let result = change(&mut record);
        self.changed.notify_all();
        result
    }

    pub fn wait(&self, record: &mut MutexGuard<'_, Container>) {
        self.changed.wait(record);
    }

    /// Sleep for `duration` unless the run ends first. Returns whether the
    /// run is still current.
    pub fn sleep(&self, generation: u64, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut record = self.record.lock();
        while record.is_current(generation) {
            if self.changed.wait_until(&mut record, deadline).timed_out() {
                break;
            }
        }
        record.is_current(generation)
    }

    /// Block while the container is paused
    pub fn wait_unpaused(&self, generation: u64) -> bool {
        let mut record = self.record.lock();
        while record.is_current(generation) && record.status == ContainerStatus::Paused {
            self.changed.wait(&mut record);
        }
        record.is_current(generation)
    }

    /// Block until the run ends
    pub fn wait_stopped(&self, generation: u64) {
        let mut record = self.record.lock();
        while record.is_current(generation) {
            self.changed.wait(&mut record);
        }
    }
}
