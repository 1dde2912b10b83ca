//! Helpers shared by unit tests

use crate::container::ContainerConfig;
use crate::engine::{
    ContainerFilter, ContainerRef, ContainerState, Engine, EventFilter, EventStream, LogOptions,
    LogStream,
};
use crate::error::ApiError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// In-memory output sink that can be inspected while a writer owns a clone
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock()).into_owned()
    }

    pub fn clear(&self) {
        self.bytes.lock().clear();
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Engine with canned log output and exit codes; everything else is a no-op
#[derive(Default)]
pub struct ScriptedEngine {
    logs: Mutex<HashMap<String, Result<Vec<Vec<u8>>, ApiError>>>,
    exits: Mutex<HashMap<String, Result<i64, ApiError>>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_logs(&self, id: &str, chunks: &[&[u8]]) {
        self.add_log_chunks(id, chunks.iter().map(|c| c.to_vec()).collect());
    }

    pub fn add_log_chunks(&self, id: &str, chunks: Vec<Vec<u8>>) {
        self.logs.lock().insert(id.to_string(), Ok(chunks));
    }

    pub fn fail_logs(&self, id: &str, error: ApiError) {
        self.logs.lock().insert(id.to_string(), Err(error));
    }

    pub fn set_exit(&self, id: &str, result: Result<i64, ApiError>) {
        self.exits.lock().insert(id.to_string(), result);
    }
}

impl Engine for ScriptedEngine {
    fn create(&self, config: ContainerConfig) -> Result<ContainerRef, ApiError> {
        Ok(ContainerRef::from_config(&config))
    }

    fn start(&self, _id: &str) -> Result<(), ApiError> {
        Ok(())
    }

    fn stop(&self, _id: &str, _timeout: Duration) -> Result<(), ApiError> {
        Ok(())
    }

    fn kill(&self, _id: &str, _signal: &str) -> Result<(), ApiError> {
        Ok(())
    }

    fn restart(&self, _id: &str, _timeout: Duration) -> Result<(), ApiError> {
        Ok(())
    }

    fn pause(&self, _id: &str) -> Result<(), ApiError> {
        Ok(())
    }

    fn unpause(&self, _id: &str) -> Result<(), ApiError> {
        Ok(())
    }

    fn remove(&self, _id: &str, _force: bool) -> Result<(), ApiError> {
        Ok(())
    }

    fn inspect(&self, id: &str) -> Result<ContainerState, ApiError> {
        Err(ApiError::NotFound(id.to_string()))
    }

    fn list(&self, _filter: &ContainerFilter) -> Result<Vec<ContainerRef>, ApiError> {
        Ok(Vec::new())
    }

    fn logs(&self, id: &str, _options: &LogOptions) -> Result<LogStream, ApiError> {
        let chunks = self.logs.lock().get(id).cloned().unwrap_or(Ok(Vec::new()))?;
        Ok(Box::new(chunks.into_iter().map(Ok)))
    }

    fn events(&self, _filter: &EventFilter) -> Result<EventStream, ApiError> {
        Ok(Box::new(std::iter::empty()))
    }

    fn wait(&self, id: &str) -> Result<i64, ApiError> {
        self.exits.lock().get(id).cloned().unwrap_or(Ok(0))
    }

    fn image_exists(&self, _image: &str) -> Result<bool, ApiError> {
        Ok(true)
    }

    fn pull(&self, _image: &str) -> Result<(), ApiError> {
        Ok(())
    }

    fn build(&self, _tag: &str, _context: &Path) -> Result<(), ApiError> {
        Ok(())
    }
}
