//! Dependency-ordered parallel execution
//!
//! An action is run on every object, each on its own thread, and only once
//! all of the object's dependencies have been processed successfully. The
//! scheduler is a single loop: it starts every object whose dependencies are
//! satisfied, short-circuits every object with a failed dependency, then waits
//! a short while on the outcome queue before scanning again.

use super::context::ExecContext;
use super::graph;
use super::limit::{GlobalLimit, LocalLimit};
use super::state::ExecutionState;
use super::POLL_INTERVAL;
use crate::error::ExecError;
use crate::progress::{ProgressStatus, ProgressWriter};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

/// Anything the executor can schedule
pub trait Object: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static {}

impl<T> Object for T where T: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static {}

/// Per-object work
pub type Action<T, R> = Arc<dyn Fn(&T) -> Result<R, ExecError> + Send + Sync>;

/// Extra condition a dependency must meet besides having finished
pub type ReadyCheck<T> = Arc<dyn Fn(&T) -> Result<bool, ExecError> + Send + Sync>;

/// Marks a successful result as failed for display purposes
pub type FailCheck<T, R> = Arc<dyn Fn(&T, &R) -> bool + Send + Sync>;

pub type DependencyFn<T> = Box<dyn Fn(&T) -> Vec<Dependency<T>> + Send>;

pub type NameFn<T> = Box<dyn Fn(&T) -> String + Send>;

/// Collected results and the per-object error messages of a run
pub type Collected<R> = (Vec<R>, BTreeMap<String, String>);

/// Edge to an object that must be processed first
pub struct Dependency<T> {
    pub object: T,
    pub ready: Option<ReadyCheck<T>>,
}

impl<T> Dependency<T> {
    pub fn new(object: T) -> Self {
        Self {
            object,
            ready: None,
        }
    }

    pub fn with_check<F>(object: T, check: F) -> Self
    where
        F: Fn(&T) -> Result<bool, ExecError> + Send + Sync + 'static,
    {
        Self {
            object,
            ready: Some(Arc::new(check)),
        }
    }
}

impl<T: Clone> Clone for Dependency<T> {
    fn clone(&self) -> Self {
        Self {
            object: self.object.clone(),
            ready: self.ready.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Dependency<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependency")
            .field("object", &self.object)
            .field("ready", &self.ready.is_some())
            .finish()
    }
}

/// Terminal state of one object
#[derive(Debug)]
pub enum OutcomeStatus<R> {
    Done(R),
    /// Succeeded, but the fail check flagged the result
    SoftFailed(R),
    Failed(ExecError),
}

/// Emitted exactly once per object
#[derive(Debug)]
pub struct Outcome<T, R> {
    pub object: T,
    pub status: OutcomeStatus<R>,
}

impl<T, R> Outcome<T, R> {
    pub fn is_success(&self) -> bool {
        !matches!(self.status, OutcomeStatus::Failed(_))
    }

    pub fn error(&self) -> Option<&ExecError> {
        match &self.status {
            OutcomeStatus::Failed(e) => Some(e),
            _ => None,
        }
    }
}

enum Event<T, R> {
    Outcome(Outcome<T, R>),
    Stop,
}

/// Lazy stream of outcomes for one run.
///
/// Yields `Err` only for fatal conditions (an interrupt), after which the
/// stream ends.
pub struct ParallelIter<T, R> {
    state: ExecutionState<T>,
    action: Action<T, R>,
    dependencies: DependencyFn<T>,
    fail_check: Option<FailCheck<T, R>>,
    local: LocalLimit,
    global: Option<Arc<GlobalLimit>>,
    tx: Sender<Event<T, R>>,
    rx: Receiver<Event<T, R>>,
    shutdown: crate::signals::ShutdownWatch,
    stop_sent: bool,
    done: bool,
}

impl<T, R> ParallelIter<T, R>
where
    T: Object,
    R: Send + 'static,
{
    fn new(
        ctx: &ExecContext,
        objects: Vec<T>,
        action: Action<T, R>,
        dependencies: DependencyFn<T>,
        limit: Option<usize>,
        fail_check: Option<FailCheck<T, R>>,
        global: bool,
    ) -> Result<Self, ExecError> {
        let state = ExecutionState::new(objects);

        let cycle = graph::find_cycle(state.objects(), |object| {
            dependencies(object).into_iter().map(|dep| dep.object).collect()
        });
        if let Some(cycle) = cycle {
            return Err(ExecError::DependencyCycle(
                cycle.iter().map(|o| o.to_string()).collect(),
            ));
        }

        let (tx, rx) = channel::unbounded();

        Ok(Self {
            state,
            action,
            dependencies,
            fail_check,
            local: LocalLimit::new(limit),
            global: global.then(|| Arc::clone(ctx.limit())),
            tx,
            rx,
            shutdown: ctx.shutdown().watch(),
            stop_sent: false,
            done: false,
        })
    }

    /// Objects of the run, without duplicates
    pub fn objects(&self) -> &[T] {
        self.state.objects()
    }

    /// Start producers for every object that is ready, short-circuit every
    /// object with a failed dependency.
    fn feed(&mut self) {
        let pending = self.state.pending();
        tracing::trace!("Pending: {}", display_list(&pending));

        for object in pending {
            let deps = (self.dependencies)(&object);

            if deps.iter().any(|dep| self.state.is_failed(&dep.object)) {
                tracing::debug!("{} has upstream errors - not processing", object);
                self.state.mark_failed(&object);
                self.emit(object, OutcomeStatus::Failed(ExecError::Upstream));
                continue;
            }

            match self.dependencies_ready(&deps) {
                Ok(true) => {
                    tracing::debug!("Starting producer thread for {}", object);
                    self.state.mark_started(object.clone());
                    self.spawn(object);
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::debug!(
                        "Healthcheck for service(s) upstream of {} failed - not processing",
                        object
                    );
                    self.state.mark_failed(&object);
                    self.emit(object, OutcomeStatus::Failed(e));
                }
            }
        }

        if self.state.is_done() && !self.stop_sent {
            self.stop_sent = true;
            let _ = self.tx.send(Event::Stop);
        }
    }

    fn dependencies_ready(&self, deps: &[Dependency<T>]) -> Result<bool, ExecError> {
        for dep in deps {
            // Objects outside this run never block it
            if !self.state.contains(&dep.object) {
                continue;
            }
            if !self.state.is_finished(&dep.object) {
                return Ok(false);
            }
            if let Some(ready) = &dep.ready {
                if !ready(&dep.object)? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn emit(&self, object: T, status: OutcomeStatus<R>) {
        let _ = self.tx.send(Event::Outcome(Outcome { object, status }));
    }

    fn spawn(&self, object: T) {
        let action = Arc::clone(&self.action);
        let fail_check = self.fail_check.clone();
        let local = self.local.clone();
        let global = self.global.clone();
        let tx = self.tx.clone();
        let target = object.clone();

        let spawned = thread::Builder::new()
            .name(format!("parallel-{}", object))
            .spawn(move || produce(target, action, fail_check, local, global, tx));

        if let Err(e) = spawned {
            tracing::warn!("Failed to start worker for {}: {}", object, e);
            self.emit(
                object,
                OutcomeStatus::Failed(ExecError::Other(anyhow::anyhow!(
                    "failed to start worker thread: {}",
                    e
                ))),
            );
        }
    }
}

/// Body of a producer thread: run the action on one object while holding
/// both the run's own limit and the process-wide one.
fn produce<T, R>(
    object: T,
    action: Action<T, R>,
    fail_check: Option<FailCheck<T, R>>,
    local: LocalLimit,
    global: Option<Arc<GlobalLimit>>,
    tx: Sender<Event<T, R>>,
) where
    T: Object,
    R: Send + 'static,
{
    let outcome = {
        let _local = local.acquire();
        let _global = global.as_ref().map(|limit| limit.current().acquire());
        panic::catch_unwind(AssertUnwindSafe(|| action(&object)))
    };

    // Permits are back before anyone hears about the outcome
    let status = match outcome {
        Ok(Ok(result)) => {
            let soft_failed = fail_check
                .as_ref()
                .is_some_and(|check| check(&object, &result));
            if soft_failed {
                OutcomeStatus::SoftFailed(result)
            } else {
                OutcomeStatus::Done(result)
            }
        }
        Ok(Err(e)) => OutcomeStatus::Failed(e),
        Err(payload) => OutcomeStatus::Failed(ExecError::Other(anyhow::anyhow!(
            "operation on {} panicked: {}",
            object,
            panic_message(payload.as_ref())
        ))),
    };

    let _ = tx.send(Event::Outcome(Outcome { object, status }));
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl<T, R> Iterator for ParallelIter<T, R>
where
    T: Object,
    R: Send + 'static,
{
    type Item = Result<Outcome<T, R>, ExecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            if self.shutdown.requested() {
                self.done = true;
                return Some(Err(ExecError::Shutdown));
            }

            self.feed();

            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(Event::Stop) | Err(RecvTimeoutError::Disconnected) => {
                    self.done = true;
                    return None;
                }
                Ok(Event::Outcome(outcome)) => {
                    if outcome.is_success() {
                        tracing::debug!("Finished processing: {}", outcome.object);
                        self.state.mark_finished(&outcome.object);
                    } else {
                        tracing::debug!("Failed: {}", outcome.object);
                        self.state.mark_failed(&outcome.object);
                    }
                    return Some(Ok(outcome));
                }
                Err(RecvTimeoutError::Timeout) => continue,
            }
        }
    }
}

/// Builder for a parallel run
pub struct ParallelExecution<T, R> {
    objects: Vec<T>,
    action: Action<T, R>,
    name: NameFn<T>,
    message: Option<String>,
    dependencies: DependencyFn<T>,
    limit: Option<usize>,
    fail_check: Option<FailCheck<T, R>>,
    global: bool,
}

impl<T, R> ParallelExecution<T, R>
where
    T: Object,
    R: Send + 'static,
{
    pub fn new<I, F>(objects: I, action: F) -> Self
    where
        I: IntoIterator<Item = T>,
        F: Fn(&T) -> Result<R, ExecError> + Send + Sync + 'static,
    {
        Self {
            objects: objects.into_iter().collect(),
            action: Arc::new(action),
            name: Box::new(|object: &T| object.to_string()),
            message: None,
            dependencies: Box::new(|_: &T| Vec::new()),
            limit: None,
            fail_check: None,
            global: true,
        }
    }

    /// Display name of an object, used for progress lines and error keys
    pub fn name<F>(mut self, name: F) -> Self
    where
        F: Fn(&T) -> String + Send + 'static,
    {
        self.name = Box::new(name);
        self
    }

    /// Progress message, e.g. "Starting". Without one nothing is displayed.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn dependencies<F>(mut self, dependencies: F) -> Self
    where
        F: Fn(&T) -> Vec<Dependency<T>> + Send + 'static,
    {
        self.dependencies = Box::new(dependencies);
        self
    }

    /// Bound concurrency within this run only
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Do not take a process-wide permit for the actions of this run.
    /// For runs whose actions only start nested runs: the leaves hold the
    /// permits, so an outer action never sits on one while waiting for them.
    pub fn without_global_limit(mut self) -> Self {
        self.global = false;
        self
    }

    pub fn fail_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&T, &R) -> bool + Send + Sync + 'static,
    {
        self.fail_check = Some(Arc::new(check));
        self
    }

    /// Lazy outcome stream. Nothing is displayed.
    pub fn iter(self, ctx: &ExecContext) -> Result<ParallelIter<T, R>, ExecError> {
        ParallelIter::new(
            ctx,
            self.objects,
            self.action,
            self.dependencies,
            self.limit,
            self.fail_check,
            self.global,
        )
    }

    /// Run to completion, reporting progress through the context's writer.
    ///
    /// Every independent branch runs to the end. Afterwards an unrecognized
    /// error, or else a missing image, is returned as the error of the whole
    /// run; recognized errors only end up in the error map.
    pub fn run(self, ctx: &ExecContext) -> Result<Collected<R>, ExecError> {
        let ParallelExecution {
            objects,
            action,
            name,
            message,
            dependencies,
            limit,
            fail_check,
            global,
        } = self;

        let events =
            ParallelIter::new(ctx, objects, action, dependencies, limit, fail_check, global)?;
        let writer = ctx.writer();

        if let Some(msg) = message.as_deref() {
            let names: Vec<String> = events.objects().iter().map(|object| name(object)).collect();
            writer.register(msg, &names);
        }

        let mut results = Vec::new();
        let mut errors = BTreeMap::new();
        let reraise = watch(events, &writer, &mut errors, &mut results, message.as_deref(), &name)?;

        for (object_name, error) in &errors {
            writer.write_raw(&format!("\nERROR: for {}  {}\n", object_name, error));
        }

        match reraise {
            Some(e) => Err(e),
            None => Ok((results, errors)),
        }
    }
}

/// Consume outcomes, update the display and fill `errors` and `results`.
/// Returns the error to raise once everything has finished.
fn watch<T, R>(
    events: ParallelIter<T, R>,
    writer: &ProgressWriter,
    errors: &mut BTreeMap<String, String>,
    results: &mut Vec<R>,
    msg: Option<&str>,
    name: &NameFn<T>,
) -> Result<Option<ExecError>, ExecError>
where
    T: Object,
    R: Send + 'static,
{
    let mut reraise: Option<ExecError> = None;
    let report = |object_name: &str, status: ProgressStatus| {
        if let Some(msg) = msg {
            writer.write(msg, object_name, status);
        }
    };

    for event in events {
        let Outcome { object, status } = event?;
        let object_name = name(&object);

        match status {
            OutcomeStatus::Done(result) => {
                report(&object_name, ProgressStatus::Done);
                results.push(result);
            }
            OutcomeStatus::SoftFailed(result) => {
                report(&object_name, ProgressStatus::Failed);
                results.push(result);
            }
            OutcomeStatus::Failed(ExecError::Upstream) => {
                report(&object_name, ProgressStatus::Error);
            }
            OutcomeStatus::Failed(e) if e.is_image_not_found() => {
                // Surfaced to the caller so it can offer to pull or rebuild
                errors.insert(object_name.clone(), e.to_string());
                report(&object_name, ProgressStatus::Error);
                if reraise.is_none() {
                    reraise = Some(e);
                }
            }
            OutcomeStatus::Failed(e) if e.is_recognized() => {
                errors.insert(object_name.clone(), e.to_string());
                report(&object_name, ProgressStatus::Error);
            }
            OutcomeStatus::Failed(e) => {
                errors.insert(object_name.clone(), e.to_string());
                report(&object_name, ProgressStatus::Error);
                let replace = reraise.as_ref().map_or(true, ExecError::is_image_not_found);
                if replace {
                    reraise = Some(e);
                }
            }
        }
    }

    Ok(reraise)
}

/// Run `action` on every object with no dependencies between them
pub fn parallel_execute<T, R, I, F, N>(
    ctx: &ExecContext,
    objects: I,
    action: F,
    name: N,
    msg: &str,
) -> Result<Collected<R>, ExecError>
where
    T: Object,
    R: Send + 'static,
    I: IntoIterator<Item = T>,
    F: Fn(&T) -> Result<R, ExecError> + Send + Sync + 'static,
    N: Fn(&T) -> String + Send + 'static,
{
    ParallelExecution::new(objects, action)
        .name(name)
        .message(msg)
        .run(ctx)
}

fn display_list<T: fmt::Display>(objects: &[T]) -> String {
    objects
        .iter()
        .map(|o| o.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
