//! Merging the output of many containers into one stream
//!
//! Every attached container gets a tailing thread that pushes presented
//! lines onto a shared queue. A watcher thread follows engine events to
//! attach containers that start later (or restart after a crash) and to
//! forget containers that stop. The caller's thread drains the queue.

use super::presenter::{LogPresenter, PresenterCycle};
use super::split::split_buffer;
use crate::engine::{ContainerRef, Engine, EventAction, EventStream, LogOptions};
use crate::error::{ApiError, ConvoyError, Result};
use crate::parallel::POLL_INTERVAL;
use crate::signals::ShutdownWatch;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

enum QueueItem {
    Line(String),
    /// The named container's stream is exhausted
    Stop(String),
    Error(ApiError),
}

type ThreadMap = Arc<Mutex<HashMap<String, JoinHandle<()>>>>;

/// Everything a tailing thread needs besides its container
#[derive(Clone)]
struct TailArgs {
    engine: Arc<dyn Engine>,
    options: LogOptions,
    queue: Sender<QueueItem>,
}

/// Prints the interleaved logs of a set of containers
pub struct LogPrinter {
    containers: Vec<ContainerRef>,
    presenters: PresenterCycle,
    engine: Arc<dyn Engine>,
    events: Option<EventStream>,
    output: Box<dyn Write + Send>,
    cascade_stop: bool,
    log_options: LogOptions,
    shutdown: Option<ShutdownWatch>,
}

impl LogPrinter {
    pub fn new(
        containers: Vec<ContainerRef>,
        presenters: PresenterCycle,
        engine: Arc<dyn Engine>,
        output: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            containers,
            presenters,
            engine,
            events: None,
            output,
            cascade_stop: false,
            log_options: LogOptions::default(),
            shutdown: None,
        }
    }

    /// Engine events used to attach and detach containers while running
    pub fn events(mut self, events: EventStream) -> Self {
        self.events = Some(events);
        self
    }

    /// Return as soon as one of the initial containers stops
    pub fn cascade_stop(mut self, cascade_stop: bool) -> Self {
        self.cascade_stop = cascade_stop;
        self
    }

    pub fn log_options(mut self, options: LogOptions) -> Self {
        self.log_options = options;
        self
    }

    pub fn shutdown(mut self, watch: ShutdownWatch) -> Self {
        self.shutdown = Some(watch);
        self
    }

    /// Print until every stream has ended. In cascade mode, returns the name
    /// of the first initial container whose stream ended.
    pub fn run(mut self) -> Result<Option<String>> {
        if self.containers.is_empty() {
            return Ok(None);
        }

        let (tx, rx) = channel::unbounded();
        let args = TailArgs {
            engine: Arc::clone(&self.engine),
            options: self.log_options.clone(),
            queue: tx,
        };

        let thread_map: ThreadMap = Arc::new(Mutex::new(HashMap::new()));
        for container in &self.containers {
            let presenter = self
                .presenters
                .next()
                .unwrap_or_else(|| LogPresenter::new(0, None, true));
            let handle = build_thread(container.clone(), presenter, args.clone())?;
            thread_map.lock().insert(container.id.clone(), handle);
        }

        if let Some(events) = self.events.take() {
            let watcher = EventWatcher {
                thread_map: Arc::clone(&thread_map),
                presenters: self.presenters.clone(),
                args,
                seen: self.containers.iter().map(|c| c.id.clone()).collect(),
            };
            thread::Builder::new()
                .name("log-events".to_string())
                .spawn(move || watcher.watch(events))?;
        } else {
            drop(args);
        }

        self.consume(rx, &thread_map)
    }

    fn consume(&mut self, rx: Receiver<QueueItem>, thread_map: &ThreadMap) -> Result<Option<String>> {
        let initial: HashSet<String> = self.containers.iter().map(|c| c.name.clone()).collect();

        loop {
            if self.shutdown.as_ref().is_some_and(ShutdownWatch::requested) {
                return Err(ConvoyError::Shutdown);
            }

            let item = rx.recv_timeout(POLL_INTERVAL);
            thread_map.lock().retain(|_, handle| !handle.is_finished());

            match item {
                Ok(QueueItem::Line(line)) => self.write(&line)?,
                Ok(QueueItem::Error(e)) => return Err(e.into()),
                Ok(QueueItem::Stop(name)) => {
                    if self.cascade_stop && initial.contains(&name) {
                        return Ok(Some(name));
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if thread_map.lock().is_empty() {
                        return Ok(None);
                    }
                }
                // No readers and no event watcher left
                Err(RecvTimeoutError::Disconnected) => return Ok(None),
            }
        }
    }

    fn write(&mut self, line: &str) -> Result<()> {
        self.output.write_all(line.as_bytes())?;
        self.output.flush()?;
        Ok(())
    }
}

struct EventWatcher {
    thread_map: ThreadMap,
    presenters: PresenterCycle,
    args: TailArgs,
    /// Containers attached at some point; their earlier output is not replayed
    seen: HashSet<String>,
}

impl EventWatcher {
    fn watch(mut self, events: EventStream) {
        let mut crashed = HashSet::new();

        for event in events {
            match event.action {
                EventAction::Stop => {
                    self.thread_map.lock().remove(&event.id);
                    continue;
                }
                EventAction::Die => {
                    self.thread_map.lock().remove(&event.id);
                    crashed.insert(event.id.clone());
                    continue;
                }
                EventAction::Start => {}
                _ => continue,
            }

            {
                let mut map = self.thread_map.lock();
                if let Some(handle) = map.get(&event.id) {
                    if !handle.is_finished() {
                        continue;
                    }
                    // stopped and started again, needs a new reader
                    map.remove(&event.id);
                }
            }

            if crashed.remove(&event.id) {
                tracing::debug!("Reattaching to {} after it crashed", event.container);
            }

            let mut args = self.args.clone();
            if !self.seen.insert(event.id.clone()) {
                args.options.since = Some(event.time);
                args.options.tail = None;
            }

            let presenter = self
                .presenters
                .next()
                .unwrap_or_else(|| LogPresenter::new(0, None, true));
            match build_thread(event.container.clone(), presenter, args) {
                Ok(handle) => {
                    self.thread_map.lock().insert(event.id.clone(), handle);
                }
                Err(e) => tracing::warn!("Failed to attach to {}: {}", event.container, e),
            }
        }
    }
}

fn build_thread(
    container: ContainerRef,
    presenter: LogPresenter,
    args: TailArgs,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("logs-{}", container.name))
        .spawn(move || tail_container_logs(container, presenter, args))
}

fn tail_container_logs(container: ContainerRef, presenter: LogPresenter, args: TailArgs) {
    let TailArgs {
        engine,
        options,
        queue,
    } = args;

    let stream = if container.has_api_logs() {
        match engine.logs(&container.id, &options) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = queue.send(QueueItem::Error(e));
                return;
            }
        }
    } else {
        let warning = format!(
            "WARNING: no logs are available with the '{}' log driver\n",
            container.log_driver.as_deref().unwrap_or_default()
        );
        Box::new(std::iter::once(Ok(warning.into_bytes())))
    };

    for line in split_buffer(stream) {
        match line {
            Ok(line) => {
                let _ = queue.send(QueueItem::Line(presenter.present(&container, &line)));
            }
            Err(e) => {
                let _ = queue.send(QueueItem::Error(e));
                return;
            }
        }
    }

    if options.follow {
        let status = wait_on_exit(engine.as_ref(), &container);
        let _ = queue.send(QueueItem::Line(presenter.color_text(&status)));
    }
    let _ = queue.send(QueueItem::Stop(container.name.clone()));
}

fn wait_on_exit(engine: &dyn Engine, container: &ContainerRef) -> String {
    match engine.wait(&container.id) {
        Ok(exit_code) => format!("{} exited with code {}\n", container.name, exit_code),
        Err(e) => {
            let body = e.explanation();
            format!(
                "Unexpected API error for {} (HTTP code {})\nResponse body:\n{}\n",
                container.name,
                e.status_code(),
                if body.is_empty() { "[empty]" } else { body.as_str() }
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerConfig, ContainerManager};
    use crate::engine::{LABEL_CONTAINER_NUMBER, LABEL_PROJECT, LABEL_SERVICE};
    use crate::engine::EventFilter;
    use crate::logs::build_log_presenters;
    use crate::signals::Shutdown;
    use crate::test_utils::{ScriptedEngine, SharedBuffer};
    use std::time::Duration;

    fn container(service: &str) -> ContainerRef {
        ContainerRef {
            id: format!("{}-id", service),
            name: format!("proj-{}-1", service),
            project: "proj".to_string(),
            service: service.to_string(),
            number: 1,
            log_driver: None,
        }
    }

    fn printer(containers: Vec<ContainerRef>, engine: Arc<dyn Engine>, out: &SharedBuffer) -> LogPrinter {
        let services: Vec<String> = containers.iter().map(|c| c.service.clone()).collect();
        LogPrinter::new(
            containers,
            build_log_presenters(&services, true, true),
            engine,
            Box::new(out.clone()),
        )
    }

    fn follow() -> LogOptions {
        LogOptions {
            follow: true,
            ..LogOptions::default()
        }
    }

    #[test]
    fn test_unterminated_last_line() {
        let engine = ScriptedEngine::new();
        engine.add_logs("web-id", &[b"hello\nworld"]);
        let out = SharedBuffer::new();

        let result = printer(vec![container("web")], Arc::new(engine), &out).run().unwrap();

        assert_eq!(result, None);
        let output = out.contents();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines, vec!["web-1  | hello", "web-1  | world"]);
        assert!(!output.contains("exited with code"));
    }

    #[test]
    fn test_per_source_order_preserved() {
        let engine = ScriptedEngine::new();
        let a: Vec<Vec<u8>> = (0..50).map(|i| format!("a{}\n", i).into_bytes()).collect();
        let b: Vec<Vec<u8>> = (0..50).map(|i| format!("b{}\nb", i).into_bytes()).collect();
        engine.add_log_chunks("a-id", a);
        engine.add_log_chunks("b-id", b);
        let out = SharedBuffer::new();

        printer(vec![container("a"), container("b")], Arc::new(engine), &out)
            .run()
            .unwrap();

        let output = out.contents();
        let of = |prefix: &str| -> Vec<String> {
            output
                .lines()
                .filter_map(|l| l.split_once(" | ").map(|(_, text)| text.to_string()))
                .filter(|text| text.starts_with(prefix))
                .collect()
        };
        let a_lines = of("a");
        assert_eq!(a_lines, (0..50).map(|i| format!("a{}", i)).collect::<Vec<_>>());
        // chunk boundaries glue "b" onto the next number
        let b_lines = of("b");
        assert_eq!(b_lines.first().map(String::as_str), Some("b0"));
        assert_eq!(b_lines.get(1).map(String::as_str), Some("bb1"));
        assert_eq!(b_lines.len(), 51);
    }

    #[test]
    fn test_follow_reports_exit_code() {
        let engine = ScriptedEngine::new();
        engine.add_logs("web-id", &[b"bye\n"]);
        engine.set_exit("web-id", Ok(3));
        let out = SharedBuffer::new();

        printer(vec![container("web")], Arc::new(engine), &out)
            .log_options(follow())
            .run()
            .unwrap();

        assert_eq!(out.contents(), "web-1  | bye\nproj-web-1 exited with code 3\n");
    }

    #[test]
    fn test_wait_failure_reported() {
        let engine = ScriptedEngine::new();
        engine.set_exit(
            "web-id",
            Err(ApiError::Status {
                code: 500,
                explanation: String::new(),
            }),
        );
        let out = SharedBuffer::new();

        printer(vec![container("web")], Arc::new(engine), &out)
            .log_options(follow())
            .run()
            .unwrap();

        assert_eq!(
            out.contents(),
            "Unexpected API error for proj-web-1 (HTTP code 500)\nResponse body:\n[empty]\n"
        );
    }

    #[test]
    fn test_log_error_aborts_run() {
        let engine = ScriptedEngine::new();
        engine.fail_logs("web-id", ApiError::NotFound("web-id".into()));
        let out = SharedBuffer::new();

        let result = printer(vec![container("web")], Arc::new(engine), &out).run();
        assert!(matches!(result, Err(ConvoyError::Api(ApiError::NotFound(_)))));
    }

    #[test]
    fn test_unreadable_log_driver_warns() {
        let engine = ScriptedEngine::new();
        let mut syslog = container("web");
        syslog.log_driver = Some("syslog".to_string());
        let out = SharedBuffer::new();

        printer(vec![syslog], Arc::new(engine), &out).run().unwrap();
        assert_eq!(
            out.contents(),
            "web-1  | WARNING: no logs are available with the 'syslog' log driver\n"
        );
    }

    #[test]
    fn test_no_containers() {
        let out = SharedBuffer::new();
        let result = printer(Vec::new(), Arc::new(ScriptedEngine::new()), &out).run().unwrap();
        assert_eq!(result, None);
        assert!(out.contents().is_empty());
    }

    fn start(manager: &ContainerManager, service: &str, script: &str) -> ContainerRef {
        let config = ContainerConfig::new(&format!("proj-{}-1", service), "busybox")
            .cmd(vec!["sh".into(), "-c".into(), script.into()])
            .label(LABEL_PROJECT, "proj")
            .label(LABEL_SERVICE, service)
            .label(LABEL_CONTAINER_NUMBER, "1");
        let container = manager.create(config).unwrap();
        manager.start(&container.id).unwrap();
        container
    }

    #[test]
    fn test_cascade_stop_returns_first_exited() {
        let manager = ContainerManager::new();
        manager.add_image("busybox");
        let server = start(&manager, "server", "nginx");
        let job = start(&manager, "job", "sleep 0.1; echo done; exit 2");
        let out = SharedBuffer::new();

        let result = printer(vec![server.clone(), job], Arc::new(manager.clone()), &out)
            .log_options(follow())
            .cascade_stop(true)
            .run()
            .unwrap();

        assert_eq!(result.as_deref(), Some("proj-job-1"));
        assert!(out.contents().contains("job-1     | done\n"));
        assert!(out.contents().contains("proj-job-1 exited with code 2\n"));
        assert!(manager.inspect(&server.id).unwrap().is_running());
    }

    #[test]
    fn test_restarted_container_is_reattached() {
        let manager = ContainerManager::new();
        manager.add_image("busybox");
        let server = start(&manager, "server", "nginx");
        let app = start(&manager, "app", "sleep 0.2; echo tick; exit 1");
        let events = manager.events(&EventFilter::project("proj")).unwrap();
        let out = SharedBuffer::new();

        let running = printer(vec![server.clone(), app.clone()], Arc::new(manager.clone()), &out)
            .log_options(follow())
            .events(events);
        let handle = thread::spawn(move || running.run());

        assert_eq!(manager.wait(&app.id).unwrap(), 1);
        thread::sleep(Duration::from_millis(300));
        manager.start(&app.id).unwrap();
        assert_eq!(manager.wait(&app.id).unwrap(), 1);
        thread::sleep(Duration::from_millis(300));
        manager.stop(&server.id, Duration::from_secs(1)).unwrap();

        assert_eq!(handle.join().unwrap().unwrap(), None);
        let output = out.contents();
        assert_eq!(output.matches("| tick").count(), 2);
        assert_eq!(output.matches("proj-app-1 exited with code 1").count(), 2);
        assert!(output.contains("proj-server-1 exited with code 0"));
    }

    #[test]
    fn test_container_started_later_is_attached() {
        let manager = ContainerManager::new();
        manager.add_image("busybox");
        let server = start(&manager, "server", "nginx");
        let events = manager.events(&EventFilter::project("proj")).unwrap();
        let out = SharedBuffer::new();

        let running = printer(vec![server.clone()], Arc::new(manager.clone()), &out)
            .log_options(follow())
            .events(events);
        let handle = thread::spawn(move || running.run());

        thread::sleep(Duration::from_millis(100));
        let late = start(&manager, "late", "echo hello; echo again; exit 0");
        assert_eq!(manager.wait(&late.id).unwrap(), 0);
        thread::sleep(Duration::from_millis(300));
        manager.stop(&server.id, Duration::from_secs(1)).unwrap();

        assert_eq!(handle.join().unwrap().unwrap(), None);
        let output = out.contents();
        // attached from the start of its output, not from the start event
        let late_lines: Vec<&str> = output
            .lines()
            .filter(|line| line.starts_with("late-1 "))
            .filter_map(|line| line.split_once(" | ").map(|(_, text)| text))
            .collect();
        assert_eq!(late_lines, vec!["hello", "again"]);
        assert!(output.contains("proj-late-1 exited with code 0"));
    }

    #[test]
    fn test_shutdown_interrupts() {
        let manager = ContainerManager::new();
        manager.add_image("busybox");
        let server = start(&manager, "server", "nginx");
        let shutdown = Shutdown::new();
        let out = SharedBuffer::new();

        let running = printer(vec![server], Arc::new(manager), &out)
            .log_options(follow())
            .shutdown(shutdown.watch());
        let handle = thread::spawn(move || running.run());
        thread::sleep(Duration::from_millis(50));
        shutdown.trigger();

        assert!(matches!(handle.join().unwrap(), Err(ConvoyError::Shutdown)));
    }
}
