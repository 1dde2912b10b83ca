//! Convoy - multi-container orchestration for compose projects
//!
//! This is the main CLI entry point for Convoy.

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use convoy::compose::config::parse_duration;
use convoy::compose::{
    project_dir, BuildAction, ComposeConfig, ComposeParser, LogSettings, Project, PullPolicy,
    UpOptions,
};
use convoy::container::ContainerManager;
use convoy::engine::{ContainerRef, Engine, LogOptions};
use convoy::error::{ApiError, ConvoyError};
use convoy::parallel::ExecContext;
use convoy::progress::AnsiMode;
use convoy::settings::{parse_parallel_limit, Settings};
use convoy::signals::wait_for_shutdown_signal;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

/// Interrupts after which the process exits without cleaning up
const FORCE_EXIT_SIGNALS: usize = 3;

/// Convoy - run multi-container projects from compose files
#[derive(Parser)]
#[command(name = "convoy")]
#[command(version)]
#[command(about = "Define and run multi-container projects from compose files", long_about = None)]
struct Cli {
    /// Compose file (repeatable; later files override earlier ones)
    #[arg(short = 'f', long = "file", global = true)]
    files: Vec<PathBuf>,

    /// Project name (defaults to the directory name)
    #[arg(short = 'p', long = "project-name", global = true)]
    project_name: Option<String>,

    /// When to print ANSI control characters
    #[arg(long, value_enum, global = true)]
    ansi: Option<AnsiMode>,

    /// Maximum number of concurrent engine operations
    #[arg(long, global = true)]
    parallel: Option<String>,

    /// Show more output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding the engine state
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and start containers
    Up(UpArgs),

    /// Start existing containers
    Start {
        services: Vec<String>,
    },

    /// Stop running containers
    Stop {
        services: Vec<String>,
        /// Shutdown timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Restart containers
    Restart {
        services: Vec<String>,
        /// Shutdown timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Kill containers
    Kill {
        services: Vec<String>,
        /// Signal to send
        #[arg(short, long, default_value = "SIGKILL")]
        signal: String,
    },

    /// Pause containers
    Pause {
        services: Vec<String>,
    },

    /// Unpause containers
    Unpause {
        services: Vec<String>,
    },

    /// Remove stopped containers
    Rm {
        services: Vec<String>,
        /// Don't ask to confirm removal
        #[arg(short, long)]
        force: bool,
        /// Stop the containers, if required, before removing
        #[arg(short, long)]
        stop: bool,
    },

    /// Stop and remove containers
    Down {
        /// Shutdown timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Build service images
    Build {
        services: Vec<String>,
    },

    /// View output from containers
    Logs(LogsArgs),

    /// List containers
    Ps {
        services: Vec<String>,
        /// Show all stopped containers
        #[arg(short, long)]
        all: bool,
        /// Only display IDs
        #[arg(short, long)]
        quiet: bool,
    },

    /// Validate and view the compose file
    Config {
        /// Print the service names, one per line
        #[arg(long)]
        services: bool,
    },
}

#[derive(Args)]
struct UpArgs {
    services: Vec<String>,

    /// Run containers in the background
    #[arg(short, long, conflicts_with_all = ["abort_on_container_exit", "exit_code_from"])]
    detach: bool,

    /// Build images before starting containers
    #[arg(long, conflicts_with = "no_build")]
    build: bool,

    /// Don't build an image, even if it's missing
    #[arg(long)]
    no_build: bool,

    /// Pull image before running
    #[arg(long, value_enum)]
    pull: Option<PullPolicy>,

    /// Don't start linked services
    #[arg(long)]
    no_deps: bool,

    /// Don't start the services after creating them
    #[arg(long)]
    no_start: bool,

    /// Stops all containers if any container was stopped
    #[arg(long)]
    abort_on_container_exit: bool,

    /// Return the exit code of the selected service container
    #[arg(long)]
    exit_code_from: Option<String>,

    /// Shutdown timeout in seconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Produce monochrome output
    #[arg(long)]
    no_color: bool,

    /// Don't print prefix in logs
    #[arg(long)]
    no_log_prefix: bool,

    /// Show timestamps
    #[arg(long)]
    timestamps: bool,
}

#[derive(Args)]
struct LogsArgs {
    services: Vec<String>,

    /// Follow log output
    #[arg(short, long)]
    follow: bool,

    /// Number of lines to show from the end of the logs, or "all"
    #[arg(long)]
    tail: Option<String>,

    /// Show logs since a timestamp (RFC 3339) or relative duration (e.g. 10m)
    #[arg(long)]
    since: Option<String>,

    /// Show timestamps
    #[arg(short, long)]
    timestamps: bool,

    /// Produce monochrome output
    #[arg(long)]
    no_color: bool,

    /// Don't print prefix in logs
    #[arg(long)]
    no_log_prefix: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    convoy::logging::init(cli.verbose);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("ERROR: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    let settings = Settings::from_env()?;
    let ctx = ExecContext::global();
    settings.apply(&ctx, cli.ansi);
    if let Some(parallel) = &cli.parallel {
        ctx.limit().set(Some(parse_parallel_limit(parallel)?));
    }

    let signal_ctx = Arc::clone(&ctx);
    tokio::spawn(async move {
        while wait_for_shutdown_signal().await.is_ok() {
            let shutdown = signal_ctx.shutdown();
            shutdown.trigger();
            if shutdown.count() >= FORCE_EXIT_SIGNALS {
                std::process::exit(130);
            }
        }
    });

    tokio::task::spawn_blocking(move || execute(cli, settings, ctx))
        .await
        .context("command handler panicked")?
}

/// Run a command on a blocking thread
fn execute(cli: Cli, settings: Settings, ctx: Arc<ExecContext>) -> anyhow::Result<u8> {
    let files = compose_files(&cli, &settings)?;
    let parser = ComposeParser::new();
    let config = parser.parse_files(&files)?;

    if let Commands::Config { services } = &cli.command {
        print_config(&config, *services)?;
        return Ok(0);
    }

    let working_dir = project_dir(&files);
    let explicit_name = cli.project_name.clone().or_else(|| settings.project_name.clone());
    let name = Project::resolve_name(explicit_name.as_deref(), &config, &working_dir)?;
    let project = Project::from_config(&name, &config, open_engine(&cli)?, ctx, &working_dir)?;

    match cli.command {
        Commands::Up(args) => up(&project, args, &settings),
        Commands::Start { services } => {
            project.start(&services)?;
            Ok(0)
        }
        Commands::Stop { services, timeout } => {
            project.stop(&services, timeout.map(Duration::from_secs))?;
            Ok(0)
        }
        Commands::Restart { services, timeout } => {
            project.restart(&services, timeout.map(Duration::from_secs))?;
            Ok(0)
        }
        Commands::Kill { services, signal } => {
            project.kill(&services, &signal)?;
            Ok(0)
        }
        Commands::Pause { services } => {
            project.pause(&services)?;
            Ok(0)
        }
        Commands::Unpause { services } => {
            project.unpause(&services)?;
            Ok(0)
        }
        Commands::Rm {
            services,
            force,
            stop,
        } => rm(&project, &services, force, stop),
        Commands::Down { timeout } => {
            project.down(timeout.map(Duration::from_secs))?;
            Ok(0)
        }
        Commands::Build { services } => {
            project.build(&services)?;
            Ok(0)
        }
        Commands::Logs(args) => logs(&project, args, &settings),
        Commands::Ps {
            services,
            all,
            quiet,
        } => ps(&project, &services, all, quiet),
        Commands::Config { .. } => Ok(0),
    }
}

fn compose_files(cli: &Cli, settings: &Settings) -> anyhow::Result<Vec<PathBuf>> {
    if !cli.files.is_empty() {
        return Ok(cli.files.clone());
    }
    if !settings.compose_files.is_empty() {
        return Ok(settings.compose_files.clone());
    }

    let cwd = std::env::current_dir()?;
    match ComposeParser::find_compose_file(&cwd) {
        Some(file) => Ok(vec![file]),
        None => bail!(
            "Can't find a suitable configuration file in this directory. \
             Are you in the right directory?"
        ),
    }
}

fn open_engine(cli: &Cli) -> anyhow::Result<Arc<dyn Engine>> {
    let state_dir = cli
        .state_dir
        .clone()
        .or_else(ContainerManager::default_state_dir);

    let manager = match state_dir {
        Some(dir) => ContainerManager::open(&dir)
            .with_context(|| format!("failed to open engine state in {}", dir.display()))?,
        None => {
            tracing::warn!("No data directory available, containers will not persist");
            ContainerManager::new()
        }
    };
    Ok(Arc::new(manager))
}

fn up(project: &Project, args: UpArgs, settings: &Settings) -> anyhow::Result<u8> {
    let timeout = args.timeout.map(Duration::from_secs);
    match up_attached(project, &args, settings) {
        Err(e) if is_shutdown(&e) => graceful_stop(project, timeout),
        result => result,
    }
}

fn up_attached(project: &Project, args: &UpArgs, settings: &Settings) -> anyhow::Result<u8> {
    let timeout = args.timeout.map(Duration::from_secs);
    let mut options = UpOptions {
        services: args.services.clone(),
        include_deps: !args.no_deps,
        build: if args.build {
            BuildAction::Force
        } else if args.no_build {
            BuildAction::Skip
        } else {
            BuildAction::None
        },
        pull: args.pull,
        start: !args.no_start,
        timeout,
    };

    let containers = match project.up(&options) {
        Err(ConvoyError::Api(ApiError::ImageNotFound(image))) => {
            eprintln!("The image {} for a service could not be found.", image);
            if !confirm("Continue with the new image? [yN]")? {
                bail!("Aborting.");
            }
            options.pull = Some(PullPolicy::Always);
            project.up(&options)?
        }
        result => result?,
    };

    if args.detach || args.no_start {
        return Ok(0);
    }

    let attached: Vec<ContainerRef> = containers
        .into_iter()
        .filter(|c| args.services.is_empty() || args.services.contains(&c.service))
        .collect();
    let cascade = args.abort_on_container_exit || args.exit_code_from.is_some();

    let log_settings = LogSettings {
        monochrome: args.no_color || settings.no_color,
        no_prefix: args.no_log_prefix,
        options: LogOptions {
            follow: true,
            timestamps: args.timestamps,
            ..LogOptions::default()
        },
    };
    let starter = project
        .log_printer(attached.clone(), &log_settings, Box::new(io::stdout()))
        .events(project.events()?)
        .cascade_stop(cascade)
        .run()?;

    if !cascade {
        return Ok(0);
    }

    eprintln!("Aborting on container exit...");
    project.stop(&[], timeout)?;
    let code =
        project.compute_exit_code(args.exit_code_from.as_deref(), &attached, starter.as_deref())?;
    Ok(exit_status(code))
}

/// First interrupt: stop the project. A second one while stopping kills it.
fn graceful_stop(project: &Project, timeout: Option<Duration>) -> anyhow::Result<u8> {
    eprintln!("Gracefully stopping... (press Ctrl+C again to force)");
    match project.stop(&[], timeout) {
        Ok(()) => Ok(0),
        Err(ConvoyError::Shutdown) => {
            project.kill(&[], "SIGKILL")?;
            Ok(2)
        }
        Err(e) => Err(e.into()),
    }
}

fn print_config(config: &ComposeConfig, services: bool) -> anyhow::Result<()> {
    if services {
        for name in config.services.keys() {
            println!("{}", name);
        }
    } else {
        print!("{}", serde_yaml::to_string(config)?);
    }
    Ok(())
}

fn rm(project: &Project, services: &[String], force: bool, stop: bool) -> anyhow::Result<u8> {
    if stop {
        project.stop(services, None)?;
    }

    let mut stopped = Vec::new();
    for container in project.containers(services, true)? {
        if !project.engine().inspect(&container.id)?.is_running() {
            stopped.push(container.name);
        }
    }

    if stopped.is_empty() {
        eprintln!("No stopped containers");
        return Ok(0);
    }

    if !force {
        eprintln!("Going to remove {}", stopped.join(", "));
        if !confirm("Are you sure? [yN]")? {
            return Ok(0);
        }
    }
    project.remove_stopped(services)?;
    Ok(0)
}

fn logs(project: &Project, args: LogsArgs, settings: &Settings) -> anyhow::Result<u8> {
    let options = LogOptions {
        follow: args.follow,
        tail: args.tail.as_deref().map(parse_tail).transpose()?.flatten(),
        since: args.since.as_deref().map(parse_since).transpose()?,
        timestamps: args.timestamps,
    };
    let log_settings = LogSettings {
        monochrome: args.no_color || settings.no_color,
        no_prefix: args.no_log_prefix,
        options,
    };

    let containers = project.containers(&args.services, true)?;
    let mut printer = project.log_printer(containers, &log_settings, Box::new(io::stdout()));
    if args.follow {
        printer = printer.events(project.events()?);
    }

    match printer.run() {
        Ok(_) | Err(ConvoyError::Shutdown) => Ok(0),
        Err(e) => Err(e.into()),
    }
}

fn ps(project: &Project, services: &[String], all: bool, quiet: bool) -> anyhow::Result<u8> {
    let containers = project.containers(services, all)?;
    if quiet {
        for container in containers {
            println!("{}", container.id);
        }
        return Ok(0);
    }

    let mut rows = vec![(
        "Name".to_string(),
        "Service".to_string(),
        "State".to_string(),
    )];
    for container in containers {
        let state = project.engine().inspect(&container.id)?;
        rows.push((container.name, container.service, state.human_readable()));
    }

    let name_width = rows.iter().map(|r| r.0.len()).max().unwrap_or(0);
    let service_width = rows.iter().map(|r| r.1.len()).max().unwrap_or(0);
    for (i, (name, service, state)) in rows.iter().enumerate() {
        println!("{:<name_width$}   {:<service_width$}   {}", name, service, state);
        if i == 0 {
            println!("{}", "-".repeat(name_width + service_width + 6 + "State".len()));
        }
    }
    Ok(0)
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    eprint!("{} ", prompt);
    io::stderr().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes" | "Yes" | "YES"))
}

fn is_shutdown(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<ConvoyError>(), Some(ConvoyError::Shutdown))
}

/// `--tail` value: a line count or `all`
fn parse_tail(value: &str) -> anyhow::Result<Option<usize>> {
    if value.eq_ignore_ascii_case("all") {
        return Ok(None);
    }
    let lines = value
        .parse()
        .map_err(|_| ConvoyError::Usage(format!("invalid --tail value \"{}\"", value)))?;
    Ok(Some(lines))
}

/// `--since` value: an RFC 3339 timestamp or a duration before now
fn parse_since(value: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(time) = DateTime::parse_from_rfc3339(value) {
        return Ok(time.with_timezone(&Utc));
    }
    let ago = parse_duration(value)
        .map_err(|_| ConvoyError::Usage(format!("invalid --since value \"{}\"", value)))?;
    Ok(Utc::now() - chrono::Duration::from_std(ago)?)
}

/// Process exit status for a container exit code
fn exit_status(code: i64) -> u8 {
    u8::try_from(code).unwrap_or(1)
}
