use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};
use nix::sys::signal::{self, SaFlags, SigHandler, SigSet, Signal};
use nix::unistd::Pid;

use shmrpc::codec::{Codec, Payload};
use shmrpc::config::RegistryConfig;
use shmrpc::registry::{ServiceFactory, ServiceRegistry};
use shmrpc::resource::ResourceManager;
use shmrpc::worker::{MethodTable, Worker};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the registry and block until interrupted
    Run(RunArgs),
    /// Print registered worker pids for each configured service
    Status(ConfigArgs),
    /// Gracefully stop one or all services
    Stop(StopArgs),
    /// Internal: run a single worker process for one service. Launched by
    /// the supervisor via `std::process::Command`, not meant to be typed
    /// by hand.
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Args)]
struct RunArgs {
    config: PathBuf,
}

#[derive(Args)]
struct ConfigArgs {
    config: PathBuf,
}

#[derive(Args)]
struct StopArgs {
    config: PathBuf,
    #[arg(long)]
    service: Option<String>,
}

#[derive(Args)]
struct WorkerArgs {
    #[arg(long)]
    service: String,
    #[arg(long)]
    config: PathBuf,
}

/// Method tables a worker process can be built from, keyed by the
/// `import_from` name in a service's config entry. Embedders that link
/// this crate as a library register their own factories with
/// `ServiceRegistry::new` directly; the CLI binary only knows the
/// built-in demo service.
fn builtin_factories() -> HashMap<String, ServiceFactory> {
    let mut factories: HashMap<String, ServiceFactory> = HashMap::new();
    factories.insert("echo_service".to_string(), Arc::new(echo_method_table));
    factories
}

fn echo_method_table() -> MethodTable {
    let mut table = MethodTable::new();
    table.register("echo", Codec::Raw, |payload| Ok(payload));
    table
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_shutdown_signal(_: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() -> std::io::Result<()> {
    let action = signal::SigAction::new(
        SigHandler::Handler(handle_shutdown_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        signal::sigaction(Signal::SIGINT, &action)
            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
        signal::sigaction(Signal::SIGTERM, &action)
            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    }
    Ok(())
}

fn run(args: RunArgs) -> ExitCode {
    let registry = match ServiceRegistry::new(&args.config, builtin_factories()) {
        Ok(registry) => registry,
        Err(e) => {
            error!("failed to load config '{}': {e}", args.config.display());
            return ExitCode::from(1);
        }
    };

    for name in registry.service_names() {
        if let Err(e) = registry.start(&name) {
            error!("failed to start service '{name}': {e}");
            return ExitCode::from(2);
        }
        info!("started service '{name}'");
    }

    if let Err(e) = install_signal_handlers() {
        warn!("failed to install signal handlers: {e}");
    }

    while !SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    info!("shutting down");
    registry.stop_all();
    ExitCode::from(0)
}

fn status(args: ConfigArgs) -> ExitCode {
    let config = match RegistryConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load config '{}': {e}", args.config.display());
            return ExitCode::from(1);
        }
    };

    for (name, service) in &config.services {
        let manager = ResourceManager::new(service.port);
        match manager.server_pids() {
            Ok(table) => {
                let pids = table.list();
                println!("{name} (port {}): {} worker(s) {:?}", service.port, pids.len(), pids);
            }
            Err(e) => println!("{name} (port {}): error reading worker table: {e}", service.port),
        }
    }
    ExitCode::from(0)
}

fn stop(args: StopArgs) -> ExitCode {
    let config = match RegistryConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load config '{}': {e}", args.config.display());
            return ExitCode::from(1);
        }
    };

    let targets: Vec<(&String, &shmrpc::config::ServiceConfig)> = match &args.service {
        Some(name) => match config.services.get(name) {
            Some(service) => vec![(name, service)],
            None => {
                error!("no such service '{name}' in config");
                return ExitCode::from(2);
            }
        },
        None => config.services.iter().collect(),
    };

    for (name, service) in targets {
        let manager = ResourceManager::new(service.port);
        match manager.server_pids() {
            Ok(table) => {
                for pid in table.list() {
                    info!("{name}: signalling worker pid={pid}");
                    let _ = signal::kill(Pid::from_raw(pid), Signal::SIGINT);
                }
            }
            Err(e) => warn!("{name}: failed to read worker table: {e}"),
        }
    }
    ExitCode::from(0)
}

fn worker(args: WorkerArgs) -> ExitCode {
    let config = match RegistryConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load config '{}': {e}", args.config.display());
            return ExitCode::from(1);
        }
    };

    let Some(service) = config.services.get(&args.service) else {
        error!("no such service '{}' in config", args.service);
        return ExitCode::from(1);
    };

    let factories = builtin_factories();
    let Some(factory) = factories.get(&service.import_from) else {
        error!("no service factory registered for '{}'", service.import_from);
        return ExitCode::from(1);
    };

    let worker = Worker::new(service.port, factory());
    if let Err(e) = worker.install_signal_handlers() {
        warn!("failed to install signal handlers: {e}");
    }
    if let Err(e) = worker.run() {
        error!("worker for service '{}' exited with error: {e}", args.service);
        return ExitCode::from(2);
    }
    ExitCode::from(0)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(if cli.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    match cli.command {
        Commands::Run(args) => run(args),
        Commands::Status(args) => status(args),
        Commands::Stop(args) => stop(args),
        Commands::Worker(args) => worker(args),
    }
}
