//! Service registry (component G).
//!
//! Owns one [`crate::supervisor::Supervisor`] per configured service,
//! each driven by its own control-loop thread. `start`/`stop`/`restart`
//! mirror `MultiProcessServer::start_service`/`stop_service`/
//! `restart_service` in the original.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::config::RegistryConfig;
use crate::error::RegistryError;
use crate::supervisor::{Supervisor, MONITOR_PERIOD};
use crate::worker::MethodTable;

/// Builds the method table a worker process should serve for one
/// service. Repurposes the original's `import_from`/`section` (import a
/// module, instantiate a class) as a statically-registered factory the
/// embedding binary provides -- the closest faithful analogue available
/// without a scripting-language import system.
pub type ServiceFactory = Arc<dyn Fn() -> MethodTable + Send + Sync>;

struct SupervisorHandle {
    supervisor: Arc<Mutex<Supervisor>>,
    thread: JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

pub struct ServiceRegistry {
    config_path: PathBuf,
    config: RegistryConfig,
    factories: HashMap<String, ServiceFactory>,
    supervisors: Mutex<HashMap<String, SupervisorHandle>>,
}

impl ServiceRegistry {
    pub fn new(
        config_path: impl Into<PathBuf>,
        factories: HashMap<String, ServiceFactory>,
    ) -> Result<Self, RegistryError> {
        let config_path = config_path.into();
        let config = RegistryConfig::load(&config_path)?;
        Ok(Self {
            config_path,
            config,
            factories,
            supervisors: Mutex::new(HashMap::new()),
        })
    }

    pub fn service_names(&self) -> Vec<String> {
        self.config.services.keys().cloned().collect()
    }

    /// Start a configured service's supervisor. If `wait_until_completed`
    /// is set on its config (the default), blocks until the floor of
    /// `min_proc_num` workers has been spawned, matching
    /// `start_service`'s behavior for the initial batch.
    pub fn start(&self, name: &str) -> Result<(), RegistryError> {
        let mut supervisors = self.supervisors.lock();
        if supervisors.contains_key(name) {
            return Err(RegistryError::AlreadyRunning(name.to_string()));
        }

        let service = self
            .config
            .services
            .get(name)
            .ok_or_else(|| RegistryError::UnknownService(name.to_string()))?
            .clone();

        if !self.factories.contains_key(&service.import_from) {
            return Err(RegistryError::InvalidConfig(format!(
                "no service factory registered for '{}'",
                service.import_from
            )));
        }

        let config_path = self.config_path.clone();
        let service_name = name.to_string();
        let spawn = move || {
            std::process::Command::new(std::env::current_exe()?)
                .arg("worker")
                .arg("--service")
                .arg(&service_name)
                .arg("--config")
                .arg(&config_path)
                .spawn()
        };

        let mut supervisor = Supervisor::new(name, service.supervisor_config(), spawn);
        if service.wait_until_completed {
            supervisor.tick()?;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let supervisor = Arc::new(Mutex::new(supervisor));
        let thread = {
            let supervisor = Arc::clone(&supervisor);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    if let Err(e) = supervisor.lock().tick() {
                        log::warn!("supervisor tick failed: {e}");
                    }
                    thread::sleep(MONITOR_PERIOD);
                }
            })
        };

        supervisors.insert(
            name.to_string(),
            SupervisorHandle {
                supervisor,
                thread,
                stop,
            },
        );
        Ok(())
    }

    pub fn stop(&self, name: &str) -> Result<(), RegistryError> {
        let handle = {
            let mut supervisors = self.supervisors.lock();
            supervisors
                .remove(name)
                .ok_or_else(|| RegistryError::UnknownService(name.to_string()))?
        };
        handle.stop.store(true, Ordering::SeqCst);
        let _ = handle.thread.join();
        handle.supervisor.lock().shutdown_all();
        Ok(())
    }

    pub fn restart(&self, name: &str) -> Result<(), RegistryError> {
        self.stop(name)?;
        self.start(name)
    }

    pub fn stop_all(&self) {
        let names: Vec<String> = self.supervisors.lock().keys().cloned().collect();
        for name in names {
            if let Err(e) = self.stop(&name) {
                log::warn!("failed to stop service '{name}': {e}");
            }
        }
    }

    pub fn status(&self) -> Vec<(String, usize)> {
        self.supervisors
            .lock()
            .iter()
            .map(|(name, handle)| (name.clone(), handle.supervisor.lock().worker_count()))
            .collect()
    }
}

static GLOBAL: OnceLock<ServiceRegistry> = OnceLock::new();

/// Install the process-wide default registry. Optional convenience for
/// embedders that don't want to thread a `ServiceRegistry` through their
/// own code, mirroring `cylo::instance_manager`'s global instance
/// manager. Fails (returning the registry back) if one is already
/// installed.
pub fn install_global(registry: ServiceRegistry) -> Result<(), ServiceRegistry> {
    GLOBAL.set(registry)
}

pub fn global() -> Option<&'static ServiceRegistry> {
    GLOBAL.get()
}
