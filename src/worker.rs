//! Worker process (component E).
//!
//! A `Worker` owns the method table and polls the client-connection
//! directory (see `resource::ClientTable`) for new `(pid, qid)` pairs,
//! spawning one `channel::server` thread per connection and reaping
//! threads whose client has disappeared. Installs a `SIGINT`/`SIGTERM`
//! handler that lets in-flight connection threads finish their current
//! call before exiting, rather than killing them mid-request.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use nix::sys::signal::{self, SaFlags, SigHandler, SigSet, Signal};
use parking_lot::Mutex;

use crate::channel::server;
use crate::codec::{Codec, Payload};
use crate::error::{RemoteException, ResourceError};
use crate::resource::ResourceManager;

type Handler = dyn Fn(Payload) -> Result<Payload, RemoteException> + Send + Sync;

struct MethodEntry {
    codec: Codec,
    handler: Arc<Handler>,
}

/// Name-keyed table of the methods this worker exposes.
#[derive(Default)]
pub struct MethodTable {
    entries: HashMap<Vec<u8>, MethodEntry>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, codec: Codec, handler: F)
    where
        F: Fn(Payload) -> Result<Payload, RemoteException> + Send + Sync + 'static,
    {
        self.entries.insert(
            name.as_bytes().to_vec(),
            MethodEntry {
                codec,
                handler: Arc::new(handler),
            },
        );
    }

    pub fn codec_for(&self, cmd: &[u8]) -> Option<Codec> {
        self.entries.get(cmd).map(|e| e.codec)
    }

    pub fn dispatch(&self, cmd: &[u8], payload: Payload) -> Result<Payload, RemoteException> {
        match self.entries.get(cmd) {
            Some(entry) => (entry.handler)(payload),
            None => Err(RemoteException::UnknownMethod(
                String::from_utf8_lossy(cmd).into_owned(),
            )),
        }
    }
}

/// Reported by a connection thread after each call, carried over a
/// `crossbeam_channel` up to whoever is watching this worker (a
/// supervisor, in the common case).
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    CallCompleted {
        pid: i32,
        qid: u64,
        cmd: Vec<u8>,
        elapsed: Duration,
        ok: bool,
    },
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_shutdown_signal(_: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// How often the worker's accept loop polls the client-connection
/// directory for newly opened or closed connections.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct Worker {
    methods: Arc<MethodTable>,
    resource_manager: Arc<ResourceManager>,
    connections: Mutex<HashMap<(i32, u64), JoinHandle<()>>>,
    events_tx: Sender<WorkerEvent>,
    events_rx: Receiver<WorkerEvent>,
}

impl Worker {
    pub fn new(port: u16, methods: MethodTable) -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            methods: Arc::new(methods),
            resource_manager: Arc::new(ResourceManager::new(port)),
            connections: Mutex::new(HashMap::new()),
            events_tx,
            events_rx,
        }
    }

    pub fn port(&self) -> u16 {
        self.resource_manager.port()
    }

    pub fn events(&self) -> &Receiver<WorkerEvent> {
        &self.events_rx
    }

    pub fn shutdown_requested() -> bool {
        SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
    }

    /// Request a graceful shutdown, as if `SIGINT`/`SIGTERM` had arrived.
    pub fn request_shutdown() {
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }

    pub fn install_signal_handlers(&self) -> std::io::Result<()> {
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

    /// Register in the server-pid directory, run the accept loop until
    /// shutdown is requested (and every connection thread has finished its
    /// in-flight call), then deregister.
    pub fn run(&self) -> Result<(), ResourceError> {
        let pid = std::process::id() as i32;
        self.resource_manager.server_pids()?.register(pid);
        let result = self.accept_loop();
        self.resource_manager.server_pids()?.unregister(pid);
        result
    }

    fn accept_loop(&self) -> Result<(), ResourceError> {
        loop {
            let known = self.resource_manager.client_connections()?.list();
            let known: HashSet<(i32, u64)> = known.into_iter().collect();

            let mut connections = self.connections.lock();
            connections.retain(|key, handle| known.contains(key) && !handle.is_finished());

            for &(pid, qid) in &known {
                if connections.contains_key(&(pid, qid)) {
                    continue;
                }
                let resource_manager = Arc::clone(&self.resource_manager);
                let methods = Arc::clone(&self.methods);
                let events_tx = self.events_tx.clone();
                let handle = std::thread::spawn(move || {
                    if let Err(e) = server::serve(
                        resource_manager,
                        methods,
                        pid,
                        qid,
                        events_tx,
                        Worker::shutdown_requested,
                    ) {
                        log::warn!("connection pid={pid} qid={qid} ended with error: {e}");
                    }
                });
                connections.insert((pid, qid), handle);
            }

            let all_done = connections.is_empty();
            drop(connections);

            if Self::shutdown_requested() && all_done {
                return Ok(());
            }

            std::thread::sleep(ACCEPT_POLL_INTERVAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_table_dispatches_registered_echo() {
        let mut table = MethodTable::new();
        table.register("echo", Codec::Raw, |payload| Ok(payload));

        let result = table
            .dispatch(b"echo", Payload::Bytes(b"hi".to_vec()))
            .unwrap();
        match result {
            Payload::Bytes(b) => assert_eq!(b, b"hi"),
            _ => panic!("expected bytes payload"),
        }
    }

    #[test]
    fn method_table_reports_unknown_method() {
        let table = MethodTable::new();
        let result = table.dispatch(b"nope", Payload::Bytes(vec![]));
        assert!(matches!(result, Err(RemoteException::UnknownMethod(_))));
    }
}
