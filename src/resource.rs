//! The shared-memory resource manager (component B, spec §4.B).
//!
//! Given `(port, pid, qid)`, produces the canonical shared-buffer and lock
//! names from spec §3/§6, and owns their creation, connection, growth and
//! teardown. Also tracks which server pids are currently registered for a
//! port, so a spinning client can tell "still processing" from "nobody's
//! listening" (spec §4.C's ~100ms no-worker probe).

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use crate::error::ResourceError;
use crate::frame::HandoffTag;
use crate::hybrid_lock::{CreateMode, HybridLock};
use crate::shm::{OpenMode, SharedRegion};

/// Default size of a freshly created channel buffer (spec §4.B).
pub const DEFAULT_BUFFER_SIZE: usize = 2048;
/// Growth factor applied to `min_size` on `create_pid_mmap` (spec §4.B).
pub const GROWTH_FACTOR: f64 = 1.5;

/// Max number of concurrently registered server pids per port. A generous,
/// fixed bound keeps the pid table a plain shared-memory array rather than
/// a dynamically resizable structure, which would need its own handoff
/// protocol just to track liveness metadata.
const MAX_SERVER_PIDS: usize = 256;

pub fn shm_name(port: u16, pid: i32, qid: u64) -> String {
    format!("service_{port}_{pid}_{qid}")
}

pub fn client_lock_name(port: u16, pid: i32, qid: u64) -> String {
    format!("client_{port}_pid_{pid}_{qid}")
}

pub fn server_lock_name(port: u16, pid: i32, qid: u64) -> String {
    format!("server_{port}_pid_{pid}_{qid}")
}

fn pid_table_name(port: u16) -> String {
    format!("service_{port}_workers")
}

#[repr(C)]
struct RawPidTable {
    slots: [AtomicI32; MAX_SERVER_PIDS],
}

/// The set of server worker pids currently registered for a port.
pub struct ServerPidTable {
    region: SharedRegion,
}

impl ServerPidTable {
    pub fn open(port: u16) -> Result<Self, ResourceError> {
        let region = SharedRegion::open(
            &pid_table_name(port),
            std::mem::size_of::<RawPidTable>(),
            OpenMode::ConnectOrCreate,
        )
        .map_err(|e| ResourceError::CreateFailed(pid_table_name(port), e))?;
        Ok(Self { region })
    }

    fn raw(&self) -> &RawPidTable {
        unsafe { &*(self.region.as_ptr() as *const RawPidTable) }
    }

    pub fn register(&self, pid: i32) {
        for slot in &self.raw().slots {
            if slot
                .compare_exchange(0, pid, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
        log::warn!("server pid table full (capacity {MAX_SERVER_PIDS}); pid {pid} not tracked");
    }

    pub fn unregister(&self, pid: i32) {
        for slot in &self.raw().slots {
            let _ = slot.compare_exchange(pid, 0, Ordering::AcqRel, Ordering::Acquire);
        }
    }

    pub fn list(&self) -> Vec<i32> {
        self.raw()
            .slots
            .iter()
            .map(|s| s.load(Ordering::Acquire))
            .filter(|&p| p != 0)
            .collect()
    }

    /// Drop any registered pid that no longer exists, probed via a
    /// zero-signal `kill` (existence check, no signal delivered).
    pub fn check_for_missing_pids(&self) {
        for pid in self.list() {
            let exists = unsafe { libc::kill(pid, 0) } == 0
                || std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH);
            if !exists {
                self.unregister(pid);
            }
        }
    }
}

/// Max number of concurrently tracked client connections per port. Like
/// `MAX_SERVER_PIDS`, a fixed bound so the directory stays a plain array.
const MAX_CLIENT_CONNECTIONS: usize = 1024;

fn client_table_name(port: u16) -> String {
    format!("service_{port}_clients")
}

#[repr(C)]
struct RawClientTable {
    pids: [AtomicI32; MAX_CLIENT_CONNECTIONS],
    qids: [AtomicU64; MAX_CLIENT_CONNECTIONS],
}

/// Directory of `(pid, qid)` client connections currently open for a port.
/// Not part of the original retrieved sources -- there is no way for a
/// server-side worker to otherwise discover which client buffers exist, so
/// this plays the same role for the server side that [`ServerPidTable`]
/// plays for clients, publishing entries with `qid` written before `pid`
/// (release) so a reader that observes a nonzero `pid` (acquire) always
/// sees the matching `qid`.
pub struct ClientTable {
    region: SharedRegion,
}

impl ClientTable {
    pub fn open(port: u16) -> Result<Self, ResourceError> {
        let region = SharedRegion::open(
            &client_table_name(port),
            std::mem::size_of::<RawClientTable>(),
            OpenMode::ConnectOrCreate,
        )
        .map_err(|e| ResourceError::CreateFailed(client_table_name(port), e))?;
        Ok(Self { region })
    }

    fn raw(&self) -> &RawClientTable {
        unsafe { &*(self.region.as_ptr() as *const RawClientTable) }
    }

    pub fn register(&self, pid: i32, qid: u64) {
        let raw = self.raw();
        for i in 0..MAX_CLIENT_CONNECTIONS {
            if raw.pids[i]
                .compare_exchange(0, pid, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                raw.qids[i].store(qid, Ordering::Release);
                return;
            }
        }
        log::warn!(
            "client connection directory full (capacity {MAX_CLIENT_CONNECTIONS}); \
             pid={pid} qid={qid} not tracked"
        );
    }

    pub fn unregister(&self, pid: i32, qid: u64) {
        let raw = self.raw();
        for i in 0..MAX_CLIENT_CONNECTIONS {
            if raw.pids[i].load(Ordering::Acquire) == pid && raw.qids[i].load(Ordering::Acquire) == qid
            {
                raw.pids[i].store(0, Ordering::Release);
            }
        }
    }

    pub fn list(&self) -> Vec<(i32, u64)> {
        let raw = self.raw();
        (0..MAX_CLIENT_CONNECTIONS)
            .filter_map(|i| {
                let pid = raw.pids[i].load(Ordering::Acquire);
                if pid == 0 {
                    return None;
                }
                Some((pid, raw.qids[i].load(Ordering::Acquire)))
            })
            .collect()
    }
}

/// Allocates, connects to, grows, and tears down the shared buffer and
/// lock pair for one `(port, pid, qid)` connection.
pub struct ResourceManager {
    port: u16,
}

impl ResourceManager {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Allocate a fresh buffer and lock pair for a new client connection.
    /// Client lock starts with one permit (client may proceed); server
    /// lock starts with zero (server must wait).
    pub fn create_client_resources(
        &self,
        pid: i32,
        qid: u64,
    ) -> Result<(SharedRegion, HybridLock, HybridLock), ResourceError> {
        let region = SharedRegion::open(
            &shm_name(self.port, pid, qid),
            DEFAULT_BUFFER_SIZE,
            OpenMode::CreateExclusive,
        )
        .map_err(|e| ResourceError::CreateFailed(shm_name(self.port, pid, qid), e))?;
        region.as_slice_mut()[0] = HandoffTag::Client as u8;

        let client_lock = HybridLock::open(
            &client_lock_name(self.port, pid, qid),
            CreateMode::CreateExclusive,
            1,
        )?;
        let server_lock = HybridLock::open(
            &server_lock_name(self.port, pid, qid),
            CreateMode::CreateExclusive,
            0,
        )?;

        self.client_connections()?.register(pid, qid);

        Ok((region, client_lock, server_lock))
    }

    pub fn client_connections(&self) -> Result<ClientTable, ResourceError> {
        ClientTable::open(self.port)
    }

    /// Map an existing buffer by name (used after observing `Invalid`).
    pub fn connect_to_pid_mmap(&self, pid: i32, qid: u64) -> Result<SharedRegion, ResourceError> {
        let name = shm_name(self.port, pid, qid);
        SharedRegion::open(&name, 1, OpenMode::ConnectExisting)
            .map_err(|e| ResourceError::MapFailed(name, e))
    }

    /// Unlink any prior buffer by the same name and create a new one sized
    /// `max(min_size, 1.5 * min_size)` (spec §4.B -- always the latter for
    /// positive `min_size`, kept as written for fidelity to the source).
    pub fn create_pid_mmap(
        &self,
        min_size: usize,
        pid: i32,
        qid: u64,
    ) -> Result<SharedRegion, ResourceError> {
        let grown = (min_size as f64 * GROWTH_FACTOR).ceil() as usize;
        let size = min_size.max(grown);
        let name = shm_name(self.port, pid, qid);
        SharedRegion::open(&name, size, OpenMode::CreateOverwrite)
            .map_err(|e| ResourceError::CreateFailed(name, e))
    }

    /// Destroy the lock pair and unlink the buffer for a client connection.
    pub fn unlink_client_resources(&self, pid: i32, qid: u64) -> Result<(), ResourceError> {
        if let Ok(table) = self.client_connections() {
            table.unregister(pid, qid);
        }
        if let Ok(lock) = HybridLock::open(
            &client_lock_name(self.port, pid, qid),
            CreateMode::ConnectExisting,
            1,
        ) {
            lock.destroy();
        }
        if let Ok(lock) = HybridLock::open(
            &server_lock_name(self.port, pid, qid),
            CreateMode::ConnectExisting,
            0,
        ) {
            lock.destroy();
        }
        SharedRegion::unlink(&shm_name(self.port, pid, qid))
            .map_err(|e| ResourceError::CreateFailed(shm_name(self.port, pid, qid), e))
    }

    pub fn server_pids(&self) -> Result<ServerPidTable, ResourceError> {
        ServerPidTable::open(self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cleanup(port: u16, pid: i32, qid: u64) {
        let _ = SharedRegion::unlink(&shm_name(port, pid, qid));
        let _ = SharedRegion::unlink(&format!("{}_state", client_lock_name(port, pid, qid)));
        let _ = SharedRegion::unlink(&format!("{}_state", server_lock_name(port, pid, qid)));
    }

    #[test]
    fn create_client_resources_sets_initial_permits() {
        let port = 49200;
        let pid = std::process::id() as i32;
        let qid = 1;
        cleanup(port, pid, qid);

        let manager = ResourceManager::new(port);
        let (region, client_lock, server_lock) =
            manager.create_client_resources(pid, qid).unwrap();

        assert_eq!(region.as_slice()[0], HandoffTag::Client as u8);
        assert_eq!(client_lock.value(), 1);
        assert_eq!(server_lock.value(), 0);

        manager.unlink_client_resources(pid, qid).unwrap();
        cleanup(port, pid, qid);
    }

    #[test]
    fn create_pid_mmap_grows_by_at_least_1_5x() {
        let port = 49201;
        let pid = std::process::id() as i32;
        let qid = 2;
        cleanup(port, pid, qid);

        let manager = ResourceManager::new(port);
        let region = manager.create_pid_mmap(10_000, pid, qid).unwrap();
        assert!(region.len() >= 15_000);

        let _ = SharedRegion::unlink(&shm_name(port, pid, qid));
    }

    #[test]
    fn server_pid_table_tracks_registration_and_missing_pids() {
        let port = 49202;
        let _ = SharedRegion::unlink(&format!("service_{port}_workers"));

        let manager = ResourceManager::new(port);
        let table = manager.server_pids().unwrap();

        let fake_pid = 999_999; // exceedingly unlikely to exist
        table.register(fake_pid);
        assert!(table.list().contains(&fake_pid));

        table.check_for_missing_pids();
        assert!(!table.list().contains(&fake_pid));

        let _ = SharedRegion::unlink(&format!("service_{port}_workers"));
    }
}
