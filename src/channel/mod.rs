//! The shared-memory RPC channel (components C and D).

pub mod client;
pub mod server;

use std::time::Duration;

/// How long a client waits before bothering to check whether any server
/// worker still exists for this port (spec §4.C, grounded on
/// `SHMClient.py::send`'s `time.time()-t_from > 0.1` check).
pub(crate) const NO_WORKER_PROBE_AFTER: Duration = Duration::from_millis(100);

/// Polling interval while waiting for the server to pick up a pending
/// request, matching `SHMClient.py::send`'s `time.sleep(0.01)`.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How often a server-side connection thread wakes from its blocking wait
/// on an idle connection to recheck whether it's been asked to shut down.
pub(crate) const IDLE_WAKE_INTERVAL: Duration = Duration::from_millis(500);
