//! RPC channel, server side (component D).
//!
//! One OS thread per connected `(pid, qid)`, blocking on that connection's
//! server lock between requests -- the thread-per-connection design named
//! in spec §4.D, grounded on the teacher's `jail::watch_directory`
//! thread-plus-poll-loop idiom, adapted here to block on the hybrid lock
//! rather than poll a directory.
//!
//! `server_lock` and `client_lock` carry disjoint signals: the client
//! posts `server_lock` once per request to wake this loop, and this loop
//! posts `client_lock` once per reply. Posting back to `server_lock`
//! after replying would race the client's own reacquire of that same
//! permit (the next `lock()` here would just as likely win it).

use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Sender;

use crate::channel::IDLE_WAKE_INTERVAL;
use crate::codec::Codec;
use crate::error::{ChannelError, LockError, RemoteException};
use crate::frame::{HandoffTag, RequestFrame, ResponseFrame};
use crate::hybrid_lock::{CreateMode, HybridLock};
use crate::resource::{client_lock_name, server_lock_name, ResourceManager};
use crate::worker::{MethodTable, Worker, WorkerEvent};

/// Serve one client connection until it disconnects or the process is
/// asked to shut down. Returns once the connection's server lock reports
/// `Destroyed` (client went away) or `should_stop` starts returning
/// `true` between requests.
pub fn serve(
    resource_manager: Arc<ResourceManager>,
    methods: Arc<MethodTable>,
    pid: i32,
    qid: u64,
    events: Sender<WorkerEvent>,
    should_stop: impl Fn() -> bool,
) -> Result<(), ChannelError> {
    let mut region = resource_manager.connect_to_pid_mmap(pid, qid)?;
    let server_lock = HybridLock::open(
        &server_lock_name(resource_manager.port(), pid, qid),
        CreateMode::ConnectExisting,
        0,
    )?;
    // The reply-ready signal, separate from `server_lock` so the server
    // never races the client for the same permit (spec §4.D: "writes the
    // reply ... and unlocks the client lock").
    let client_lock = HybridLock::open(
        &client_lock_name(resource_manager.port(), pid, qid),
        CreateMode::ConnectExisting,
        1,
    )?;

    loop {
        match server_lock.lock(Some(IDLE_WAKE_INTERVAL), true) {
            Ok(()) => {}
            Err(LockError::TimedOut(_)) => {
                if should_stop() {
                    return Ok(());
                }
                continue;
            }
            Err(LockError::Destroyed(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let started = Instant::now();
        let (cmd, args) = reconnect_until_pending(&resource_manager, &mut region, pid, qid)?;
        let (ok, data, shutdown_requested) = handle_request(&methods, &cmd, &args);
        write_response(&resource_manager, &mut region, pid, qid, ok, &data)?;
        client_lock.unlock();

        if shutdown_requested {
            Worker::request_shutdown();
        }

        let _ = events.send(WorkerEvent::CallCompleted {
            pid,
            qid,
            cmd,
            elapsed: started.elapsed(),
            ok,
        });

        if should_stop() {
            return Ok(());
        }
    }
}

/// Follow any number of `Invalid` tags (the client resized the buffer
/// between writing its request and us waking up) until we can read the
/// pending request, returning its command name.
fn reconnect_until_pending(
    resource_manager: &ResourceManager,
    region: &mut crate::shm::SharedRegion,
    pid: i32,
    qid: u64,
) -> Result<(Vec<u8>, Vec<u8>), ChannelError> {
    let mut attempts = 0;
    loop {
        let tag = region.as_slice()[0];
        match HandoffTag::from_byte(tag) {
            Some(HandoffTag::Pending) => {
                let request = RequestFrame::decode(&region.as_slice()[1..])?;
                return Ok((request.cmd.to_vec(), request.args.to_vec()));
            }
            Some(HandoffTag::Invalid) => {
                *region = resource_manager.connect_to_pid_mmap(pid, qid)?;
                attempts += 1;
                if attempts > 1000 {
                    return Err(ChannelError::ProtocolViolation(tag));
                }
            }
            _ => return Err(ChannelError::ProtocolViolation(tag)),
        }
    }
}

/// Dispatch one request, returning `(ok, data, shutdown_requested)`.
/// `heartbeat` and `shutdown` are handled before the method table is ever
/// consulted (spec §4.D "Special commands").
fn handle_request(methods: &MethodTable, cmd: &[u8], args: &[u8]) -> (bool, Vec<u8>, bool) {
    if cmd == b"heartbeat" {
        return (true, args.to_vec(), false);
    }
    if cmd == b"shutdown" {
        return (true, Vec::new(), true);
    }

    let codec = methods.codec_for(cmd).unwrap_or(Codec::Raw);

    let outcome = match codec.decode(args) {
        Ok(payload) => methods.dispatch(cmd, payload),
        Err(_) => Err(RemoteException::Generic(
            "malformed request payload".to_string(),
        )),
    };

    let (ok, data) = match outcome {
        Ok(result) => match codec.encode(&result) {
            Ok(bytes) => (true, bytes),
            Err(e) => (
                false,
                RemoteException::RuntimeError(e.to_string())
                    .to_string()
                    .into_bytes(),
            ),
        },
        Err(remote_exc) => (false, remote_exc.to_string().into_bytes()),
    };
    (ok, data, false)
}

fn write_response(
    resource_manager: &ResourceManager,
    region: &mut crate::shm::SharedRegion,
    pid: i32,
    qid: u64,
    ok: bool,
    data: &[u8],
) -> Result<(), ChannelError> {
    let response = ResponseFrame { ok, data };

    if response.encoded_len() >= region.len().saturating_sub(1) {
        let new_region = resource_manager.create_pid_mmap(response.encoded_len() * 2, pid, qid)?;
        let old_tag = region.as_slice()[0];
        new_region.as_slice_mut()[0] = old_tag;
        region.as_slice_mut()[0] = HandoffTag::Invalid as u8;
        *region = new_region;
    }

    response.encode_into(&mut region.as_slice_mut()[1..])?;
    region.as_slice_mut()[0] = HandoffTag::Client as u8;
    Ok(())
}
