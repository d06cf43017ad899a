//! RPC channel, client side (component C).
//!
//! Grounded directly on
//! `original_source/speedysvc/client_server/shared_memory/SHMClient.py::send`:
//! encode under the client lock, flip the buffer to `Pending`, unlock the
//! server lock to wake the server, spin-poll for a reply, then reacquire
//! the client lock (posted once by the server after it writes the reply,
//! per spec §4.D) and decode. Buffer growth and `Invalid`-tag
//! reconnection follow `__resize_mmap`/`__reconnect_to_mmap` in the same
//! file.

use std::time::{Duration, Instant};

use crate::channel::{NO_WORKER_PROBE_AFTER, POLL_INTERVAL};
use crate::codec::{Codec, Payload};
use crate::error::ChannelError;
use crate::exception;
use crate::frame::{HandoffTag, RequestFrame, ResponseFrame};
use crate::hybrid_lock::HybridLock;
use crate::qid;
use crate::resource::ResourceManager;
use crate::shm::SharedRegion;

/// A client's connection to one service port. Registers its own
/// `(pid, qid)`-named buffer and lock pair on construction and unlinks them
/// on drop, mirroring `SHMClient.__init__`/`__del__`.
pub struct Connection {
    pid: i32,
    qid: u64,
    region: SharedRegion,
    client_lock: HybridLock,
    server_lock: HybridLock,
    resource_manager: ResourceManager,
}

impl Connection {
    pub fn connect(port: u16) -> Result<Self, ChannelError> {
        let pid = std::process::id() as i32;
        let qid = qid::global().next_qid(port);
        let resource_manager = ResourceManager::new(port);
        let (region, client_lock, server_lock) =
            resource_manager.create_client_resources(pid, qid)?;
        Ok(Self {
            pid,
            qid,
            region,
            client_lock,
            server_lock,
            resource_manager,
        })
    }

    pub fn port(&self) -> u16 {
        self.resource_manager.port()
    }

    /// Call `cmd` with `args` encoded/decoded per `codec`. `timeout` of
    /// `None` blocks until a server worker answers.
    pub fn call(
        &mut self,
        cmd: &[u8],
        codec: Codec,
        args: &Payload,
        timeout: Option<Duration>,
    ) -> Result<Payload, ChannelError> {
        self.client_lock.lock(timeout, true)?;
        let result = self.call_locked(cmd, codec, args, timeout);
        self.client_lock.unlock();
        result
    }

    fn call_locked(
        &mut self,
        cmd: &[u8],
        codec: Codec,
        args: &Payload,
        timeout: Option<Duration>,
    ) -> Result<Payload, ChannelError> {
        let encoded_args = codec.encode(args)?;
        let request = RequestFrame {
            cmd,
            args: &encoded_args,
        };

        if request.encoded_len() >= self.region.len().saturating_sub(1) {
            self.resize_for(request.encoded_len())?;
        }

        request.encode_into(&mut self.region.as_slice_mut()[1..])?;
        self.region.as_slice_mut()[0] = HandoffTag::Pending as u8;
        self.server_lock.unlock();

        self.wait_for_pickup(timeout)?;

        // The server posts `client_lock` exactly once, after it has fully
        // written the reply (and completed any buffer resize), so this
        // reacquire is the real "reply ready" signal -- never `server_lock`,
        // which the server only ever waits on, not posts after replying.
        self.client_lock.lock(None, true)?;
        self.await_response_tag()?;

        let response = ResponseFrame::decode(&self.region.as_slice()[1..])?;
        if response.ok {
            Ok(codec.decode(response.data)?)
        } else {
            let text = String::from_utf8_lossy(response.data).into_owned();
            Err(ChannelError::Remote(exception::decode(&text)))
        }
    }

    /// Spin-poll until the server flips the tag away from `Pending`,
    /// warning once if no server worker appears to be alive.
    fn wait_for_pickup(&self, timeout: Option<Duration>) -> Result<(), ChannelError> {
        let start = Instant::now();
        let mut checked_missing = false;

        while self.region.as_slice()[0] == HandoffTag::Pending as u8 {
            if let Some(timeout) = timeout
                && start.elapsed() > timeout
            {
                return Err(ChannelError::TimedOut);
            }

            if !checked_missing && start.elapsed() > NO_WORKER_PROBE_AFTER {
                checked_missing = true;
                if let Ok(table) = self.resource_manager.server_pids() {
                    table.check_for_missing_pids();
                    if table.list().is_empty() {
                        log::warn!(
                            "client pid={} qid={} port={}: no server worker appears to be \
                             running for this service",
                            self.pid,
                            self.qid,
                            self.port()
                        );
                    }
                }
            }

            std::thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }

    /// Wait (after reacquiring the client lock) until the tag reads
    /// `Client`, transparently reconnecting across any number of
    /// `Invalid` resizes in between. By the time the client lock's post
    /// wakes us, the server has already finished any resize and written
    /// the final tag, so at most one reconnect is ever really needed here
    /// -- the bounded retry just guards against a malformed peer.
    fn await_response_tag(&mut self) -> Result<(), ChannelError> {
        loop {
            let tag = self.region.as_slice()[0];
            match HandoffTag::from_byte(tag) {
                Some(HandoffTag::Client) => return Ok(()),
                Some(HandoffTag::Invalid) => {
                    self.reconnect()?;
                }
                Some(HandoffTag::Server) | Some(HandoffTag::Pending) | None => {
                    return Err(ChannelError::ProtocolViolation(tag));
                }
            }
        }
    }

    fn resize_for(&mut self, encoded_len: usize) -> Result<(), ChannelError> {
        let new_region = self
            .resource_manager
            .create_pid_mmap(encoded_len * 2, self.pid, self.qid)?;

        let old_tag = self.region.as_slice()[0];
        debug_assert_ne!(old_tag, HandoffTag::Invalid as u8);
        new_region.as_slice_mut()[0] = old_tag;
        self.region.as_slice_mut()[0] = HandoffTag::Invalid as u8;
        self.region = new_region;
        Ok(())
    }

    fn reconnect(&mut self) -> Result<(), ChannelError> {
        let prev_len = self.region.len();
        let new_region = self
            .resource_manager
            .connect_to_pid_mmap(self.pid, self.qid)?;
        if new_region.len() <= prev_len {
            return Err(ChannelError::MalformedFrame(format!(
                "reconnected buffer ({} bytes) is not larger than the previous one ({prev_len} \
                 bytes)",
                new_region.len()
            )));
        }
        self.region = new_region;
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self
            .resource_manager
            .unlink_client_resources(self.pid, self.qid)
        {
            log::warn!(
                "failed to unlink resources for pid={} qid={}: {e}",
                self.pid,
                self.qid
            );
        }
    }
}
