//! Trait seam for a non-shared-memory transport (spec §1 "Out of scope").
//!
//! `original_source/speedysvc/client_server/network/NetworkClient.py` and
//! `original_source/shmrpc/rpc/network/NetworkServer.py` show the original
//! system also shipping a TCP fallback beside its shared-memory transport,
//! framed the same way (`len_packer`-prefixed command/args) but carried
//! over a socket instead of a mapped buffer. A full TCP implementation is
//! out of scope here; this trait exists so one could be dropped in later
//! without touching `channel::client`/`channel::server`, which only ever
//! depend on this seam, never on shared memory directly being the only
//! possible transport.
//!
//! No type in this crate implements `NetworkTransport` today.

use crate::codec::{Codec, Payload};
use crate::error::ChannelError;

/// A transport capable of carrying one RPC call's request/response pair.
/// `channel::client::Connection` and `channel::server::serve` are built
/// directly against the shared-memory protocol rather than this trait, so
/// adding a transport means writing a new pair of types against this seam,
/// not modifying either of them.
pub trait NetworkTransport: Send + Sync {
    fn call(
        &mut self,
        cmd: &[u8],
        codec: Codec,
        args: &Payload,
    ) -> Result<Payload, ChannelError>;
}
