//! ============================================================================
//! shmrpc: a local shared-memory RPC framework
//! ============================================================================
//!
//! Clients and server workers exchange requests over POSIX shared-memory
//! buffers, synchronized by a hybrid spin-then-block semaphore rather than
//! a socket round trip. A supervisor process autoscales each service's
//! worker pool against sampled CPU load.
//!
//! - Zero-copy handoff through a single shared buffer per connection
//! - Hybrid lock: bounded userspace spin before falling back to a kernel
//!   semaphore, so the common case never leaves userspace
//! - One OS thread per connection on the server side
//! - A supervisor that reaps zombies, enforces a process-count floor, and
//!   scales the worker pool against CPU load sampled over two windows
//!
//! ## Quick start
//!
//! ```no_run
//! use shmrpc::channel::client::Connection;
//! use shmrpc::codec::{Codec, Payload};
//!
//! let mut conn = Connection::connect(5555)?;
//! let reply = conn.call(b"echo", Codec::Raw, &Payload::Bytes(b"hi".to_vec()), None)?;
//! # Ok::<(), shmrpc::error::ChannelError>(())
//! ```

// ============================================================================
// The hybrid spin-then-block lock (component A)
// ============================================================================

pub mod hybrid_lock;
pub use hybrid_lock::{CreateMode, HybridLock};

// ============================================================================
// POSIX shared memory regions
// ============================================================================

pub mod shm;
pub use shm::{OpenMode, SharedRegion};

// ============================================================================
// The shared-memory resource manager (component B)
// ============================================================================

pub mod resource;
pub use resource::{ClientTable, ResourceManager, ServerPidTable};

// ============================================================================
// Wire format: handoff tag, request/response frames, codecs, exceptions
// ============================================================================

pub mod frame;
pub use frame::{HandoffTag, RequestFrame, ResponseFrame};

pub mod codec;
pub use codec::{Codec, Payload};

pub mod exception;

// ============================================================================
// Per-connection id allocation
// ============================================================================

pub mod qid;

// ============================================================================
// The RPC channel (components C and D)
// ============================================================================

pub mod channel;

// ============================================================================
// Transport trait seam (out of scope per spec §1; no implementation here)
// ============================================================================

pub mod transport;
pub use transport::NetworkTransport;

// ============================================================================
// Worker process (component E)
// ============================================================================

pub mod worker;
pub use worker::{MethodTable, Worker, WorkerEvent};

// ============================================================================
// Worker supervisor (component F)
// ============================================================================

pub mod supervisor;
pub use supervisor::{Supervisor, SupervisorConfig};

// ============================================================================
// Service registry and configuration (component G)
// ============================================================================

pub mod config;
pub use config::{RegistryConfig, ServiceConfig};

pub mod registry;
pub use registry::{ServiceFactory, ServiceRegistry};

// ============================================================================
// Error handling
// ============================================================================

pub mod error;
pub use error::{
    ChannelError, LockError, RegistryError, RemoteException, Result, ResourceError, RpcError,
    SupervisorError,
};
