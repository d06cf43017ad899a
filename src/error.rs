use thiserror::Error;

/// Errors raised by the hybrid spin/block lock (component A).
#[derive(Debug, Error)]
pub enum LockError {
    #[error("semaphore '{0}' already exists")]
    AlreadyExists(String),

    #[error("no such semaphore '{0}'")]
    NoSuchSemaphore(String),

    #[error("lock '{0}' was destroyed")]
    Destroyed(String),

    #[error("timed out waiting for lock '{0}'")]
    TimedOut(String),

    #[error("OS error acquiring named semaphore resources: {0}")]
    Os(#[from] std::io::Error),
}

/// Errors raised by the shared-memory resource manager (component B).
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("failed to create shared buffer '{0}': {1}")]
    CreateFailed(String, std::io::Error),

    #[error("failed to map shared buffer '{0}': {1}")]
    MapFailed(String, std::io::Error),

    #[error(transparent)]
    Lock(#[from] LockError),
}

/// A typed remote exception, reconstructed from the wire's
/// `ExceptionName(repr-of-args)` descriptor (see `crate::exception`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteException {
    #[error("ValueError({0})")]
    ValueError(String),

    #[error("TypeError({0})")]
    TypeError(String),

    #[error("KeyError({0})")]
    KeyError(String),

    #[error("RuntimeError({0})")]
    RuntimeError(String),

    #[error("TimeoutError({0})")]
    TimeoutError(String),

    #[error("UnknownMethod({0})")]
    UnknownMethod(String),

    /// Any exception name not present in the closed table above, carrying
    /// the full original wire text unparsed.
    #[error("{0}")]
    Generic(String),
}

/// Errors raised while driving the request/response handoff protocol
/// (components C and D).
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("timed out waiting for a reply")]
    TimedOut,

    #[error("protocol violation: unexpected handoff tag {0:?}")]
    ProtocolViolation(u8),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("remote call failed: {0}")]
    Remote(#[from] RemoteException),

    #[error("no server worker is currently reachable for this service")]
    NoWorkerAvailable,
}

/// Errors raised by the worker supervisor (component F).
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(#[from] std::io::Error),

    #[error("worker pid {0} did not report ready in time")]
    StartTimeout(i32),

    #[error(transparent)]
    Resource(#[from] ResourceError),
}

/// Errors raised by the service registry (component G).
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown service '{0}'")]
    UnknownService(String),

    #[error("service '{0}' is already running")]
    AlreadyRunning(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Crate-wide error, composing every subsystem error the way
/// `cylo::error::ExecError` composes `StorageError`/`SandboxError`.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub type Result<T, E = RpcError> = std::result::Result<T, E>;
