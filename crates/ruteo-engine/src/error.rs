//! Engine error types.

use thiserror::Error;

use ruteo_core::proto::ProtoError;
use ruteo_shm::ShmError;

use crate::driver::DriverError;

/// Failures surfaced by engine setup, teardown and the IPC surface.
///
/// Request-channel failures are not here: those are inline
/// [`ruteo_core::proto::ErrorCode`] statuses that never kill anything.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Shared-memory setup or registry failure.
    #[error(transparent)]
    Shm(#[from] ShmError),
    /// Socket-level failure on the IPC surface.
    #[error(transparent)]
    Proto(#[from] ProtoError),
    /// Server directory, socket or FIFO filesystem failure.
    #[error("server filesystem error: {0}")]
    Io(#[from] std::io::Error),
    /// FIFO creation/open failure.
    #[error("cannot set up wakeup fifo: {0}")]
    Fifo(#[source] nix::Error),
    /// The driver failed.
    #[error(transparent)]
    Driver(#[from] DriverError),
    /// A named driver is not built into this server.
    #[error("unknown driver '{0}'")]
    UnknownDriver(String),
    /// An internal invariant did not hold; the server exits after cleanup.
    #[error("internal invariant violated: {0}")]
    Internal(&'static str),
}
