//! Cross-process shared-memory management for ruteo.
//!
//! Two layers live here. [`Segment`] is an RAII mapping of one POSIX
//! shared-memory object. [`ShmRegistry`] is the process-independent
//! directory of every segment ruteo processes have allocated — who made
//! it, how big it is — so that a crashed server or client never leaks
//! kernel objects: any process that later takes the registry lock and
//! finds a dead allocator pid reclaims the segment.
//!
//! The registry itself is purely cache/metadata: if its header does not
//! validate (old protocol, different backend, resized entries), it is
//! destroyed and re-created on the spot.

mod registry;
mod segment;

pub use registry::{REGISTRY_NAME, ShmRegistry};
pub use segment::Segment;

use thiserror::Error;

/// Failures in shared-memory setup and the registry.
#[derive(Debug, Error)]
pub enum ShmError {
    /// Could not create a shm object.
    #[error("cannot create shm segment '{name}': {source}")]
    Create {
        /// Object name.
        name: String,
        /// Underlying errno.
        #[source]
        source: nix::Error,
    },
    /// Could not attach an existing shm object.
    #[error("cannot attach shm segment '{name}': {source}")]
    Attach {
        /// Object name.
        name: String,
        /// Underlying errno.
        #[source]
        source: nix::Error,
    },
    /// mmap/ftruncate/unlink failure.
    #[error("shm operation failed: {0}")]
    Os(#[from] nix::Error),
    /// Registry lock file problems.
    #[error("cannot lock shm registry: {0}")]
    Lock(#[from] std::io::Error),
    /// Another live server already claims this name.
    #[error("server name already in use")]
    ServerExists,
    /// All server slots are taken.
    #[error("no free server slot in shm registry")]
    NoServerSlot,
    /// All segment entries are taken.
    #[error("no free segment entry in shm registry")]
    NoSegmentEntry,
    /// A segment key did not resolve to a usable name.
    #[error("malformed segment key")]
    BadKey,
}
