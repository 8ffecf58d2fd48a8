//! Shared contract between the ruteo server and its clients.
//!
//! Everything in this crate crosses a process boundary: the layouts of the
//! shared-memory control structures, the fixed-size records exchanged over
//! the server's UNIX sockets, the port flag and type vocabulary, and the
//! audio/MIDI buffer functions both sides run against shared buffers.
//!
//! All cross-process records are `#[repr(C)]`, host-endian, and cast to and
//! from bytes with [`bytemuck`]; both sides of every channel are always the
//! same build on the same host, so no serialization format is involved.
//!
//! # Crate map
//!
//! - [`flags`] — port direction and capability flags
//! - [`name`] — client/port naming rules and fixed-width name arrays
//! - [`shm_layout`] — control segment, port records, client control blocks
//! - [`port_type`] — the port-type capability table (audio and MIDI built in)
//! - [`audio`] / [`midi`] — the builtin buffer functions
//! - [`proto`] — request, reply, event, and handshake records
//! - [`server_dir`] — on-disk layout of a server instance

pub mod audio;
pub mod flags;
pub mod midi;
pub mod name;
pub mod port_type;
pub mod proto;
pub mod server_dir;
pub mod shm_layout;

pub use flags::PortFlags;
pub use name::{CLIENT_NAME_MAX, FULL_NAME_MAX, PORT_NAME_MAX};
pub use port_type::{PortTypeId, PortTypeInfo};
pub use shm_layout::{ClientControl, ClientKind, ClientState, ControlHeader, PortRecord};

/// One audio sample as stored in port buffers.
pub type Sample = f32;

/// Monotonic microseconds, comparable across processes on this host.
///
/// The engine stamps each cycle with this clock and clients subtract
/// their own reading to compute `frames_since_cycle_start`.
pub fn monotonic_usecs() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // Safety: plain syscall writing the timespec we hand it.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000
}

/// Frame counts, frame times and everything else measured in frames.
pub type Nframes = u32;

/// Dense identifier of a port; an index into the shared port table.
pub type PortId = u32;

/// Dense identifier of a client.
pub type ClientId = u32;

/// Sentinel for "no port" in shared records.
pub const NO_PORT: PortId = u32::MAX;

/// Default capacity of the shared port table.
pub const DEFAULT_PORT_MAX: u32 = 256;
