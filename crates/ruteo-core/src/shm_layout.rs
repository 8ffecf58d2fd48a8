//! Layouts of the shared-memory control structures.
//!
//! The control segment starts with a [`ControlHeader`] and is immediately
//! followed by `port_max` [`PortRecord`]s. Each external client additionally
//! attaches a one-[`ClientControl`] segment of its own. All structures are
//! plain-old-data: fixed layout, host endianness, no pointers — processes
//! address buffers through `(segment, offset)` handles resolved against
//! their own mappings.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use crate::name::{CLIENT_NAME_MAX, FULL_NAME_MAX};

/// Identifies a well-formed control segment.
pub const CONTROL_MAGIC: u32 = 0x52_55_54_45; // "RUTE"

/// Bumped whenever any shared layout in this module changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Fixed header of the control segment.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct ControlHeader {
    /// [`CONTROL_MAGIC`].
    pub magic: u32,
    /// [`PROTOCOL_VERSION`].
    pub protocol: u32,
    /// Capacity of the port table that follows this header.
    pub port_max: u32,
    /// Non-zero when the server runs its cycle thread under SCHED_FIFO.
    pub real_time: u32,
    /// Priority external clients should request for their process threads.
    pub client_priority: i32,
    /// Current sample rate in frames per second.
    pub sample_rate: u32,
    /// Current period size in frames.
    pub buffer_size: u32,
    /// Transport frame counter, driven by the timebase client.
    pub frame_time: u32,
    /// Monotonic microseconds latched at the start of the running cycle.
    pub cycle_start_usecs: u64,
}

/// One slot of the shared port table.
///
/// `in_use`, the name and the buffer handle are written only by the engine
/// under its port lock; clients read them to resolve peers' buffers.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct PortRecord {
    /// 1 while the slot is allocated.
    pub in_use: u32,
    /// The slot's own index, for self-describing records.
    pub id: u32,
    /// Owning client.
    pub client_id: u32,
    /// [`crate::PortFlags`] bits.
    pub flags: u32,
    /// Index into the builtin port-type table.
    pub type_id: u32,
    /// Port-segment index holding this port's buffer, or [`NO_SEGMENT`].
    pub buffer_segment: i32,
    /// Byte offset of the buffer inside its segment.
    pub buffer_offset: u32,
    /// Buffer length in bytes.
    pub buffer_bytes: u32,
    /// Outstanding monitor requests.
    pub monitor_requests: u32,
    /// Latency in frames, maintained by the owner.
    pub latency: u32,
    /// Full `client:port` name, NUL padded.
    pub name: [u8; FULL_NAME_MAX],
}

/// `buffer_segment` value of a port with no assigned buffer.
pub const NO_SEGMENT: i32 = -1;

/// Per-cycle execution state of a client.
///
/// Transitions within a cycle go strictly forward; [`ClientState::Dead`]
/// is terminal and set only by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum ClientState {
    /// Reset at cycle start; a client left here was never reached.
    NotTriggered = 0,
    /// The client was woken (or began running) but has not finished.
    Triggered = 1,
    /// The client's process callback completed successfully.
    Finished = 2,
    /// The engine timed out waiting on the client's subgraph.
    TimedOut = 3,
    /// The client has been removed; its control block is a tombstone.
    Dead = 4,
}

impl ClientState {
    /// Decode a shared-memory value; unknown values read as [`Self::Dead`]
    /// so a corrupted block is treated as removable, never runnable.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => ClientState::NotTriggered,
            1 => ClientState::Triggered,
            2 => ClientState::Finished,
            3 => ClientState::TimedOut,
            _ => ClientState::Dead,
        }
    }
}

/// What kind of actor a client is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ClientKind {
    /// A separate process, woken through the FIFO chain.
    External = 0,
    /// Runs inside the server, called directly by the cycle thread.
    InProcess = 1,
    /// The driver: in-process, provides the time source, sorts last.
    Driver = 2,
}

impl ClientKind {
    /// Decode a wire/shared-memory value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(ClientKind::External),
            1 => Some(ClientKind::InProcess),
            2 => Some(ClientKind::Driver),
            _ => None,
        }
    }

    /// True for clients executed by the engine thread itself.
    pub fn runs_in_server(self) -> bool {
        matches!(self, ClientKind::InProcess | ClientKind::Driver)
    }
}

bitflags! {
    /// Which discretionary events a client wants delivered.
    ///
    /// Maintained by the client library as callbacks are registered; the
    /// engine skips clients without the relevant bit. Connection events are
    /// always delivered to the endpoints' owners regardless, because the
    /// client library needs them to keep its buffer resolution current.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventInterest: u32 {
        /// Port registration / unregistration notifications.
        const PORT_REGISTER = 1 << 0;
        /// Buffer size changes.
        const BUFFER_SIZE = 1 << 1;
        /// Sample rate changes.
        const SAMPLE_RATE = 1 << 2;
        /// Monitor / unmonitor requests for owned ports.
        const PORT_MONITOR = 1 << 3;
        /// Xrun notifications.
        const XRUN = 1 << 4;
    }
}

/// A client's control block.
///
/// For external clients this lives in a dedicated SHM segment written by
/// both sides: the engine owns identity and liveness fields, the client
/// owns `state` during a cycle plus its event-interest mask and frame
/// timer. In-process clients get a heap-backed copy inside the engine.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct ClientControl {
    /// Dense client id.
    pub id: u32,
    /// [`ClientKind`] as raw u32.
    pub kind: u32,
    /// [`ClientState`] as raw u32.
    pub state: u32,
    /// Non-zero once activated into the execution chain.
    pub active: u32,
    /// Set by the engine when the client is removed.
    pub dead: u32,
    /// Frames to process this cycle.
    pub nframes: u32,
    /// Transport frame counter (meaningful for the timebase client).
    pub frame_time: u32,
    /// Per-client process timeout in milliseconds; 0 uses the engine's.
    pub timeout_msecs: u32,
    /// Process id of the owning process.
    pub pid: i32,
    /// [`EventInterest`] bits.
    pub interest: u32,
    /// Client name, NUL padded.
    pub name: [u8; CLIENT_NAME_MAX],
}

/// Total byte size of a control segment with the given port capacity.
pub fn control_segment_bytes(port_max: u32) -> usize {
    size_of::<ControlHeader>() + size_of::<PortRecord>() * port_max as usize
}

/// Byte offset of port record `id` inside the control segment.
pub fn port_record_offset(id: u32) -> usize {
    size_of::<ControlHeader>() + size_of::<PortRecord>() * id as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_are_pod_and_stable() {
        // Field reordering or accidental padding would silently break
        // cross-process reads; pin the sizes.
        assert_eq!(size_of::<ControlHeader>(), 40);
        assert_eq!(size_of::<PortRecord>(), 40 + FULL_NAME_MAX);
        assert_eq!(size_of::<ClientControl>(), 40 + CLIENT_NAME_MAX);
    }

    #[test]
    fn segment_math() {
        let n = 8;
        assert_eq!(
            control_segment_bytes(n),
            port_record_offset(n) // one past the last record
        );
    }

    #[test]
    fn unknown_state_reads_as_dead() {
        assert_eq!(ClientState::from_raw(99), ClientState::Dead);
        assert_eq!(ClientState::from_raw(1), ClientState::Triggered);
    }
}
