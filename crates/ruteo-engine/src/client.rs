//! Engine-side client records.
//!
//! Every client — external process, in-process handler, or the driver —
//! gets a control block. External clients' blocks live in their own SHM
//! segment so the client process can flip its cycle state without a
//! syscall; in-process blocks are plain heap allocations. Around the
//! block the engine keeps what only it needs: sockets, chain position,
//! the feed sets the scheduler computes, and the in-process handler.

use std::cell::UnsafeCell;
use std::os::fd::RawFd;
use std::os::unix::net::UnixStream;
use std::ptr;

use ruteo_core::proto::EventRecord;
use ruteo_core::shm_layout::{ClientControl, ClientKind, ClientState, EventInterest};
use ruteo_core::{ClientId, Nframes, PortId};
use ruteo_shm::Segment;

use crate::scope::ProcessScope;

/// A client's process callback failed; the cycle is abandoned and the
/// client removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessFailed;

/// A client living inside the server process.
///
/// Handlers run on the cycle thread; nothing here may block. Events are
/// delivered by direct call for the same reason.
pub trait InProcessClient: Send {
    /// One period of work. Buffers are reached through the scope.
    fn process(&mut self, scope: &ProcessScope<'_>, nframes: Nframes) -> Result<(), ProcessFailed>;

    /// Non-cycle notifications (port registrations, buffer size, xrun...).
    fn handle_event(&mut self, _event: &EventRecord) {}
}

/// Where a control block's memory lives.
enum Backing {
    /// External client: its own SHM segment, shared with that process.
    Shm(Segment),
    /// In-process client: engine heap.
    Heap(Box<UnsafeCell<ClientControl>>),
}

/// Copy-free accessor over a control block.
///
/// All access is field-at-a-time through raw pointers: the SHM variant is
/// concurrently written by another process (its cycle state), so no
/// references into it are ever formed.
pub struct ControlBlock {
    backing: Backing,
}

// State words are independently written by the owning client process and
// read by the engine; the cycle protocol orders the accesses that matter.
unsafe impl Send for ControlBlock {}
unsafe impl Sync for ControlBlock {}

impl ControlBlock {
    /// Wrap an SHM-backed block (external clients). The segment must hold
    /// an initialized [`ClientControl`] at offset 0.
    pub fn shm(seg: Segment) -> Self {
        Self {
            backing: Backing::Shm(seg),
        }
    }

    /// Allocate a heap-backed block (in-process clients).
    pub fn heap(control: ClientControl) -> Self {
        Self {
            backing: Backing::Heap(Box::new(UnsafeCell::new(control))),
        }
    }

    /// Initialize a fresh SHM segment with a control block.
    pub fn init_segment(seg: &Segment, control: &ClientControl) {
        // Safety: fresh segment sized for at least one ClientControl.
        unsafe { ptr::write(seg.at::<ClientControl>(0), *control) };
    }

    /// The wire key of the SHM backing, if any.
    pub fn key(&self) -> Option<ruteo_core::proto::SegmentKey> {
        match &self.backing {
            Backing::Shm(seg) => Some(seg.key()),
            Backing::Heap(_) => None,
        }
    }

    fn raw(&self) -> *mut ClientControl {
        match &self.backing {
            Backing::Shm(seg) => seg.at::<ClientControl>(0),
            Backing::Heap(cell) => cell.get(),
        }
    }

    /// Client id.
    pub fn id(&self) -> ClientId {
        // Safety: engine-owned immutable field.
        unsafe { ptr::addr_of!((*self.raw()).id).read() }
    }

    /// Client kind.
    pub fn kind(&self) -> ClientKind {
        // Safety: engine-owned immutable field; validated at creation.
        ClientKind::from_raw(unsafe { ptr::addr_of!((*self.raw()).kind).read() })
            .unwrap_or(ClientKind::External)
    }

    /// Client name (copied out).
    pub fn name(&self) -> String {
        // Safety: engine-owned immutable field.
        let bytes = unsafe { ptr::addr_of!((*self.raw()).name).read() };
        ruteo_core::name::from_fixed(&bytes).to_owned()
    }

    /// Cycle state, written by the owning process mid-cycle.
    pub fn state(&self) -> ClientState {
        // Safety: single-word shared field.
        ClientState::from_raw(unsafe { ptr::addr_of!((*self.raw()).state).read_volatile() })
    }

    /// Set the cycle state (engine side: reset, timeout, death).
    pub fn set_state(&self, state: ClientState) {
        // Safety: single-word shared field.
        unsafe { ptr::addr_of_mut!((*self.raw()).state).write_volatile(state as u32) };
    }

    /// Whether the client is in the execution chain.
    pub fn active(&self) -> bool {
        // Safety: single-word shared field.
        unsafe { ptr::addr_of!((*self.raw()).active).read_volatile() != 0 }
    }

    /// Flip chain membership.
    pub fn set_active(&self, active: bool) {
        // Safety: single-word shared field.
        unsafe { ptr::addr_of_mut!((*self.raw()).active).write_volatile(u32::from(active)) };
    }

    /// One-way death mark.
    pub fn dead(&self) -> bool {
        // Safety: single-word shared field.
        unsafe { ptr::addr_of!((*self.raw()).dead).read_volatile() != 0 }
    }

    /// Mark the block dead; never cleared.
    pub fn set_dead(&self) {
        // Safety: single-word shared field.
        unsafe { ptr::addr_of_mut!((*self.raw()).dead).write_volatile(1) };
    }

    /// Publish this cycle's frame count.
    pub fn set_nframes(&self, nframes: Nframes) {
        // Safety: single-word shared field.
        unsafe { ptr::addr_of_mut!((*self.raw()).nframes).write_volatile(nframes) };
    }

    /// Transport frame counter (timebase client writes it).
    pub fn frame_time(&self) -> u32 {
        // Safety: single-word shared field.
        unsafe { ptr::addr_of!((*self.raw()).frame_time).read_volatile() }
    }

    /// Per-client process timeout, 0 when unset.
    pub fn timeout_msecs(&self) -> u32 {
        // Safety: single-word shared field.
        unsafe { ptr::addr_of!((*self.raw()).timeout_msecs).read_volatile() }
    }

    /// Which discretionary events the client wants.
    pub fn interest(&self) -> EventInterest {
        // Safety: single-word shared field, client-maintained.
        let bits = unsafe { ptr::addr_of!((*self.raw()).interest).read_volatile() };
        EventInterest::from_bits_truncate(bits)
    }
}

/// Everything the engine tracks about one client.
pub struct InternalClient {
    /// The shared (or heap) control block.
    pub control: ControlBlock,
    /// Request socket, external clients only.
    pub request_stream: Option<UnixStream>,
    /// Event socket, external clients only, set by the ack handshake.
    pub event_stream: Option<UnixStream>,
    /// FIFO the engine writes to start this client's subgraph. Borrowed
    /// from the engine's FIFO table, which outlives every client.
    pub subgraph_start: Option<RawFd>,
    /// FIFO the engine polls for subgraph completion.
    pub subgraph_wait: Option<RawFd>,
    /// Position among external clients in the chain.
    pub rank: u32,
    /// Chain successor last time this client was told its order.
    pub next_in_chain: Option<ClientId>,
    /// Clients that feed this one (transitive, rebuilt on every sort).
    pub fed_by: Vec<ClientId>,
    /// Ports owned by this client.
    pub ports: Vec<PortId>,
    /// The callback object for in-process clients.
    pub handler: Option<Box<dyn InProcessClient>>,
}

impl InternalClient {
    /// A record with no chain position yet.
    pub fn new(control: ControlBlock, request_stream: Option<UnixStream>) -> Self {
        Self {
            control,
            request_stream,
            event_stream: None,
            subgraph_start: None,
            subgraph_wait: None,
            rank: u32::MAX,
            next_in_chain: None,
            fed_by: Vec::new(),
            ports: Vec::new(),
            handler: None,
        }
    }

    /// Shorthand for the control block's id.
    pub fn id(&self) -> ClientId {
        self.control.id()
    }

    /// True for clients the cycle thread calls directly.
    pub fn is_in_process(&self) -> bool {
        self.control.kind().runs_in_server()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::Zeroable;

    fn heap_block(id: ClientId, kind: ClientKind) -> ControlBlock {
        let mut c = ClientControl::zeroed();
        c.id = id;
        c.kind = kind as u32;
        c.name = ruteo_core::name::to_fixed("t");
        ControlBlock::heap(c)
    }

    #[test]
    fn state_roundtrip_and_death_is_sticky() {
        let cb = heap_block(1, ClientKind::InProcess);
        assert_eq!(cb.state(), ClientState::NotTriggered);
        cb.set_state(ClientState::Finished);
        assert_eq!(cb.state(), ClientState::Finished);

        assert!(!cb.dead());
        cb.set_dead();
        assert!(cb.dead());
    }

    #[test]
    fn kinds_classify_in_process() {
        let ext = InternalClient::new(heap_block(1, ClientKind::External), None);
        let drv = InternalClient::new(heap_block(2, ClientKind::Driver), None);
        assert!(!ext.is_in_process());
        assert!(drv.is_in_process());
    }
}
