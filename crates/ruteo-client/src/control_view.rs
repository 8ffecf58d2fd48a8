//! Read/write views over the shared control structures, client side.
//!
//! Mirrors the engine's accessors but from the other end of the shared
//! memory: the engine's control segment is read-only here, while the
//! client's own control block is where it publishes its cycle state and
//! event interests. No references into the mappings are formed.

use std::ptr;

use ruteo_core::Nframes;
use ruteo_core::shm_layout::{
    ClientControl, ClientState, ControlHeader, EventInterest, PortRecord, port_record_offset,
};
use ruteo_shm::Segment;

/// The engine control segment (header plus port table), read-only.
pub(crate) struct ControlView {
    seg: Segment,
}

impl ControlView {
    pub fn new(seg: Segment) -> Self {
        Self { seg }
    }

    fn header(&self) -> *const ControlHeader {
        self.seg.at::<ControlHeader>(0)
    }

    pub fn sample_rate(&self) -> u32 {
        // Safety: single-word header field.
        unsafe { ptr::addr_of!((*self.header()).sample_rate).read_volatile() }
    }

    pub fn buffer_size(&self) -> Nframes {
        // Safety: single-word header field.
        unsafe { ptr::addr_of!((*self.header()).buffer_size).read_volatile() }
    }

    pub fn frame_time(&self) -> u32 {
        // Safety: single-word header field.
        unsafe { ptr::addr_of!((*self.header()).frame_time).read_volatile() }
    }

    pub fn cycle_start_usecs(&self) -> u64 {
        // Safety: aligned u64 header field; a torn read skews one
        // latency estimate and nothing else.
        unsafe { ptr::addr_of!((*self.header()).cycle_start_usecs).read_volatile() }
    }

    pub fn port_max(&self) -> u32 {
        // Safety: immutable after creation.
        unsafe { ptr::addr_of!((*self.header()).port_max).read() }
    }

    pub fn read_port(&self, id: u32) -> PortRecord {
        assert!(id < self.port_max(), "port id outside table");
        // Safety: bounds asserted, layout-constant offset.
        unsafe { ptr::read(self.seg.at::<PortRecord>(port_record_offset(id))) }
    }

    /// Redirect an owned output port's buffer handle (tie/untie).
    ///
    /// Owner-mutable port fields are written in place; everything else
    /// in the record stays engine-owned.
    pub fn set_port_buffer(&self, id: u32, segment: i32, offset: u32) {
        assert!(id < self.port_max(), "port id outside table");
        let record = self.seg.at::<PortRecord>(port_record_offset(id));
        // Safety: bounds asserted; single-word owner-side fields.
        unsafe {
            ptr::addr_of_mut!((*record).buffer_segment).write_volatile(segment);
            ptr::addr_of_mut!((*record).buffer_offset).write_volatile(offset);
        }
    }

    /// Publish an owned port's latency in frames.
    pub fn set_port_latency(&self, id: u32, frames: u32) {
        assert!(id < self.port_max(), "port id outside table");
        let record = self.seg.at::<PortRecord>(port_record_offset(id));
        // Safety: bounds asserted; single-word owner-side field.
        unsafe { ptr::addr_of_mut!((*record).latency).write_volatile(frames) };
    }
}

/// The client's own control block.
pub(crate) struct OwnControl {
    seg: Segment,
}

impl OwnControl {
    pub fn new(seg: Segment) -> Self {
        Self { seg }
    }

    fn raw(&self) -> *mut ClientControl {
        self.seg.at::<ClientControl>(0)
    }

    pub fn set_state(&self, state: ClientState) {
        // Safety: single-word shared field owned by this process.
        unsafe { ptr::addr_of_mut!((*self.raw()).state).write_volatile(state as u32) };
    }

    pub fn nframes(&self) -> Nframes {
        // Safety: single-word shared field, engine-written.
        unsafe { ptr::addr_of!((*self.raw()).nframes).read_volatile() }
    }

    pub fn add_interest(&self, bits: EventInterest) {
        // Safety: only this process writes the interest mask.
        unsafe {
            let p = ptr::addr_of_mut!((*self.raw()).interest);
            p.write_volatile(p.read_volatile() | bits.bits());
        }
    }

    pub fn set_frame_time(&self, frames: u32) {
        // Safety: single-word shared field, timebase-owner written.
        unsafe { ptr::addr_of_mut!((*self.raw()).frame_time).write_volatile(frames) };
    }

    pub fn set_timeout_msecs(&self, msecs: u32) {
        // Safety: single-word shared field.
        unsafe { ptr::addr_of_mut!((*self.raw()).timeout_msecs).write_volatile(msecs) };
    }
}
