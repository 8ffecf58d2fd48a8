//! Engine-side wrapper of the shared control segment.
//!
//! The control segment is a [`ControlHeader`] followed by the port table.
//! Clients in other processes read it concurrently, so no references into
//! the mapping are ever formed here — fields and whole port records are
//! copied in and out through raw pointers. Port-record writes happen only
//! under the engine's locks; header fields are single-word state the
//! cycle thread publishes.

use std::ptr;

use ruteo_core::shm_layout::{
    CONTROL_MAGIC, ControlHeader, PROTOCOL_VERSION, PortRecord, control_segment_bytes,
    port_record_offset,
};
use ruteo_core::{Nframes, PortId};
use ruteo_shm::{Segment, ShmRegistry, ShmError};

/// The engine's handle on the control segment.
pub struct ControlShm {
    seg: Segment,
    port_max: u32,
}

impl ControlShm {
    /// Allocate and initialize the control segment.
    pub fn create(
        registry: &ShmRegistry,
        port_max: u32,
        real_time: bool,
        client_priority: i32,
    ) -> Result<Self, ShmError> {
        let seg = registry.alloc(control_segment_bytes(port_max))?;
        let header = ControlHeader {
            magic: CONTROL_MAGIC,
            protocol: PROTOCOL_VERSION,
            port_max,
            real_time: u32::from(real_time),
            client_priority,
            sample_rate: 0,
            buffer_size: 0,
            frame_time: 0,
            cycle_start_usecs: 0,
        };
        // Safety: fresh segment, offset 0, sized by control_segment_bytes.
        unsafe { ptr::write(seg.at::<ControlHeader>(0), header) };

        let this = Self { seg, port_max };
        for id in 0..port_max {
            let mut record: PortRecord = bytemuck::Zeroable::zeroed();
            record.id = id;
            record.buffer_segment = ruteo_core::shm_layout::NO_SEGMENT;
            this.write_port(id, &record);
        }
        Ok(this)
    }

    /// Wire key clients attach with.
    pub fn key(&self) -> ruteo_core::proto::SegmentKey {
        self.seg.key()
    }

    fn header(&self) -> *mut ControlHeader {
        self.seg.at::<ControlHeader>(0)
    }

    /// Copy out port record `id`.
    pub fn read_port(&self, id: PortId) -> PortRecord {
        assert!(id < self.port_max, "port id outside table");
        // Safety: bounds asserted; record offsets are layout constants.
        unsafe { ptr::read(self.seg.at::<PortRecord>(port_record_offset(id))) }
    }

    /// Copy in port record `id`.
    pub fn write_port(&self, id: PortId, record: &PortRecord) {
        assert!(id < self.port_max, "port id outside table");
        // Safety: as in read_port.
        unsafe { ptr::write(self.seg.at::<PortRecord>(port_record_offset(id)), *record) };
    }

    /// Publish the sample rate.
    pub fn set_sample_rate(&self, rate: u32) {
        // Safety: single-word header field.
        unsafe { ptr::addr_of_mut!((*self.header()).sample_rate).write_volatile(rate) };
    }

    /// Current sample rate.
    pub fn sample_rate(&self) -> u32 {
        // Safety: single-word header field.
        unsafe { ptr::addr_of!((*self.header()).sample_rate).read_volatile() }
    }

    /// Publish the period size.
    pub fn set_buffer_size(&self, nframes: Nframes) {
        // Safety: single-word header field.
        unsafe { ptr::addr_of_mut!((*self.header()).buffer_size).write_volatile(nframes) };
    }

    /// Current period size.
    pub fn buffer_size(&self) -> Nframes {
        // Safety: single-word header field.
        unsafe { ptr::addr_of!((*self.header()).buffer_size).read_volatile() }
    }

    /// Publish the transport frame time (timebase export).
    pub fn set_frame_time(&self, frames: u32) {
        // Safety: single-word header field.
        unsafe { ptr::addr_of_mut!((*self.header()).frame_time).write_volatile(frames) };
    }

    /// Publish the monotonic microseconds at cycle start.
    pub fn set_cycle_start_usecs(&self, usecs: u64) {
        // Safety: u64 header field, aligned; torn reads are tolerated by
        // consumers (the value only steers latency estimates).
        unsafe { ptr::addr_of_mut!((*self.header()).cycle_start_usecs).write_volatile(usecs) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ShmRegistry {
        let name = format!("/ruteo-ctl-test-{}", std::process::id());
        ShmRegistry::open_named(&name).unwrap()
    }

    #[test]
    fn header_and_ports_roundtrip() {
        let reg = registry();
        let ctl = ControlShm::create(&reg, 8, true, 10).unwrap();

        ctl.set_sample_rate(48_000);
        ctl.set_buffer_size(1024);
        assert_eq!(ctl.sample_rate(), 48_000);
        assert_eq!(ctl.buffer_size(), 1024);

        let mut rec = ctl.read_port(3);
        assert_eq!(rec.id, 3);
        assert_eq!(rec.in_use, 0);
        assert_eq!(rec.buffer_segment, ruteo_core::shm_layout::NO_SEGMENT);
        rec.in_use = 1;
        rec.client_id = 42;
        ctl.write_port(3, &rec);
        assert_eq!(ctl.read_port(3).client_id, 42);

        let key = ctl.key();
        drop(ctl);
        reg.destroy(&key).unwrap();
        reg.destroy_registry().unwrap();
    }
}
