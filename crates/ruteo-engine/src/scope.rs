//! Buffer access for code running on the cycle thread.
//!
//! [`ProcessScope`] is handed to in-process clients and the driver during
//! a cycle. It resolves port ids to buffers the same way the client
//! library does on the far side of the FIFOs:
//!
//! - output port → its own assigned buffer
//! - input, no connections → the shared silence buffer
//! - input, one connection → the source output's buffer, zero-copy
//! - input, several connections → a per-port mix buffer filled by the
//!   port type's mixdown
//!
//! A port may be resolved once per callback; resolving the same port
//! twice aliases the same memory.

use std::cell::UnsafeCell;
use std::collections::HashMap;

use ruteo_core::port_type;
use ruteo_core::shm_layout::{NO_SEGMENT, PortRecord};
use ruteo_core::{Nframes, PortFlags, PortId, Sample};

use crate::buffers::BufferPool;
use crate::control::ControlShm;
use crate::graph::Connection;

/// An engine-owned fan-in buffer for one in-process input port.
///
/// Sized like a pool buffer and created under the graph lock when a
/// port's fan-in reaches two, so the cycle path never allocates. Backed
/// by samples so the storage carries audio alignment; MIDI layouts need
/// none.
pub struct MixBuffer {
    data: UnsafeCell<Box<[Sample]>>,
}

// Only the cycle thread touches the contents, under the graph lock.
unsafe impl Send for MixBuffer {}
unsafe impl Sync for MixBuffer {}

impl MixBuffer {
    /// Allocate, zeroed, `bytes` long (rounded up to whole samples).
    pub fn new(bytes: usize) -> Self {
        let samples = bytes.div_ceil(size_of::<Sample>());
        Self {
            data: UnsafeCell::new(vec![0.0; samples].into_boxed_slice()),
        }
    }

    fn slice_mut(&self) -> &mut [u8] {
        // Safety: exclusive by the cycle-thread-under-graph-lock contract.
        bytemuck::cast_slice_mut(unsafe { &mut *self.data.get() })
    }
}

/// Cycle-thread view of the engine's buffers.
pub struct ProcessScope<'a> {
    nframes: Nframes,
    control: &'a ControlShm,
    pool: &'a BufferPool,
    connections: &'a [Connection],
    mix: &'a HashMap<PortId, MixBuffer>,
}

impl<'a> ProcessScope<'a> {
    /// Assemble a scope for one cycle.
    pub(crate) fn new(
        nframes: Nframes,
        control: &'a ControlShm,
        pool: &'a BufferPool,
        connections: &'a [Connection],
        mix: &'a HashMap<PortId, MixBuffer>,
    ) -> Self {
        Self {
            nframes,
            control,
            pool,
            connections,
            mix,
        }
    }

    /// Frames in this cycle.
    pub fn nframes(&self) -> Nframes {
        self.nframes
    }

    /// Current sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.control.sample_rate()
    }

    fn record(&self, port: PortId) -> PortRecord {
        self.control.read_port(port)
    }

    fn owned_buffer(&self, record: &PortRecord) -> &'a mut [u8] {
        assert!(
            record.buffer_segment != NO_SEGMENT,
            "output port has no buffer"
        );
        let ptr = self.pool.buffer_ptr((record.buffer_segment, record.buffer_offset));
        // Safety: pool-owned buffer, valid for the scope's lifetime; the
        // one-borrow-per-callback contract is the caller's.
        unsafe { std::slice::from_raw_parts_mut(ptr, self.pool.buffer_bytes() as usize) }
    }

    fn silence_buffer(&self) -> &'a [u8] {
        let ptr = self.pool.buffer_ptr(self.pool.silence());
        // Safety: pool-owned, never written after creation.
        unsafe { std::slice::from_raw_parts(ptr, self.pool.buffer_bytes() as usize) }
    }

    /// Resolve an output port to its writable buffer.
    pub fn port_out(&self, port: PortId) -> &'a mut [u8] {
        let record = self.record(port);
        debug_assert!(PortFlags::from_bits_truncate(record.flags).is_output());
        self.owned_buffer(&record)
    }

    /// Resolve an input port to its readable buffer.
    ///
    /// The common no-fan-in cases stay allocation-free; the mix path
    /// gathers its source list into a small vector.
    pub fn port_in(&self, port: PortId) -> &'a [u8] {
        let mut sources = self.connections.iter().filter(|c| c.dst_port == port);
        let first = sources.next();
        let second = sources.next();

        let Some(first) = first else {
            return self.silence_buffer();
        };
        if second.is_none() {
            let src = self.record(first.src_port);
            return self.owned_buffer(&src);
        }

        let Some(mix) = self.mix.get(&port) else {
            // Fan-in appeared without its buffer (mid-rebuild); read the
            // first source rather than mixing nothing.
            let src = self.record(first.src_port);
            return self.owned_buffer(&src);
        };
        let dst = mix.slice_mut();
        let bufs: Vec<&[u8]> = self
            .connections
            .iter()
            .filter(|c| c.dst_port == port)
            .map(|c| {
                let buf: &[u8] = self.owned_buffer(&self.record(c.src_port));
                buf
            })
            .collect();
        let record = self.record(port);
        let ty = port_type::PortTypeId::from_raw(record.type_id)
            .map(port_type::by_id)
            .expect("port record carries a builtin type");
        let mixdown = ty.mixdown.expect("fan-in was validated at connect");
        mixdown(dst, &bufs, self.nframes);
        dst
    }

    /// Audio view of [`ProcessScope::port_in`].
    pub fn audio_in(&self, port: PortId) -> &'a [Sample] {
        let n = self.nframes as usize;
        &bytemuck::cast_slice(self.port_in(port))[..n]
    }

    /// Audio view of [`ProcessScope::port_out`].
    pub fn audio_out(&self, port: PortId) -> &'a mut [Sample] {
        let n = self.nframes as usize;
        &mut bytemuck::cast_slice_mut(self.port_out(port))[..n]
    }
}
