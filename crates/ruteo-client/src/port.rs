//! Client-side ports and per-cycle buffer access.
//!
//! Resolution of an input port's buffer follows the shared contract:
//!
//! - output port → its assigned buffer (or the tied port's buffer)
//! - input, no connections → the server's shared silence buffer
//! - input, one connection → the source output's buffer, zero-copy
//! - input, several connections → this client's mix buffer for the
//!   port, filled by the port type's mixdown over all sources
//!
//! Connection knowledge comes from the `PortConnected`/`PortDisconnected`
//! events the server sends to both endpoint owners; the event thread
//! keeps the per-port source lists and mix buffers current, so the
//! process path just reads them.

use std::collections::HashMap;

use ruteo_core::port_type::{self, PortTypeId};
use ruteo_core::shm_layout::NO_SEGMENT;
use ruteo_core::{Nframes, PortFlags, PortId, Sample, monotonic_usecs};

use crate::client::Inner;
use crate::midi::{MidiInput, MidiOutput};

/// Which way a port faces, from the owning client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    /// The port consumes data from connected outputs.
    Input,
    /// The port produces data for connected inputs.
    Output,
}

impl PortDirection {
    /// The flag bit this direction contributes.
    pub fn flags(self) -> PortFlags {
        match self {
            PortDirection::Input => PortFlags::INPUT,
            PortDirection::Output => PortFlags::OUTPUT,
        }
    }
}

/// Handle on a port owned by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Port {
    pub(crate) id: PortId,
    pub(crate) flags: PortFlags,
    pub(crate) type_id: PortTypeId,
}

impl Port {
    /// The port's table id.
    pub fn id(&self) -> PortId {
        self.id
    }

    /// True for input ports.
    pub fn is_input(&self) -> bool {
        self.flags.is_input()
    }
}

/// What the client tracks per owned port.
pub(crate) struct PortState {
    pub flags: PortFlags,
    pub type_id: PortTypeId,
    /// Source ports feeding this input, in connect order.
    pub sources: Vec<PortId>,
    /// Fan-in scratch, present while `sources.len() >= 2`.
    pub mix: Option<Vec<Sample>>,
    /// Output tied to another output of this client.
    pub tied: Option<PortId>,
    /// The port's own buffer handle, kept across a tie for untying.
    pub own_buffer: Option<(i32, u32)>,
}

impl PortState {
    pub fn new(flags: PortFlags, type_id: PortTypeId) -> Self {
        Self {
            flags,
            type_id,
            sources: Vec::new(),
            mix: None,
            tied: None,
            own_buffer: None,
        }
    }
}

/// Per-cycle buffer access, handed to the process callback.
pub struct ClientScope<'a> {
    pub(crate) inner: &'a Inner,
    pub(crate) nframes: Nframes,
}

impl ClientScope<'_> {
    /// Frames in this cycle.
    pub fn nframes(&self) -> Nframes {
        self.nframes
    }

    /// Current sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.inner.control.sample_rate()
    }

    /// The transport frame counter exported by the engine.
    pub fn frame_time(&self) -> u32 {
        self.inner.control.frame_time()
    }

    /// Publish this client's transport frame counter (timebase clients).
    pub fn set_frame_time(&self, frames: u32) {
        self.inner.own.set_frame_time(frames);
    }

    /// Frames elapsed since the engine latched the cycle start.
    pub fn frames_since_cycle_start(&self) -> Nframes {
        let elapsed = monotonic_usecs().saturating_sub(self.inner.control.cycle_start_usecs());
        (elapsed * u64::from(self.sample_rate()) / 1_000_000) as Nframes
    }

    /// Readable frames of an input port.
    pub fn audio_in(&self, port: &Port) -> &[Sample] {
        debug_assert_eq!(port.type_id, PortTypeId::Audio);
        let (ptr, len) = resolve_in(self.inner, port.id, self.nframes);
        // Safety: pool/mix memory valid for the scope's lifetime; the
        // event thread never reshapes buffers while a cycle runs.
        let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
        &bytemuck::cast_slice(bytes)[..self.nframes as usize]
    }

    /// Writable frames of an output port.
    pub fn audio_out(&self, port: &Port) -> &mut [Sample] {
        debug_assert_eq!(port.type_id, PortTypeId::Audio);
        let (ptr, len) = resolve_out(self.inner, port.id);
        // Safety: as in audio_in; one borrow per port per callback is
        // the caller's contract.
        let bytes = unsafe { std::slice::from_raw_parts_mut(ptr, len) };
        &mut bytemuck::cast_slice_mut(bytes)[..self.nframes as usize]
    }

    /// Reader over an input MIDI port.
    pub fn midi_in(&self, port: &Port) -> MidiInput<'_> {
        debug_assert_eq!(port.type_id, PortTypeId::Midi);
        let (ptr, len) = resolve_in(self.inner, port.id, self.nframes);
        // Safety: as in audio_in.
        MidiInput::new(unsafe { std::slice::from_raw_parts(ptr, len) })
    }

    /// Writer over an output MIDI port.
    pub fn midi_out(&self, port: &Port) -> MidiOutput<'_> {
        debug_assert_eq!(port.type_id, PortTypeId::Midi);
        let (ptr, len) = resolve_out(self.inner, port.id);
        // Safety: as in audio_out.
        MidiOutput::new(unsafe { std::slice::from_raw_parts_mut(ptr, len) })
    }
}

/// Pointer and length of a port's own (or tied) buffer.
pub(crate) fn resolve_out(inner: &Inner, port: PortId) -> (*mut u8, usize) {
    // Tie chains are one deep: an output tied to another output of the
    // same client, never to another tie.
    let target = {
        let ports = inner.ports.lock().unwrap();
        ports.get(&port).and_then(|s| s.tied).unwrap_or(port)
    };
    let record = inner.control.read_port(target);
    assert!(
        record.buffer_segment != NO_SEGMENT,
        "output port has no buffer"
    );
    segment_ptr(inner, record.buffer_segment, record.buffer_offset)
}

/// Pointer and length of the buffer an input port reads this cycle.
pub(crate) fn resolve_in(inner: &Inner, port: PortId, nframes: Nframes) -> (*const u8, usize) {
    let mut ports = inner.ports.lock().unwrap();
    let Some(state) = ports.get_mut(&port) else {
        return silence(inner);
    };

    match state.sources.len() {
        0 => silence(inner),
        1 => {
            let record = inner.control.read_port(state.sources[0]);
            if record.buffer_segment == NO_SEGMENT {
                return silence(inner);
            }
            let (ptr, len) = segment_ptr(inner, record.buffer_segment, record.buffer_offset);
            (ptr.cast_const(), len)
        }
        _ => {
            let type_id = state.type_id;
            let sources = state.sources.clone();
            let mix = state.mix.get_or_insert_with(|| {
                vec![0.0; inner.control.buffer_size() as usize]
            });
            let dst: &mut [u8] = bytemuck::cast_slice_mut(mix.as_mut_slice());

            let mut bufs: Vec<&[u8]> = Vec::with_capacity(sources.len());
            for src in sources {
                let record = inner.control.read_port(src);
                if record.buffer_segment == NO_SEGMENT {
                    continue;
                }
                let (ptr, len) = segment_ptr(inner, record.buffer_segment, record.buffer_offset);
                // Safety: source buffers live in attached segments and
                // are complete before this client runs.
                bufs.push(unsafe { std::slice::from_raw_parts(ptr, len) });
            }

            let mixdown = port_type::by_id(type_id)
                .mixdown
                .expect("fan-in was validated at connect time");
            mixdown(dst, &bufs, nframes);
            (dst.as_ptr(), dst.len())
        }
    }
}

fn silence(inner: &Inner) -> (*const u8, usize) {
    let index = inner.current_segment.load(std::sync::atomic::Ordering::SeqCst);
    let (ptr, len) = segment_ptr(inner, index, 0);
    (ptr.cast_const(), len)
}

fn segment_ptr(inner: &Inner, index: i32, offset: u32) -> (*mut u8, usize) {
    let segments = inner.segments.lock().unwrap();
    let seg = segments
        .get(&index)
        .expect("port buffer segment not attached");
    let len = inner.control.buffer_size() as usize * size_of::<Sample>();
    assert!(offset as usize + len <= seg.len(), "buffer outside segment");
    // Safety: bounds asserted against the live mapping.
    (unsafe { seg.as_ptr().add(offset as usize) }, len)
}

/// Keep a port's mix buffer in step with its fan-in.
pub(crate) fn refresh_mix(state: &mut PortState, buffer_frames: usize) {
    if state.sources.len() >= 2 {
        if state.mix.is_none() {
            state.mix = Some(vec![0.0; buffer_frames]);
        }
    } else {
        state.mix = None;
    }
}

/// Resize every mix buffer after a period change.
pub(crate) fn resize_mix_buffers(ports: &mut HashMap<PortId, PortState>, buffer_frames: usize) {
    for state in ports.values_mut() {
        if state.mix.is_some() {
            state.mix = Some(vec![0.0; buffer_frames]);
        }
    }
}
