//! Typed access to MIDI port buffers.
//!
//! Thin wrappers over the shared buffer functions in
//! [`ruteo_core::midi`], bound to the buffers a [`crate::ClientScope`]
//! resolves. A writer clears its buffer and appends events with
//! non-decreasing times; a reader iterates whatever the (possibly
//! mixed-down) buffer holds.

use ruteo_core::Nframes;
use ruteo_core::midi::{self, MidiEvent, MidiWriteError};

/// Reader over an input MIDI port's resolved buffer.
pub struct MidiInput<'a> {
    buf: &'a [u8],
}

impl<'a> MidiInput<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Number of events in the buffer.
    pub fn len(&self) -> u32 {
        midi::event_count(self.buf)
    }

    /// True when no events arrived this cycle.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events dropped upstream for lack of space.
    pub fn lost(&self) -> u32 {
        midi::lost_count(self.buf)
    }

    /// Event `idx`, if present.
    pub fn event(&self, idx: u32) -> Option<MidiEvent<'a>> {
        midi::event(self.buf, idx)
    }

    /// All events in time order.
    pub fn iter(&self) -> impl Iterator<Item = MidiEvent<'a>> + '_ {
        (0..self.len()).filter_map(|i| midi::event(self.buf, i))
    }
}

/// Writer over an output MIDI port's buffer.
pub struct MidiOutput<'a> {
    buf: &'a mut [u8],
}

impl<'a> MidiOutput<'a> {
    pub(crate) fn new(buf: &'a mut [u8]) -> Self {
        Self { buf }
    }

    /// Drop everything from previous cycles. Call once at the top of
    /// the process callback before writing.
    pub fn clear(&mut self) {
        midi::clear(self.buf);
    }

    /// Largest event payload that still fits.
    pub fn max_event_size(&self) -> usize {
        midi::max_event_size(self.buf)
    }

    /// Append an event; times must not decrease within a cycle.
    pub fn write(&mut self, time: Nframes, data: &[u8]) -> Result<(), MidiWriteError> {
        midi::write(self.buf, time, data)
    }

    /// Reserve space for an event and fill it in place.
    pub fn reserve(&mut self, time: Nframes, size: usize) -> Result<&mut [u8], MidiWriteError> {
        midi::reserve(self.buf, time, size)
    }

    /// Events this buffer has refused so far.
    pub fn lost(&self) -> u32 {
        midi::lost_count(self.buf)
    }
}
